//! # Simulation context
//!
//! The shared state every endpoint method needs a handle to: global flit and
//! packet id allocation, the per-class in-flight maps that decide when the
//! run may quiesce, and the workload-facing knobs (sizes, load, read/write
//! mix). The enclosing simulation loop owns one `SimContext` and threads it
//! through the per-cycle entry points.

use std::collections::HashSet;

use crate::flit::Flit;
use crate::{Cycle, NodeId};

/// Phase of the enclosing simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimPhase {
    WarmingUp,
    Running,
    Draining,
}

/// Injection process and traffic pattern, queried only during new-packet
/// generation. The harness supplies the implementation.
pub trait TrafficModel {
    /// Whether this node's injection process fires this opportunity.
    fn test(&mut self, node: NodeId) -> bool;

    /// Pick a destination for a new packet from `src`.
    fn dest(&mut self, src: NodeId) -> NodeId;

    /// Packet size in flits for undifferentiated (`ANY_TYPE`) traffic.
    fn next_packet_size(&mut self, class: usize) -> usize;
}

pub struct SimContext {
    pub time: Cycle,
    pub phase: SimPhase,
    /// First cycle of the measurement window.
    pub reset_time: Cycle,
    /// Cycle at which draining began.
    pub drain_time: Cycle,
    pub include_queuing: bool,
    pub measure_stats: bool,

    // ─── Workload shape ───
    pub use_read_write: bool,
    pub write_fraction: f64,
    pub intended_load: f64,
    pub read_request_size: usize,
    pub read_reply_size: usize,
    pub write_request_size: usize,

    // ─── Global id allocation ───
    cur_flit_id: u64,
    cur_packet_id: u64,

    // ─── In-flight tracking (per class) ───
    total_in_flight: Vec<HashSet<u64>>,
    measured_in_flight: Vec<HashSet<u64>>,

    // ─── Whole-run counters shared across endpoints ───
    pub flit_retransmissions: u64,
    pub packet_retransmissions: u64,
    pub standalone_acks_transmitted: u64,
}

impl SimContext {
    pub fn new(classes: usize) -> Self {
        SimContext {
            time: 0,
            phase: SimPhase::Running,
            reset_time: 0,
            drain_time: u64::MAX,
            include_queuing: true,
            measure_stats: true,
            use_read_write: true,
            write_fraction: 1.0,
            intended_load: 0.0,
            read_request_size: 2,
            read_reply_size: 8,
            write_request_size: 8,
            cur_flit_id: 0,
            cur_packet_id: 0,
            total_in_flight: vec![HashSet::new(); classes],
            measured_in_flight: vec![HashSet::new(); classes],
            flit_retransmissions: 0,
            packet_retransmissions: 0,
            standalone_acks_transmitted: 0,
        }
    }

    pub fn next_flit_id(&mut self) -> u64 {
        let id = self.cur_flit_id;
        self.cur_flit_id += 1;
        id
    }

    pub fn next_packet_id(&mut self) -> u64 {
        let id = self.cur_packet_id;
        self.cur_packet_id += 1;
        id
    }

    /// Track a freshly generated flit until it retires.
    pub fn register_flit(&mut self, flit: &Flit) {
        self.total_in_flight[flit.class].insert(flit.id);
        if flit.record {
            self.measured_in_flight[flit.class].insert(flit.id);
        }
    }

    /// The endpoint has fully accounted for this flit (ACKed and, where
    /// required, answered). Storage may be reclaimed.
    pub fn retire_flit(&mut self, flit: &Flit, _at_node: NodeId) {
        self.total_in_flight[flit.class].remove(&flit.id);
        self.measured_in_flight[flit.class].remove(&flit.id);
    }

    /// Erase a flit that was discarded before injection (put→rget
    /// conversion); it never counts as retired.
    pub fn discard_flit(&mut self, id: u64, class: usize) {
        self.total_in_flight[class].remove(&id);
        self.measured_in_flight[class].remove(&id);
    }

    pub fn in_flight_flits(&self, class: usize) -> usize {
        self.total_in_flight[class].len()
    }

    pub fn measured_in_flight_empty(&self) -> bool {
        self.measured_in_flight.iter().all(|m| m.is_empty())
    }

    pub fn all_in_flight_empty(&self) -> bool {
        self.total_in_flight.iter().all(|m| m.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flit::FlitKind;

    #[test]
    fn ids_are_monotonic() {
        let mut ctx = SimContext::new(1);
        assert_eq!(ctx.next_flit_id(), 0);
        assert_eq!(ctx.next_flit_id(), 1);
        assert_eq!(ctx.next_packet_id(), 0);
        assert_eq!(ctx.next_packet_id(), 1);
    }

    #[test]
    fn register_and_retire_round_trip() {
        let mut ctx = SimContext::new(1);
        let mut flits = Flit::packet(
            0,
            0,
            1,
            FlitKind::WriteRequest,
            2,
            0,
            0,
            true,
            None,
            0,
            None,
        );
        for f in &mut flits {
            f.id = ctx.next_flit_id();
            ctx.register_flit(f);
        }
        assert_eq!(ctx.in_flight_flits(0), 2);
        assert!(!ctx.measured_in_flight_empty());

        for f in &flits {
            ctx.retire_flit(f, 1);
        }
        assert!(ctx.all_in_flight_empty());
        assert!(ctx.measured_in_flight_empty());
    }

    #[test]
    fn discard_removes_without_retirement() {
        let mut ctx = SimContext::new(1);
        let mut f = Flit::packet(0, 0, 1, FlitKind::WriteRequest, 1, 0, 0, true, None, 0, None)
            .pop()
            .unwrap();
        f.id = ctx.next_flit_id();
        ctx.register_flit(&f);
        ctx.discard_flit(f.id, f.class);
        assert!(ctx.all_in_flight_empty());
    }
}
