//! # Flit model
//!
//! The atomic transport unit. A packet is `size` flits: one head, zero or
//! more body flits, one tail (a single-flit packet is both head and tail).
//! Only the head carries a routable destination; interior and tail flits
//! inherit the virtual channel handed back from the head. Sequence numbers
//! are per (source, destination) and start at 1; they never wrap in
//! simulation.
//!
//! ACK/NACK/SACK state rides in the header of every head flit (piggybacked)
//! or in a dedicated single-flit `Ctrl` packet (standalone).

use bytes::Bytes;

use crate::{Cycle, NodeId, SeqNum};

// ─── Flit kinds ─────────────────────────────────────────────────────────────

/// Transaction type carried by every flit of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlitKind {
    ReadRequest,
    ReadReply,
    WriteRequest,
    WriteReply,
    /// Undifferentiated traffic; treated as a write (PUT) everywhere.
    AnyType,
    /// Standalone ACK/NACK/SACK control packet. Never enters the OPB.
    Ctrl,
    RgetRequest,
    RgetGetRequest,
    RgetGetReply,
    WriteRequestNoop,
}

impl FlitKind {
    /// Types that deliver payload data into the target's put queue.
    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            FlitKind::WriteRequest
                | FlitKind::WriteRequestNoop
                | FlitKind::AnyType
                | FlitKind::ReadReply
                | FlitKind::RgetGetReply
        )
    }

    /// Types that may only retire from the OPB after a protocol response
    /// (READ_REPLY or RGET_GET_REQUEST) arrives in addition to the ACK.
    pub fn expects_response(self) -> bool {
        matches!(self, FlitKind::ReadRequest | FlitKind::RgetRequest)
    }
}

// ─── ACK fields ─────────────────────────────────────────────────────────────

/// The acknowledgement header shared by piggybacked and standalone ACKs.
///
/// `ack == nack` (both present and equal) is the congestion-signalling
/// duplicate-ACK encoding used by the host-control policy; any other
/// combination with both fields present is a protocol error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckFields {
    pub ack_seq_num: Option<SeqNum>,
    pub nack_seq_num: Option<SeqNum>,
    pub sack: bool,
    pub sack_vec: u64,
}

impl AckFields {
    pub fn is_empty(&self) -> bool {
        self.ack_seq_num.is_none() && self.nack_seq_num.is_none()
    }
}

// ─── Flit ───────────────────────────────────────────────────────────────────

/// One flit on the wire or in an endpoint-side queue.
///
/// Inside the endpoint's injection buffers every flit keeps `dest` populated
/// for bookkeeping; the staging stage strips it from non-head flits before
/// they enter the fabric.
#[derive(Debug, Clone)]
pub struct Flit {
    pub id: u64,
    pub packet_id: u64,
    pub kind: FlitKind,
    pub head: bool,
    pub tail: bool,
    /// Total flits in the packet, including head and tail.
    pub size: usize,
    pub src: NodeId,
    pub dest: Option<NodeId>,
    pub vc: Option<usize>,
    pub subnet: usize,
    pub class: usize,
    pub priority: i64,
    /// Creation time (generation), for end-to-end latency accounting.
    pub ctime: Cycle,
    /// Per-destination packet sequence number; 0 until assigned at injection.
    pub seq_num: SeqNum,
    pub ack: AckFields,
    /// For responses: the request sequence number being answered.
    pub response_to_seq_num: Option<SeqNum>,
    /// For READ_REQUEST / RGET_REQUEST / RGET_GET_REQUEST: size in flits of
    /// the data transfer being requested.
    pub requested_data_size: usize,
    pub ecn_congestion_detected: bool,
    /// Whether this packet counts toward measured (steady-state) statistics.
    pub record: bool,
    /// Opaque workload payload, carried on head and tail.
    pub payload: Option<Bytes>,
}

impl Flit {
    /// Build the `size` flits of a new packet, ids not yet assigned.
    /// The caller stamps ids and registers them with the simulation context.
    #[allow(clippy::too_many_arguments)]
    pub fn packet(
        packet_id: u64,
        src: NodeId,
        dest: NodeId,
        kind: FlitKind,
        size: usize,
        ctime: Cycle,
        class: usize,
        record: bool,
        response_to_seq_num: Option<SeqNum>,
        requested_data_size: usize,
        payload: Option<Bytes>,
    ) -> Vec<Flit> {
        debug_assert!(size >= 1);
        (0..size)
            .map(|i| {
                let head = i == 0;
                let tail = i == size - 1;
                Flit {
                    id: 0,
                    packet_id,
                    kind,
                    head,
                    tail,
                    size,
                    src,
                    dest: Some(dest),
                    vc: None,
                    subnet: 0,
                    class,
                    priority: 0,
                    ctime,
                    seq_num: 0,
                    ack: AckFields::default(),
                    response_to_seq_num,
                    requested_data_size: if matches!(
                        kind,
                        FlitKind::ReadRequest | FlitKind::RgetGetRequest
                    ) {
                        requested_data_size
                    } else {
                        0
                    },
                    ecn_congestion_detected: false,
                    record,
                    payload: if head || tail { payload.clone() } else { None },
                }
            })
            .collect()
    }

    /// A standalone control flit: single-flit packet, never enters the OPB.
    pub fn standalone_ctrl(src: NodeId, dest: NodeId) -> Flit {
        Flit {
            id: 0,
            packet_id: 0,
            kind: FlitKind::Ctrl,
            head: true,
            tail: true,
            size: 1,
            src,
            dest: Some(dest),
            vc: Some(0),
            subnet: 0,
            class: 0,
            priority: 0,
            ctime: 0,
            seq_num: 0,
            ack: AckFields::default(),
            response_to_seq_num: None,
            requested_data_size: 0,
            ecn_congestion_detected: false,
            record: false,
            payload: None,
        }
    }
}

// ─── Credit ─────────────────────────────────────────────────────────────────

/// Fabric buffer credit returned for each consumed flit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credit {
    pub vc: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_has_head_body_tail_structure() {
        let flits = Flit::packet(
            7,
            0,
            1,
            FlitKind::WriteRequest,
            4,
            100,
            0,
            true,
            None,
            0,
            None,
        );
        assert_eq!(flits.len(), 4);
        assert!(flits[0].head && !flits[0].tail);
        assert!(!flits[1].head && !flits[1].tail);
        assert!(!flits[2].head && !flits[2].tail);
        assert!(!flits[3].head && flits[3].tail);
        assert!(flits.iter().all(|f| f.size == 4 && f.dest == Some(1)));
    }

    #[test]
    fn single_flit_packet_is_head_and_tail() {
        let flits = Flit::packet(
            1,
            0,
            1,
            FlitKind::ReadRequest,
            1,
            0,
            0,
            false,
            None,
            8,
            None,
        );
        assert!(flits[0].head && flits[0].tail);
        assert_eq!(flits[0].requested_data_size, 8);
    }

    #[test]
    fn requested_size_only_on_request_kinds() {
        let flits = Flit::packet(
            1,
            0,
            1,
            FlitKind::WriteRequest,
            2,
            0,
            0,
            false,
            None,
            8,
            None,
        );
        assert_eq!(flits[0].requested_data_size, 0);
    }

    #[test]
    fn data_bearing_classification() {
        assert!(FlitKind::WriteRequest.is_data_bearing());
        assert!(FlitKind::ReadReply.is_data_bearing());
        assert!(FlitKind::RgetGetReply.is_data_bearing());
        assert!(!FlitKind::ReadRequest.is_data_bearing());
        assert!(!FlitKind::RgetRequest.is_data_bearing());
        assert!(!FlitKind::Ctrl.is_data_bearing());
    }

    #[test]
    fn response_expectations() {
        assert!(FlitKind::ReadRequest.expects_response());
        assert!(FlitKind::RgetRequest.expects_response());
        assert!(!FlitKind::RgetGetRequest.expects_response());
        assert!(!FlitKind::WriteRequest.expects_response());
    }
}
