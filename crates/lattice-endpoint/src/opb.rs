//! # Outstanding Packet Buffer
//!
//! Per-destination FIFO of in-flight packets awaiting acknowledgement (and,
//! for READ/RGET requests, the protocol response). Within a destination,
//! packets appear in strictly increasing sequence order; within a packet the
//! head, body flits, and tail are contiguous.
//!
//! The buffer is set-associative for insertion: `hash(dest, seq)` buckets may
//! hold at most `opb_ways` simultaneous head flits, modeling the hardware's
//! limited tag storage. Total head-flit occupancy is bounded by
//! `opb_max_pkt_occupancy`.
//!
//! Ownership model: the OPB holds an owned [`OpbFlit`] for every flit of a
//! resident packet; each (re)transmission produces a transient wire copy via
//! [`OpbFlit::emit_copy`], whose lifetime is the fabric traversal. The
//! resident copy keeps the retry bookkeeping.

use std::collections::{HashMap, VecDeque};

use crate::config::EndpointConfig;
use crate::error::EndpointError;
use crate::flit::Flit;
use crate::{Cycle, NodeId, SeqNum};

// ─── OPB-resident flit ──────────────────────────────────────────────────────

/// A flit copy resident in the OPB, plus its reliability state.
#[derive(Debug, Clone)]
pub struct OpbFlit {
    pub flit: Flit,
    pub dest: NodeId,
    /// Injection time of the most recent transmission attempt.
    pub itime: Cycle,
    /// Injection time of the first attempt.
    pub first_itime: Cycle,
    /// When the retry (or, once acked, response) timer fires.
    pub expire_time: Cycle,
    pub transmit_attempts: u32,
    pub ack_received: bool,
    pub ack_received_time: Option<Cycle>,
    pub response_received: bool,
}

impl OpbFlit {
    pub fn new(flit: Flit, dest: NodeId, now: Cycle, retry_timeout: u64) -> Self {
        let attempts = if flit.head { 1 } else { 0 };
        OpbFlit {
            flit,
            dest,
            itime: now,
            first_itime: now,
            expire_time: now + retry_timeout,
            transmit_attempts: attempts,
            ack_received: false,
            ack_received_time: None,
            response_received: false,
        }
    }

    /// Produce the wire copy for one (re)transmission. Non-head flits leave
    /// with no routable destination; the fabric infers it from the head.
    pub fn emit_copy(&self) -> Flit {
        let mut wire = self.flit.clone();
        if !wire.head {
            wire.dest = None;
        }
        wire
    }

    /// Re-arm the retry timer after a (re)transmission.
    pub fn rearm(&mut self, now: Cycle, retry_timeout: u64) {
        self.itime = now;
        self.expire_time = now + retry_timeout;
    }
}

// ─── The buffer ─────────────────────────────────────────────────────────────

pub struct Opb {
    buffers: Vec<VecDeque<OpbFlit>>,
    /// Head-flit residents per set-associative bucket.
    occupancy: HashMap<u64, u32>,
    pkt_occupancy: usize,
    max_pkt_occupancy: usize,
    ways: u32,
    dest_mask: u64,
    seq_bits: u32,
    seq_mask: u64,
}

impl Opb {
    pub fn new(cfg: &EndpointConfig) -> Self {
        Opb {
            buffers: vec![VecDeque::new(); cfg.nodes],
            occupancy: HashMap::new(),
            pkt_occupancy: 0,
            max_pkt_occupancy: cfg.opb_max_pkt_occupancy,
            ways: cfg.opb_ways,
            dest_mask: (1u64 << cfg.opb_dest_idx_bits) - 1,
            seq_bits: cfg.opb_seq_num_idx_bits,
            seq_mask: (1u64 << cfg.opb_seq_num_idx_bits) - 1,
        }
    }

    pub fn hash(&self, dest: NodeId, seq: SeqNum) -> u64 {
        ((dest as u64 & self.dest_mask) << self.seq_bits) | (seq & self.seq_mask)
    }

    /// Would inserting `(dest, seq)` collide with a full bucket?
    /// Finding more residents than ways is a protocol error.
    pub fn insertion_conflict(
        &self,
        node: NodeId,
        now: Cycle,
        dest: NodeId,
        seq: SeqNum,
    ) -> Result<bool, EndpointError> {
        let bucket = self.hash(dest, seq);
        let residents = self.occupancy.get(&bucket).copied().unwrap_or(0);
        if residents > self.ways {
            return Err(EndpointError::OpbWayOverflow {
                cycle: now,
                node,
                bucket,
                count: residents,
                ways: self.ways,
            });
        }
        Ok(residents >= self.ways)
    }

    /// Insert one flit. Head flits claim a bucket way and a packet slot.
    pub fn insert(&mut self, node: NodeId, now: Cycle, entry: OpbFlit) -> Result<(), EndpointError> {
        if entry.flit.head {
            let bucket = self.hash(entry.dest, entry.flit.seq_num);
            let residents = self.occupancy.entry(bucket).or_insert(0);
            if *residents >= self.ways {
                return Err(EndpointError::OpbWayOverflow {
                    cycle: now,
                    node,
                    bucket,
                    count: *residents + 1,
                    ways: self.ways,
                });
            }
            *residents += 1;
            self.pkt_occupancy += 1;
        }
        self.buffers[entry.dest].push_back(entry);
        Ok(())
    }

    /// Release the bucket way and packet slot for a cleared packet.
    pub fn note_packet_cleared(&mut self, dest: NodeId, seq: SeqNum) {
        let bucket = self.hash(dest, seq);
        if let Some(residents) = self.occupancy.get_mut(&bucket) {
            debug_assert!(*residents > 0);
            *residents = residents.saturating_sub(1);
        }
        debug_assert!(self.pkt_occupancy > 0);
        self.pkt_occupancy -= 1;
    }

    pub fn dest(&self, dest: NodeId) -> &VecDeque<OpbFlit> {
        &self.buffers[dest]
    }

    pub fn dest_mut(&mut self, dest: NodeId) -> &mut VecDeque<OpbFlit> {
        &mut self.buffers[dest]
    }

    /// Index of the head flit with the given sequence number, if resident.
    pub fn find_head_index(&self, dest: NodeId, seq: SeqNum) -> Option<usize> {
        self.buffers[dest]
            .iter()
            .position(|e| e.flit.head && e.flit.seq_num == seq)
    }

    /// Sequence number of the oldest resident packet for a destination.
    pub fn oldest_seq(&self, dest: NodeId) -> Option<SeqNum> {
        self.buffers[dest].front().map(|e| e.flit.seq_num)
    }

    pub fn pkt_occupancy(&self) -> usize {
        self.pkt_occupancy
    }

    pub fn at_capacity(&self) -> bool {
        self.pkt_occupancy >= self.max_pkt_occupancy
    }

    pub fn drained(&self) -> bool {
        self.buffers.iter().all(|b| b.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flit::FlitKind;

    fn entry(dest: NodeId, seq: SeqNum, size: usize, idx: usize) -> OpbFlit {
        let flits = Flit::packet(
            seq,
            0,
            dest,
            FlitKind::WriteRequest,
            size,
            0,
            0,
            false,
            None,
            0,
            None,
        );
        let mut f = flits[idx].clone();
        f.seq_num = seq;
        OpbFlit::new(f, dest, 10, 100)
    }

    fn cfg() -> EndpointConfig {
        EndpointConfig {
            nodes: 4,
            opb_ways: 2,
            opb_dest_idx_bits: 2,
            opb_seq_num_idx_bits: 2,
            opb_max_pkt_occupancy: 8,
            ..Default::default()
        }
    }

    #[test]
    fn hash_packs_dest_and_seq() {
        let opb = Opb::new(&cfg());
        assert_eq!(opb.hash(1, 3), (1 << 2) | 3);
        // Sequence bits wrap within the mask.
        assert_eq!(opb.hash(1, 7), (1 << 2) | 3);
    }

    #[test]
    fn bucket_fills_after_ways_inserts() {
        let mut opb = Opb::new(&cfg());
        // seq 1 and 5 alias (2 seq bits); 2 ways fit, the third conflicts.
        opb.insert(0, 10, entry(1, 1, 1, 0)).unwrap();
        opb.insert(0, 10, entry(1, 5, 1, 0)).unwrap();
        assert!(opb.insertion_conflict(0, 10, 1, 9).unwrap());
        assert!(opb.insert(0, 10, entry(1, 9, 1, 0)).is_err());
    }

    #[test]
    fn clearing_releases_the_way() {
        let mut opb = Opb::new(&cfg());
        opb.insert(0, 10, entry(1, 1, 1, 0)).unwrap();
        opb.insert(0, 10, entry(1, 5, 1, 0)).unwrap();
        opb.note_packet_cleared(1, 1);
        assert!(!opb.insertion_conflict(0, 10, 1, 9).unwrap());
        assert_eq!(opb.pkt_occupancy(), 1);
    }

    #[test]
    fn find_head_index_skips_bodies() {
        let mut opb = Opb::new(&cfg());
        opb.insert(0, 10, entry(1, 1, 2, 0)).unwrap();
        opb.insert(0, 10, entry(1, 1, 2, 1)).unwrap();
        opb.insert(0, 10, entry(1, 2, 2, 0)).unwrap();
        opb.insert(0, 10, entry(1, 2, 2, 1)).unwrap();
        assert_eq!(opb.find_head_index(1, 2), Some(2));
        assert_eq!(opb.find_head_index(1, 3), None);
    }

    #[test]
    fn emit_copy_strips_body_dest() {
        let head = entry(1, 1, 2, 0);
        let body = entry(1, 1, 2, 1);
        assert_eq!(head.emit_copy().dest, Some(1));
        assert_eq!(body.emit_copy().dest, None);
    }

    #[test]
    fn rearm_updates_timers_but_not_first_itime() {
        let mut e = entry(1, 1, 1, 0);
        e.rearm(50, 100);
        assert_eq!(e.itime, 50);
        assert_eq!(e.first_itime, 10);
        assert_eq!(e.expire_time, 150);
    }

    #[test]
    fn occupancy_tracks_heads_only() {
        let mut opb = Opb::new(&cfg());
        opb.insert(0, 10, entry(1, 1, 2, 0)).unwrap();
        opb.insert(0, 10, entry(1, 1, 2, 1)).unwrap();
        assert_eq!(opb.pkt_occupancy(), 1);
        assert!(!opb.drained());
    }
}
