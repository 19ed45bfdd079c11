//! # Receive-side tracking
//!
//! Per-source expected-sequence state, the ACK/NACK/SACK decision that rides
//! back to each initiator, and the integrity tracker that checks every flit
//! of a multi-flit packet against its head.
//!
//! Invariant, per source:
//! `last_valid_seq_num_recvd_and_ackd <= last_valid_seq_num_recvd_and_ready_to_ack
//!  <= last_valid_seq_num_recvd`.

use bytes::Bytes;

use crate::error::EndpointError;
use crate::flit::{Flit, FlitKind};
use crate::{Cycle, NodeId, SeqNum};

// ─── Outstanding acknowledgement to return ──────────────────────────────────

/// What the next ACK emitted toward a source will say. There is no "none":
/// with nothing new to report we simply repeat the last cumulative ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nack,
    Sack,
}

#[derive(Debug, Clone)]
pub struct AckResponseState {
    /// Highest in-order sequence received from this source.
    pub last_valid_seq_num_recvd: SeqNum,
    /// Highest sequence an emitted ACK has covered (delayed acking may hold
    /// this below what is ready).
    pub last_valid_seq_num_recvd_and_ackd: SeqNum,
    /// Highest sequence released by the delayed-ack queue.
    pub last_valid_seq_num_recvd_and_ready_to_ack: SeqNum,
    /// Receipt time of the oldest packet still awaiting an ACK; drives the
    /// standalone-ACK timeout.
    pub time_last_valid_unacked_packet_recvd: Option<Cycle>,
    pub packets_recvd_since_last_ack: u32,
    pub outstanding_ack_type_to_return: AckKind,
    /// One NACK per drop cluster: set on the first out-of-sequence packet,
    /// cleared when the expected sequence resumes.
    pub already_nacked_bad_seq_num: bool,
    pub time_last_valid_packet_recvd: Cycle,
    pub time_last_ack_sent: Cycle,
    /// Receive-side SACK vector; LSB is `last_valid_seq_num_recvd + 1`.
    pub sack_vec: u64,
}

impl AckResponseState {
    pub fn new() -> Self {
        AckResponseState {
            last_valid_seq_num_recvd: 0,
            last_valid_seq_num_recvd_and_ackd: 0,
            last_valid_seq_num_recvd_and_ready_to_ack: 0,
            time_last_valid_unacked_packet_recvd: None,
            packets_recvd_since_last_ack: 0,
            outstanding_ack_type_to_return: AckKind::Ack,
            already_nacked_bad_seq_num: false,
            time_last_valid_packet_recvd: 0,
            time_last_ack_sent: 0,
            sack_vec: 0,
        }
    }

    pub fn expected_seq(&self) -> SeqNum {
        self.last_valid_seq_num_recvd + 1
    }

    #[cfg(debug_assertions)]
    pub fn check_invariant(&self) {
        debug_assert!(
            self.last_valid_seq_num_recvd_and_ackd
                <= self.last_valid_seq_num_recvd_and_ready_to_ack
        );
        debug_assert!(
            self.last_valid_seq_num_recvd_and_ready_to_ack <= self.last_valid_seq_num_recvd
        );
    }
}

impl Default for AckResponseState {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Deferred ACK processing ────────────────────────────────────────────────

/// ACK fields peeled off an arriving flit, queued behind the ack-processing
/// latency. The flit itself may be freed before this is consumed.
#[derive(Debug, Clone)]
pub struct RecvdAck {
    pub time: Cycle,
    pub subnet: usize,
    /// The peer that sent the acknowledgement (the target of the original
    /// transaction).
    pub target: NodeId,
    pub ack_seq_num: Option<SeqNum>,
    pub nack_seq_num: Option<SeqNum>,
    pub flit_id: u64,
    pub is_standalone: bool,
    pub sack: bool,
    pub sack_vec: u64,
}

// ─── Deferred protocol responses ────────────────────────────────────────────

/// A response waiting out its processing latency, either outbound (we will
/// generate a reply packet) or inbound (we will mark our own request as
/// answered).
#[derive(Debug, Clone)]
pub struct PendingResponse {
    pub source: NodeId,
    pub kind: FlitKind,
    pub reply_size: usize,
    pub time: Cycle,
    pub record: bool,
    pub class: usize,
    pub req_seq_num: SeqNum,
    pub rget_data_size: usize,
    pub payload: Option<Bytes>,
}

// ─── Delayed-ACK queue records ──────────────────────────────────────────────

/// One received packet awaiting release to the outstanding-ACK state.
#[derive(Debug, Clone)]
pub struct ToSendAck {
    pub kind: FlitKind,
    pub seq_num: SeqNum,
    pub latest_time_to_ack: Cycle,
    pub size: usize,
    pub source: NodeId,
}

// ─── Packet integrity ───────────────────────────────────────────────────────

/// Tracks the packet currently being received to check that every flit of a
/// multi-flit packet is accounted for and consistent with its head.
#[derive(Debug, Clone, Default)]
pub struct IncomingPacketTracker {
    src: Option<NodeId>,
    packet_id: Option<u64>,
    seq_num: Option<SeqNum>,
    countdown: usize,
    total: usize,
}

impl IncomingPacketTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total flits of the packet whose tail just arrived.
    pub fn packet_size(&self) -> usize {
        self.total
    }

    pub fn quiesced(&self) -> bool {
        self.src.is_none() && self.countdown == 0
    }

    /// Account for one received flit. On the tail of a complete packet the
    /// tracker resets itself.
    pub fn observe(&mut self, node: NodeId, now: Cycle, flit: &Flit) -> Result<(), EndpointError> {
        if flit.head {
            if !flit.tail {
                self.src = Some(flit.src);
                self.packet_id = Some(flit.packet_id);
                self.seq_num = Some(flit.seq_num);
            }
            self.countdown = flit.size - 1;
            self.total = flit.size;
        } else {
            if let Some(src) = self.src {
                if flit.src != src {
                    return Err(EndpointError::InterleavedFlit {
                        cycle: now,
                        node,
                        flit_id: flit.id,
                        field: "src",
                        got: flit.src as u64,
                        expected: src as u64,
                    });
                }
            }
            if let Some(pid) = self.packet_id {
                if flit.packet_id != pid {
                    return Err(EndpointError::InterleavedFlit {
                        cycle: now,
                        node,
                        flit_id: flit.id,
                        field: "packet_id",
                        got: flit.packet_id,
                        expected: pid,
                    });
                }
            }
            if let Some(seq) = self.seq_num {
                if flit.seq_num != seq {
                    return Err(EndpointError::InterleavedFlit {
                        cycle: now,
                        node,
                        flit_id: flit.id,
                        field: "seq_num",
                        got: flit.seq_num,
                        expected: seq,
                    });
                }
            }
            self.countdown = self.countdown.saturating_sub(1);
        }

        if flit.tail {
            if self.countdown != 0 {
                return Err(EndpointError::MissingFlits {
                    cycle: now,
                    node,
                    packet_id: flit.packet_id,
                    missing: self.countdown,
                });
            }
            self.src = None;
            self.packet_id = None;
            self.seq_num = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(src: NodeId, pid: u64, seq: SeqNum, size: usize) -> Vec<Flit> {
        let mut flits = Flit::packet(
            pid,
            src,
            1,
            FlitKind::WriteRequest,
            size,
            0,
            0,
            false,
            None,
            0,
            None,
        );
        for f in &mut flits {
            f.seq_num = seq;
        }
        flits
    }

    #[test]
    fn tracker_accepts_complete_packet() {
        let mut tracker = IncomingPacketTracker::new();
        for f in packet(0, 9, 1, 4) {
            tracker.observe(1, 0, &f).unwrap();
        }
        assert!(tracker.quiesced());
        assert_eq!(tracker.packet_size(), 4);
    }

    #[test]
    fn tracker_rejects_interleaved_src() {
        let mut tracker = IncomingPacketTracker::new();
        let a = packet(0, 9, 1, 3);
        let b = packet(2, 10, 1, 3);
        tracker.observe(1, 0, &a[0]).unwrap();
        let err = tracker.observe(1, 0, &b[1]).unwrap_err();
        assert!(matches!(
            err,
            EndpointError::InterleavedFlit { field: "src", .. }
        ));
    }

    #[test]
    fn tracker_rejects_wrong_seq() {
        let mut tracker = IncomingPacketTracker::new();
        let a = packet(0, 9, 1, 3);
        let mut stray = a[1].clone();
        stray.seq_num = 7;
        tracker.observe(1, 0, &a[0]).unwrap();
        let err = tracker.observe(1, 0, &stray).unwrap_err();
        assert!(matches!(
            err,
            EndpointError::InterleavedFlit {
                field: "seq_num",
                ..
            }
        ));
    }

    #[test]
    fn tracker_detects_missing_flits() {
        let mut tracker = IncomingPacketTracker::new();
        let a = packet(0, 9, 1, 4);
        tracker.observe(1, 0, &a[0]).unwrap();
        // Skip a[1], a[2]: the tail arrives with flits outstanding.
        let err = tracker.observe(1, 0, &a[3]).unwrap_err();
        assert!(matches!(err, EndpointError::MissingFlits { missing: 2, .. }));
    }

    #[test]
    fn ack_state_starts_expecting_one() {
        let state = AckResponseState::new();
        assert_eq!(state.expected_seq(), 1);
        assert_eq!(state.outstanding_ack_type_to_return, AckKind::Ack);
        assert!(state.time_last_valid_unacked_packet_recvd.is_none());
    }
}
