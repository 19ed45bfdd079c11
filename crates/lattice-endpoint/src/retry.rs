//! # Retry controller state
//!
//! Per-destination retransmission mode and the timer queues that drive
//! timeout-based recovery.
//!
//! Modes per destination:
//! - `Idle` — new packets flow normally.
//! - `NackBased { opb_index }` — a NACK arrived; every OPB entry from
//!   `opb_index` onward replays back-to-back before new packets resume.
//! - `SackBased { .. }` — like a NACK replay but steered by the SACK vector:
//!   zero bits are gaps to resend, one bits were received and are skipped.
//! - `TimeoutBased` — the retry timer fired; no new packets to this
//!   destination until every resident packet has been acked.
//!
//! While a replay is in progress, ACKs for that destination are not applied;
//! the highest one is parked in `pending_ack` and applied at completion.

use std::collections::VecDeque;

use crate::{Cycle, NodeId, SeqNum};

// ─── Per-destination state ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    NackBased {
        opb_index: usize,
    },
    SackBased {
        opb_index: usize,
        seq_in_progress: SeqNum,
        sack_vec: u64,
        orig_sack_vec: u64,
        orig_ack_seq_num: SeqNum,
    },
    TimeoutBased,
}

impl RetryState {
    /// A NACK- or SACK-driven replay (they share the replay machinery).
    pub fn is_replay(&self) -> bool {
        matches!(self, RetryState::NackBased { .. } | RetryState::SackBased { .. })
    }

    pub fn replay_index(&self) -> Option<usize> {
        match self {
            RetryState::NackBased { opb_index } | RetryState::SackBased { opb_index, .. } => {
                Some(*opb_index)
            }
            _ => None,
        }
    }

    /// Shift the replay index when an ACK removes an older OPB entry.
    pub fn note_entry_removed_below(&mut self, removed_index: usize) {
        match self {
            RetryState::NackBased { opb_index } | RetryState::SackBased { opb_index, .. } => {
                if *opb_index > 0 && removed_index < *opb_index {
                    *opb_index -= 1;
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct DestRetry {
    pub state: RetryState,
    /// Highest ACK received while a replay was in progress.
    pub pending_ack: Option<SeqNum>,
}

impl DestRetry {
    fn new() -> Self {
        DestRetry {
            state: RetryState::Idle,
            pending_ack: None,
        }
    }
}

// ─── Timer queues ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRecord {
    pub expiry: Cycle,
    pub dest: NodeId,
    pub seq_num: SeqNum,
}

pub struct RetryTracker {
    per_dest: Vec<DestRetry>,
    /// Destinations with a NACK/SACK replay queued, in arrival order.
    pub pending_nack_replays: VecDeque<NodeId>,
    /// Armed on every head-flit (re)injection.
    pub retry_timers: VecDeque<TimerRecord>,
    /// Armed when a READ/RGET request is acked but still awaits its response.
    pub response_timers: VecDeque<TimerRecord>,
    /// A multi-flit timeout retransmission partway through its packet.
    pub timeout_replay_in_progress: Option<(NodeId, SeqNum)>,
}

impl RetryTracker {
    pub fn new(nodes: usize) -> Self {
        RetryTracker {
            per_dest: (0..nodes).map(|_| DestRetry::new()).collect(),
            pending_nack_replays: VecDeque::new(),
            retry_timers: VecDeque::new(),
            response_timers: VecDeque::new(),
            timeout_replay_in_progress: None,
        }
    }

    pub fn dest(&self, dest: NodeId) -> &DestRetry {
        &self.per_dest[dest]
    }

    pub fn dest_mut(&mut self, dest: NodeId) -> &mut DestRetry {
        &mut self.per_dest[dest]
    }

    pub fn state(&self, dest: NodeId) -> &RetryState {
        &self.per_dest[dest].state
    }

    /// Park an ACK until the in-progress replay completes. Keeps the highest.
    pub fn pend_ack(&mut self, dest: NodeId, seq: SeqNum) {
        let pending = &mut self.per_dest[dest].pending_ack;
        if pending.map_or(true, |p| seq > p) {
            *pending = Some(seq);
        }
    }

    pub fn arm_retry_timer(&mut self, expiry: Cycle, dest: NodeId, seq_num: SeqNum) {
        self.retry_timers.push_back(TimerRecord {
            expiry,
            dest,
            seq_num,
        });
    }

    pub fn arm_response_timer(&mut self, expiry: Cycle, dest: NodeId, seq_num: SeqNum) {
        self.response_timers.push_back(TimerRecord {
            expiry,
            dest,
            seq_num,
        });
    }
}

// ─── SACK helpers ───────────────────────────────────────────────────────────

/// Distance (in packets) from the current position to the next gap in the
/// SACK vector, or `None` when every remaining bit up to the window edge is
/// set or no set bit lies above the first gap. One bits are received
/// packets; a zero with no ones above it is ignored (nothing to steer to).
pub fn sack_vec_next_retrans(mut sack_vec: u64, sack_vec_length: u32) -> Option<u32> {
    let mut idx = 0;
    while (sack_vec & 1) != 0 && idx <= sack_vec_length {
        sack_vec >>= 1;
        idx += 1;
    }
    if idx > sack_vec_length {
        return None;
    }
    if sack_vec == 0 {
        None
    } else {
        Some(idx)
    }
}

/// Shift a newly received SACK vector onto the base of an in-progress replay
/// and OR it into the existing vector. Sequence numbers below the new
/// cumulative ACK are marked received. Returns the shifted new vector; a
/// merge that would clear a previously set bit is reported to the caller as
/// the (old, shifted) pair for the protocol error.
pub fn shift_sack_vec(new_vec: u64, new_ack: SeqNum, base_seq: SeqNum) -> u64 {
    let diff = new_ack as i64 + 1 - base_seq as i64;
    if diff > 0 {
        let mask = if diff >= 64 { u64::MAX } else { (1u64 << diff) - 1 };
        (new_vec << diff.min(63)) | mask
    } else if diff < 0 {
        new_vec >> ((-diff).min(63))
    } else {
        new_vec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn next_retrans_finds_first_gap_with_higher_ones() {
        // bit0 = next packet after the one in progress.
        assert_eq!(sack_vec_next_retrans(0b110, 16), Some(0));
        assert_eq!(sack_vec_next_retrans(0b1011, 16), Some(2));
    }

    #[test]
    fn next_retrans_ignores_trailing_zeroes() {
        assert_eq!(sack_vec_next_retrans(0b0011, 16), None);
        assert_eq!(sack_vec_next_retrans(0, 16), None);
    }

    #[test]
    fn next_retrans_saturated_vector() {
        assert_eq!(sack_vec_next_retrans(u64::MAX, 64), None);
    }

    #[test]
    fn pend_ack_keeps_highest() {
        let mut tracker = RetryTracker::new(2);
        tracker.pend_ack(1, 5);
        tracker.pend_ack(1, 3);
        assert_eq!(tracker.dest(1).pending_ack, Some(5));
        tracker.pend_ack(1, 9);
        assert_eq!(tracker.dest(1).pending_ack, Some(9));
    }

    #[test]
    fn replay_index_shifts_down_for_removals_below() {
        let mut state = RetryState::NackBased { opb_index: 3 };
        state.note_entry_removed_below(1);
        assert_eq!(state.replay_index(), Some(2));
        state.note_entry_removed_below(5);
        assert_eq!(state.replay_index(), Some(2));
    }

    #[test]
    fn shift_positive_base_diff_marks_lower_bits_received() {
        // New ack is 2 ahead of the replay base: everything below it is set.
        assert_eq!(shift_sack_vec(0b100, 5, 4), (0b100 << 2) | 0b11);
    }

    #[test]
    fn shift_negative_base_diff_drops_lower_bits() {
        assert_eq!(shift_sack_vec(0b1100, 3, 6), 0b11);
    }

    proptest! {
        /// A superset SACK merged onto the same base never clears set bits.
        #[test]
        fn proptest_superset_merge_preserves_bits(
            old_vec in any::<u64>(),
            extra in any::<u64>(),
            base in 1u64..1000,
        ) {
            let new_vec = old_vec | extra;
            let shifted = shift_sack_vec(new_vec, base - 1, base);
            prop_assert_eq!((!shifted) & old_vec, 0);
        }

        /// Advancing the cumulative ACK can only add bits, never clear them.
        #[test]
        fn proptest_advancing_ack_preserves_bits(
            vec in any::<u64>(),
            base in 10u64..100,
            advance in 0u64..8,
        ) {
            let shifted = shift_sack_vec(vec, base - 1 + advance, base);
            let reference = shift_sack_vec(vec, base - 1, base);
            // Bits surviving the window in both encodings stay set.
            prop_assert_eq!((!shifted) & (reference << advance) & !((1u64 << advance) - 1), 0);
        }
    }
}
