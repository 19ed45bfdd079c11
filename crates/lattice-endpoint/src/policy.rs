//! # Host congestion-control policies
//!
//! Per-peer state for the selectable host-control policies.
//!
//! ## Halt window ("mypolicy")
//!
//! ```text
//!            non-dup ACK            non-dup ACK at +max
//!   halted ──────────────▶ opening ───────────────────▶ flood gate open
//!     ▲        dup ACK        │                              │
//!     └───────────────────────┘        dup ACK + congestion  │
//!     ▲                                 encoding (ack==nack) │
//!     └──────────────────────────────────────────────────────┘
//! ```
//!
//! `halt_state` is a small integer window: positive values accelerate toward
//! opening the flood gate (`halt_active = false` at
//! `max_packet_send_per_ack`), non-positive values throttle, saturating at
//! `-max_ack_before_send_packet`. The byte bucket
//! `send_allowance_counter_size` refills from acked data and gates every
//! data-bearing emission while halted.
//!
//! ## TCP-like / ECN
//!
//! Classic cwnd/ssthresh: slow-start grows linearly per ACK, congestion
//! avoidance quadratically; a NACK halves both. The ECN variant additionally
//! runs an EWMA of the congestion-marked flit fraction each `ecn_period` and
//! scales the window down by it.

use crate::config::EndpointConfig;
use crate::receiver::RecvdAck;
use crate::{Cycle, SeqNum};

/// Congestion state kept for every peer, on both sides of the connection.
#[derive(Debug, Clone)]
pub struct PeerCongestionState {
    // ─── Target side ───
    pub periodic_buffer_occupancy: usize,
    pub periodic_ack_occupancy: usize,
    pub highest_bad_seq_num_from_initiator: SeqNum,
    pub initiator_retransmitting: bool,
    pub put_drop_counter: u32,
    pub space_after_nack_reserved: bool,
    /// Allowance handed over from another stream's accumulated ACK.
    pub speculative_ack_allowance_size: usize,
    pub earliest_accum_ack_shared_time: Option<Cycle>,
    pub ecn_count: u64,
    pub ecn_total: u64,
    pub ecn_running_percent: f64,

    // ─── Initiator side ───
    pub halt_active: bool,
    pub halt_state: i32,
    pub send_allowance_counter_size: usize,
    pub must_retry_at_least_one_packet: bool,
    pub time_last_ack_recvd: Option<Cycle>,
    pub last_valid_ack_seq_num_recvd: SeqNum,
    /// A NACK that arrived mid-replay; the replay restarts from its
    /// successor once the current packet finishes.
    pub pending_nack_seq_num: Option<SeqNum>,
    pub cwnd: usize,
    pub ssthresh: usize,
}

impl PeerCongestionState {
    pub fn new(cfg: &EndpointConfig) -> Self {
        PeerCongestionState {
            periodic_buffer_occupancy: 0,
            periodic_ack_occupancy: 0,
            highest_bad_seq_num_from_initiator: 0,
            initiator_retransmitting: false,
            put_drop_counter: 0,
            space_after_nack_reserved: false,
            speculative_ack_allowance_size: 0,
            earliest_accum_ack_shared_time: None,
            ecn_count: 0,
            ecn_total: 0,
            ecn_running_percent: 0.0,
            halt_active: false,
            halt_state: 0,
            send_allowance_counter_size: 0,
            must_retry_at_least_one_packet: false,
            time_last_ack_recvd: None,
            last_valid_ack_seq_num_recvd: 0,
            pending_nack_seq_num: None,
            cwnd: cfg.host_control_tcplikepolicy_mss,
            ssthresh: cfg.xaction_size_limit_flits(),
        }
    }

    /// The halt/allowance gate: may a data-bearing packet of `size` flits go
    /// out toward this peer right now?
    pub fn allowance_gate_open(&self, size: usize) -> bool {
        !self.halt_active
            || self.send_allowance_counter_size >= size
            || self.must_retry_at_least_one_packet
    }

    /// Consume allowance for an emitted data-bearing head.
    pub fn spend_allowance(&mut self, size: usize) {
        if self.send_allowance_counter_size >= size {
            self.send_allowance_counter_size -= size;
            self.must_retry_at_least_one_packet = false;
        }
    }

    /// Reset the window after `host_control_timeout` cycles without an ACK.
    pub fn halt_timeout_reset(&mut self) {
        self.halt_active = false;
        self.send_allowance_counter_size = 0;
        self.halt_state = -1;
        self.time_last_ack_recvd = None;
    }

    /// TCP-like growth on a cumulative ACK covering `acked_size` flits.
    pub fn tcp_on_ack(&mut self, acked_size: usize, cfg: &EndpointConfig) {
        let mss = cfg.host_control_tcplikepolicy_mss;
        if self.cwnd < self.ssthresh {
            self.cwnd += acked_size.min(mss);
        } else {
            self.cwnd += (mss * mss) / self.cwnd.max(1);
        }
    }

    /// TCP-like multiplicative decrease on a NACK.
    pub fn tcp_on_nack(&mut self) {
        self.ssthresh = self.cwnd >> 1;
        self.cwnd >>= 1;
    }

    /// Fold one ECN window sample into the running percentage and scale the
    /// window. Called every `ecn_period`; the decay factor was already
    /// applied by the caller.
    pub fn ecn_apply_sample(&mut self, cfg: &EndpointConfig) {
        if self.ecn_total == 0 {
            return;
        }
        let sample = self.ecn_count as f64 / self.ecn_total as f64;
        self.ecn_running_percent += sample * cfg.ecn_param_g;

        self.ssthresh =
            ((self.ssthresh as f64) * (1.0 - self.ecn_running_percent / 2.0)) as usize;
        self.cwnd = ((self.cwnd as f64) * (1.0 - self.ecn_running_percent)) as usize;

        self.cwnd = self.cwnd.max(cfg.host_control_tcplikepolicy_mss);
        self.ssthresh = self.ssthresh.max(cfg.xaction_size_limit_flits());
    }

    /// Drive the halt window with one received acknowledgement.
    ///
    /// `acked_size` is the data covered by this ACK; `replay_in_progress`
    /// reports whether a NACK/SACK replay toward this peer is active (a
    /// standalone duplicate ACK during a replay still refills allowance).
    pub fn mypolicy_on_ack(
        &mut self,
        record: &RecvdAck,
        acked_size: usize,
        replay_in_progress: bool,
        contains_put: bool,
        now: Cycle,
        cfg: &EndpointConfig,
    ) {
        self.time_last_ack_recvd = Some(now);

        let Some(ack) = record.ack_seq_num else {
            // A pure NACK slams the window shut and grants one replay.
            self.halt_state = cfg.max_ack_before_send_packet();
            self.halt_active = true;
            if self.send_allowance_counter_size == 0 {
                self.send_allowance_counter_size += acked_size;
            }
            self.must_retry_at_least_one_packet = true;
            return;
        };

        let duplicate = self.last_valid_ack_seq_num_recvd >= ack;
        let congested = record.nack_seq_num == Some(ack);
        let partial_incremented = congested && !duplicate;

        // Piggybacked duplicates carry no information unless they also carry
        // the congestion encoding.
        if duplicate && !record.is_standalone && !congested {
            return;
        }
        if !duplicate && !contains_put {
            return;
        }

        if self.halt_active {
            if self.halt_state > 0 {
                if duplicate {
                    self.halt_state = -1;
                } else if partial_incremented {
                    self.halt_state = 0;
                } else if self.halt_state == cfg.host_control_max_packet_send_per_ack {
                    self.halt_active = false;
                } else {
                    self.halt_state += 1;
                }
            } else if duplicate {
                if self.halt_state > cfg.max_ack_before_send_packet() {
                    self.halt_state -= 1;
                }
            } else if partial_incremented {
                self.halt_state = 0;
            } else {
                self.halt_state += 1;
            }

            if !duplicate {
                if self.halt_state > 0 {
                    self.send_allowance_counter_size += 2 * acked_size;
                } else {
                    self.send_allowance_counter_size += acked_size;
                }
            } else if record.is_standalone && replay_in_progress {
                self.send_allowance_counter_size += acked_size;
            }
        } else if duplicate && congested {
            self.halt_active = true;
            self.halt_state = -1;
        } else if partial_incremented {
            self.halt_active = true;
            self.halt_state = 0;
            self.send_allowance_counter_size += acked_size;
        }

        self.last_valid_ack_seq_num_recvd = ack;
    }
}

/// Bookkeeping for the target-side "initiator is retransmitting" signal.
/// Returns the change in the number of retransmitting initiators.
pub fn note_bad_seq(peer: &mut PeerCongestionState, seq: SeqNum) -> i32 {
    let mut delta = 0;
    if !peer.initiator_retransmitting {
        peer.initiator_retransmitting = true;
        delta = 1;
    }
    if peer.highest_bad_seq_num_from_initiator < seq {
        peer.highest_bad_seq_num_from_initiator = seq;
    }
    delta
}

/// An in-order receipt may clear the retransmitting signal once the highest
/// previously bad sequence number has come through.
pub fn note_good_seq(peer: &mut PeerCongestionState, seq: SeqNum) -> i32 {
    if peer.initiator_retransmitting && seq == peer.highest_bad_seq_num_from_initiator {
        peer.initiator_retransmitting = false;
        return -1;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeId;

    fn cfg() -> EndpointConfig {
        EndpointConfig {
            host_control_max_packet_send_per_ack: 4,
            host_control_max_ack_before_send_packet: 5,
            host_control_tcplikepolicy_mss: 8,
            ..Default::default()
        }
    }

    fn ack(seq: SeqNum, standalone: bool) -> RecvdAck {
        RecvdAck {
            time: 0,
            subnet: 0,
            target: 1 as NodeId,
            ack_seq_num: Some(seq),
            nack_seq_num: None,
            flit_id: 0,
            is_standalone: standalone,
            sack: false,
            sack_vec: 0,
        }
    }

    fn dup_congested(seq: SeqNum) -> RecvdAck {
        RecvdAck {
            nack_seq_num: Some(seq),
            ..ack(seq, true)
        }
    }

    fn nack() -> RecvdAck {
        RecvdAck {
            ack_seq_num: None,
            nack_seq_num: Some(3),
            ..ack(0, true)
        }
    }

    #[test]
    fn nack_closes_the_gate_and_grants_one_retry() {
        let cfg = cfg();
        let mut peer = PeerCongestionState::new(&cfg);
        peer.mypolicy_on_ack(&nack(), 8, false, true, 100, &cfg);
        assert!(peer.halt_active);
        assert_eq!(peer.halt_state, -5);
        assert!(peer.must_retry_at_least_one_packet);
        assert_eq!(peer.send_allowance_counter_size, 8);
        assert!(peer.allowance_gate_open(64), "retry override holds the gate open");
    }

    #[test]
    fn duplicates_saturate_at_negative_bound() {
        let cfg = cfg();
        let mut peer = PeerCongestionState::new(&cfg);
        peer.mypolicy_on_ack(&nack(), 8, false, true, 100, &cfg);
        peer.must_retry_at_least_one_packet = false;
        // Already at the bound: five more duplicates stay there.
        for _ in 0..5 {
            peer.mypolicy_on_ack(&dup_congested(0), 8, false, true, 101, &cfg);
        }
        assert_eq!(peer.halt_state, cfg.max_ack_before_send_packet());
        assert!(peer.halt_active);
        assert!(!peer.allowance_gate_open(64));
    }

    #[test]
    fn incremental_acks_reopen_the_flood_gate() {
        let cfg = cfg();
        let mut peer = PeerCongestionState::new(&cfg);
        peer.mypolicy_on_ack(&nack(), 8, false, true, 100, &cfg);
        peer.must_retry_at_least_one_packet = false;

        // Climb from -5 through the positive window to the open threshold.
        let mut seq = 1;
        for _ in 0..100 {
            if !peer.halt_active {
                break;
            }
            peer.mypolicy_on_ack(&ack(seq, true), 8, false, true, 101, &cfg);
            seq += 1;
        }
        assert!(!peer.halt_active, "enough incremental acks open the gate");
        assert!(peer.allowance_gate_open(1 << 20));
    }

    #[test]
    fn congestion_duplicate_while_open_rehalts() {
        let cfg = cfg();
        let mut peer = PeerCongestionState::new(&cfg);
        assert!(!peer.halt_active);
        peer.last_valid_ack_seq_num_recvd = 5;
        peer.mypolicy_on_ack(&dup_congested(5), 8, false, true, 100, &cfg);
        assert!(peer.halt_active);
        assert_eq!(peer.halt_state, -1);
    }

    #[test]
    fn piggyback_duplicate_without_congestion_is_ignored() {
        let cfg = cfg();
        let mut peer = PeerCongestionState::new(&cfg);
        peer.last_valid_ack_seq_num_recvd = 5;
        let before = peer.clone();
        peer.mypolicy_on_ack(&ack(3, false), 8, false, true, 100, &cfg);
        assert_eq!(peer.halt_active, before.halt_active);
        assert_eq!(peer.halt_state, before.halt_state);
        assert_eq!(peer.last_valid_ack_seq_num_recvd, 5);
    }

    #[test]
    fn standalone_duplicate_during_replay_refills_allowance() {
        let cfg = cfg();
        let mut peer = PeerCongestionState::new(&cfg);
        peer.mypolicy_on_ack(&nack(), 8, false, true, 100, &cfg);
        peer.must_retry_at_least_one_packet = false;
        let before = peer.send_allowance_counter_size;
        peer.mypolicy_on_ack(&ack(0, true), 8, true, true, 101, &cfg);
        assert_eq!(peer.send_allowance_counter_size, before + 8);
    }

    #[test]
    fn halt_timeout_resets_window() {
        let cfg = cfg();
        let mut peer = PeerCongestionState::new(&cfg);
        peer.mypolicy_on_ack(&nack(), 8, false, true, 100, &cfg);
        peer.halt_timeout_reset();
        assert!(!peer.halt_active);
        assert_eq!(peer.halt_state, -1);
        assert_eq!(peer.send_allowance_counter_size, 0);
        assert!(peer.time_last_ack_recvd.is_none());
    }

    #[test]
    fn tcp_slow_start_then_congestion_avoidance() {
        let cfg = cfg();
        let mut peer = PeerCongestionState::new(&cfg);
        peer.ssthresh = 32;
        assert_eq!(peer.cwnd, 8);
        peer.tcp_on_ack(8, &cfg); // slow start: +MSS
        assert_eq!(peer.cwnd, 16);
        peer.tcp_on_ack(8, &cfg);
        peer.tcp_on_ack(8, &cfg);
        assert_eq!(peer.cwnd, 32);
        peer.tcp_on_ack(8, &cfg); // avoidance: +MSS^2/cwnd
        assert_eq!(peer.cwnd, 34);
    }

    #[test]
    fn tcp_nack_halves_window() {
        let cfg = cfg();
        let mut peer = PeerCongestionState::new(&cfg);
        peer.cwnd = 64;
        peer.tcp_on_nack();
        assert_eq!(peer.cwnd, 32);
        assert_eq!(peer.ssthresh, 32);
    }

    #[test]
    fn ecn_sample_scales_window_down() {
        let cfg = cfg();
        let mut peer = PeerCongestionState::new(&cfg);
        peer.cwnd = 1 << 20;
        peer.ssthresh = 1 << 20;
        peer.ecn_total = 100;
        peer.ecn_count = 50;
        peer.ecn_apply_sample(&cfg);
        assert!(peer.ecn_running_percent > 0.0);
        assert!(peer.cwnd < 1 << 20);
        assert!(peer.cwnd >= cfg.host_control_tcplikepolicy_mss);
    }

    #[test]
    fn retransmitting_signal_sets_and_clears() {
        let cfg = cfg();
        let mut peer = PeerCongestionState::new(&cfg);
        assert_eq!(note_bad_seq(&mut peer, 7), 1);
        assert_eq!(note_bad_seq(&mut peer, 9), 0);
        assert_eq!(note_good_seq(&mut peer, 8), 0);
        assert_eq!(note_good_seq(&mut peer, 9), -1);
        assert!(!peer.initiator_retransmitting);
    }
}
