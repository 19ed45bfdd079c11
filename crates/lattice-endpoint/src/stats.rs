//! # Endpoint statistics
//!
//! Two windows run in parallel: steady-state counters that reset on
//! [`EndpointStats::clear_steady_state`] (the measurement window), and
//! `*_full_sim` counters that cover the whole run. All structs serialize to
//! JSON for run snapshots.

use serde::Serialize;

/// Cycles an injection opportunity was lost, by cause.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IdleCycleStats {
    pub generation_not_attempted: u64,
    pub gen_attempted_but_blocked: u64,
    pub new_flit_not_injected: u64,
    pub packet_processing_penalty: u64,
    pub staging_buffer_full: u64,
    pub inj_present_but_blocked: u64,
    pub link_avail_no_new_flits: u64,
    pub all_blocked_on_timeout: u64,
    pub retransmitting: u64,
}

/// Per-gate injection-blocked counters (targets x cycles).
#[derive(Debug, Clone, Default, Serialize)]
pub struct BlockedStats {
    pub req_xaction_limit: u64,
    pub req_size_limit: u64,
    pub req_ws_tokens: u64,
    pub read_req_get_limit: u64,
    pub read_req_size_limit: u64,
    pub resp_xaction_limit: u64,
    pub resp_size_limit: u64,
    pub resp_ws_tokens: u64,
    pub rget_req_xaction_limit: u64,
    pub rget_req_limit: u64,
    pub rget_req_size_limit: u64,
    pub rget_req_inbound_limit: u64,
    pub rget_get_req_get_limit: u64,
    pub rget_get_req_inbound_limit: u64,
    pub rget_get_req_ws_tokens: u64,
    pub global_get_request_limit: u64,
    pub global_get_data_limit: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointStats {
    // ─── Generation ───
    pub generated_packets: u64,
    pub generated_flits: u64,
    pub generated_packets_full_sim: u64,
    pub generated_flits_full_sim: u64,

    // ─── Injection ───
    pub sent_packets: u64,
    pub sent_flits: u64,
    pub sent_data_flits: u64,
    pub new_sent_packets: u64,
    pub new_sent_flits: u64,
    pub new_sent_data_flits: u64,

    // ─── Retransmission ───
    pub packets_retransmitted: u64,
    pub packets_retransmitted_full_sim: u64,
    pub flits_retransmitted_full_sim: u64,
    pub max_packet_retries_full_sim: u32,
    pub retry_timeouts: u64,

    // ─── Receive ───
    pub received_packets: u64,
    pub received_flits: u64,
    pub received_data_flits: u64,
    pub good_packets_received: u64,
    pub good_packets_write_received: u64,
    pub good_flits_received: u64,
    pub good_data_flits_received: u64,
    pub good_packets_received_full_sim: u64,
    pub good_flits_received_full_sim: u64,
    pub good_data_flits_received_full_sim: u64,
    pub duplicate_packets_received: u64,
    pub duplicate_flits_received: u64,
    pub duplicate_packets_received_full_sim: u64,
    pub duplicate_flits_received_full_sim: u64,
    pub bad_packets_received: u64,
    pub bad_flits_received: u64,
    pub bad_packets_received_full_sim: u64,
    pub bad_flits_received_full_sim: u64,

    // ─── Retirement ───
    pub packets_retired: u64,
    pub packets_retired_full_sim: u64,
    pub flits_retired: u64,
    pub flits_retired_full_sim: u64,
    pub data_flits_retired: u64,
    pub data_flits_retired_full_sim: u64,

    // ─── Acknowledgement ───
    pub nacks_sent: u64,
    pub nacks_received: u64,
    pub sacks_sent: u64,
    pub sacks_received: u64,
    pub standalone_acks_sent: u64,

    // ─── RGET conversion ───
    pub puts_converted_to_rgets: u64,
    pub flits_dropped_for_rget_conversion: u64,

    // ─── Put queue ───
    pub packets_dequeued: u64,
    /// Dropped put data in flits, steady-state window.
    pub packet_dropped: u64,
    /// Dropped put data in flits, whole run.
    pub packet_dropped_full: u64,

    // ─── Latency (steady-state) ───
    pub packet_latency_sum: u64,
    pub packet_latency_samples: u64,

    // ─── OPB / arbitration pressure ───
    pub opb_insertion_conflicts: u64,
    pub idle: IdleCycleStats,
    pub blocked: BlockedStats,

    // ─── Watermarks ───
    pub max_outstanding_xactions_per_dest: usize,
    pub max_outstanding_xactions_all_dests: usize,
    pub max_outstanding_data_per_dest: usize,
    pub max_outstanding_data_all_dests: usize,
}

impl EndpointStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mean end-to-end packet latency over the measurement window.
    pub fn mean_packet_latency(&self) -> f64 {
        if self.packet_latency_samples == 0 {
            0.0
        } else {
            self.packet_latency_sum as f64 / self.packet_latency_samples as f64
        }
    }

    /// Fraction of injected packets that were retransmissions.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.sent_packets == 0 {
            0.0
        } else {
            self.packets_retransmitted as f64 / self.sent_packets as f64
        }
    }

    /// Reset the steady-state window; `*_full_sim` counters survive.
    pub fn clear_steady_state(&mut self) {
        self.generated_packets = 0;
        self.generated_flits = 0;
        self.sent_packets = 0;
        self.sent_flits = 0;
        self.sent_data_flits = 0;
        self.new_sent_packets = 0;
        self.new_sent_flits = 0;
        self.new_sent_data_flits = 0;
        self.packets_retransmitted = 0;
        self.received_packets = 0;
        self.received_flits = 0;
        self.received_data_flits = 0;
        self.good_packets_received = 0;
        self.good_packets_write_received = 0;
        self.good_flits_received = 0;
        self.good_data_flits_received = 0;
        self.duplicate_packets_received = 0;
        self.duplicate_flits_received = 0;
        self.bad_packets_received = 0;
        self.bad_flits_received = 0;
        self.packets_retired = 0;
        self.flits_retired = 0;
        self.data_flits_retired = 0;
        self.packets_dequeued = 0;
        self.packet_dropped = 0;
        self.packet_latency_sum = 0;
        self.packet_latency_samples = 0;
        self.idle = IdleCycleStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_preserves_full_sim_counters() {
        let mut stats = EndpointStats::new();
        stats.good_packets_received = 10;
        stats.good_packets_received_full_sim = 10;
        stats.packet_dropped = 5;
        stats.packet_dropped_full = 5;
        stats.clear_steady_state();
        assert_eq!(stats.good_packets_received, 0);
        assert_eq!(stats.good_packets_received_full_sim, 10);
        assert_eq!(stats.packet_dropped, 0);
        assert_eq!(stats.packet_dropped_full, 5);
    }

    #[test]
    fn mean_latency_handles_empty_window() {
        let stats = EndpointStats::new();
        assert_eq!(stats.mean_packet_latency(), 0.0);
    }

    #[test]
    fn retransmit_ratio() {
        let mut stats = EndpointStats::new();
        stats.sent_packets = 200;
        stats.packets_retransmitted = 10;
        assert!((stats.retransmit_ratio() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn stats_serialize_to_json() {
        let stats = EndpointStats::new();
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"nacks_sent\":0"));
        assert!(json.contains("\"blocked\""));
    }
}
