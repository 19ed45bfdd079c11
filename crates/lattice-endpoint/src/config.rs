//! # Endpoint configuration
//!
//! Every knob the endpoint recognizes, named after the simulator's option
//! strings. Sizes given in KB are converted to flits through
//! `flit_size_bytes`; bandwidths given in Gbps are converted to flits/cycle.

use serde::Deserialize;

use crate::error::ConfigError;
use crate::NodeId;

/// Injection arbiter mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbMode {
    #[default]
    RoundRobin,
    Weighted,
}

/// Host congestion-control policy selector (`host_control_policy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostControlPolicy {
    #[default]
    None,
    MyPolicy,
    TcpLike,
    Ecn,
    Homa,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    // ─── Topology ───
    pub nodes: usize,
    pub subnets: usize,
    pub classes: usize,
    pub num_vcs: usize,
    pub flit_size_bytes: usize,

    // ─── Arbitration ───
    pub endpoint_tx_arb_type: ArbMode,
    pub weighted_sched_req_tokens: i64,
    pub weighted_sched_rsp_tokens: i64,
    pub weighted_sched_incr_tokens: i64,
    pub weighted_sched_rsp_incr_mult: i64,

    // ─── Injection pipeline ───
    pub use_endpoint_crediting: bool,
    pub inj_buf_depth: usize,
    pub packet_processing_penalty: u64,
    pub max_flits_waiting_to_inject: usize,
    pub packet_gen_attempts: usize,

    // ─── Processing latencies ───
    pub ack_processing_latency: u64,
    pub rsp_processing_latency: u64,
    pub req_processing_latency: u64,
    pub rget_processing_latency: u64,

    // ─── Standalone ACK triggers ───
    pub cycles_before_standalone_ack: u64,
    pub packets_before_standalone_ack: u32,

    // ─── SACK ───
    pub enable_sack: bool,
    pub sack_vec_length: u32,
    pub max_receivable_pkts_after_drop: u64,

    // ─── OPB geometry ───
    pub opb_max_pkt_occupancy: usize,
    pub opb_ways: u32,
    pub opb_dest_idx_bits: u32,
    pub opb_seq_num_idx_bits: u32,

    // ─── Timers ───
    pub retry_timer_timeout: u64,
    pub max_retry_attempts: u32,
    pub response_timer_timeout: u64,
    pub rget_req_pull_timeout: u64,
    pub estimate_round_trip_cycles: u64,

    // ─── Metering ───
    pub endpoint_xaction_limit_per_dest: usize,
    pub endpoint_xaction_size_limit_per_dest_in_kb: usize,
    pub endpoint_get_limit_per_dest: usize,
    pub endpoint_rget_req_limit_per_dest: usize,
    pub endpoint_get_inbound_size_limit_per_dest_in_kb: usize,
    pub endpoint_rget_inbound_size_limit_per_dest_in_kb: usize,
    pub endpoint_global_get_limit: usize,
    pub endpoint_global_get_req_size_limit_in_kb: usize,
    pub endpoint_use_new_rget_metering: bool,

    // ─── Put→RGET conversion ───
    pub put_to_rget_conversion_rate: f64,
    pub put_to_noop: bool,
    pub enable_adaptive_rget: bool,
    pub rget_convert_sample_period: u64,
    pub rget_convert_num_samples: u32,
    pub rget_convert_unacked_perc: f64,
    pub rget_revert_acked_perc: f64,
    pub rget_convert_min_data_before_convert: usize,
    pub rget_min_samples_since_last_transition: u64,

    // ─── Host control policy ───
    pub host_control_policy: HostControlPolicy,
    pub mypolicy_delayed_ack_threshold: usize,
    pub mypolicy_nack_reservation_size: usize,
    pub host_control_max_packet_send_per_ack: i32,
    pub host_control_max_ack_before_send_packet: i32,
    pub host_control_timeout: u64,
    pub shared_ack_timeout: u64,
    pub speculative_ack_queue_size: usize,
    pub host_control_fairness_sampling_period: u64,
    pub host_control_fairness_reset_period: u64,
    pub host_control_tcplikepolicy_mss: usize,
    pub ecn_period: u64,
    pub ecn_param_g: f64,
    pub ecn_threshold_percent: f64,

    // ─── Put wait queue model ───
    pub put_wait_buf_size: usize,
    pub load_balance_buf_size: usize,
    pub put_latency_header: u64,
    pub put_header_flit: usize,
    pub host_bandwidth_gbps: f64,
    pub host_bandwidth_gbps_low: f64,
    pub inter_host_bandwidth_change_mean: f64,
    pub inter_host_bandwidth_change_variance: f64,
    /// Node ids experiencing host congestion; empty means all of them.
    pub host_congestion_active: Vec<NodeId>,

    pub seed: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            nodes: 2,
            subnets: 1,
            classes: 1,
            num_vcs: 4,
            flit_size_bytes: 32,

            endpoint_tx_arb_type: ArbMode::RoundRobin,
            weighted_sched_req_tokens: 64,
            weighted_sched_rsp_tokens: 64,
            weighted_sched_incr_tokens: 1,
            weighted_sched_rsp_incr_mult: 1,

            use_endpoint_crediting: false,
            inj_buf_depth: 4,
            packet_processing_penalty: 1,
            max_flits_waiting_to_inject: 16,
            packet_gen_attempts: 4,

            ack_processing_latency: 0,
            rsp_processing_latency: 0,
            req_processing_latency: 0,
            rget_processing_latency: 0,

            cycles_before_standalone_ack: 100,
            packets_before_standalone_ack: 8,

            enable_sack: false,
            sack_vec_length: 16,
            max_receivable_pkts_after_drop: 64,

            opb_max_pkt_occupancy: 64,
            opb_ways: 4,
            opb_dest_idx_bits: 4,
            opb_seq_num_idx_bits: 4,

            retry_timer_timeout: 1000,
            max_retry_attempts: 16,
            response_timer_timeout: 4000,
            rget_req_pull_timeout: 4000,
            estimate_round_trip_cycles: 4000,

            endpoint_xaction_limit_per_dest: 16,
            endpoint_xaction_size_limit_per_dest_in_kb: 16,
            endpoint_get_limit_per_dest: 8,
            endpoint_rget_req_limit_per_dest: 8,
            endpoint_get_inbound_size_limit_per_dest_in_kb: 16,
            endpoint_rget_inbound_size_limit_per_dest_in_kb: 16,
            endpoint_global_get_limit: 64,
            endpoint_global_get_req_size_limit_in_kb: 64,
            endpoint_use_new_rget_metering: false,

            put_to_rget_conversion_rate: 0.0,
            put_to_noop: false,
            enable_adaptive_rget: false,
            rget_convert_sample_period: 1000,
            rget_convert_num_samples: 2,
            rget_convert_unacked_perc: 0.7,
            rget_revert_acked_perc: 0.9,
            rget_convert_min_data_before_convert: 64,
            rget_min_samples_since_last_transition: 2,

            host_control_policy: HostControlPolicy::None,
            mypolicy_delayed_ack_threshold: 64,
            mypolicy_nack_reservation_size: 16,
            host_control_max_packet_send_per_ack: 4,
            host_control_max_ack_before_send_packet: 4,
            host_control_timeout: 10_000,
            shared_ack_timeout: 1000,
            speculative_ack_queue_size: 8,
            host_control_fairness_sampling_period: 1000,
            host_control_fairness_reset_period: 10_000,
            host_control_tcplikepolicy_mss: 8,
            ecn_period: 1000,
            ecn_param_g: 0.0625,
            ecn_threshold_percent: 0.5,

            put_wait_buf_size: 256,
            load_balance_buf_size: 64,
            put_latency_header: 0,
            put_header_flit: 2,
            host_bandwidth_gbps: 100.0,
            host_bandwidth_gbps_low: 20.0,
            inter_host_bandwidth_change_mean: 5000.0,
            inter_host_bandwidth_change_variance: 1.0,
            host_congestion_active: Vec::new(),

            seed: 123,
        }
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sack_vec_length > 64 {
            return Err(ConfigError::SackVecTooLong(self.sack_vec_length));
        }
        if self.rget_convert_num_samples > 2 {
            return Err(ConfigError::RgetSampleWindow(self.rget_convert_num_samples));
        }
        if self.host_control_policy == HostControlPolicy::MyPolicy
            && self.load_balance_buf_size >= self.put_wait_buf_size
        {
            return Err(ConfigError::LoadBalanceExceedsPutBuffer {
                lbq: self.load_balance_buf_size,
                put: self.put_wait_buf_size,
            });
        }
        Ok(())
    }

    /// Mask selecting the configured number of SACK bits.
    pub fn sack_vec_mask(&self) -> u64 {
        if self.sack_vec_length >= 64 {
            u64::MAX
        } else {
            (1u64 << self.sack_vec_length) - 1
        }
    }

    fn kb_to_flits(&self, kb: usize) -> usize {
        kb * 1000 / self.flit_size_bytes
    }

    pub fn xaction_size_limit_flits(&self) -> usize {
        self.kb_to_flits(self.endpoint_xaction_size_limit_per_dest_in_kb)
    }

    pub fn get_inbound_size_limit_flits(&self) -> usize {
        self.kb_to_flits(self.endpoint_get_inbound_size_limit_per_dest_in_kb)
    }

    pub fn rget_inbound_size_limit_flits(&self) -> usize {
        self.kb_to_flits(self.endpoint_rget_inbound_size_limit_per_dest_in_kb)
    }

    pub fn global_get_req_size_limit_flits(&self) -> usize {
        self.kb_to_flits(self.endpoint_global_get_req_size_limit_in_kb)
    }

    /// Gbps to flits per cycle at one cycle per 2.5 GHz tick.
    fn gbps_to_flits_per_cycle(&self, gbps: f64) -> f64 {
        gbps * 2.5 / (self.flit_size_bytes as f64 * 8.0)
    }

    pub fn host_bandwidth_high(&self) -> f64 {
        self.gbps_to_flits_per_cycle(self.host_bandwidth_gbps)
    }

    pub fn host_bandwidth_low(&self) -> f64 {
        self.gbps_to_flits_per_cycle(self.host_bandwidth_gbps_low)
    }

    /// The retry timeout, with the Homa-like policy's RTT-derived override.
    pub fn effective_retry_timer_timeout(&self) -> u64 {
        if self.host_control_policy == HostControlPolicy::Homa {
            self.estimate_round_trip_cycles * 3
        } else {
            self.retry_timer_timeout
        }
    }

    /// Negative saturation bound for the halt-state window.
    pub fn max_ack_before_send_packet(&self) -> i32 {
        -self.host_control_max_ack_before_send_packet
    }

    /// ECN marking threshold in flits of put-queue occupancy.
    pub fn ecn_threshold(&self) -> usize {
        (self.load_balance_buf_size as f64 * self.ecn_threshold_percent) as usize
    }

    /// Whether this node's host experiences the slow-bandwidth band.
    pub fn host_congestion_enabled(&self, node: NodeId) -> bool {
        self.host_congestion_active.is_empty() || self.host_congestion_active.contains(&node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EndpointConfig::default().validate().unwrap();
    }

    #[test]
    fn sack_vec_length_is_bounded() {
        let cfg = EndpointConfig {
            sack_vec_length: 65,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::SackVecTooLong(65))
        ));
    }

    #[test]
    fn rget_sample_window_is_bounded() {
        let cfg = EndpointConfig {
            rget_convert_num_samples: 3,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::RgetSampleWindow(3))
        ));
    }

    #[test]
    fn sack_mask_matches_length() {
        let cfg = EndpointConfig {
            sack_vec_length: 8,
            ..Default::default()
        };
        assert_eq!(cfg.sack_vec_mask(), 0xff);
        let full = EndpointConfig {
            sack_vec_length: 64,
            ..Default::default()
        };
        assert_eq!(full.sack_vec_mask(), u64::MAX);
    }

    #[test]
    fn kb_limits_convert_to_flits() {
        let cfg = EndpointConfig::default();
        assert_eq!(cfg.xaction_size_limit_flits(), 16 * 1000 / 32);
    }

    #[test]
    fn homa_overrides_retry_timeout() {
        let cfg = EndpointConfig {
            host_control_policy: HostControlPolicy::Homa,
            estimate_round_trip_cycles: 4000,
            retry_timer_timeout: 100,
            ..Default::default()
        };
        assert_eq!(cfg.effective_retry_timer_timeout(), 12_000);
    }

    #[test]
    fn config_deserializes_from_json() {
        let cfg: EndpointConfig = serde_json::from_str(
            r#"{"nodes": 4, "enable_sack": true, "host_control_policy": "my_policy"}"#,
        )
        .unwrap();
        assert_eq!(cfg.nodes, 4);
        assert!(cfg.enable_sack);
        assert_eq!(cfg.host_control_policy, HostControlPolicy::MyPolicy);
    }
}
