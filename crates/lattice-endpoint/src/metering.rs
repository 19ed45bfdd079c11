//! # Outstanding-transaction metering
//!
//! Per-destination and global counters of in-flight work, incremented when a
//! head flit enters the OPB and decremented when its packet retires. These
//! feed the admission gates in the arbiter's qualification check.
//!
//! RGET accounting is asymmetric on purpose: an RGET_REQUEST reserves
//! outbound-data and transaction budget for the data it will *pull*, and the
//! matching RGET_GET_REPLY releases it on retirement.

use crate::config::EndpointConfig;
use crate::flit::FlitKind;
use crate::stats::EndpointStats;
use crate::NodeId;

#[derive(Debug, Clone)]
pub struct OutstandingMeters {
    pub xactions_per_dest: Vec<usize>,
    /// Outstanding put (write) payload, feeding adaptive-RGET sampling.
    pub put_data_per_dest: Vec<usize>,
    /// Write payload acked since the last RGET sample boundary.
    pub new_write_ack_data_per_dest: Vec<usize>,
    pub gets_per_dest: Vec<usize>,
    pub rget_reqs_per_dest: Vec<usize>,
    pub outbound_data_per_dest: Vec<usize>,
    pub inbound_data_per_dest: Vec<usize>,
    pub rget_inbound_data_per_dest: Vec<usize>,
    pub global_get_requests: usize,
    pub global_get_inbound_data: usize,
    /// Stat shadows across all destinations.
    pub xactions_all_dests: usize,
    pub outbound_data_all_dests: usize,
}

impl OutstandingMeters {
    pub fn new(nodes: usize) -> Self {
        OutstandingMeters {
            xactions_per_dest: vec![0; nodes],
            put_data_per_dest: vec![0; nodes],
            new_write_ack_data_per_dest: vec![0; nodes],
            gets_per_dest: vec![0; nodes],
            rget_reqs_per_dest: vec![0; nodes],
            outbound_data_per_dest: vec![0; nodes],
            inbound_data_per_dest: vec![0; nodes],
            rget_inbound_data_per_dest: vec![0; nodes],
            global_get_requests: 0,
            global_get_inbound_data: 0,
            xactions_all_dests: 0,
            outbound_data_all_dests: 0,
        }
    }

    /// Account for a head flit entering the OPB.
    pub fn on_opb_insert(
        &mut self,
        kind: FlitKind,
        dest: NodeId,
        size: usize,
        requested_data_size: usize,
        cfg: &EndpointConfig,
        stats: &mut EndpointStats,
    ) {
        match kind {
            FlitKind::WriteRequest | FlitKind::WriteRequestNoop | FlitKind::AnyType => {
                self.xactions_per_dest[dest] += 1;
                self.put_data_per_dest[dest] += size;
                self.xactions_all_dests += 1;
                self.outbound_data_per_dest[dest] += size;
                self.outbound_data_all_dests += size;
            }
            FlitKind::ReadRequest => {
                self.xactions_all_dests += 1;
                self.gets_per_dest[dest] += 1;
                self.inbound_data_per_dest[dest] += requested_data_size;
                self.outbound_data_all_dests += size;
                self.global_get_inbound_data += requested_data_size;
                self.global_get_requests += 1;
            }
            FlitKind::ReadReply => {
                self.xactions_per_dest[dest] += 1;
                self.xactions_all_dests += 1;
                self.outbound_data_per_dest[dest] += size;
                self.outbound_data_all_dests += size;
            }
            FlitKind::RgetRequest => {
                self.xactions_per_dest[dest] += 1;
                self.put_data_per_dest[dest] += requested_data_size;
                self.xactions_all_dests += 1;
                // Budget is reserved for the pulled data, not the request.
                self.outbound_data_per_dest[dest] += requested_data_size;
                self.outbound_data_all_dests += requested_data_size;
                self.rget_reqs_per_dest[dest] += 1;
                if cfg.endpoint_use_new_rget_metering {
                    self.rget_inbound_data_per_dest[dest] += requested_data_size;
                }
            }
            FlitKind::RgetGetRequest => {
                self.xactions_all_dests += 1;
                self.outbound_data_all_dests += size;
                self.gets_per_dest[dest] += 1;
                self.inbound_data_per_dest[dest] += requested_data_size;
                self.global_get_requests += 1;
                self.global_get_inbound_data += requested_data_size;
            }
            // The RGET_REQUEST already reserved for the RGET_GET_REPLY.
            FlitKind::RgetGetReply | FlitKind::WriteReply | FlitKind::Ctrl => {}
        }

        stats.max_outstanding_xactions_per_dest = stats
            .max_outstanding_xactions_per_dest
            .max(self.xactions_per_dest[dest]);
        stats.max_outstanding_xactions_all_dests = stats
            .max_outstanding_xactions_all_dests
            .max(self.xactions_all_dests);
        stats.max_outstanding_data_per_dest = stats
            .max_outstanding_data_per_dest
            .max(self.outbound_data_per_dest[dest]);
        stats.max_outstanding_data_all_dests = stats
            .max_outstanding_data_all_dests
            .max(self.outbound_data_all_dests);
    }

    /// Account for a packet leaving the OPB.
    pub fn on_opb_clear(
        &mut self,
        kind: FlitKind,
        dest: NodeId,
        size: usize,
        requested_data_size: usize,
        cfg: &EndpointConfig,
    ) {
        match kind {
            FlitKind::WriteRequest | FlitKind::WriteRequestNoop | FlitKind::AnyType => {
                self.xactions_per_dest[dest] -= 1;
                self.put_data_per_dest[dest] -= size;
                self.new_write_ack_data_per_dest[dest] += size;
                self.xactions_all_dests -= 1;
                self.outbound_data_per_dest[dest] -= size;
                self.outbound_data_all_dests -= size;
            }
            FlitKind::ReadRequest => {
                self.gets_per_dest[dest] -= 1;
                self.inbound_data_per_dest[dest] -= requested_data_size;
                self.global_get_inbound_data -= requested_data_size;
                self.global_get_requests -= 1;
            }
            FlitKind::ReadReply => {
                self.xactions_per_dest[dest] -= 1;
                self.xactions_all_dests -= 1;
                self.outbound_data_per_dest[dest] -= size;
                self.outbound_data_all_dests -= size;
            }
            FlitKind::RgetRequest => {
                if !cfg.endpoint_use_new_rget_metering {
                    self.rget_reqs_per_dest[dest] -= 1;
                }
                // xaction and outbound budget stay reserved until the
                // matching RGET_GET_REPLY retires.
            }
            FlitKind::RgetGetRequest => {
                self.gets_per_dest[dest] -= 1;
                self.inbound_data_per_dest[dest] -= requested_data_size;
                self.global_get_requests -= 1;
                self.global_get_inbound_data -= requested_data_size;
            }
            FlitKind::RgetGetReply => {
                self.xactions_per_dest[dest] -= 1;
                self.xactions_all_dests -= 1;
                self.outbound_data_per_dest[dest] -= size;
                self.outbound_data_all_dests -= size;
                if cfg.endpoint_use_new_rget_metering {
                    self.rget_reqs_per_dest[dest] -= 1;
                    self.rget_inbound_data_per_dest[dest] -= size;
                }
                self.put_data_per_dest[dest] -= size;
                self.new_write_ack_data_per_dest[dest] += size;
            }
            FlitKind::WriteReply | FlitKind::Ctrl => {}
        }
    }

    /// End-of-run check: every outstanding counter returned to zero.
    pub fn all_zero(&self) -> bool {
        self.xactions_per_dest.iter().all(|&v| v == 0)
            && self.put_data_per_dest.iter().all(|&v| v == 0)
            && self.gets_per_dest.iter().all(|&v| v == 0)
            && self.rget_reqs_per_dest.iter().all(|&v| v == 0)
            && self.outbound_data_per_dest.iter().all(|&v| v == 0)
            && self.inbound_data_per_dest.iter().all(|&v| v == 0)
            && self.rget_inbound_data_per_dest.iter().all(|&v| v == 0)
            && self.global_get_requests == 0
            && self.global_get_inbound_data == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (OutstandingMeters, EndpointConfig, EndpointStats) {
        (
            OutstandingMeters::new(4),
            EndpointConfig::default(),
            EndpointStats::new(),
        )
    }

    #[test]
    fn write_round_trip_balances() {
        let (mut m, cfg, mut stats) = setup();
        m.on_opb_insert(FlitKind::WriteRequest, 1, 8, 0, &cfg, &mut stats);
        assert_eq!(m.xactions_per_dest[1], 1);
        assert_eq!(m.outbound_data_per_dest[1], 8);
        assert_eq!(m.put_data_per_dest[1], 8);

        m.on_opb_clear(FlitKind::WriteRequest, 1, 8, 0, &cfg);
        assert!(m.all_zero());
        assert_eq!(m.new_write_ack_data_per_dest[1], 8);
    }

    #[test]
    fn read_request_uses_inbound_and_global_budget() {
        let (mut m, cfg, mut stats) = setup();
        m.on_opb_insert(FlitKind::ReadRequest, 2, 2, 16, &cfg, &mut stats);
        assert_eq!(m.gets_per_dest[2], 1);
        assert_eq!(m.inbound_data_per_dest[2], 16);
        assert_eq!(m.global_get_requests, 1);
        assert_eq!(m.global_get_inbound_data, 16);
        // Reads carry no per-dest outbound data.
        assert_eq!(m.outbound_data_per_dest[2], 0);

        m.on_opb_clear(FlitKind::ReadRequest, 2, 2, 16, &cfg);
        assert!(m.all_zero());
    }

    #[test]
    fn rget_budget_released_by_get_reply() {
        let (mut m, cfg, mut stats) = setup();
        // RGET_REQUEST reserves for the data it will pull (16 flits).
        m.on_opb_insert(FlitKind::RgetRequest, 1, 2, 16, &cfg, &mut stats);
        assert_eq!(m.xactions_per_dest[1], 1);
        assert_eq!(m.outbound_data_per_dest[1], 16);
        assert_eq!(m.rget_reqs_per_dest[1], 1);

        // Request retires: credit and budget stay reserved.
        m.on_opb_clear(FlitKind::RgetRequest, 1, 2, 16, &cfg);
        assert_eq!(m.xactions_per_dest[1], 1);
        assert_eq!(m.outbound_data_per_dest[1], 16);
        assert_eq!(m.rget_reqs_per_dest[1], 0);

        // The pulled data going out is not re-metered on insert...
        m.on_opb_insert(FlitKind::RgetGetReply, 1, 16, 0, &cfg, &mut stats);
        assert_eq!(m.outbound_data_per_dest[1], 16);

        // ...and its retirement closes the reservation.
        m.on_opb_clear(FlitKind::RgetGetReply, 1, 16, 0, &cfg);
        assert!(m.all_zero());
        assert_eq!(m.new_write_ack_data_per_dest[1], 16);
    }

    #[test]
    fn new_rget_metering_moves_credit_to_reply() {
        let (mut m, mut cfg, mut stats) = setup();
        cfg.endpoint_use_new_rget_metering = true;
        m.on_opb_insert(FlitKind::RgetRequest, 1, 2, 16, &cfg, &mut stats);
        assert_eq!(m.rget_inbound_data_per_dest[1], 16);
        m.on_opb_clear(FlitKind::RgetRequest, 1, 2, 16, &cfg);
        // Credit held until the reply retires.
        assert_eq!(m.rget_reqs_per_dest[1], 1);
        m.on_opb_insert(FlitKind::RgetGetReply, 1, 16, 0, &cfg, &mut stats);
        m.on_opb_clear(FlitKind::RgetGetReply, 1, 16, 0, &cfg);
        assert!(m.all_zero());
    }

    #[test]
    fn watermarks_track_maxima() {
        let (mut m, cfg, mut stats) = setup();
        m.on_opb_insert(FlitKind::WriteRequest, 1, 8, 0, &cfg, &mut stats);
        m.on_opb_insert(FlitKind::WriteRequest, 1, 8, 0, &cfg, &mut stats);
        m.on_opb_clear(FlitKind::WriteRequest, 1, 8, 0, &cfg);
        assert_eq!(stats.max_outstanding_xactions_per_dest, 2);
        assert_eq!(stats.max_outstanding_data_per_dest, 16);
    }
}
