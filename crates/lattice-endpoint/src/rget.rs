//! # Adaptive put→rget conversion
//!
//! Every `rget_convert_sample_period` cycles the endpoint snapshots, per
//! destination, the outstanding put data and the write data acked since the
//! last boundary. A destination enters converting mode when enough data is
//! outstanding and acks lag behind (`acks < outstanding * unacked_perc`),
//! and reverts once acks catch up (`acks >= outstanding * acked_perc`), with
//! a minimum number of sample periods between transitions.
//!
//! While converting, an outgoing WRITE_REQUEST still sitting in its
//! injection FIFO is rewritten in place into an RGET_REQUEST: the head flit
//! survives, enough body flits are dropped to shrink the packet to the read
//! request size, and the original payload size rides along in
//! `requested_data_size` so the target knows how much to pull.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::Rng;

use crate::config::EndpointConfig;
use crate::context::SimContext;
use crate::flit::{Flit, FlitKind};
use crate::metering::OutstandingMeters;
use crate::stats::EndpointStats;
use crate::NodeId;

pub struct RgetConverter {
    converting: Vec<bool>,
    /// Newest sample at the front; window depth is the configured sample
    /// count (only 2 is supported).
    outstanding_samples: Vec<VecDeque<usize>>,
    ack_samples: Vec<VecDeque<usize>>,
    periods_since_transition: Vec<u64>,
}

impl RgetConverter {
    pub fn new(cfg: &EndpointConfig) -> Self {
        let n = cfg.nodes;
        let window = cfg.rget_convert_num_samples.max(2) as usize;
        RgetConverter {
            converting: vec![false; n],
            outstanding_samples: vec![VecDeque::from(vec![0; window]); n],
            ack_samples: vec![VecDeque::from(vec![0; window - 1]); n],
            periods_since_transition: vec![0; n],
        }
    }

    pub fn is_converting(&self, dest: NodeId) -> bool {
        self.converting[dest]
    }

    /// Take one sample of every destination's outstanding/acked counters and
    /// reset the per-period ack accumulators.
    pub fn sample(&mut self, meters: &mut OutstandingMeters) {
        for dest in 0..self.converting.len() {
            self.outstanding_samples[dest].push_front(meters.put_data_per_dest[dest]);
            self.outstanding_samples[dest].pop_back();

            self.ack_samples[dest].push_front(meters.new_write_ack_data_per_dest[dest]);
            self.ack_samples[dest].pop_back();

            meters.new_write_ack_data_per_dest[dest] = 0;
            self.periods_since_transition[dest] += 1;
        }
    }

    /// Decide whether the next WRITE_REQUEST toward `dest` converts. With a
    /// fixed conversion rate configured, roll the dice; otherwise run the
    /// adaptive hysteresis on the sampled window.
    pub fn decide(&mut self, dest: NodeId, cfg: &EndpointConfig, rng: &mut StdRng) -> bool {
        if cfg.put_to_rget_conversion_rate > 0.0 {
            return rng.random::<f64>() <= cfg.put_to_rget_conversion_rate;
        }
        if !cfg.enable_adaptive_rget {
            return false;
        }

        let oldest_outstanding = *self.outstanding_samples[dest].back().unwrap_or(&0);
        let newest_acks = *self.ack_samples[dest].front().unwrap_or(&0);
        let settled =
            self.periods_since_transition[dest] >= cfg.rget_min_samples_since_last_transition;

        if !self.converting[dest] {
            if oldest_outstanding > cfg.rget_convert_min_data_before_convert
                && settled
                && (newest_acks as f64)
                    < (oldest_outstanding as f64) * cfg.rget_convert_unacked_perc
            {
                tracing::debug!(dest, oldest_outstanding, newest_acks, "converting puts to rgets");
                self.converting[dest] = true;
                self.periods_since_transition[dest] = 0;
            }
        } else if settled
            && (newest_acks as f64) >= (oldest_outstanding as f64) * cfg.rget_revert_acked_perc
        {
            tracing::debug!(dest, oldest_outstanding, newest_acks, "reverting rgets to puts");
            self.converting[dest] = false;
            self.periods_since_transition[dest] = 0;
        }

        self.converting[dest]
    }
}

/// Rewrite the WRITE_REQUEST at the front of an injection FIFO into an
/// RGET_REQUEST of `read_request_size` flits, discarding the surplus body
/// flits. The tail survives, so head+tail structure is preserved.
pub fn convert_put_to_rget(
    queue: &mut VecDeque<Flit>,
    ctx: &mut SimContext,
    stats: &mut EndpointStats,
    read_request_size: usize,
) {
    let original_size = queue.front().map(|f| f.size).unwrap_or(0);
    debug_assert!(queue.front().map(|f| f.head).unwrap_or(false));
    debug_assert!(read_request_size <= original_size);

    stats.puts_converted_to_rgets += 1;
    let mut flits_to_drop = original_size - read_request_size;
    stats.flits_dropped_for_rget_conversion += flits_to_drop as u64;

    let mut idx = 0;
    while idx < queue.len() {
        let flit = &queue[idx];
        if flit.tail {
            let flit = &mut queue[idx];
            flit.kind = FlitKind::RgetRequest;
            flit.size = read_request_size;
            flit.requested_data_size = original_size;
            break;
        }
        if !flit.head && flits_to_drop > 0 {
            let dead = queue.remove(idx).expect("index in bounds");
            ctx.discard_flit(dead.id, dead.class);
            flits_to_drop -= 1;
        } else {
            let flit = &mut queue[idx];
            flit.kind = FlitKind::RgetRequest;
            flit.size = read_request_size;
            flit.requested_data_size = original_size;
            idx += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn cfg() -> EndpointConfig {
        EndpointConfig {
            nodes: 2,
            enable_adaptive_rget: true,
            rget_convert_min_data_before_convert: 16,
            rget_min_samples_since_last_transition: 2,
            rget_convert_unacked_perc: 0.7,
            rget_revert_acked_perc: 0.9,
            ..Default::default()
        }
    }

    #[test]
    fn converts_when_acks_lag_and_reverts_when_they_catch_up() {
        let cfg = cfg();
        let mut conv = RgetConverter::new(&cfg);
        let mut meters = OutstandingMeters::new(2);
        let mut rng = StdRng::seed_from_u64(1);

        // Two periods of heavy outstanding data, almost no acks.
        meters.put_data_per_dest[1] = 64;
        meters.new_write_ack_data_per_dest[1] = 2;
        conv.sample(&mut meters);
        meters.new_write_ack_data_per_dest[1] = 2;
        conv.sample(&mut meters);
        assert!(conv.decide(1, &cfg, &mut rng));
        assert!(conv.is_converting(1));

        // Acks catch up; after the settling window the mode reverts.
        meters.new_write_ack_data_per_dest[1] = 64;
        conv.sample(&mut meters);
        meters.put_data_per_dest[1] = 64;
        meters.new_write_ack_data_per_dest[1] = 64;
        conv.sample(&mut meters);
        assert!(!conv.decide(1, &cfg, &mut rng));
        assert!(!conv.is_converting(1));
    }

    #[test]
    fn respects_settling_period_between_transitions() {
        let cfg = cfg();
        let mut conv = RgetConverter::new(&cfg);
        let mut meters = OutstandingMeters::new(2);
        let mut rng = StdRng::seed_from_u64(1);

        meters.put_data_per_dest[1] = 64;
        conv.sample(&mut meters);
        // Only one period since start-of-window: not settled yet.
        assert!(!conv.decide(1, &cfg, &mut rng));
    }

    #[test]
    fn fixed_rate_conversion_is_a_coin_flip() {
        let cfg = EndpointConfig {
            put_to_rget_conversion_rate: 1.0,
            ..cfg()
        };
        let mut conv = RgetConverter::new(&cfg);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(conv.decide(0, &cfg, &mut rng));
    }

    #[test]
    fn conversion_rewrites_packet_in_place() {
        let mut ctx = SimContext::new(1);
        let mut stats = EndpointStats::new();
        let mut queue: VecDeque<Flit> = Flit::packet(
            5,
            0,
            1,
            FlitKind::WriteRequest,
            8,
            0,
            0,
            true,
            None,
            0,
            None,
        )
        .into_iter()
        .map(|mut f| {
            f.id = ctx.next_flit_id();
            ctx.register_flit(&f);
            f
        })
        .collect();

        convert_put_to_rget(&mut queue, &mut ctx, &mut stats, 2);

        assert_eq!(queue.len(), 2);
        assert!(queue[0].head && !queue[0].tail);
        assert!(queue[1].tail);
        assert!(queue.iter().all(|f| f.kind == FlitKind::RgetRequest));
        assert!(queue.iter().all(|f| f.size == 2));
        assert_eq!(queue[0].requested_data_size, 8, "original size preserved");
        assert_eq!(stats.puts_converted_to_rgets, 1);
        assert_eq!(stats.flits_dropped_for_rget_conversion, 6);
        assert_eq!(ctx.in_flight_flits(0), 2, "dropped flits deregistered");
    }

    #[test]
    fn conversion_to_minimum_request_keeps_head_and_tail() {
        let mut ctx = SimContext::new(1);
        let mut stats = EndpointStats::new();
        let mut queue: VecDeque<Flit> = Flit::packet(
            5,
            0,
            1,
            FlitKind::WriteRequest,
            4,
            0,
            0,
            false,
            None,
            0,
            None,
        )
        .into_iter()
        .collect();
        convert_put_to_rget(&mut queue, &mut ctx, &mut stats, 2);
        // Every body flit is dropped; head and tail survive.
        assert_eq!(queue.len(), 2);
        assert!(queue[0].head);
        assert!(queue.back().unwrap().tail);
        assert_eq!(queue[0].size, 2);
        assert_eq!(stats.flits_dropped_for_rget_conversion, 2);
    }
}
