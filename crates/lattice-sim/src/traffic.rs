//! # Traffic models
//!
//! Injection processes and destination patterns for driving endpoints.
//! Deterministic for a given seed, per the harness convention.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use lattice_endpoint::{NodeId, TrafficModel};

/// Where generated packets go.
#[derive(Debug, Clone, Copy)]
pub enum DestPattern {
    /// Every packet to the same node.
    Fixed(NodeId),
    /// Uniform random over all other nodes.
    Uniform,
}

/// Bernoulli injection process: each opportunity fires with probability
/// `rate`, independently per node.
pub struct BernoulliTraffic {
    rate: f64,
    nodes: usize,
    packet_size: usize,
    pattern: DestPattern,
    rng: StdRng,
}

impl BernoulliTraffic {
    pub fn new(rate: f64, nodes: usize, packet_size: usize, pattern: DestPattern, seed: u64) -> Self {
        BernoulliTraffic {
            rate,
            nodes,
            packet_size,
            pattern,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl TrafficModel for BernoulliTraffic {
    fn test(&mut self, _node: NodeId) -> bool {
        self.rng.random::<f64>() < self.rate
    }

    fn dest(&mut self, src: NodeId) -> NodeId {
        match self.pattern {
            DestPattern::Fixed(d) => d,
            DestPattern::Uniform => {
                let mut d = self.rng.random_range(0..self.nodes);
                while d == src && self.nodes > 1 {
                    d = self.rng.random_range(0..self.nodes);
                }
                d
            }
        }
    }

    fn next_packet_size(&mut self, _class: usize) -> usize {
        self.packet_size
    }
}

/// Emits a fixed number of packets from one source to one destination, then
/// goes quiet. The workhorse of the reliability scenarios.
pub struct ScriptedTraffic {
    pub src: NodeId,
    pub remaining: usize,
    pub dest: NodeId,
    pub packet_size: usize,
}

impl ScriptedTraffic {
    pub fn new(src: NodeId, count: usize, dest: NodeId) -> Self {
        ScriptedTraffic {
            src,
            remaining: count,
            dest,
            packet_size: 8,
        }
    }
}

impl TrafficModel for ScriptedTraffic {
    fn test(&mut self, node: NodeId) -> bool {
        if node == self.src && self.remaining > 0 {
            self.remaining -= 1;
            true
        } else {
            false
        }
    }

    fn dest(&mut self, _src: NodeId) -> NodeId {
        self.dest
    }

    fn next_packet_size(&mut self, _class: usize) -> usize {
        self.packet_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_traffic_exhausts_its_budget() {
        let mut t = ScriptedTraffic::new(0, 3, 1);
        let mut fired = 0;
        for _ in 0..10 {
            if t.test(0) {
                fired += 1;
            }
        }
        assert_eq!(fired, 3);
        assert!(!t.test(0));
        assert_eq!(t.dest(0), 1);
    }

    #[test]
    fn scripted_traffic_ignores_other_nodes() {
        let mut t = ScriptedTraffic::new(0, 3, 1);
        assert!(!t.test(1));
        assert_eq!(t.remaining, 3);
    }

    #[test]
    fn bernoulli_is_deterministic_per_seed() {
        let mut a = BernoulliTraffic::new(0.5, 4, 8, DestPattern::Uniform, 9);
        let mut b = BernoulliTraffic::new(0.5, 4, 8, DestPattern::Uniform, 9);
        for _ in 0..100 {
            assert_eq!(a.test(0), b.test(0));
            assert_eq!(a.dest(0), b.dest(0));
        }
    }

    #[test]
    fn uniform_pattern_avoids_self() {
        let mut t = BernoulliTraffic::new(1.0, 4, 8, DestPattern::Uniform, 3);
        for _ in 0..100 {
            assert_ne!(t.dest(2), 2);
        }
    }
}
