//! # Fabric model
//!
//! A deliberately small stand-in for the interconnect: per-destination
//! in-order delivery after a fixed latency, plus programmable packet drops
//! for loss scenarios. Body flits carry no destination on the wire; the
//! fabric routes them with the head's, the same way a virtual channel
//! would.

use std::collections::VecDeque;

use serde::Deserialize;

use lattice_endpoint::flit::Credit;
use lattice_endpoint::{Cycle, Flit, FlitKind, NodeId, SeqNum};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Flit delivery latency in cycles.
    pub latency: Cycle,
    /// Credit return latency in cycles.
    pub credit_latency: Cycle,
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig {
            latency: 5,
            credit_latency: 2,
        }
    }
}

/// Drop the first packet matching this rule, head through tail. Consumed on
/// use.
#[derive(Debug, Clone)]
pub struct DropRule {
    pub src: NodeId,
    pub dest: NodeId,
    /// Match a specific sequence number, or any when `None`.
    pub seq: Option<SeqNum>,
    /// Match a specific flit kind, or any when `None`.
    pub kind: Option<FlitKind>,
}

impl DropRule {
    fn matches(&self, src: NodeId, dest: NodeId, flit: &Flit) -> bool {
        self.src == src
            && self.dest == dest
            && self.seq.map(|s| s == flit.seq_num).unwrap_or(true)
            && self.kind.map(|k| k == flit.kind).unwrap_or(true)
    }
}

pub struct Fabric {
    latency: Cycle,
    credit_latency: Cycle,
    /// In-order delivery queues, one per destination node.
    flit_queues: Vec<VecDeque<(Cycle, Flit)>>,
    credit_queues: Vec<VecDeque<(Cycle, Credit)>>,
    /// Destination of the packet currently streaming from each source.
    current_dest: Vec<Option<NodeId>>,
    /// Sources currently dropping the remainder of a packet.
    dropping: Vec<bool>,
    rules: Vec<DropRule>,
    pub dropped_flits: u64,
}

impl Fabric {
    pub fn new(nodes: usize, cfg: &FabricConfig) -> Self {
        Fabric {
            latency: cfg.latency,
            credit_latency: cfg.credit_latency,
            flit_queues: vec![VecDeque::new(); nodes],
            credit_queues: vec![VecDeque::new(); nodes],
            current_dest: vec![None; nodes],
            dropping: vec![false; nodes],
            rules: Vec::new(),
            dropped_flits: 0,
        }
    }

    pub fn add_drop_rule(&mut self, rule: DropRule) {
        self.rules.push(rule);
    }

    /// Inject one flit at `src`. Head flits set the route; bodies follow it.
    pub fn write_flit(&mut self, now: Cycle, src: NodeId, flit: Flit) {
        let dest = match flit.dest {
            Some(d) => {
                self.current_dest[src] = Some(d);
                d
            }
            None => self.current_dest[src].expect("body flit follows its head"),
        };

        if flit.head {
            self.dropping[src] = false;
            if let Some(i) = self.rules.iter().position(|r| r.matches(src, dest, &flit)) {
                self.rules.remove(i);
                self.dropping[src] = true;
                tracing::debug!(src, dest, seq = flit.seq_num, "fabric dropping packet");
            }
        }

        let tail = flit.tail;
        if self.dropping[src] {
            self.dropped_flits += 1;
            if tail {
                self.dropping[src] = false;
            }
            return;
        }

        self.flit_queues[dest].push_back((now + self.latency, flit));
    }

    /// Pop one delivered flit for `node`, if any is due.
    pub fn read_flit(&mut self, now: Cycle, node: NodeId) -> Option<Flit> {
        let due = self.flit_queues[node]
            .front()
            .map(|(t, _)| *t <= now)
            .unwrap_or(false);
        if due {
            self.flit_queues[node].pop_front().map(|(_, f)| f)
        } else {
            None
        }
    }

    pub fn write_credit(&mut self, now: Cycle, node: NodeId, credit: Credit) {
        self.credit_queues[node].push_back((now + self.credit_latency, credit));
    }

    pub fn read_credit(&mut self, now: Cycle, node: NodeId) -> Option<Credit> {
        let due = self.credit_queues[node]
            .front()
            .map(|(t, _)| *t <= now)
            .unwrap_or(false);
        if due {
            self.credit_queues[node].pop_front().map(|(_, c)| c)
        } else {
            None
        }
    }

    /// Nothing in flight anywhere.
    pub fn is_empty(&self) -> bool {
        self.flit_queues.iter().all(|q| q.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flit(src: NodeId, dest: Option<NodeId>, seq: SeqNum, head: bool, tail: bool) -> Flit {
        let mut f = Flit::standalone_ctrl(src, dest.unwrap_or(0));
        f.kind = FlitKind::WriteRequest;
        f.dest = dest;
        f.seq_num = seq;
        f.head = head;
        f.tail = tail;
        f.size = 2;
        f
    }

    #[test]
    fn delivers_in_order_after_latency() {
        let mut fabric = Fabric::new(2, &FabricConfig::default());
        fabric.write_flit(0, 0, flit(0, Some(1), 1, true, false));
        fabric.write_flit(1, 0, flit(0, None, 1, false, true));

        assert!(fabric.read_flit(4, 1).is_none(), "not due yet");
        let head = fabric.read_flit(5, 1).unwrap();
        assert!(head.head);
        let body = fabric.read_flit(6, 1).unwrap();
        assert!(body.tail);
        assert!(fabric.is_empty());
    }

    #[test]
    fn body_flits_follow_the_head_route() {
        let mut fabric = Fabric::new(3, &FabricConfig::default());
        fabric.write_flit(0, 0, flit(0, Some(2), 1, true, false));
        fabric.write_flit(1, 0, flit(0, None, 1, false, true));
        assert!(fabric.read_flit(10, 1).is_none());
        assert!(fabric.read_flit(10, 2).is_some());
        assert!(fabric.read_flit(10, 2).is_some());
    }

    #[test]
    fn drop_rule_consumes_exactly_one_packet() {
        let mut fabric = Fabric::new(2, &FabricConfig::default());
        fabric.add_drop_rule(DropRule {
            src: 0,
            dest: 1,
            seq: Some(1),
            kind: None,
        });

        // First transmission of seq 1 vanishes entirely.
        fabric.write_flit(0, 0, flit(0, Some(1), 1, true, false));
        fabric.write_flit(1, 0, flit(0, None, 1, false, true));
        assert_eq!(fabric.dropped_flits, 2);
        assert!(fabric.is_empty());

        // The retransmission goes through.
        fabric.write_flit(10, 0, flit(0, Some(1), 1, true, false));
        fabric.write_flit(11, 0, flit(0, None, 1, false, true));
        assert!(fabric.read_flit(20, 1).is_some());
    }

    #[test]
    fn kind_scoped_rule_spares_other_kinds() {
        let mut fabric = Fabric::new(2, &FabricConfig::default());
        fabric.add_drop_rule(DropRule {
            src: 0,
            dest: 1,
            seq: None,
            kind: Some(FlitKind::Ctrl),
        });

        let mut data = flit(0, Some(1), 1, true, true);
        data.kind = FlitKind::WriteRequest;
        fabric.write_flit(0, 0, data);
        assert!(fabric.read_flit(10, 1).is_some(), "data unaffected");

        let ctrl = Flit::standalone_ctrl(0, 1);
        fabric.write_flit(0, 0, ctrl);
        assert_eq!(fabric.dropped_flits, 1);
    }
}
