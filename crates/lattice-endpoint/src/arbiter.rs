//! # Injection arbiter
//!
//! Selects which transmit queue feeds the fabric each cycle. Three queue
//! groups — new commands, read replies, rget get-requests — each with one
//! FIFO per destination. The group selector round-robins; within a group
//! the per-destination cursor either round-robins or runs the weighted token
//! scheduler.
//!
//! Once a head flit is chosen the arbiter locks onto that queue until the
//! tail is sent; only then does the cursor advance. Tokens regenerate on
//! cycles where a group search comes up empty, saturating at the initial
//! grant.

use crate::config::{ArbMode, EndpointConfig};

/// The three transmit queue groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    NewCmd,
    ReadReply,
    RgetGetReq,
}

pub const QUEUE_TYPES: [QueueType; 3] = [QueueType::NewCmd, QueueType::ReadReply, QueueType::RgetGetReq];

impl QueueType {
    pub fn index(self) -> usize {
        match self {
            QueueType::NewCmd => 0,
            QueueType::ReadReply => 1,
            QueueType::RgetGetReq => 2,
        }
    }

    pub fn next(self) -> QueueType {
        match self {
            QueueType::NewCmd => QueueType::ReadReply,
            QueueType::ReadReply => QueueType::RgetGetReq,
            QueueType::RgetGetReq => QueueType::NewCmd,
        }
    }
}

pub struct InjectionArbiter {
    mode: ArbMode,
    num_queues: usize,
    /// Which group the round-robin starts from next cycle.
    pub group_cursor: QueueType,
    /// Per-group destination cursor.
    cursors: [usize; 3],
    /// A packet is mid-transmission from this group; its queue stays locked.
    pub in_progress: Option<QueueType>,
    tokens: [Vec<i64>; 3],
    req_init_tokens: i64,
    rsp_init_tokens: i64,
    incr_tokens: i64,
    rsp_incr_mult: i64,
}

impl InjectionArbiter {
    pub fn new(cfg: &EndpointConfig) -> Self {
        let n = cfg.nodes;
        InjectionArbiter {
            mode: cfg.endpoint_tx_arb_type,
            num_queues: n,
            group_cursor: QueueType::NewCmd,
            cursors: [0; 3],
            in_progress: None,
            tokens: [
                vec![cfg.weighted_sched_req_tokens; n],
                vec![cfg.weighted_sched_rsp_tokens; n],
                vec![cfg.weighted_sched_req_tokens; n],
            ],
            req_init_tokens: cfg.weighted_sched_req_tokens,
            rsp_init_tokens: cfg.weighted_sched_rsp_tokens,
            incr_tokens: cfg.weighted_sched_incr_tokens,
            rsp_incr_mult: cfg.weighted_sched_rsp_incr_mult,
        }
    }

    pub fn mode(&self) -> ArbMode {
        self.mode
    }

    pub fn num_queues(&self) -> usize {
        self.num_queues
    }

    pub fn cursor(&self, q: QueueType) -> usize {
        self.cursors[q.index()]
    }

    pub fn set_cursor(&mut self, q: QueueType, idx: usize) {
        self.cursors[q.index()] = idx;
    }

    pub fn advance_cursor(&mut self, q: QueueType) {
        let i = q.index();
        self.cursors[i] = (self.cursors[i] + 1) % self.num_queues;
    }

    pub fn tokens(&self, q: QueueType, idx: usize) -> i64 {
        self.tokens[q.index()][idx]
    }

    /// Whether this queue may start a new head packet under the token gate.
    /// A packet already mid-transmission bypasses the check.
    pub fn token_gate_open(&self, q: QueueType, idx: usize) -> bool {
        self.mode == ArbMode::RoundRobin
            || self.in_progress.is_some()
            || self.tokens[q.index()][idx] > 0
    }

    /// Charge a queue for one emitted flit of an N-flit packet.
    pub fn charge_tokens(&mut self, q: QueueType, idx: usize, packet_size: usize) {
        if self.mode == ArbMode::Weighted {
            self.tokens[q.index()][idx] -= packet_size as i64;
        }
    }

    /// Regenerate tokens toward the initial grant; response queues earn the
    /// configured multiple per step.
    pub fn increment_tokens(&mut self) {
        for (gi, init, incr) in [
            (0usize, self.req_init_tokens, self.incr_tokens),
            (1, self.rsp_init_tokens, self.incr_tokens * self.rsp_incr_mult),
            (2, self.req_init_tokens, self.incr_tokens),
        ] {
            for t in &mut self.tokens[gi] {
                if *t < init {
                    *t = (*t + incr).min(init);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weighted_cfg() -> EndpointConfig {
        EndpointConfig {
            nodes: 4,
            endpoint_tx_arb_type: ArbMode::Weighted,
            weighted_sched_req_tokens: 16,
            weighted_sched_rsp_tokens: 32,
            weighted_sched_incr_tokens: 2,
            weighted_sched_rsp_incr_mult: 3,
            ..Default::default()
        }
    }

    #[test]
    fn group_cursor_cycles_all_groups() {
        assert_eq!(QueueType::NewCmd.next(), QueueType::ReadReply);
        assert_eq!(QueueType::ReadReply.next(), QueueType::RgetGetReq);
        assert_eq!(QueueType::RgetGetReq.next(), QueueType::NewCmd);
    }

    #[test]
    fn round_robin_ignores_tokens() {
        let mut arb = InjectionArbiter::new(&EndpointConfig::default());
        arb.charge_tokens(QueueType::NewCmd, 0, 1000);
        assert!(arb.token_gate_open(QueueType::NewCmd, 0));
        assert_eq!(arb.tokens(QueueType::NewCmd, 0), 64);
    }

    #[test]
    fn weighted_gate_closes_at_zero_tokens() {
        let mut arb = InjectionArbiter::new(&weighted_cfg());
        arb.charge_tokens(QueueType::NewCmd, 1, 16);
        assert!(!arb.token_gate_open(QueueType::NewCmd, 1));
        // Other queues keep their grant.
        assert!(arb.token_gate_open(QueueType::NewCmd, 0));
    }

    #[test]
    fn in_progress_bypasses_token_gate() {
        let mut arb = InjectionArbiter::new(&weighted_cfg());
        arb.charge_tokens(QueueType::NewCmd, 1, 16);
        arb.in_progress = Some(QueueType::NewCmd);
        assert!(arb.token_gate_open(QueueType::NewCmd, 1));
    }

    #[test]
    fn tokens_regenerate_and_saturate() {
        let mut arb = InjectionArbiter::new(&weighted_cfg());
        arb.charge_tokens(QueueType::NewCmd, 0, 5);
        arb.charge_tokens(QueueType::ReadReply, 0, 31);
        arb.increment_tokens();
        assert_eq!(arb.tokens(QueueType::NewCmd, 0), 13);
        // Response queues earn incr * mult per step.
        assert_eq!(arb.tokens(QueueType::ReadReply, 0), 7);

        for _ in 0..100 {
            arb.increment_tokens();
        }
        assert_eq!(arb.tokens(QueueType::NewCmd, 0), 16);
        assert_eq!(arb.tokens(QueueType::ReadReply, 0), 32);
    }

    #[test]
    fn cursor_wraps_at_queue_count() {
        let mut arb = InjectionArbiter::new(&weighted_cfg());
        for _ in 0..4 {
            arb.advance_cursor(QueueType::NewCmd);
        }
        assert_eq!(arb.cursor(QueueType::NewCmd), 0);
    }
}
