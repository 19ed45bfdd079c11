//! # Endpoint
//!
//! The per-node transport endpoint. Plays initiator and target at once:
//! generates packets, arbitrates injection across the three transmit queue
//! groups, keeps every in-flight packet in the OPB until acknowledged,
//! replays on NACK/SACK/timeout, tracks received sequences per source, and
//! returns ACKs piggybacked on outgoing heads or as standalone control
//! flits.
//!
//! The enclosing simulation calls the five entry points in this order every
//! cycle:
//!
//! 1. [`Endpoint::receive_flit`] — consume fabric ejections
//! 2. [`Endpoint::receive_credit`] — fabric buffer accounting
//! 3. [`Endpoint::evaluate_new_packet_injection`] — maybe generate a packet
//! 4. [`Endpoint::step`] — emit at most one flit, advance sub-controllers
//! 5. [`Endpoint::process_received_flits`] — consume one received flit,
//!    return a credit

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::arbiter::{InjectionArbiter, QueueType};
use crate::config::{ArbMode, EndpointConfig, HostControlPolicy};
use crate::context::{SimContext, SimPhase, TrafficModel};
use crate::error::EndpointError;
use crate::flit::{Credit, Flit, FlitKind};
use crate::metering::OutstandingMeters;
use crate::opb::{Opb, OpbFlit};
use crate::policy::{note_bad_seq, note_good_seq, PeerCongestionState};
use crate::put_queue::{BandwidthOscillator, DelayedAcks, LbqRecord, PutBuffer, PutWaitRecord};
use crate::receiver::{
    AckKind, AckResponseState, IncomingPacketTracker, PendingResponse, RecvdAck, ToSendAck,
};
use crate::retry::{sack_vec_next_retrans, shift_sack_vec, RetryState, RetryTracker};
use crate::rget::{convert_put_to_rget, RgetConverter};
use crate::stats::EndpointStats;
use crate::{Cycle, NodeId, SeqNum};

/// Packet kinds admitted to the put wait queue.
fn is_put_kind(kind: FlitKind) -> bool {
    matches!(
        kind,
        FlitKind::WriteRequest | FlitKind::RgetGetReply | FlitKind::ReadReply
    )
}

/// Where `generate_packet_flits` appends the new packet.
#[derive(Debug, Clone, Copy)]
enum QueueTarget {
    Injection(usize, NodeId),
    Reply(NodeId),
    RgetGetReq(NodeId),
}

/// A flit sitting in the staging buffer between arbitration and the wire.
struct StagedFlit {
    flit: Flit,
    ready: Cycle,
    new_flit: bool,
}

/// Minimal per-subnet output buffer accounting, active only when endpoint
/// crediting is enabled.
struct BufferState {
    #[allow(dead_code)]
    credits: Vec<i64>,
}

impl BufferState {
    fn new(vcs: usize, depth: i64) -> Self {
        BufferState {
            credits: vec![depth; vcs],
        }
    }

    fn process_credit(&mut self, credit: &Credit) {
        if credit.vc < self.credits.len() {
            self.credits[credit.vc] += 1;
        }
    }

    fn sending_flit(&mut self, flit: &Flit) {
        if let Some(vc) = flit.vc {
            if vc < self.credits.len() {
                self.credits[vc] -= 1;
            }
        }
    }
}

enum ReplayOutcome {
    Emitted(Flit),
    Blocked,
}

pub struct Endpoint {
    node: NodeId,
    nodes: usize,
    classes: usize,
    cfg: EndpointConfig,
    now: Cycle,
    rng: StdRng,

    // ─── Generation ───
    qtime: Vec<Cycle>,
    qdrained: Vec<bool>,
    injection_buffer: Vec<Vec<VecDeque<Flit>>>,
    full_packets_in_inj_buf: Vec<Vec<usize>>,
    replies_pending: Vec<VecDeque<Flit>>,
    rget_get_req_queues: Vec<VecDeque<Flit>>,
    /// Next sequence number per destination; first value is 1.
    packet_seq_num: Vec<SeqNum>,

    // ─── Arbitration and staging ───
    arb: InjectionArbiter,
    next_packet_injection_blocked_until: Cycle,
    flits_waiting_to_inject: VecDeque<StagedFlit>,
    num_flits_waiting_to_inject: usize,
    last_vc: Vec<Vec<Option<usize>>>,
    buf_states: Vec<BufferState>,

    // ─── Reliability ───
    opb: Opb,
    retry: RetryTracker,
    meters: OutstandingMeters,
    ack_state: Vec<AckResponseState>,
    received_ack_queue: VecDeque<RecvdAck>,
    pending_inbound_responses: VecDeque<PendingResponse>,
    pending_outbound_responses: VecDeque<PendingResponse>,
    incoming: IncomingPacketTracker,
    incoming_flit_queue: Vec<VecDeque<Flit>>,

    // ─── Host model ───
    peers: Vec<PeerCongestionState>,
    delayed: DelayedAcks,
    put_buffer: PutBuffer,
    bandwidth: BandwidthOscillator,
    ecn_next_check: Cycle,

    rget: RgetConverter,
    stats: EndpointStats,
}

impl Endpoint {
    pub fn new(node: NodeId, cfg: EndpointConfig) -> Result<Self, crate::error::ConfigError> {
        cfg.validate()?;
        let nodes = cfg.nodes;
        let classes = cfg.classes;
        let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(node as u64));
        let load_balance = cfg.host_control_policy == HostControlPolicy::MyPolicy;
        let bandwidth = BandwidthOscillator::new(node, &cfg, &mut rng);
        Ok(Endpoint {
            node,
            nodes,
            classes,
            now: 0,
            qtime: vec![0; classes],
            qdrained: vec![false; classes],
            injection_buffer: vec![vec![VecDeque::new(); nodes]; classes],
            full_packets_in_inj_buf: vec![vec![0; nodes]; classes],
            replies_pending: vec![VecDeque::new(); nodes],
            rget_get_req_queues: vec![VecDeque::new(); nodes],
            packet_seq_num: vec![1; nodes],
            arb: InjectionArbiter::new(&cfg),
            next_packet_injection_blocked_until: 0,
            flits_waiting_to_inject: VecDeque::new(),
            num_flits_waiting_to_inject: 0,
            last_vc: vec![vec![None; classes]; cfg.subnets],
            buf_states: (0..cfg.subnets).map(|_| BufferState::new(cfg.num_vcs, 64)).collect(),
            opb: Opb::new(&cfg),
            retry: RetryTracker::new(nodes),
            meters: OutstandingMeters::new(nodes),
            ack_state: vec![AckResponseState::new(); nodes],
            received_ack_queue: VecDeque::new(),
            pending_inbound_responses: VecDeque::new(),
            pending_outbound_responses: VecDeque::new(),
            incoming: IncomingPacketTracker::new(),
            incoming_flit_queue: vec![VecDeque::new(); cfg.subnets],
            peers: (0..nodes).map(|_| PeerCongestionState::new(&cfg)).collect(),
            delayed: DelayedAcks::new(&cfg),
            put_buffer: PutBuffer::new(&cfg, load_balance),
            bandwidth,
            ecn_next_check: 0,
            rget: RgetConverter::new(&cfg),
            stats: EndpointStats::new(),
            rng,
            cfg,
        })
    }

    pub fn update_time(&mut self, now: Cycle) {
        self.now = now;
    }

    fn mypolicy(&self) -> bool {
        self.cfg.host_control_policy == HostControlPolicy::MyPolicy
    }

    fn tcp_like(&self) -> bool {
        matches!(
            self.cfg.host_control_policy,
            HostControlPolicy::TcpLike | HostControlPolicy::Ecn
        )
    }

    // ════════════════════════════════════════════════════════════════════
    // 1. Receive flit
    // ════════════════════════════════════════════════════════════════════

    pub fn receive_flit(
        &mut self,
        ctx: &SimContext,
        subnet: usize,
        flit: Flit,
    ) -> Result<(), EndpointError> {
        if flit.head {
            if let Some(dest) = flit.dest {
                if dest != self.node {
                    return Err(EndpointError::WrongDestination {
                        cycle: self.now,
                        node: self.node,
                        flit_id: flit.id,
                        dest,
                    });
                }
            }
        }

        // Peel the ACK fields off now: the flit may be consumed before the
        // deferred processing runs.
        if !flit.ack.is_empty() {
            self.received_ack_queue.push_back(RecvdAck {
                time: self.now + self.cfg.ack_processing_latency,
                subnet,
                target: flit.src,
                ack_seq_num: flit.ack.ack_seq_num,
                nack_seq_num: flit.ack.nack_seq_num,
                flit_id: flit.id,
                is_standalone: flit.kind == FlitKind::Ctrl,
                sack: flit.ack.sack,
                sack_vec: flit.ack.sack_vec,
            });
        }

        if self.cfg.host_control_policy == HostControlPolicy::Ecn && flit.tail {
            let peer = &mut self.peers[flit.src];
            peer.ecn_total += 1;
            if flit.ecn_congestion_detected {
                peer.ecn_count += 1;
            }
        }

        if ctx.phase == SimPhase::Running && flit.kind != FlitKind::Ctrl {
            self.stats.received_flits += 1;
            if flit.head {
                self.stats.received_packets += 1;
                if flit.kind.is_data_bearing() {
                    self.stats.received_data_flits += flit.size.saturating_sub(2) as u64;
                }
            }
        }

        self.incoming_flit_queue[subnet].push_back(flit);
        Ok(())
    }

    // ════════════════════════════════════════════════════════════════════
    // 2. Receive credit
    // ════════════════════════════════════════════════════════════════════

    pub fn receive_credit(&mut self, subnet: usize, credit: Credit) {
        if self.cfg.use_endpoint_crediting {
            self.buf_states[subnet].process_credit(&credit);
        }
    }

    // ════════════════════════════════════════════════════════════════════
    // 3. New packet generation
    // ════════════════════════════════════════════════════════════════════

    pub fn evaluate_new_packet_injection(
        &mut self,
        ctx: &mut SimContext,
        traffic: &mut dyn TrafficModel,
    ) {
        // Block while the OPB is full so complete packets never pile into
        // the injection buffers with nowhere to go.
        if self.opb.at_capacity() {
            return;
        }

        let mut gen_attempts_but_blocked = 0u32;
        let mut attempted_count = 0u32;
        let mut final_generated = false;

        for c in 0..self.classes {
            let mut generated = false;
            // qtime lags behind whenever backpressure stopped generation;
            // this loop reclaims those lost opportunities later in time.
            while !generated && self.qtime[c] <= ctx.time {
                let mut stype = self.decide_whether_to_generate(ctx, traffic, false);
                let attempt = stype != 0;
                if attempt {
                    let time = if ctx.include_queuing {
                        self.qtime[c]
                    } else {
                        ctx.time
                    };
                    self.generate_packet(ctx, traffic, &mut stype, c, time);
                    if stype != 0 {
                        generated = true;
                        final_generated = true;
                    } else {
                        gen_attempts_but_blocked += 1;
                    }
                    attempted_count += 1;
                } else if ctx.intended_load == 1.0
                    && ctx.phase == SimPhase::Running
                    && self.injection_buffers_empty(0)
                    && self.pending_replies_drained()
                {
                    // Full intended load with everything idle: force one.
                    stype = self.decide_whether_to_generate(ctx, traffic, true);
                    if stype != 0 {
                        let time = if ctx.include_queuing {
                            self.qtime[c]
                        } else {
                            ctx.time
                        };
                        self.generate_packet(ctx, traffic, &mut stype, c, time);
                    }
                    if stype != 0 {
                        generated = true;
                        final_generated = true;
                    }
                }

                if !attempt {
                    self.qtime[c] += 1;
                } else if generated && (!ctx.use_read_write || stype > 0) {
                    self.qtime[c] += 1;
                } else if attempt && !generated {
                    // Wanted to generate but the FIFO was full. Leave qtime
                    // behind so the opportunity is reclaimed, but exit.
                    generated = true;
                }
            }

            if ctx.phase == SimPhase::Draining && self.qtime[c] > ctx.drain_time {
                self.qdrained[c] = true;
            }
        }

        if ctx.phase == SimPhase::Running {
            if attempted_count == 0 {
                self.stats.idle.generation_not_attempted += 1;
            }
            if !final_generated && gen_attempts_but_blocked > 0 {
                self.stats.idle.gen_attempted_but_blocked += 1;
            }
        }
    }

    /// stype encoding: 0 none, 1 read request (or ANY_TYPE), 2 write request.
    fn decide_whether_to_generate(
        &mut self,
        ctx: &SimContext,
        traffic: &mut dyn TrafficModel,
        force: bool,
    ) -> i32 {
        if ctx.use_read_write {
            if force || traffic.test(self.node) {
                if self.rng.random::<f64>() < ctx.write_fraction {
                    2
                } else {
                    1
                }
            } else {
                0
            }
        } else if traffic.test(self.node) || force {
            1
        } else {
            0
        }
    }

    fn generate_packet(
        &mut self,
        ctx: &mut SimContext,
        traffic: &mut dyn TrafficModel,
        stype: &mut i32,
        class: usize,
        time: Cycle,
    ) {
        debug_assert!(*stype != 0);

        let mut dest = traffic.dest(self.node);
        let (kind, size, requested) = if !ctx.use_read_write {
            (FlitKind::AnyType, traffic.next_packet_size(class), 0)
        } else if *stype == 1 {
            (
                FlitKind::ReadRequest,
                ctx.read_request_size,
                ctx.read_reply_size,
            )
        } else {
            let kind = if self.cfg.put_to_noop {
                FlitKind::WriteRequestNoop
            } else {
                FlitKind::WriteRequest
            };
            (kind, ctx.write_request_size, 0)
        };

        // Only generate toward destinations with injection-buffer space;
        // try a few alternates before giving up for this cycle.
        let mut attempts = 0;
        while self.full_packets_in_inj_buf[class][dest] >= self.cfg.inj_buf_depth
            && attempts < self.cfg.packet_gen_attempts
        {
            dest = traffic.dest(self.node);
            attempts += 1;
        }
        if attempts >= self.cfg.packet_gen_attempts {
            *stype = 0;
            return;
        }

        let record = ctx.measure_stats
            && (ctx.phase == SimPhase::Running
                || (ctx.phase == SimPhase::Draining && time < ctx.drain_time));

        self.generate_packet_flits(
            ctx,
            dest,
            kind,
            size,
            time,
            record,
            class,
            None,
            requested,
            QueueTarget::Injection(class, dest),
        );
        self.full_packets_in_inj_buf[class][dest] += 1;
    }

    #[allow(clippy::too_many_arguments)]
    fn generate_packet_flits(
        &mut self,
        ctx: &mut SimContext,
        dest: NodeId,
        kind: FlitKind,
        size: usize,
        time: Cycle,
        record: bool,
        class: usize,
        response_to: Option<SeqNum>,
        requested_data_size: usize,
        target: QueueTarget,
    ) {
        let pid = ctx.next_packet_id();
        let mut flits = Flit::packet(
            pid,
            self.node,
            dest,
            kind,
            size,
            time,
            class,
            record,
            response_to,
            requested_data_size,
            None,
        );
        for f in &mut flits {
            f.id = ctx.next_flit_id();
            ctx.register_flit(f);
        }

        if ctx.phase == SimPhase::Running {
            self.stats.generated_packets += 1;
            self.stats.generated_flits += size as u64;
        }
        self.stats.generated_packets_full_sim += 1;
        self.stats.generated_flits_full_sim += size as u64;

        let queue = match target {
            QueueTarget::Injection(c, d) => &mut self.injection_buffer[c][d],
            QueueTarget::Reply(d) => &mut self.replies_pending[d],
            QueueTarget::RgetGetReq(d) => &mut self.rget_get_req_queues[d],
        };
        queue.extend(flits);
    }

    // ════════════════════════════════════════════════════════════════════
    // 4. Step: select and emit one flit, advance sub-controllers
    // ════════════════════════════════════════════════════════════════════

    pub fn step(
        &mut self,
        ctx: &mut SimContext,
        subnet: usize,
    ) -> Result<Option<Flit>, EndpointError> {
        self.now = ctx.time;

        if self.cfg.rget_convert_sample_period > 0
            && self.now > 0
            && self.now % self.cfg.rget_convert_sample_period == 0
        {
            self.rget.sample(&mut self.meters);
        }

        let front_replay_ready = self
            .retry
            .pending_nack_replays
            .front()
            .map(|&d| self.retry.state(d).is_replay())
            .unwrap_or(false);
        let nothing_in_progress = self.arb.in_progress.is_none()
            && self.retry.timeout_replay_in_progress.is_none()
            && !front_replay_ready;
        let staging_blocked = self.next_packet_injection_blocked_until > self.now
            || self.num_flits_waiting_to_inject >= self.cfg.max_flits_waiting_to_inject;

        if nothing_in_progress && staging_blocked {
            if ctx.phase == SimPhase::Running {
                self.stats.idle.new_flit_not_injected += 1;
                if self.next_packet_injection_blocked_until > self.now {
                    self.stats.idle.packet_processing_penalty += 1;
                }
                if self.num_flits_waiting_to_inject >= self.cfg.max_flits_waiting_to_inject {
                    self.stats.idle.staging_buffer_full += 1;
                }
            }
        } else {
            let mut flit: Option<Flit> = None;
            let mut new_flit = false;

            // Retransmissions first, but never interrupt a packet already
            // mid-transmission.
            if self.arb.in_progress.is_none() {
                flit = self.find_flit_to_retransmit(ctx)?;
                if let Some(f) = &flit {
                    if ctx.phase == SimPhase::Running {
                        self.stats.idle.retransmitting += 1;
                        self.stats.idle.new_flit_not_injected += 1;
                        if f.head {
                            self.stats.packets_retransmitted += 1;
                        }
                    }
                    if f.head {
                        self.stats.packets_retransmitted_full_sim += 1;
                    }
                    self.stats.flits_retransmitted_full_sim += 1;
                }
            }

            if flit.is_none() {
                flit = self.find_new_flit_to_inject(ctx, subnet)?;
                if flit.is_some() {
                    new_flit = true;
                } else if ctx.phase == SimPhase::Running {
                    self.stats.idle.new_flit_not_injected += 1;
                    if !self.injection_buffers_empty(0) || !self.pending_replies_drained() {
                        self.stats.idle.inj_present_but_blocked += 1;
                    }
                    if self.injection_buffers_not_empty_but_all_blocked_on_timeout(0) {
                        self.stats.idle.all_blocked_on_timeout += 1;
                    }
                }
            }

            if flit.is_none()
                && self.injection_buffers_empty(0)
                && self.pending_replies_drained()
                && ctx.phase == SimPhase::Running
            {
                self.stats.idle.link_avail_no_new_flits += 1;
            }

            if let Some(f) = &mut flit {
                self.insert_piggybacked_acks(f);
                if f.head {
                    self.next_packet_injection_blocked_until = if f.kind.is_data_bearing() {
                        self.now + self.cfg.packet_processing_penalty
                    } else {
                        self.now + 1
                    };
                }
            } else {
                flit = self.manufacture_standalone_ack(ctx);
            }

            if let Some(f) = flit.take() {
                if f.head {
                    self.num_flits_waiting_to_inject += f.size;
                    // Spend the mypolicy send allowance on data-bearing heads.
                    if self.mypolicy()
                        && matches!(
                            f.kind,
                            FlitKind::WriteRequest
                                | FlitKind::WriteRequestNoop
                                | FlitKind::RgetGetReply
                                | FlitKind::ReadReply
                        )
                    {
                        if let Some(d) = f.dest {
                            self.peers[d].spend_allowance(f.size);
                        }
                    }
                }
                let ready = if f.kind.is_data_bearing() {
                    self.now + self.cfg.packet_processing_penalty
                } else {
                    self.now + 1
                };
                self.flits_waiting_to_inject.push_back(StagedFlit {
                    flit: f,
                    ready,
                    new_flit,
                });
            }
        }

        let injected = self.inject_flit(ctx);

        self.process_received_ack_queue(ctx)?;
        self.process_pending_inbound_response_queue(ctx)?;
        self.process_pending_outbound_response_queue(ctx);
        self.bandwidth.update(self.now, &mut self.rng);
        self.sender_process_ecn();
        self.process_put_queue(ctx)?;
        if self.mypolicy() {
            self.process_delayed_ack_if_needed();
        }

        Ok(injected)
    }

    /// Pop the staging buffer onto the wire once the front's ready time
    /// arrives. Heads pick their VC here; bodies inherit it.
    fn inject_flit(&mut self, ctx: &SimContext) -> Option<Flit> {
        let ready = self
            .flits_waiting_to_inject
            .front()
            .map(|s| s.ready <= self.now)
            .unwrap_or(false);
        if !ready {
            return None;
        }
        let StagedFlit {
            mut flit, new_flit, ..
        } = self.flits_waiting_to_inject.pop_front().expect("front checked");
        self.num_flits_waiting_to_inject = self.num_flits_waiting_to_inject.saturating_sub(1);

        let subnet = flit.subnet;
        let class = flit.class;
        if flit.head {
            if flit.vc.is_none() {
                flit.vc = flit.dest.map(|d| d % self.cfg.num_vcs);
            }
            self.last_vc[subnet][class] = flit.vc;
        } else {
            flit.vc = self.last_vc[subnet][class];
        }
        if self.cfg.use_endpoint_crediting {
            self.buf_states[subnet].sending_flit(&flit);
        }

        if ctx.phase == SimPhase::Running && flit.kind != FlitKind::Ctrl {
            self.stats.sent_flits += 1;
            if new_flit {
                self.stats.new_sent_flits += 1;
            }
            if flit.head {
                self.stats.sent_packets += 1;
                if new_flit {
                    self.stats.new_sent_packets += 1;
                }
                if flit.kind.is_data_bearing() {
                    let data = flit.size.saturating_sub(2) as u64;
                    self.stats.sent_data_flits += data;
                    if new_flit {
                        self.stats.new_sent_data_flits += data;
                    }
                }
            }
        }

        trace!(
            node = self.node,
            flit = flit.id,
            packet = flit.packet_id,
            seq = flit.seq_num,
            "injecting flit"
        );

        // A real non-head flit carries no routable destination.
        if !flit.head {
            flit.dest = None;
        }
        Some(flit)
    }

    // ════════════════════════════════════════════════════════════════════
    // Arbitration
    // ════════════════════════════════════════════════════════════════════

    fn find_new_flit_to_inject(
        &mut self,
        ctx: &mut SimContext,
        subnet: usize,
    ) -> Result<Option<Flit>, EndpointError> {
        let mut flit = None;
        if let Some(q) = self.arb.in_progress {
            flit = self.find_new_flit_from_group(ctx, q, subnet)?;
        } else {
            let mut checked = 0;
            while checked < 3 && flit.is_none() {
                let q = self.arb.group_cursor;
                flit = self.find_new_flit_from_group(ctx, q, subnet)?;
                self.arb.group_cursor = q.next();
                checked += 1;
            }
        }

        if let Some(f) = &mut flit {
            // Sequence numbers are assigned only at first emission.
            let dest = f.dest.expect("queued flits keep their destination");
            f.seq_num = self.packet_seq_num[dest];
            if f.tail {
                self.packet_seq_num[dest] += 1;
            }
            let wire = f.clone();
            self.insert_flit_into_opb(&wire)?;
        }
        Ok(flit)
    }

    fn find_new_flit_from_group(
        &mut self,
        ctx: &mut SimContext,
        q: QueueType,
        subnet: usize,
    ) -> Result<Option<Flit>, EndpointError> {
        let num_queues = self.arb.num_queues();
        let mut checked = 0;
        let mut found = false;
        while checked < num_queues && !found {
            let idx = self.arb.cursor(q);
            if self.arb.token_gate_open(q, idx) {
                if self.check_single_queue(ctx, q, idx, subnet)? {
                    found = true;
                    let size = self.queue_front(q, idx).map(|f| f.size).unwrap_or(0);
                    self.arb.charge_tokens(q, idx, size);
                } else {
                    self.arb.advance_cursor(q);
                }
            } else {
                self.arb.advance_cursor(q);
            }
            checked += 1;
        }

        if found {
            let idx = self.arb.cursor(q);
            Ok(Some(self.pop_and_lock(q, idx)))
        } else {
            if self.arb.mode() == ArbMode::Weighted {
                self.count_blocked_on_tokens(ctx, q);
                self.arb.increment_tokens();
            }
            Ok(None)
        }
    }

    fn queue_front(&self, q: QueueType, idx: usize) -> Option<&Flit> {
        match q {
            QueueType::NewCmd => self.injection_buffer[0][idx].front(),
            QueueType::ReadReply => self.replies_pending[idx].front(),
            QueueType::RgetGetReq => self.rget_get_req_queues[idx].front(),
        }
    }

    /// Whether the front flit of one transmit queue may be emitted now.
    /// Assigns the output VC on a selectable head.
    fn check_single_queue(
        &mut self,
        ctx: &mut SimContext,
        q: QueueType,
        idx: usize,
        subnet: usize,
    ) -> Result<bool, EndpointError> {
        let Some(front) = self.queue_front(q, idx) else {
            return Ok(false);
        };

        if !front.head {
            // Mid-packet continuation: no further conditions.
            return Ok(true);
        }
        let dest = front.dest.expect("head flit has a destination");
        let front_subnet = front.subnet;
        let front_kind = front.kind;

        if self.has_priority_standalone_ack() {
            return Ok(false);
        }
        if front_subnet != subnet {
            return Ok(false);
        }
        if self.retry.state(dest) != &RetryState::Idle {
            return Ok(false);
        }

        if front_kind == FlitKind::WriteRequest
            && !self.cfg.put_to_noop
            && self.rget.decide(dest, &self.cfg, &mut self.rng)
        {
            let read_size = ctx.read_request_size;
            let queue = match q {
                QueueType::NewCmd => &mut self.injection_buffer[0][idx],
                QueueType::ReadReply => &mut self.replies_pending[idx],
                QueueType::RgetGetReq => &mut self.rget_get_req_queues[idx],
            };
            convert_put_to_rget(queue, ctx, &mut self.stats, read_size);
        }

        let (kind, size, req_size) = {
            let f = self.queue_front(q, idx).expect("front still present");
            (f.kind, f.size, f.requested_data_size)
        };
        if !self.new_packet_qualifies_for_arb(ctx, kind, dest, size, req_size)? {
            return Ok(false);
        }

        let vc = dest % self.cfg.num_vcs;
        let front = match q {
            QueueType::NewCmd => self.injection_buffer[0][idx].front_mut(),
            QueueType::ReadReply => self.replies_pending[idx].front_mut(),
            QueueType::RgetGetReq => self.rget_get_req_queues[idx].front_mut(),
        };
        if let Some(f) = front {
            if f.vc.is_none() {
                f.vc = Some(vc);
            }
        }
        Ok(true)
    }

    fn pop_and_lock(&mut self, q: QueueType, idx: usize) -> Flit {
        let flit = match q {
            QueueType::NewCmd => self.injection_buffer[0][idx].pop_front(),
            QueueType::ReadReply => self.replies_pending[idx].pop_front(),
            QueueType::RgetGetReq => self.rget_get_req_queues[idx].pop_front(),
        }
        .expect("selected queue has a front");

        if flit.head {
            self.arb.in_progress = Some(q);
            if q == QueueType::NewCmd {
                let dest = flit.dest.expect("head has dest");
                self.full_packets_in_inj_buf[flit.class][dest] -= 1;
            }
        }

        if !flit.tail {
            // Pass the output VC back to the next flit of the packet.
            let next = match q {
                QueueType::NewCmd => self.injection_buffer[0][idx].front_mut(),
                QueueType::ReadReply => self.replies_pending[idx].front_mut(),
                QueueType::RgetGetReq => self.rget_get_req_queues[idx].front_mut(),
            };
            if let Some(n) = next {
                n.vc = flit.vc;
            }
        } else {
            // Only the tail releases the lock and moves the cursor.
            self.arb.advance_cursor(q);
            self.arb.in_progress = None;
        }
        flit
    }

    /// Stats only: one blocked-on-tokens sample per cycle and group.
    fn count_blocked_on_tokens(&mut self, ctx: &SimContext, q: QueueType) {
        if ctx.phase != SimPhase::Running {
            return;
        }
        for idx in 0..self.arb.num_queues() {
            if self.arb.tokens(q, idx) <= 0 && self.queue_front(q, idx).is_some() {
                match q {
                    QueueType::NewCmd => self.stats.blocked.req_ws_tokens += 1,
                    QueueType::ReadReply => self.stats.blocked.resp_ws_tokens += 1,
                    QueueType::RgetGetReq => self.stats.blocked.rget_get_req_ws_tokens += 1,
                }
                return;
            }
        }
    }

    // ════════════════════════════════════════════════════════════════════
    // Metering / admission
    // ════════════════════════════════════════════════════════════════════

    fn new_packet_qualifies_for_arb(
        &mut self,
        ctx: &SimContext,
        kind: FlitKind,
        dest: NodeId,
        size: usize,
        data_size: usize,
    ) -> Result<bool, EndpointError> {
        let running = ctx.phase == SimPhase::Running;
        let mut blocked = false;
        let policy = self.cfg.host_control_policy;

        // Model the receiver's finite in-order command queue: never run
        // farther ahead of the oldest unacked packet than it can buffer.
        if self.cfg.enable_sack {
            if let Some(oldest) = self.opb.oldest_seq(dest) {
                if self.packet_seq_num[dest] - oldest >= self.cfg.max_receivable_pkts_after_drop {
                    blocked = true;
                }
            }
        }

        match kind {
            FlitKind::WriteRequest | FlitKind::WriteRequestNoop | FlitKind::AnyType => {
                if matches!(policy, HostControlPolicy::None | HostControlPolicy::MyPolicy) {
                    if self.meters.xactions_per_dest[dest] >= self.cfg.endpoint_xaction_limit_per_dest
                    {
                        if running {
                            self.stats.blocked.req_xaction_limit += 1;
                        }
                        blocked = true;
                    }
                    if self.meters.outbound_data_per_dest[dest] + size
                        > self.cfg.xaction_size_limit_flits()
                    {
                        if running {
                            self.stats.blocked.req_size_limit += 1;
                        }
                        blocked = true;
                    }
                }
                if policy == HostControlPolicy::Homa
                    && self.meters.outbound_data_per_dest[dest] + size
                        > self.cfg.estimate_round_trip_cycles as usize
                {
                    if running {
                        self.stats.blocked.req_size_limit += 1;
                    }
                    blocked = true;
                }
                if self.mypolicy() && !self.peers[dest].allowance_gate_open(size) {
                    blocked = true;
                }
            }
            FlitKind::ReadRequest => {
                if self.meters.gets_per_dest[dest] >= self.cfg.endpoint_get_limit_per_dest {
                    if running {
                        self.stats.blocked.read_req_get_limit += 1;
                    }
                    blocked = true;
                }
                if self.meters.inbound_data_per_dest[dest] + data_size
                    > self.cfg.get_inbound_size_limit_flits()
                {
                    if running {
                        self.stats.blocked.read_req_size_limit += 1;
                    }
                    blocked = true;
                }
                if self.meters.global_get_requests >= self.cfg.endpoint_global_get_limit {
                    if running {
                        self.stats.blocked.global_get_request_limit += 1;
                    }
                    blocked = true;
                }
                if self.meters.global_get_inbound_data + data_size
                    > self.cfg.global_get_req_size_limit_flits()
                {
                    if running {
                        self.stats.blocked.global_get_data_limit += 1;
                    }
                    blocked = true;
                }
            }
            FlitKind::ReadReply => {
                if self.meters.xactions_per_dest[dest] >= self.cfg.endpoint_xaction_limit_per_dest {
                    if running {
                        self.stats.blocked.resp_xaction_limit += 1;
                    }
                    blocked = true;
                }
                if self.meters.outbound_data_per_dest[dest] + size
                    > self.cfg.xaction_size_limit_flits()
                {
                    if running {
                        self.stats.blocked.resp_size_limit += 1;
                    }
                    blocked = true;
                }
                if self.mypolicy() && !self.peers[dest].allowance_gate_open(size) {
                    blocked = true;
                }
            }
            FlitKind::RgetRequest => {
                if self.meters.xactions_per_dest[dest] >= self.cfg.endpoint_xaction_limit_per_dest {
                    if running {
                        self.stats.blocked.rget_req_xaction_limit += 1;
                    }
                    blocked = true;
                }
                // RGETs meter the data transfer they request, not their own
                // size.
                if self.meters.outbound_data_per_dest[dest] + data_size
                    > self.cfg.xaction_size_limit_flits()
                {
                    if running {
                        self.stats.blocked.rget_req_size_limit += 1;
                    }
                    blocked = true;
                }
                if self.meters.rget_reqs_per_dest[dest] >= self.cfg.endpoint_rget_req_limit_per_dest
                {
                    if running {
                        self.stats.blocked.rget_req_limit += 1;
                    }
                    blocked = true;
                }
                if self.cfg.endpoint_use_new_rget_metering
                    && self.meters.rget_inbound_data_per_dest[dest] + data_size
                        > self.cfg.rget_inbound_size_limit_flits()
                {
                    if running {
                        self.stats.blocked.rget_req_inbound_limit += 1;
                    }
                    blocked = true;
                }
            }
            FlitKind::RgetGetRequest => {
                if self.meters.gets_per_dest[dest] >= self.cfg.endpoint_get_limit_per_dest {
                    if running {
                        self.stats.blocked.rget_get_req_get_limit += 1;
                    }
                    blocked = true;
                }
                if self.meters.inbound_data_per_dest[dest] + data_size
                    > self.cfg.get_inbound_size_limit_flits()
                {
                    if running {
                        self.stats.blocked.rget_get_req_inbound_limit += 1;
                    }
                    blocked = true;
                }
                if self.meters.global_get_requests >= self.cfg.endpoint_global_get_limit {
                    if running {
                        self.stats.blocked.global_get_request_limit += 1;
                    }
                    blocked = true;
                }
                if self.meters.global_get_inbound_data + data_size
                    > self.cfg.global_get_req_size_limit_flits()
                {
                    if running {
                        self.stats.blocked.global_get_data_limit += 1;
                    }
                    blocked = true;
                }
            }
            FlitKind::RgetGetReply => {
                if self.mypolicy() && !self.peers[dest].allowance_gate_open(size) {
                    blocked = true;
                }
            }
            FlitKind::WriteReply | FlitKind::Ctrl => {}
        }

        // The TCP-like window gates every outgoing packet type.
        if self.tcp_like() && self.meters.outbound_data_per_dest[dest] + size > self.peers[dest].cwnd
        {
            blocked = true;
        }

        let conflict =
            self.opb
                .insertion_conflict(self.node, self.now, dest, self.packet_seq_num[dest])?;
        if conflict {
            self.stats.opb_insertion_conflicts += 1;
        }

        Ok(!blocked && !conflict)
    }

    /// The halt/allowance gate applies to replayed packets of every type.
    fn packet_qualifies_for_retransmission(&self, dest: NodeId, size: usize) -> bool {
        debug_assert!(self.mypolicy());
        self.peers[dest].allowance_gate_open(size)
    }

    fn insert_flit_into_opb(&mut self, flit: &Flit) -> Result<(), EndpointError> {
        let dest = flit.dest.expect("OPB insert needs a destination");
        if flit.head {
            self.meters.on_opb_insert(
                flit.kind,
                dest,
                flit.size,
                flit.requested_data_size,
                &self.cfg,
                &mut self.stats,
            );
        }
        let timeout = self.cfg.effective_retry_timer_timeout();
        let entry = OpbFlit::new(flit.clone(), dest, self.now, timeout);
        if entry.flit.head {
            self.retry
                .arm_retry_timer(self.now + timeout, dest, flit.seq_num);
        }
        self.opb.insert(self.node, self.now, entry)
    }
}

// ════════════════════════════════════════════════════════════════════════
// Retransmission
// ════════════════════════════════════════════════════════════════════════

impl Endpoint {
    /// Pick a flit to retransmit. NACK/SACK replays take precedence over
    /// timeout recovery, except that an in-progress timeout replay is never
    /// interrupted.
    fn find_flit_to_retransmit(
        &mut self,
        ctx: &mut SimContext,
    ) -> Result<Option<Flit>, EndpointError> {
        if self.retry.timeout_replay_in_progress.is_none() {
            if let Some(&dest) = self.retry.pending_nack_replays.front() {
                if self.retry.state(dest).is_replay() {
                    return match self.service_replay(ctx, dest)? {
                        ReplayOutcome::Emitted(flit) => Ok(Some(flit)),
                        ReplayOutcome::Blocked => Ok(None),
                    };
                }
            }
        }
        self.find_timed_out_flit_to_retransmit(ctx)
    }

    /// Emit the next flit of the NACK/SACK replay at the front of the
    /// pending queue, advancing or completing the replay state.
    fn service_replay(
        &mut self,
        ctx: &mut SimContext,
        dest: NodeId,
    ) -> Result<ReplayOutcome, EndpointError> {
        let opb_len = self.opb.dest(dest).len();
        let mut opb_index = self
            .retry
            .state(dest)
            .replay_index()
            .expect("replay state has an index");
        if opb_index >= opb_len {
            return Err(EndpointError::ReplayIndexOutOfRange {
                cycle: self.now,
                node: self.node,
                dest,
                index: opb_index,
                opb_len,
            });
        }

        let is_head = self.opb.dest(dest)[opb_index].flit.head;
        if is_head && self.mypolicy() {
            let size = self.opb.dest(dest)[opb_index].flit.size;
            if !self.peers[dest].allowance_gate_open(size) {
                // Try another destination's pending replay next cycle.
                if let Some(d) = self.retry.pending_nack_replays.pop_front() {
                    self.retry.pending_nack_replays.push_back(d);
                }
                return Ok(ReplayOutcome::Blocked);
            }

            // A NACK received mid-replay re-targets the replay at a packet
            // boundary; an in-progress packet is never cut.
            if let Some(pending_nack) = self.peers[dest].pending_nack_seq_num.take() {
                let idx = self.opb.find_head_index(dest, pending_nack + 1).ok_or(
                    EndpointError::ReplayTargetMissing {
                        cycle: self.now,
                        node: self.node,
                        dest,
                        seq: pending_nack + 1,
                    },
                )?;
                opb_index = idx;
                self.set_replay_index(dest, idx);
                debug!(node = self.node, dest, idx, "re-targeted replay for mid-replay nack");
            }

            let size = self.opb.dest(dest)[opb_index].flit.size;
            if !self.packet_qualifies_for_retransmission(dest, size) {
                return Ok(ReplayOutcome::Blocked);
            }
        }

        // Emit a fresh wire copy and re-arm the resident copy's timer.
        let timeout = self.cfg.effective_retry_timer_timeout();
        let (wire, head, tail, seq) = {
            let entry = &mut self.opb.dest_mut(dest)[opb_index];
            if entry.flit.head && entry.flit.vc.is_none() {
                entry.flit.vc = Some(dest % self.cfg.num_vcs);
            }
            let wire = entry.emit_copy();
            entry.rearm(self.now, timeout);
            // Invalidate the resident VC so the next attempt reselects.
            let head = entry.flit.head;
            let tail = entry.flit.tail;
            let seq = entry.flit.seq_num;
            entry.flit.vc = None;
            (wire, head, tail, seq)
        };

        ctx.flit_retransmissions += 1;
        if head {
            self.retry.arm_retry_timer(self.now + timeout, dest, seq);
            ctx.packet_retransmissions += 1;
            let entry = &self.opb.dest(dest)[opb_index];
            if entry.transmit_attempts > self.cfg.max_retry_attempts {
                return Err(EndpointError::RetryAttemptsExceeded {
                    cycle: self.now,
                    node: self.node,
                    dest,
                    seq,
                    attempts: entry.transmit_attempts,
                    max: self.cfg.max_retry_attempts,
                });
            }
            let entry = &mut self.opb.dest_mut(dest)[opb_index];
            entry.transmit_attempts += 1;
            self.stats.max_packet_retries_full_sim = self
                .stats
                .max_packet_retries_full_sim
                .max(entry.transmit_attempts);
        }

        let is_sack = matches!(self.retry.state(dest), RetryState::SackBased { .. });
        if !is_sack {
            if opb_index == opb_len - 1 {
                // Last resident flit: either restart at a pending NACK or
                // complete the replay.
                if let Some(pending_nack) = self.peers[dest].pending_nack_seq_num.take() {
                    let idx = self.opb.find_head_index(dest, pending_nack + 1).ok_or(
                        EndpointError::ReplayTargetMissing {
                            cycle: self.now,
                            node: self.node,
                            dest,
                            seq: pending_nack + 1,
                        },
                    )?;
                    self.set_replay_index(dest, idx);
                } else {
                    self.complete_replay(ctx, dest)?;
                }
            } else {
                self.set_replay_index(dest, opb_index + 1);
                if !tail {
                    let vc = wire.vc;
                    self.opb.dest_mut(dest)[opb_index + 1].flit.vc = vc;
                }
            }
        } else {
            let (sack_vec, seq_in_progress) = match self.retry.state(dest) {
                RetryState::SackBased {
                    sack_vec,
                    seq_in_progress,
                    ..
                } => (*sack_vec, *seq_in_progress),
                _ => unreachable!(),
            };
            let next_gap = sack_vec_next_retrans(sack_vec >> 1, self.cfg.sack_vec_length);
            if opb_index == opb_len - 1 || (tail && next_gap.is_none()) {
                debug!(node = self.node, dest, "completed sack-based replay");
                self.complete_replay(ctx, dest)?;
            } else if !tail {
                let vc = wire.vc;
                self.opb.dest_mut(dest)[opb_index + 1].flit.vc = vc;
                self.set_replay_index(dest, opb_index + 1);
            } else {
                // Packet done: hop over the received run to the next gap.
                let skip = next_gap.expect("gap checked above") as u64;
                let new_seq = seq_in_progress + 1 + skip;
                let idx = self.opb.find_head_index(dest, new_seq).ok_or(
                    EndpointError::ReplayTargetMissing {
                        cycle: self.now,
                        node: self.node,
                        dest,
                        seq: new_seq,
                    },
                )?;
                if let RetryState::SackBased {
                    opb_index: i,
                    seq_in_progress: s,
                    sack_vec: v,
                    ..
                } = &mut self.retry.dest_mut(dest).state
                {
                    *v >>= 1 + skip as u32;
                    *s = new_seq;
                    *i = idx;
                }
            }
        }

        Ok(ReplayOutcome::Emitted(wire))
    }

    fn set_replay_index(&mut self, dest: NodeId, idx: usize) {
        match &mut self.retry.dest_mut(dest).state {
            RetryState::NackBased { opb_index }
            | RetryState::SackBased { opb_index, .. } => *opb_index = idx,
            _ => {}
        }
    }

    /// Pop the finished replay, return to idle, and apply any ACK that
    /// arrived while it ran.
    fn complete_replay(&mut self, ctx: &mut SimContext, dest: NodeId) -> Result<(), EndpointError> {
        self.retry.pending_nack_replays.pop_front();
        self.retry.dest_mut(dest).state = RetryState::Idle;
        debug!(node = self.node, dest, "completed nack-based replay");
        if let Some(pending) = self.retry.dest_mut(dest).pending_ack.take() {
            self.clear_opb_of_acked_packets(ctx, dest, pending, false)?;
        }
        Ok(())
    }

    /// Serve the retry / response timer queues: locate the expired packet in
    /// the OPB and retransmit it flit by flit.
    fn find_timed_out_flit_to_retransmit(
        &mut self,
        ctx: &mut SimContext,
    ) -> Result<Option<Flit>, EndpointError> {
        enum TimerQueue {
            Retry,
            Response,
        }

        let mut rollback: Option<(TimerQueue, crate::retry::TimerRecord)> = None;
        let target = if let Some(t) = self.retry.timeout_replay_in_progress {
            Some(t)
        } else if self
            .retry
            .retry_timers
            .front()
            .map(|r| r.expiry <= self.now)
            .unwrap_or(false)
        {
            let rec = self.retry.retry_timers.pop_front().expect("front checked");
            rollback = Some((TimerQueue::Retry, rec));
            Some((rec.dest, rec.seq_num))
        } else if self
            .retry
            .response_timers
            .front()
            .map(|r| r.expiry <= self.now)
            .unwrap_or(false)
        {
            let rec = self.retry.response_timers.pop_front().expect("front checked");
            rollback = Some((TimerQueue::Response, rec));
            Some((rec.dest, rec.seq_num))
        } else {
            None
        };

        let Some((dest, retry_seq)) = target else {
            return Ok(None);
        };
        if self.opb.dest(dest).is_empty() {
            return Ok(None);
        }

        let timeout = self.cfg.effective_retry_timer_timeout();
        let mut i = 0;
        while i < self.opb.dest(dest).len() {
            let (head, seq, size, kind, expire, ack_received, ack_time) = {
                let e = &self.opb.dest(dest)[i];
                (
                    e.flit.head,
                    e.flit.seq_num,
                    e.flit.size,
                    e.flit.kind,
                    e.expire_time,
                    e.ack_received,
                    e.ack_received_time,
                )
            };

            if head && seq < retry_seq {
                // Skip whole packets older than the expired one.
                i += size;
                continue;
            }
            if seq > retry_seq {
                // The expired packet no longer exists in the OPB; that is
                // only legal between packets, never mid-retransmission.
                if self.retry.timeout_replay_in_progress.is_some() {
                    return Err(EndpointError::RetryPacketVanished {
                        cycle: self.now,
                        node: self.node,
                        dest,
                        seq: retry_seq,
                    });
                }
                return Ok(None);
            }
            if seq == retry_seq && expire <= self.now {
                if matches!(
                    kind,
                    FlitKind::ReadRequest | FlitKind::RgetRequest | FlitKind::RgetGetRequest
                ) && ack_received
                {
                    // The ACK arrived but the protocol response never did.
                    return Err(EndpointError::ResponseTimerExpired {
                        cycle: self.now,
                        node: self.node,
                        dest,
                        seq,
                        kind,
                        acked_at: ack_time.unwrap_or(0),
                    });
                }

                if head {
                    if self.mypolicy() {
                        let peer = &self.peers[dest];
                        let blocked = peer.halt_active
                            && peer.send_allowance_counter_size <= size
                            && !peer.must_retry_at_least_one_packet;
                        if blocked {
                            // Re-arm the timer record and wait for allowance.
                            if let Some((queue, rec)) = rollback.take() {
                                match queue {
                                    TimerQueue::Retry => {
                                        self.retry.retry_timers.push_front(rec)
                                    }
                                    TimerQueue::Response => {
                                        self.retry.response_timers.push_front(rec)
                                    }
                                }
                            }
                            return Ok(None);
                        }
                    }

                    if self.retry.state(dest) != &RetryState::TimeoutBased {
                        // No new packets to this destination until everything
                        // resident has been acked.
                        self.retry.dest_mut(dest).state = RetryState::TimeoutBased;
                        debug!(node = self.node, dest, seq, "entered timeout-based recovery");
                    }
                }

                let (wire, tail) = {
                    let entry = &mut self.opb.dest_mut(dest)[i];
                    if entry.flit.head {
                        entry.flit.vc = Some(dest % self.cfg.num_vcs);
                    }
                    let wire = entry.emit_copy();
                    let tail = entry.flit.tail;
                    entry.rearm(self.now, timeout);
                    entry.flit.vc = None;
                    (wire, tail)
                };

                ctx.flit_retransmissions += 1;
                if head {
                    self.retry.arm_retry_timer(self.now + timeout, dest, seq);
                    ctx.packet_retransmissions += 1;
                    let attempts = self.opb.dest(dest)[i].transmit_attempts;
                    if attempts > self.cfg.max_retry_attempts {
                        return Err(EndpointError::RetryAttemptsExceeded {
                            cycle: self.now,
                            node: self.node,
                            dest,
                            seq,
                            attempts,
                            max: self.cfg.max_retry_attempts,
                        });
                    }
                    let entry = &mut self.opb.dest_mut(dest)[i];
                    entry.transmit_attempts += 1;
                    self.stats.max_packet_retries_full_sim = self
                        .stats
                        .max_packet_retries_full_sim
                        .max(entry.transmit_attempts);
                    self.stats.retry_timeouts += 1;
                }

                if !tail {
                    let vc = wire.vc;
                    if let Some(next) = self.opb.dest_mut(dest).get_mut(i + 1) {
                        next.flit.vc = vc;
                    }
                    self.retry.timeout_replay_in_progress = Some((dest, seq));
                } else {
                    self.retry.timeout_replay_in_progress = None;
                    if let Some(pending) = self.retry.dest_mut(dest).pending_ack.take() {
                        self.clear_opb_of_acked_packets(ctx, dest, pending, false)?;
                    }
                }

                return Ok(Some(wire));
            }

            i += 1;
        }

        Ok(None)
    }
}

// ════════════════════════════════════════════════════════════════════════
// Received-acknowledgement processing
// ════════════════════════════════════════════════════════════════════════

impl Endpoint {
    fn process_received_ack_queue(&mut self, ctx: &mut SimContext) -> Result<(), EndpointError> {
        // In order; stop at the first record still inside its processing
        // latency.
        while self
            .received_ack_queue
            .front()
            .map(|r| r.time <= self.now)
            .unwrap_or(false)
        {
            let record = self.received_ack_queue.pop_front().expect("front checked");
            if record.nack_seq_num.is_some() {
                self.stats.nacks_received += 1;
            }
            if record.sack {
                self.stats.sacks_received += 1;
            }
            self.process_received_acks(ctx, record)?;
        }

        // Halted peers that have gone silent reset their window.
        if self.mypolicy() {
            for peer in &mut self.peers {
                if peer.halt_active
                    && peer
                        .time_last_ack_recvd
                        .map(|t| t + self.cfg.host_control_timeout <= self.now)
                        .unwrap_or(false)
                {
                    peer.halt_timeout_reset();
                }
            }
        }
        Ok(())
    }

    fn process_received_acks(
        &mut self,
        ctx: &mut SimContext,
        record: RecvdAck,
    ) -> Result<(), EndpointError> {
        let target = record.target;

        // `ack == nack` is the congestion-signalling duplicate encoding;
        // any other combination with both fields set is a protocol error.
        if let (Some(ack), Some(nack)) = (record.ack_seq_num, record.nack_seq_num) {
            if ack != nack {
                return Err(EndpointError::AckNackBothSet {
                    cycle: self.now,
                    node: self.node,
                    ack,
                    nack,
                });
            }
        }

        let packet_size =
            self.calculate_to_be_acked_packet_size(target, record.ack_seq_num, self.mypolicy());
        if self.mypolicy() {
            let replay = self.retry.state(target).is_replay();
            let contains_put = record
                .ack_seq_num
                .map(|a| self.to_be_acked_packets_contain_put(target, a))
                .unwrap_or(false);
            let now = self.now;
            self.peers[target].mypolicy_on_ack(
                &record,
                packet_size,
                replay,
                contains_put,
                now,
                &self.cfg,
            );
        }

        if let Some(ack_seq) = record.ack_seq_num {
            trace!(node = self.node, target, ack_seq, "processing ack");
            self.clear_opb_of_acked_packets(ctx, target, ack_seq, false)?;

            if self.mypolicy() && self.opb.dest(target).is_empty() {
                self.peers[target].must_retry_at_least_one_packet = true;
            }

            if self.tcp_like() {
                self.peers[target].tcp_on_ack(packet_size, &self.cfg);
            }

            if record.sack {
                self.handle_received_sack(ctx, target, ack_seq, record.sack_vec)?;
            }
        } else if let Some(nack_seq) = record.nack_seq_num {
            debug!(node = self.node, target, nack_seq, "received nack");
            if self.tcp_like() {
                self.peers[target].tcp_on_nack();
            }

            match self.retry.state(target) {
                RetryState::NackBased { .. } | RetryState::SackBased { .. } => {
                    // Already replaying: remember the NACK, restart from its
                    // successor when the current packet completes.
                    if !self.mypolicy() {
                        self.clear_opb_of_acked_packets(ctx, target, nack_seq, false)?;
                    }
                    self.peers[target].pending_nack_seq_num = Some(nack_seq);
                }
                RetryState::TimeoutBased => {
                    // Timeout recovery supersedes NACK handling entirely.
                }
                RetryState::Idle => {
                    if !self.mypolicy() {
                        self.clear_opb_of_acked_packets(ctx, target, nack_seq, false)?;
                    }
                    self.retry.pending_nack_replays.push_back(target);
                    let idx = self.opb.find_head_index(target, nack_seq + 1).ok_or(
                        EndpointError::ReplayTargetMissing {
                            cycle: self.now,
                            node: self.node,
                            dest: target,
                            seq: nack_seq + 1,
                        },
                    )?;
                    self.retry.dest_mut(target).state = RetryState::NackBased { opb_index: idx };
                }
            }
        }
        Ok(())
    }

    /// Process a received SACK vector: set up or merge a SACK-based replay
    /// and retire every packet the vector marks as received.
    fn handle_received_sack(
        &mut self,
        ctx: &mut SimContext,
        target: NodeId,
        ack_seq: SeqNum,
        sack_vec: u64,
    ) -> Result<(), EndpointError> {
        let max_bit = self.cfg.sack_vec_length.min(63);
        match self.retry.state(target).clone() {
            RetryState::SackBased {
                sack_vec: old_vec,
                seq_in_progress,
                ..
            } => {
                // Merge the new vector onto the in-progress base.
                let shifted = shift_sack_vec(sack_vec, ack_seq, seq_in_progress);
                if (!shifted) & old_vec != 0 {
                    return Err(EndpointError::SackMergeClearsAckedBit {
                        cycle: self.now,
                        node: self.node,
                        dest: target,
                        old_vec,
                        new_vec: shifted,
                    });
                }
                let newly_acked = !old_vec & shifted;
                for vec_idx in 1..=max_bit as u64 {
                    if (newly_acked >> vec_idx) & 1 == 1 {
                        self.clear_opb_of_single_packet(ctx, target, seq_in_progress + vec_idx)?;
                    }
                }
                if let RetryState::SackBased { sack_vec: v, .. } =
                    &mut self.retry.dest_mut(target).state
                {
                    // Never clear the bit of the packet being retransmitted.
                    *v |= shifted & !1u64;
                }
            }
            RetryState::Idle => {
                let idx = self.opb.find_head_index(target, ack_seq + 1).ok_or(
                    EndpointError::ReplayTargetMissing {
                        cycle: self.now,
                        node: self.node,
                        dest: target,
                        seq: ack_seq + 1,
                    },
                )?;
                debug!(
                    node = self.node,
                    target,
                    ack_seq,
                    sack_vec,
                    "starting sack-based replay"
                );
                self.retry.dest_mut(target).state = RetryState::SackBased {
                    opb_index: idx,
                    seq_in_progress: ack_seq + 1,
                    sack_vec,
                    orig_sack_vec: sack_vec,
                    orig_ack_seq_num: ack_seq,
                };
                self.retry.pending_nack_replays.push_back(target);

                for vec_idx in 1..=max_bit as u64 {
                    if (sack_vec >> vec_idx) & 1 == 1 {
                        self.clear_opb_of_single_packet(ctx, target, ack_seq + vec_idx + 1)?;
                    }
                }
            }
            // A SACK landing during NACK- or timeout-based recovery adds no
            // information: the cumulative part was already applied or pended.
            RetryState::NackBased { .. } | RetryState::TimeoutBased => {}
        }
        Ok(())
    }

    /// Size in flits of the packets a cumulative ACK would retire. During a
    /// NACK replay, ACK application is deferred, so only the NACK-initiated
    /// accounting observes sizes (and then only the last packet's).
    fn calculate_to_be_acked_packet_size(
        &self,
        target: NodeId,
        ack_seq: Option<SeqNum>,
        nack_initiated: bool,
    ) -> usize {
        let Some(seq_acked) = ack_seq else {
            return 0;
        };
        let replay = self.retry.state(target).is_replay();
        if !nack_initiated && replay {
            return 0;
        }
        let reset_per_packet = nack_initiated && replay;

        let buf = self.opb.dest(target);
        let mut accum = 0;
        let mut i = 0;
        while i < buf.len() && buf[i].flit.seq_num <= seq_acked {
            if reset_per_packet {
                accum = 0;
            }
            let entry = &buf[i];
            debug_assert!(entry.flit.head);
            accum += self.acked_packet_contribution(target, entry, seq_acked);
            i += entry.flit.size;
        }
        accum
    }

    fn acked_packet_contribution(
        &self,
        target: NodeId,
        entry: &OpbFlit,
        seq_acked: SeqNum,
    ) -> usize {
        let kind = entry.flit.kind;
        let seq = entry.flit.seq_num;
        let size = entry.flit.size;

        let timeout_blocks = matches!(
            self.retry.timeout_replay_in_progress,
            Some((d, s)) if d == target && seq >= s
        );
        let clearable = (!kind.expects_response() || entry.response_received) && !timeout_blocks;
        if clearable {
            return size;
        }
        if matches!(
            self.retry.timeout_replay_in_progress,
            Some((d, s)) if d == target && seq == s && seq_acked >= seq
        ) {
            return size;
        }
        // Requests still waiting on their response carry no put data.
        if matches!(kind, FlitKind::ReadRequest | FlitKind::RgetGetRequest) {
            return 0;
        }
        if kind == FlitKind::RgetRequest && !entry.ack_received {
            return 0;
        }
        size
    }

    fn to_be_acked_packets_contain_put(&self, target: NodeId, seq_acked: SeqNum) -> bool {
        let buf = self.opb.dest(target);
        let mut i = 0;
        while i < buf.len() && buf[i].flit.seq_num <= seq_acked {
            if is_put_kind(buf[i].flit.kind) {
                return true;
            }
            i += 1;
        }
        false
    }

    /// Retire every packet with `seq <= seq_acked`, honoring replay and
    /// response ordering: an in-progress replay pends the ACK; packets
    /// awaiting responses stay resident but are marked acked.
    fn clear_opb_of_acked_packets(
        &mut self,
        ctx: &mut SimContext,
        target: NodeId,
        seq_acked: SeqNum,
        nack_initiated: bool,
    ) -> Result<(), EndpointError> {
        if seq_acked == 0 {
            return Ok(());
        }

        if !nack_initiated && self.retry.state(target).is_replay() {
            self.retry.pend_ack(target, seq_acked);
            return Ok(());
        }

        let mut i = 0;
        while i < self.opb.dest(target).len()
            && self.opb.dest(target)[i].flit.seq_num <= seq_acked
        {
            i += self.check_and_clear_opb_of_packet_by_index(ctx, target, i, seq_acked)?;
        }

        if self.retry.state(target) == &RetryState::TimeoutBased
            && self.all_packets_in_opb_are_acked(target)
        {
            self.retry.dest_mut(target).state = RetryState::Idle;
            debug!(node = self.node, target, "exited timeout-based recovery");
        }
        Ok(())
    }

    /// Clear one packet if it can retire, else update its ACK state.
    /// Returns how far to advance the scan (0 after removal).
    fn check_and_clear_opb_of_packet_by_index(
        &mut self,
        ctx: &mut SimContext,
        target: NodeId,
        idx: usize,
        seq_acked: SeqNum,
    ) -> Result<usize, EndpointError> {
        let (kind, size, seq, ack_received, response_received) = {
            let e = &self.opb.dest(target)[idx];
            debug_assert!(e.flit.head);
            (
                e.flit.kind,
                e.flit.size,
                e.flit.seq_num,
                e.ack_received,
                e.response_received,
            )
        };

        let timeout_blocks = matches!(
            self.retry.timeout_replay_in_progress,
            Some((d, s)) if d == target && seq >= s
        );
        let clearable = (!kind.expects_response() || response_received) && !timeout_blocks;

        if clearable {
            if matches!(kind, FlitKind::ReadRequest | FlitKind::RgetGetRequest) && !ack_received {
                self.meters.xactions_all_dests -= 1;
                self.meters.outbound_data_all_dests -= size;
            }
            self.clear_opb_of_packet_by_index(ctx, target, idx)?;
            return Ok(0);
        }

        // The packet being timeout-retransmitted must finish first; hold the
        // ACK and stop clearing anything younger.
        if matches!(
            self.retry.timeout_replay_in_progress,
            Some((d, s)) if d == target && seq == s && seq_acked >= seq
        ) {
            self.retry.pend_ack(target, seq_acked);
            return Ok(size);
        }

        if matches!(kind, FlitKind::ReadRequest | FlitKind::RgetGetRequest) {
            if !ack_received {
                self.meters.xactions_all_dests -= 1;
                self.meters.outbound_data_all_dests -= size;
                let expiry = self.now + self.cfg.response_timer_timeout;
                self.retry.arm_response_timer(expiry, target, seq);
                self.mark_packet_acked(target, idx, expiry);
            }
            return Ok(size);
        }
        if kind == FlitKind::RgetRequest && !ack_received {
            let expiry = self.now + self.cfg.rget_req_pull_timeout;
            self.retry.arm_response_timer(expiry, target, seq);
            self.mark_packet_acked(target, idx, expiry);
            return Ok(size);
        }
        Ok(size)
    }

    /// Mark every flit of the packet at `idx` acked, with the response
    /// deadline as the new expiry.
    fn mark_packet_acked(&mut self, target: NodeId, idx: usize, expiry: Cycle) {
        let now = self.now;
        let buf = self.opb.dest_mut(target);
        let mut i = idx;
        while i < buf.len() {
            let entry = &mut buf[i];
            entry.ack_received = true;
            entry.ack_received_time = Some(now);
            entry.expire_time = expiry;
            if entry.flit.tail {
                break;
            }
            i += 1;
        }
    }

    fn all_packets_in_opb_are_acked(&self, target: NodeId) -> bool {
        for entry in self.opb.dest(target) {
            if !entry.flit.head {
                continue;
            }
            // A resident packet that expects no response is by definition
            // unacked; response-waiters report their ACK state directly.
            if !matches!(
                entry.flit.kind,
                FlitKind::ReadRequest | FlitKind::RgetRequest | FlitKind::RgetGetRequest
            ) {
                return false;
            }
            if !entry.ack_received {
                return false;
            }
        }
        true
    }

    /// Retire exactly one packet by sequence number (SACK-selective clear).
    fn clear_opb_of_single_packet(
        &mut self,
        ctx: &mut SimContext,
        target: NodeId,
        seq: SeqNum,
    ) -> Result<(), EndpointError> {
        if seq == 0 {
            return Ok(());
        }
        if let Some(idx) = self
            .opb
            .dest(target)
            .iter()
            .position(|e| e.flit.seq_num == seq)
        {
            self.check_and_clear_opb_of_packet_by_index(ctx, target, idx, seq)?;
        }
        Ok(())
    }

    /// Remove every flit of the packet at `idx` and release its metering.
    fn clear_opb_of_packet_by_index(
        &mut self,
        ctx: &mut SimContext,
        target: NodeId,
        idx: usize,
    ) -> Result<(), EndpointError> {
        let (seq, kind, size, requested) = {
            let e = &self.opb.dest(target)[idx];
            (
                e.flit.seq_num,
                e.flit.kind,
                e.flit.size,
                e.flit.requested_data_size,
            )
        };

        loop {
            let Some(entry) = self.opb.dest(target).get(idx) else {
                return Err(EndpointError::OpbTailNotFound {
                    cycle: self.now,
                    node: self.node,
                    dest: target,
                    seq,
                });
            };
            let tail = entry.flit.tail;
            self.clear_opb_of_flit_by_index(ctx, target, idx);
            if tail {
                break;
            }
        }

        self.meters.on_opb_clear(kind, target, size, requested, &self.cfg);
        self.opb.note_packet_cleared(target, seq);
        Ok(())
    }

    fn clear_opb_of_flit_by_index(&mut self, ctx: &mut SimContext, target: NodeId, idx: usize) {
        let entry = self
            .opb
            .dest_mut(target)
            .remove(idx)
            .expect("index in bounds");

        if entry.flit.head {
            self.stats.packets_retired_full_sim += 1;
            if ctx.phase == SimPhase::Running {
                self.stats.packets_retired += 1;
            }
            if entry.flit.kind.is_data_bearing() {
                let data = entry.flit.size.saturating_sub(2) as u64;
                self.stats.data_flits_retired_full_sim += data;
                if ctx.phase == SimPhase::Running {
                    self.stats.data_flits_retired += data;
                }
            }
        }
        ctx.retire_flit(&entry.flit, self.node);
        self.stats.flits_retired_full_sim += 1;
        if ctx.phase == SimPhase::Running {
            self.stats.flits_retired += 1;
        }

        // Keep an in-progress replay pointed at the same flit.
        self.retry
            .dest_mut(target)
            .state
            .note_entry_removed_below(idx);
    }

    fn mark_response_received_in_opb(
        &mut self,
        ctx: &mut SimContext,
        target: NodeId,
        response_to: SeqNum,
    ) -> Result<(), EndpointError> {
        if self.opb.dest(target).is_empty() {
            return Err(EndpointError::ReplayTargetMissing {
                cycle: self.now,
                node: self.node,
                dest: target,
                seq: response_to,
            });
        }

        let mut i = 0;
        while i < self.opb.dest(target).len() {
            let (kind, seq, size, ack_received, head) = {
                let e = &self.opb.dest(target)[i];
                (
                    e.flit.kind,
                    e.flit.seq_num,
                    e.flit.size,
                    e.ack_received,
                    e.flit.head,
                )
            };
            debug_assert!(head);
            if kind.expects_response() && seq == response_to {
                self.opb.dest_mut(target)[i].response_received = true;
                trace!(node = self.node, target, seq, "response received for request");
                if ack_received {
                    self.clear_opb_of_packet_by_index(ctx, target, i)?;
                }
                break;
            }
            // Skip over the rest of this packet; it may still be mid-insert.
            i += size.min(self.opb.dest(target).len() - i);
        }
        Ok(())
    }

    fn process_pending_inbound_response_queue(
        &mut self,
        ctx: &mut SimContext,
    ) -> Result<(), EndpointError> {
        while self
            .pending_inbound_responses
            .front()
            .map(|r| r.time <= self.now)
            .unwrap_or(false)
        {
            let record = self
                .pending_inbound_responses
                .pop_front()
                .expect("front checked");
            match record.kind {
                FlitKind::ReadReply | FlitKind::RgetGetRequest => {
                    self.mark_response_received_in_opb(ctx, record.source, record.req_seq_num)?;
                }
                kind => {
                    return Err(EndpointError::UnexpectedInboundResponse {
                        cycle: self.now,
                        node: self.node,
                        kind,
                    });
                }
            }
        }
        Ok(())
    }

    fn process_pending_outbound_response_queue(&mut self, ctx: &mut SimContext) {
        while self
            .pending_outbound_responses
            .front()
            .map(|r| r.time <= self.now)
            .unwrap_or(false)
        {
            let r = self
                .pending_outbound_responses
                .pop_front()
                .expect("front checked");
            match r.kind {
                FlitKind::ReadReply => self.generate_packet_flits(
                    ctx,
                    r.source,
                    FlitKind::ReadReply,
                    r.reply_size,
                    r.time,
                    r.record,
                    r.class,
                    Some(r.req_seq_num),
                    r.rget_data_size,
                    QueueTarget::Reply(r.source),
                ),
                FlitKind::RgetGetRequest => self.generate_packet_flits(
                    ctx,
                    r.source,
                    FlitKind::RgetGetRequest,
                    r.reply_size,
                    r.time,
                    r.record,
                    r.class,
                    Some(r.req_seq_num),
                    r.rget_data_size,
                    QueueTarget::RgetGetReq(r.source),
                ),
                FlitKind::RgetGetReply => self.generate_packet_flits(
                    ctx,
                    r.source,
                    FlitKind::RgetGetReply,
                    r.reply_size,
                    r.time,
                    r.record,
                    r.class,
                    Some(r.req_seq_num),
                    0,
                    QueueTarget::Reply(r.source),
                ),
                _ => {}
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════
// 5. Receive-side processing
// ════════════════════════════════════════════════════════════════════════

impl Endpoint {
    /// Pop at most one flit from the incoming queue, run the receive
    /// tracker on it, and return one credit to the fabric.
    pub fn process_received_flits(
        &mut self,
        ctx: &mut SimContext,
        subnet: usize,
    ) -> Result<Option<Credit>, EndpointError> {
        let Some(flit) = self.incoming_flit_queue[subnet].pop_front() else {
            return Ok(None);
        };
        let credit = Credit {
            vc: flit.vc.unwrap_or(0),
        };

        if flit.kind != FlitKind::Ctrl {
            self.incoming.observe(self.node, self.now, &flit)?;

            if flit.tail {
                if ctx.phase == SimPhase::Running && flit.ctime >= ctx.reset_time {
                    self.stats.packet_latency_sum += self.now.saturating_sub(flit.ctime);
                    self.stats.packet_latency_samples += 1;
                }
                let packet_size = self.incoming.packet_size();

                match self.cfg.host_control_policy {
                    HostControlPolicy::MyPolicy => {
                        // Everything flows through the load-balance queue so
                        // parked packets keep their arrival order.
                        self.shift_load_balance_queue_to_put_queue(ctx)?;
                        self.insert_packet_into_lbq_or_put_queue(ctx, &flit, packet_size)?;
                    }
                    HostControlPolicy::Homa => {
                        self.homa_enqueue(&flit, packet_size);
                    }
                    _ => {
                        self.update_ack_and_read_response_state(ctx, &flit, packet_size)?;
                    }
                }
            }
        }

        // The wire copy is consumed here; the initiator's OPB copy survives
        // until the ACK retires it.
        Ok(Some(credit))
    }

    /// The core receive tracker: advance the expected sequence, decide
    /// ACK/NACK/SACK, admit data to the put queue, and queue responses.
    fn update_ack_and_read_response_state(
        &mut self,
        ctx: &mut SimContext,
        flit: &Flit,
        packet_size: usize,
    ) -> Result<(), EndpointError> {
        debug_assert!(self.cfg.host_control_policy != HostControlPolicy::Homa);
        let source = flit.src;
        let seq = flit.seq_num;
        let now = self.now;
        let mypolicy = self.mypolicy();

        self.ack_state[source].time_last_valid_packet_recvd = now;
        let expected = self.ack_state[source].expected_seq();

        if seq == expected {
            if !mypolicy {
                if self.ack_state[source].time_last_valid_unacked_packet_recvd.is_none() {
                    self.ack_state[source].time_last_valid_unacked_packet_recvd = Some(now);
                }

                // Host admission: data with no unreserved space is dropped
                // and NACKed, unless this source holds a reservation.
                if is_put_kind(flit.kind)
                    && packet_size as i64
                        > self.put_buffer.remaining - self.delayed.reserved_space as i64
                {
                    if self.peers[source].space_after_nack_reserved
                        && (packet_size as i64) < self.put_buffer.remaining
                    {
                        self.peers[source].space_after_nack_reserved = false;
                        self.delayed.reserved_space = self
                            .delayed
                            .reserved_space
                            .saturating_sub(self.cfg.mypolicy_nack_reservation_size);
                    } else {
                        debug!(
                            node = self.node,
                            source,
                            seq,
                            occupied = self.put_buffer.occupied(),
                            "dropping put, wait queue full"
                        );
                        self.setup_nack_state(ctx, source, seq, packet_size);
                        return Ok(());
                    }
                } else if self.peers[source].space_after_nack_reserved {
                    // Reservation no longer needed; release it.
                    self.peers[source].space_after_nack_reserved = false;
                    self.delayed.reserved_space = self
                        .delayed
                        .reserved_space
                        .saturating_sub(self.cfg.mypolicy_nack_reservation_size);
                }
            }

            self.ack_state[source].last_valid_seq_num_recvd = seq;

            let delta = note_good_seq(&mut self.peers[source], seq);
            if delta < 0 {
                self.delayed.num_initiator_retransmitting =
                    self.delayed.num_initiator_retransmitting.saturating_sub(1);
            }

            let latest_time_to_ack = (now + self.cfg.retry_timer_timeout)
                .saturating_sub(self.cfg.estimate_round_trip_cycles);
            if mypolicy {
                // Delayed acking: release order is decided as the put queue
                // drains, not at receive time.
                self.delayed.ack_queue.push_back(ToSendAck {
                    kind: flit.kind,
                    seq_num: seq,
                    latest_time_to_ack,
                    size: packet_size,
                    source,
                });
                if is_put_kind(flit.kind) && now > self.delayed.next_fairness_reset_time {
                    self.reset_ack_occupancy();
                }
            } else {
                self.ack_state[source].packets_recvd_since_last_ack += 1;
            }

            // The expected sequence resumed; the drop cluster is over.
            self.ack_state[source].already_nacked_bad_seq_num = false;

            if self.cfg.enable_sack {
                if self.ack_state[source].sack_vec & 1 != 0 {
                    return Err(EndpointError::SackLsbAlreadySet {
                        cycle: now,
                        node: self.node,
                        src: source,
                        seq,
                        sack_vec: self.ack_state[source].sack_vec,
                    });
                }
                let st = &mut self.ack_state[source];
                st.sack_vec >>= 1;
                // Consume the run of already-received packets behind the
                // hole this packet just filled.
                while st.sack_vec & 1 != 0 {
                    st.sack_vec >>= 1;
                    st.last_valid_seq_num_recvd += 1;
                    st.packets_recvd_since_last_ack += 1;
                }
            }

            self.ack_state[source].outstanding_ack_type_to_return = AckKind::Ack;
            self.queue_response(ctx, flit);

            if is_put_kind(flit.kind) {
                self.put_buffer.queue.push_back(PutWaitRecord {
                    packet_id: flit.packet_id,
                    size: packet_size,
                    src: source,
                    seq_num: seq,
                    remaining_process_size: packet_size as f64,
                    flit: None,
                });
                self.put_buffer.remaining -= packet_size as i64;

                if mypolicy {
                    self.mypolicy_note_buffer_entrance(source, packet_size);
                    if self.queue_depth_over_threshold() {
                        let st = &mut self.ack_state[source];
                        st.packets_recvd_since_last_ack += 1;
                        if st.time_last_valid_unacked_packet_recvd.is_none() {
                            st.time_last_valid_unacked_packet_recvd = Some(now);
                        }
                    }
                }
            }
        } else if seq < expected {
            // Duplicate: repeat the cumulative ACK, never NACK.
            self.ack_state[source].outstanding_ack_type_to_return = AckKind::Ack;
            // Re-arm the standalone timer so a retransmission whose ACK was
            // lost gets acknowledged again even with no reverse traffic.
            if self.ack_state[source].time_last_valid_unacked_packet_recvd.is_none() {
                self.ack_state[source].time_last_valid_unacked_packet_recvd = Some(now);
            }
            self.stats.duplicate_packets_received_full_sim += 1;
            self.stats.duplicate_flits_received_full_sim += flit.size as u64;
            if ctx.phase == SimPhase::Running {
                self.stats.duplicate_packets_received += 1;
                self.stats.duplicate_flits_received += flit.size as u64;
            }
        } else {
            // Out of order: track the gap in the SACK vector when it fits,
            // otherwise fall back to a NACK.
            let num_missing = seq - expected;
            if self.cfg.enable_sack
                && num_missing + 1 <= self.cfg.max_receivable_pkts_after_drop
                && num_missing < 64
            {
                self.ack_state[source].sack_vec |= 1u64 << num_missing;
                self.ack_state[source].outstanding_ack_type_to_return = AckKind::Sack;
                trace!(
                    node = self.node,
                    source,
                    seq,
                    sack_vec = self.ack_state[source].sack_vec,
                    "out-of-order receive tracked in sack vector"
                );
                // Respond now; the data is processed once the gap fills.
                self.queue_response(ctx, flit);
            } else {
                self.setup_nack_state(ctx, source, seq, packet_size);
            }

            self.stats.bad_packets_received_full_sim += 1;
            self.stats.bad_flits_received_full_sim += flit.size as u64;
            if ctx.phase == SimPhase::Running {
                self.stats.bad_packets_received += 1;
                self.stats.bad_flits_received += flit.size as u64;
            }
        }
        Ok(())
    }

    /// A packet was dropped or arrived out of sequence: emit one NACK per
    /// drop cluster and keep the retransmitting-initiator bookkeeping.
    fn setup_nack_state(
        &mut self,
        ctx: &SimContext,
        source: NodeId,
        seq: SeqNum,
        packet_size: usize,
    ) {
        if ctx.phase == SimPhase::Running {
            self.stats.packet_dropped += packet_size as u64;
        }
        self.stats.packet_dropped_full += packet_size as u64;

        let first_nack = !self.ack_state[source].already_nacked_bad_seq_num
            || seq == self.ack_state[source].last_valid_seq_num_recvd + 1;
        if first_nack {
            self.ack_state[source].outstanding_ack_type_to_return = AckKind::Nack;
            self.ack_state[source].already_nacked_bad_seq_num = true;
            // Arm the standalone timer: with no reverse traffic to piggyback
            // on, the NACK must still leave within the standalone window.
            if self.ack_state[source]
                .time_last_valid_unacked_packet_recvd
                .is_none()
            {
                self.ack_state[source].time_last_valid_unacked_packet_recvd = Some(self.now);
            }
        } else if self.mypolicy()
            && self.delayed.speculative_ack_queue.len() < self.cfg.speculative_ack_queue_size
        {
            // Later drops in the cluster: ack speculatively once the replay
            // is known to be coming.
            let latest = (self.now + self.cfg.retry_timer_timeout)
                .saturating_sub(self.cfg.estimate_round_trip_cycles);
            self.delayed.speculative_ack_queue.push_back(ToSendAck {
                kind: FlitKind::WriteRequest,
                seq_num: seq,
                latest_time_to_ack: latest,
                size: packet_size,
                source,
            });
        }

        let delta = note_bad_seq(&mut self.peers[source], seq);
        if delta > 0 {
            self.delayed.num_initiator_retransmitting += 1;
        }
    }

    /// Queue the protocol response a received packet calls for, and count
    /// the good receive.
    fn queue_response(&mut self, ctx: &mut SimContext, flit: &Flit) {
        self.stats.good_packets_received_full_sim += 1;
        self.stats.good_flits_received_full_sim += flit.size as u64;
        if ctx.phase == SimPhase::Running {
            self.stats.good_packets_received += 1;
            self.stats.good_flits_received += flit.size as u64;
            if matches!(flit.kind, FlitKind::WriteRequest | FlitKind::RgetGetReply) {
                self.stats.good_packets_write_received += 1;
            }
        }
        if flit.kind.is_data_bearing() {
            let data = flit.size.saturating_sub(2) as u64;
            self.stats.good_data_flits_received_full_sim += data;
            if ctx.phase == SimPhase::Running {
                self.stats.good_data_flits_received += data;
            }
        }

        match flit.kind {
            FlitKind::ReadRequest => {
                self.pending_outbound_responses.push_back(PendingResponse {
                    source: flit.src,
                    kind: FlitKind::ReadReply,
                    reply_size: flit.requested_data_size,
                    time: self.now + self.cfg.req_processing_latency,
                    record: flit.record,
                    class: 0,
                    req_seq_num: flit.seq_num,
                    rget_data_size: 0,
                    payload: None,
                });
            }
            FlitKind::ReadReply => {
                self.pending_inbound_responses.push_back(PendingResponse {
                    source: flit.src,
                    kind: FlitKind::ReadReply,
                    reply_size: flit.size,
                    time: self.now + self.cfg.rsp_processing_latency,
                    record: flit.record,
                    class: 0,
                    req_seq_num: flit.response_to_seq_num.unwrap_or(0),
                    rget_data_size: 0,
                    payload: None,
                });
            }
            FlitKind::RgetRequest => {
                // Pull: answer the push request with our own get-request.
                self.pending_outbound_responses.push_back(PendingResponse {
                    source: flit.src,
                    kind: FlitKind::RgetGetRequest,
                    reply_size: ctx.read_request_size,
                    time: self.now + self.cfg.rget_processing_latency,
                    record: flit.record,
                    class: 0,
                    req_seq_num: flit.seq_num,
                    rget_data_size: flit.requested_data_size,
                    payload: None,
                });
            }
            FlitKind::RgetGetRequest => {
                // Inbound side: this answers our RGET_REQUEST.
                self.pending_inbound_responses.push_back(PendingResponse {
                    source: flit.src,
                    kind: FlitKind::RgetGetRequest,
                    reply_size: ctx.read_request_size,
                    time: self.now + self.cfg.rsp_processing_latency,
                    record: flit.record,
                    class: 0,
                    req_seq_num: flit.response_to_seq_num.unwrap_or(0),
                    rget_data_size: flit.requested_data_size,
                    payload: None,
                });
                // And generate the data transfer being pulled.
                self.pending_outbound_responses.push_back(PendingResponse {
                    source: flit.src,
                    kind: FlitKind::RgetGetReply,
                    reply_size: flit.requested_data_size,
                    time: self.now + self.cfg.req_processing_latency,
                    record: flit.record,
                    class: 0,
                    req_seq_num: flit.seq_num,
                    rget_data_size: 0,
                    payload: None,
                });
            }
            _ => {}
        }
    }
}

// ════════════════════════════════════════════════════════════════════════
// Put wait queue, load-balance queue, delayed acknowledgements
// ════════════════════════════════════════════════════════════════════════

impl Endpoint {
    fn queue_depth_over_threshold(&self) -> bool {
        self.put_buffer.occupied() + self.delayed.reserved_space as i64
            > self.cfg.mypolicy_delayed_ack_threshold as i64
    }

    fn mypolicy_note_buffer_entrance(&mut self, source: NodeId, size: usize) {
        if self.now > self.delayed.next_fairness_reset_time {
            self.reset_buffer_occupancy();
        }
        self.peers[source].periodic_buffer_occupancy += size;
        self.delayed.periodic_total_occupancy += size;
        self.delayed.total_packet_occupy += 1;
    }

    fn reset_buffer_occupancy(&mut self) {
        for peer in &mut self.peers {
            peer.periodic_buffer_occupancy = 0;
        }
        self.delayed.periodic_total_occupancy = 0;
        self.delayed.total_packet_occupy = 0;
        self.delayed.next_fairness_request_time =
            self.now + self.cfg.host_control_fairness_sampling_period;
        self.delayed.next_fairness_reset_time =
            self.now + self.cfg.host_control_fairness_reset_period;
    }

    fn reset_ack_occupancy(&mut self) {
        for peer in &mut self.peers {
            peer.periodic_ack_occupancy = 0;
        }
        self.delayed.next_fairness_reset_time =
            self.now + self.cfg.host_control_fairness_reset_period;
    }

    fn mypolicy_note_ack_occupancy(&mut self, source: NodeId, size: usize) {
        if self.now > self.delayed.next_fairness_reset_time {
            self.reset_ack_occupancy();
        }
        self.peers[source].periodic_ack_occupancy += size;
    }

    /// Reserve space for the first packet from an initiator we just NACKed.
    fn target_reserve_put_space(&mut self, initiator: NodeId) {
        if !self.peers[initiator].space_after_nack_reserved {
            self.peers[initiator].space_after_nack_reserved = true;
            self.delayed.reserved_space += self.cfg.mypolicy_nack_reservation_size;
            debug!(
                node = self.node,
                initiator,
                reserved = self.delayed.reserved_space,
                "reserved put space after nack"
            );
        }
    }

    /// Park or admit one received packet under the load-balancing policy.
    /// When even the LBQ overflows, the source with the least drops loses
    /// all its parked packets (preferring sources already NACKed).
    fn insert_packet_into_lbq_or_put_queue(
        &mut self,
        ctx: &mut SimContext,
        flit: &Flit,
        packet_size: usize,
    ) -> Result<(), EndpointError> {
        let no_space = packet_size as i64
            > self.put_buffer.remaining - self.delayed.reserved_space as i64;
        if !no_space && self.put_buffer.lbq.is_empty() {
            return self.update_ack_and_read_response_state(ctx, flit, packet_size);
        }

        if packet_size as i64 <= self.put_buffer.lbq_remaining {
            self.put_buffer.lbq.push_back(LbqRecord {
                flit: flit.clone(),
                size: packet_size,
            });
            self.put_buffer.lbq_remaining -= packet_size as i64;
            return Ok(());
        }

        // LBQ full: pick a victim stream.
        let mut victim: Option<NodeId> = None;
        if !self.ack_state[flit.src].already_nacked_bad_seq_num {
            let mut lowest: Option<(u32, NodeId)> = None;
            for rec in &self.put_buffer.lbq {
                let s = rec.flit.src;
                if self.ack_state[s].already_nacked_bad_seq_num {
                    lowest = Some((0, s));
                    break;
                }
                let drops = self.peers[s].put_drop_counter;
                match lowest {
                    None => lowest = Some((drops, s)),
                    Some((best, bs)) if bs != s && best > drops => lowest = Some((drops, s)),
                    _ => {}
                }
            }
            victim = lowest.map(|(_, s)| s);
        }

        let victim = match victim {
            Some(v) => v,
            None => {
                if self.peers[flit.src].space_after_nack_reserved {
                    // The newcomer holds a reservation: admit it directly.
                    return self.update_ack_and_read_response_state(ctx, flit, packet_size);
                }
                flit.src
            }
        };

        // Drop every parked packet of the victim stream.
        let drained: Vec<LbqRecord> = self.put_buffer.lbq.drain(..).collect();
        let mut dropped = 0u64;
        for rec in drained {
            if rec.flit.src == victim {
                if !self.ack_state[victim].already_nacked_bad_seq_num {
                    self.peers[victim].put_drop_counter += 1;
                }
                self.put_buffer.lbq_remaining += rec.size as i64;
                dropped += rec.size as u64;
                self.force_drop_packet(ctx, &rec.flit, rec.size);
            } else {
                self.put_buffer.lbq.push_back(rec);
            }
        }
        if dropped > 0 {
            debug!(node = self.node, victim, dropped, "load-balance queue fair-share drop");
        }

        if packet_size as i64 > self.put_buffer.lbq_remaining || flit.src == victim {
            if !self.ack_state[flit.src].already_nacked_bad_seq_num {
                self.peers[flit.src].put_drop_counter += 1;
            }
            self.force_drop_packet(ctx, flit, packet_size);
        } else {
            self.put_buffer.lbq.push_back(LbqRecord {
                flit: flit.clone(),
                size: packet_size,
            });
            self.put_buffer.lbq_remaining -= packet_size as i64;
        }
        Ok(())
    }

    /// Drop a packet at admission time: count it bad and set up its NACK.
    fn force_drop_packet(&mut self, ctx: &SimContext, flit: &Flit, packet_size: usize) {
        self.stats.bad_packets_received_full_sim += 1;
        self.stats.bad_flits_received_full_sim += packet_size as u64;
        if ctx.phase == SimPhase::Running {
            self.stats.bad_packets_received += 1;
            self.stats.bad_flits_received += packet_size as u64;
        }
        self.setup_nack_state(ctx, flit.src, flit.seq_num, packet_size);
    }

    /// Move parked packets into the put queue: reservation holders jump the
    /// queue, the rest follow in FIFO order while space lasts.
    fn shift_load_balance_queue_to_put_queue(
        &mut self,
        ctx: &mut SimContext,
    ) -> Result<(), EndpointError> {
        debug_assert!(self.mypolicy());
        if self.put_buffer.lbq_remaining == self.put_buffer.lbq_size as i64 {
            return Ok(());
        }

        let drained: Vec<LbqRecord> = self.put_buffer.lbq.drain(..).collect();
        for rec in drained {
            if self.peers[rec.flit.src].space_after_nack_reserved {
                self.put_buffer.lbq_remaining += rec.size as i64;
                self.update_ack_and_read_response_state(ctx, &rec.flit, rec.size)?;
            } else {
                self.put_buffer.lbq.push_back(rec);
            }
        }

        while let Some(front) = self.put_buffer.lbq.front() {
            if front.size as i64
                > self.put_buffer.remaining - self.delayed.reserved_space as i64
            {
                break;
            }
            let rec = self.put_buffer.lbq.pop_front().expect("front checked");
            self.put_buffer.lbq_remaining += rec.size as i64;
            self.update_ack_and_read_response_state(ctx, &rec.flit, rec.size)?;
        }
        Ok(())
    }

    /// Apply this cycle's host bandwidth against the put queue head(s).
    fn process_put_queue(&mut self, ctx: &mut SimContext) -> Result<(), EndpointError> {
        let mut budget = self.bandwidth.current;
        while budget > 0.0 {
            let Some(mut record) = self.put_buffer.queue.pop_front() else {
                break;
            };
            let used = record.remaining_process_size.min(budget);
            budget -= used;
            record.remaining_process_size -= used;
            if record.remaining_process_size > 0.0 {
                self.put_buffer.queue.push_front(record);
                break;
            }
            if self.cfg.host_control_policy == HostControlPolicy::Homa {
                self.homa_ack_queue_record(ctx, record)?;
            } else {
                self.update_dequeued_state(ctx, record)?;
            }
        }
        Ok(())
    }

    fn update_dequeued_state(
        &mut self,
        ctx: &mut SimContext,
        record: PutWaitRecord,
    ) -> Result<(), EndpointError> {
        debug_assert!(record.remaining_process_size <= 0.0);
        if self.delayed.acked_data_in_queue >= record.size {
            // Already acked while queued; just release the space.
            self.delayed.acked_data_in_queue -= record.size;
        } else {
            self.delayed.data_dequeued_but_need_acked += record.size;
        }
        self.put_buffer.remaining += record.size as i64;
        if self.mypolicy() {
            self.shift_load_balance_queue_to_put_queue(ctx)?;
        }
        self.stats.packets_dequeued += 1;
        if self.now > self.delayed.next_fairness_reset_time {
            self.reset_buffer_occupancy();
        }
        trace!(
            node = self.node,
            src = record.src,
            size = record.size,
            depth = self.put_buffer.occupied(),
            "dequeued from put wait queue"
        );
        Ok(())
    }

    /// Drain the delayed-ack queue toward the outstanding-ACK state,
    /// interleaving speculative promotions to under-served sources.
    fn process_delayed_ack_if_needed(&mut self) {
        loop {
            let Some(r) = self.delayed.ack_queue.front().cloned() else {
                return;
            };
            let occupied = self.put_buffer.occupied();
            let threshold = self.cfg.mypolicy_delayed_ack_threshold as i64;

            let timer_fired = self.now >= r.latest_time_to_ack;
            let acked_below_threshold = occupied > threshold
                && (self.delayed.acked_data_in_queue as i64) < threshold;
            let below_threshold = occupied < threshold;
            let dequeued_needs_ack = self.delayed.data_dequeued_but_need_acked > 0;
            let is_data = is_put_kind(r.kind);

            if !(timer_fired
                || !is_data
                || acked_below_threshold
                || below_threshold
                || dequeued_needs_ack)
            {
                return;
            }

            if is_data {
                if dequeued_needs_ack {
                    self.delayed.data_dequeued_but_need_acked = self
                        .delayed
                        .data_dequeued_but_need_acked
                        .saturating_sub(r.size);
                } else {
                    self.delayed.acked_data_in_queue += r.size;
                }
            }
            self.delayed.ack_queue.pop_front();

            if r.seq_num < self.ack_state[r.source].last_valid_seq_num_recvd_and_ackd {
                debug_assert!(false, "delayed ack released out of order");
                continue;
            }

            // Look for an under-served stream to hand this accumulation to.
            let mut give: Option<(NodeId, usize)> = None;
            while let Some(front) = self.delayed.speculative_ack_queue.front() {
                let other = front.source;
                if other != r.source && self.peers[other].speculative_ack_allowance_size == 0 {
                    if self.peers[r.source].periodic_ack_occupancy
                        > self.peers[other].periodic_ack_occupancy
                    {
                        give = Some((other, front.size));
                        break;
                    }
                    self.delayed.speculative_ack_queue.pop_front();
                } else {
                    self.delayed.speculative_ack_queue.pop_front();
                }
            }

            self.ack_state[r.source].last_valid_seq_num_recvd_and_ready_to_ack = r.seq_num;
            if self.ack_state[r.source].packets_recvd_since_last_ack == 0 {
                self.ack_state[r.source].last_valid_seq_num_recvd_and_ackd = r.seq_num;
                if let Some((other, other_size)) = give {
                    self.delayed.speculative_ack_queue.pop_front();
                    self.peers[other].speculative_ack_allowance_size += other_size;
                    if self.peers[r.source].earliest_accum_ack_shared_time.is_none() {
                        self.peers[r.source].earliest_accum_ack_shared_time = Some(self.now);
                    }
                } else {
                    self.mypolicy_note_ack_occupancy(r.source, r.size);
                    self.peers[r.source].earliest_accum_ack_shared_time = None;
                    let st = &mut self.ack_state[r.source];
                    st.packets_recvd_since_last_ack += 1;
                    if st.time_last_valid_unacked_packet_recvd.is_none() {
                        st.time_last_valid_unacked_packet_recvd = Some(self.now);
                    }
                }
            } else {
                self.mypolicy_note_ack_occupancy(r.source, r.size);
                self.peers[r.source].earliest_accum_ack_shared_time = None;
                let st = &mut self.ack_state[r.source];
                st.packets_recvd_since_last_ack += 1;
                if st.time_last_valid_unacked_packet_recvd.is_none() {
                    st.time_last_valid_unacked_packet_recvd = Some(self.now);
                }
            }
        }
    }

    // ─── Homa-like policy ───────────────────────────────────────────────

    /// Homa admission: data packets drop silently on overflow; the ACK
    /// decision waits until the packet finishes host processing.
    fn homa_enqueue(&mut self, flit: &Flit, packet_size: usize) {
        if !is_put_kind(flit.kind) {
            return;
        }
        if packet_size as i64
            > self.put_buffer.remaining - self.delayed.reserved_space as i64
        {
            debug!(
                node = self.node,
                src = flit.src,
                seq = flit.seq_num,
                "homa: dropping put, wait queue full"
            );
            return;
        }
        self.put_buffer.queue.push_back(PutWaitRecord {
            packet_id: flit.packet_id,
            size: packet_size,
            src: flit.src,
            seq_num: flit.seq_num,
            remaining_process_size: packet_size as f64,
            flit: Some(flit.clone()),
        });
        self.put_buffer.remaining -= packet_size as i64;
    }

    fn homa_ack_queue_record(
        &mut self,
        ctx: &mut SimContext,
        record: PutWaitRecord,
    ) -> Result<(), EndpointError> {
        let flit = record.flit.clone().expect("homa keeps the flit");
        let source = record.src;
        let seq = flit.seq_num;
        let expected = self.ack_state[source].expected_seq();

        if seq == expected {
            let st = &mut self.ack_state[source];
            if st.time_last_valid_unacked_packet_recvd.is_none() {
                st.time_last_valid_unacked_packet_recvd = Some(self.now);
            }
            st.last_valid_seq_num_recvd = seq;
            st.packets_recvd_since_last_ack += 1;
            st.already_nacked_bad_seq_num = false;
            st.outstanding_ack_type_to_return = AckKind::Ack;
            let delta = note_good_seq(&mut self.peers[source], seq);
            if delta < 0 {
                self.delayed.num_initiator_retransmitting =
                    self.delayed.num_initiator_retransmitting.saturating_sub(1);
            }
            self.queue_response(ctx, &flit);
        } else if seq < expected {
            self.ack_state[source].outstanding_ack_type_to_return = AckKind::Ack;
            self.stats.duplicate_packets_received_full_sim += 1;
            self.stats.duplicate_flits_received_full_sim += record.size as u64;
            if ctx.phase == SimPhase::Running {
                self.stats.duplicate_packets_received += 1;
                self.stats.duplicate_flits_received += record.size as u64;
            }
        } else {
            self.setup_nack_state(ctx, source, seq, record.size);
            self.stats.bad_packets_received_full_sim += 1;
            self.stats.bad_flits_received_full_sim += record.size as u64;
            if ctx.phase == SimPhase::Running {
                self.stats.bad_packets_received += 1;
                self.stats.bad_flits_received += record.size as u64;
            }
        }

        self.put_buffer.remaining += record.size as i64;
        Ok(())
    }

    // ─── ECN window ─────────────────────────────────────────────────────

    /// Stamp the congestion-experienced bit on an outgoing acknowledgement
    /// when the put queue is past the marking threshold.
    fn stamp_ecn(&self, flit: &mut Flit) {
        if self.cfg.host_control_policy == HostControlPolicy::Ecn
            && self.put_buffer.occupied() + self.delayed.reserved_space as i64
                > self.cfg.ecn_threshold() as i64
        {
            flit.ecn_congestion_detected = true;
        }
    }

    /// Fold the per-period ECN mark fraction into each peer's running
    /// percentage and scale the windows.
    fn sender_process_ecn(&mut self) {
        if self.cfg.host_control_policy != HostControlPolicy::Ecn || self.now <= self.ecn_next_check
        {
            return;
        }
        for peer in &mut self.peers {
            peer.ecn_running_percent *= 1.0 - self.cfg.ecn_param_g;
        }
        self.ecn_next_check = self.now + self.cfg.ecn_period;
        for peer in &mut self.peers {
            peer.ecn_apply_sample(&self.cfg);
            peer.ecn_total = 0;
            peer.ecn_count = 0;
        }
    }
}

// ════════════════════════════════════════════════════════════════════════
// Acknowledgement emission
// ════════════════════════════════════════════════════════════════════════

impl Endpoint {
    /// Decorate an outgoing head flit with the ACK/NACK/SACK state owed to
    /// its destination.
    fn insert_piggybacked_acks(&mut self, flit: &mut Flit) {
        if !flit.head {
            return;
        }
        let Some(dest) = flit.dest else {
            return;
        };
        let mypolicy = self.mypolicy();
        let now = self.now;

        match self.ack_state[dest].outstanding_ack_type_to_return {
            AckKind::Ack => {
                if mypolicy {
                    let ack = self.ack_state[dest].last_valid_seq_num_recvd_and_ackd;
                    flit.ack.ack_seq_num = Some(ack);
                    // The duplicate-ACK congestion encoding: nack == ack.
                    flit.ack.nack_seq_num = if self.queue_depth_over_threshold() {
                        Some(ack)
                    } else {
                        None
                    };
                    let st = &mut self.ack_state[dest];
                    if st.last_valid_seq_num_recvd_and_ready_to_ack
                        > st.last_valid_seq_num_recvd_and_ackd
                    {
                        st.last_valid_seq_num_recvd_and_ackd += 1;
                    } else {
                        st.packets_recvd_since_last_ack = 0;
                    }
                } else {
                    flit.ack.ack_seq_num = Some(self.ack_state[dest].last_valid_seq_num_recvd);
                    flit.ack.nack_seq_num = None;
                    self.ack_state[dest].packets_recvd_since_last_ack = 0;
                }
                self.stamp_ecn(flit);
                flit.ack.sack = false;
                // ACKs repeat freely; the state stays Ack.
                self.ack_state[dest].time_last_valid_unacked_packet_recvd = None;
                self.ack_state[dest].time_last_ack_sent = now;
            }
            AckKind::Nack => {
                if self.cfg.host_control_policy == HostControlPolicy::Homa {
                    // Homa carries no piggybacked NACK information.
                    flit.ack.nack_seq_num = None;
                } else {
                    flit.ack.nack_seq_num =
                        Some(self.ack_state[dest].last_valid_seq_num_recvd);
                    if mypolicy {
                        self.target_reserve_put_space(dest);
                    }
                }
                flit.ack.ack_seq_num = None;
                flit.ack.sack = false;
                // Only one NACK per drop cluster; flip back to Ack.
                self.ack_state[dest].outstanding_ack_type_to_return = AckKind::Ack;
                self.ack_state[dest].time_last_valid_unacked_packet_recvd = None;
                self.ack_state[dest].packets_recvd_since_last_ack = 0;
                self.stats.nacks_sent += 1;
            }
            AckKind::Sack => {
                let masked = self.ack_state[dest].sack_vec & self.cfg.sack_vec_mask();
                flit.ack.sack = true;
                flit.ack.sack_vec = masked;
                flit.ack.ack_seq_num = Some(self.ack_state[dest].last_valid_seq_num_recvd);
                flit.ack.nack_seq_num = None;
                self.ack_state[dest].outstanding_ack_type_to_return = AckKind::Ack;
                self.ack_state[dest].time_last_valid_unacked_packet_recvd = None;
                self.ack_state[dest].packets_recvd_since_last_ack = 0;
                self.stats.sacks_sent += 1;
                debug!(node = self.node, dest, sack_vec = masked, "piggybacked sack");
            }
        }
    }

    /// An acknowledgement that has waited long enough pre-empts new head
    /// packets so a standalone ACK wins arbitration this cycle.
    fn has_priority_standalone_ack(&self) -> bool {
        if !self.mypolicy() {
            return false;
        }
        let priority_window = self.cfg.cycles_before_standalone_ack * 2;
        self.ack_state.iter().any(|st| {
            st.time_last_valid_unacked_packet_recvd
                .map(|t| t + priority_window <= self.now)
                .unwrap_or(false)
        })
    }

    /// With no data packet to carry the ACK in time, build a dedicated
    /// single-flit control packet. Standalone ACKs never enter the OPB.
    fn manufacture_standalone_ack(&mut self, ctx: &mut SimContext) -> Option<Flit> {
        let mut chosen: Option<NodeId> = None;
        for initiator in 0..self.nodes {
            let st = &self.ack_state[initiator];
            let waited_out = st
                .time_last_valid_unacked_packet_recvd
                .map(|t| t + self.cfg.cycles_before_standalone_ack <= self.now)
                .unwrap_or(false);
            let packet_count = st.packets_recvd_since_last_ack
                >= self.cfg.packets_before_standalone_ack;
            let speculative_grant = self.peers[initiator].speculative_ack_allowance_size != 0;
            let shared_timeout = self.peers[initiator]
                .earliest_accum_ack_shared_time
                .map(|t| t + self.cfg.shared_ack_timeout < self.now)
                .unwrap_or(false);

            if waited_out || packet_count || speculative_grant || shared_timeout {
                if self.mypolicy()
                    && st.outstanding_ack_type_to_return == AckKind::Ack
                    && !waited_out
                    && !packet_count
                    && speculative_grant
                {
                    // A redirected allowance is being spent; fold it into
                    // this stream's fairness accounting.
                    let size = self.peers[initiator].speculative_ack_allowance_size;
                    self.mypolicy_note_ack_occupancy(initiator, size);
                    self.peers[initiator].speculative_ack_allowance_size = 0;
                }
                self.peers[initiator].earliest_accum_ack_shared_time = None;
                chosen = Some(initiator);
                break;
            }
        }

        let initiator = chosen?;
        let mut ack_flit = Flit::standalone_ctrl(self.node, initiator);
        ack_flit.ctime = self.now;

        match self.ack_state[initiator].outstanding_ack_type_to_return {
            AckKind::Ack => {
                let ack = if self.mypolicy() {
                    self.ack_state[initiator].last_valid_seq_num_recvd_and_ackd
                } else {
                    self.ack_state[initiator].last_valid_seq_num_recvd
                };
                ack_flit.ack.ack_seq_num = Some(ack);
                self.stamp_ecn(&mut ack_flit);
                ack_flit.ack.nack_seq_num = if self.queue_depth_over_threshold() {
                    Some(ack)
                } else {
                    None
                };
            }
            AckKind::Nack => {
                if self.cfg.host_control_policy != HostControlPolicy::Homa {
                    ack_flit.ack.nack_seq_num =
                        Some(self.ack_state[initiator].last_valid_seq_num_recvd);
                }
                self.stats.nacks_sent += 1;
                if self.mypolicy() {
                    self.target_reserve_put_space(initiator);
                }
            }
            AckKind::Sack => {
                ack_flit.ack.ack_seq_num =
                    Some(self.ack_state[initiator].last_valid_seq_num_recvd);
                ack_flit.ack.sack = true;
                ack_flit.ack.sack_vec =
                    self.ack_state[initiator].sack_vec & self.cfg.sack_vec_mask();
                self.stats.sacks_sent += 1;
                debug!(
                    node = self.node,
                    initiator,
                    sack_vec = ack_flit.ack.sack_vec,
                    "standalone sack"
                );
            }
        }

        if self.mypolicy() {
            let st = &mut self.ack_state[initiator];
            if st.last_valid_seq_num_recvd_and_ready_to_ack > st.last_valid_seq_num_recvd_and_ackd
            {
                st.last_valid_seq_num_recvd_and_ackd += 1;
            } else {
                st.packets_recvd_since_last_ack = 0;
            }
        } else {
            self.ack_state[initiator].packets_recvd_since_last_ack = 0;
        }

        self.ack_state[initiator].outstanding_ack_type_to_return = AckKind::Ack;
        self.ack_state[initiator].time_last_valid_unacked_packet_recvd = None;
        self.ack_state[initiator].time_last_ack_sent = self.now;
        ctx.standalone_acks_transmitted += 1;
        self.stats.standalone_acks_sent += 1;

        trace!(
            node = self.node,
            dest = initiator,
            ack = ?ack_flit.ack.ack_seq_num,
            nack = ?ack_flit.ack.nack_seq_num,
            "manufactured standalone ack"
        );
        Some(ack_flit)
    }
}

// ════════════════════════════════════════════════════════════════════════
// Drain checks, end-of-run reporting, accessors
// ════════════════════════════════════════════════════════════════════════

impl Endpoint {
    pub fn injection_buffers_empty(&self, class: usize) -> bool {
        self.injection_buffer[class].iter().all(|q| q.is_empty())
    }

    pub fn pending_replies_drained(&self) -> bool {
        self.replies_pending.iter().all(|q| q.is_empty())
    }

    pub fn pending_rget_get_request_queues_drained(&self) -> bool {
        self.rget_get_req_queues.iter().all(|q| q.is_empty())
    }

    fn injection_buffers_not_empty_but_all_blocked_on_timeout(&self, class: usize) -> bool {
        if self.injection_buffers_empty(class) {
            return false;
        }
        self.injection_buffer[class].iter().enumerate().all(|(dest, q)| {
            q.is_empty() || self.retry.state(dest) == &RetryState::TimeoutBased
        })
    }

    pub fn injection_queue_drained(&self, class: usize) -> bool {
        self.qdrained[class]
    }

    pub fn endpoint_processing_finished(&self) -> bool {
        self.put_buffer.queue.is_empty()
    }

    pub fn opb_drained(&self) -> bool {
        self.opb.drained()
    }

    /// Whether any peer is still owed an acknowledgement.
    pub fn acks_to_return(&self) -> bool {
        self.ack_state
            .iter()
            .any(|st| st.time_last_valid_unacked_packet_recvd.is_some())
    }

    /// End-of-run consistency checks; every entry is a failure.
    pub fn end_of_run_report(&self) -> Vec<String> {
        let mut failures = Vec::new();
        for (initiator, st) in self.ack_state.iter().enumerate() {
            if let Some(t) = st.time_last_valid_unacked_packet_recvd {
                failures.push(format!(
                    "still waiting to ack initiator {initiator} (last unacked packet at cycle {t})"
                ));
            }
        }
        if !self.incoming.quiesced() {
            failures.push("incoming packet processing not quiesced".to_string());
        }
        if !self.opb_drained() {
            failures.push("OPB not drained".to_string());
        }
        for class in 0..self.classes {
            if !self.injection_buffers_empty(class) {
                failures.push(format!("class {class} injection buffers not drained"));
            }
        }
        if !self.pending_replies_drained() {
            failures.push("pending reply queues not drained".to_string());
        }
        if !self.pending_rget_get_request_queues_drained() {
            failures.push("rget get-request queues not drained".to_string());
        }
        if !self.meters.all_zero() {
            failures.push("outstanding transaction meters nonzero".to_string());
        }
        if !self.put_buffer.queue.is_empty() {
            failures.push(format!(
                "put wait queue still holds {} packets",
                self.put_buffer.queue.len()
            ));
        }
        if self.delayed.acked_data_in_queue != 0 || self.delayed.data_dequeued_but_need_acked != 0
        {
            failures.push(format!(
                "acked-in-queue {} / dequeued-but-unacked {} nonzero",
                self.delayed.acked_data_in_queue, self.delayed.data_dequeued_but_need_acked
            ));
        }
        if self.put_buffer.remaining != self.put_buffer.queue_size as i64 {
            failures.push(format!(
                "put queue remaining {} != size {}",
                self.put_buffer.remaining, self.put_buffer.queue_size
            ));
        }
        failures
    }

    pub fn clear_stats(&mut self) {
        self.stats.clear_steady_state();
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.cfg
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    pub fn meters(&self) -> &OutstandingMeters {
        &self.meters
    }

    pub fn retry_state(&self, dest: NodeId) -> &RetryState {
        self.retry.state(dest)
    }

    pub fn ack_response(&self, src: NodeId) -> &AckResponseState {
        &self.ack_state[src]
    }

    pub fn peer(&self, dest: NodeId) -> &PeerCongestionState {
        &self.peers[dest]
    }

    pub fn opb_len(&self, dest: NodeId) -> usize {
        self.opb.dest(dest).len()
    }

    pub fn next_seq_num(&self, dest: NodeId) -> SeqNum {
        self.packet_seq_num[dest]
    }

    pub fn put_queue_depth(&self) -> usize {
        self.put_buffer.queue.len()
    }
}
