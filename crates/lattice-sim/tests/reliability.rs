//! # End-to-end reliability scenarios
//!
//! Two endpoints joined by the fabric model, exercising the full vertical
//! stack: generation → arbitration → OPB → fabric → receive tracking →
//! ACK/NACK/SACK → retirement. Losses are injected with fabric drop rules.

use lattice_endpoint::retry::RetryState;
use lattice_endpoint::{EndpointConfig, FlitKind, HostControlPolicy};
use lattice_sim::{init_tracing, DropRule, ScriptedTraffic, SimConfig, Simulation};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn base_endpoint_cfg() -> EndpointConfig {
    EndpointConfig {
        nodes: 2,
        retry_timer_timeout: 5000,
        cycles_before_standalone_ack: 20,
        ..Default::default()
    }
}

fn two_node_sim(endpoint: EndpointConfig, writes: usize) -> Simulation {
    init_tracing();
    let cfg = SimConfig {
        endpoint,
        ..Default::default()
    };
    Simulation::new(cfg, Box::new(ScriptedTraffic::new(0, writes, 1))).unwrap()
}

// ─── Scenario: single write round trip ──────────────────────────────────────

#[test]
fn single_write_round_trip() {
    let mut sim = two_node_sim(base_endpoint_cfg(), 1);
    let quiet_at = sim.run_until_quiet(2000).unwrap();

    let tx = &sim.endpoints[0];
    let rx = &sim.endpoints[1];
    assert_eq!(rx.stats().good_packets_received_full_sim, 1);
    assert_eq!(rx.stats().good_flits_received_full_sim, 8);
    assert!(tx.opb_drained());
    assert!(tx.meters().all_zero());
    assert_eq!(tx.stats().packets_retired_full_sim, 1);
    assert_eq!(tx.stats().flits_retired_full_sim, 8);
    assert_eq!(tx.stats().packets_retransmitted_full_sim, 0);
    sim.assert_end_of_run_clean();

    // Injection + delivery + standalone-ack window + ack return + slack.
    assert!(
        quiet_at <= 100,
        "round trip should complete promptly, took {quiet_at} cycles"
    );
}

// ─── Scenario: drop + NACK + replay ─────────────────────────────────────────

#[test]
fn drop_nack_replay() {
    let mut sim = two_node_sim(base_endpoint_cfg(), 2);
    // The fabric eats the first transmission of seq 1; seq 2 sails through
    // and arrives out of order.
    sim.fabric.add_drop_rule(DropRule {
        src: 0,
        dest: 1,
        seq: Some(1),
        kind: None,
    });

    sim.run_until_quiet(5000).unwrap();

    let tx = &sim.endpoints[0];
    let rx = &sim.endpoints[1];
    assert_eq!(rx.stats().nacks_sent, 1, "one nack per drop cluster");
    assert_eq!(tx.stats().nacks_received, 1);
    assert_eq!(rx.stats().bad_packets_received_full_sim, 1);
    // The replay resends everything resident from the nacked gap onward.
    assert_eq!(tx.stats().packets_retransmitted_full_sim, 2);
    assert_eq!(tx.stats().retry_timeouts, 0, "feedback beat the timer");
    assert!(tx.opb_drained());
    assert_eq!(tx.retry_state(1), &RetryState::Idle);
    assert!(tx.meters().all_zero());
    assert_eq!(rx.ack_response(0).last_valid_seq_num_recvd, 2);
    sim.assert_end_of_run_clean();
}

// ─── Scenario: SACK cluster ─────────────────────────────────────────────────

#[test]
fn sack_cluster_retransmits_only_the_gaps() {
    let endpoint = EndpointConfig {
        enable_sack: true,
        sack_vec_length: 8,
        // Let the whole burst land before the standalone window fires, so a
        // single SACK describes both gaps.
        cycles_before_standalone_ack: 80,
        packets_before_standalone_ack: 100,
        ..base_endpoint_cfg()
    };
    let mut sim = two_node_sim(endpoint, 8);
    sim.ctx.write_request_size = 4;
    for seq in [2u64, 5] {
        sim.fabric.add_drop_rule(DropRule {
            src: 0,
            dest: 1,
            seq: Some(seq),
            kind: None,
        });
    }

    sim.run_until_quiet(10_000).unwrap();

    let tx = &sim.endpoints[0];
    let rx = &sim.endpoints[1];
    assert!(rx.stats().sacks_sent >= 1);
    assert!(tx.stats().sacks_received >= 1);
    // Only the two gap packets replay; sacked packets retire in place.
    assert_eq!(tx.stats().packets_retransmitted_full_sim, 2);
    assert_eq!(tx.stats().retry_timeouts, 0);
    assert!(tx.opb_drained());
    assert!(tx.meters().all_zero());
    assert_eq!(rx.ack_response(0).last_valid_seq_num_recvd, 8);
    assert_eq!(rx.ack_response(0).sack_vec, 0, "vector fully consumed");
    assert_eq!(rx.stats().good_packets_received_full_sim, 8);
    sim.assert_end_of_run_clean();
}

// ─── Scenario: adaptive put→rget conversion ─────────────────────────────────

#[test]
fn adaptive_rget_converts_backlogged_puts() {
    let endpoint = EndpointConfig {
        enable_adaptive_rget: true,
        rget_convert_sample_period: 50,
        rget_convert_min_data_before_convert: 8,
        rget_min_samples_since_last_transition: 2,
        rget_convert_unacked_perc: 0.7,
        rget_revert_acked_perc: 0.9,
        // Starve the writer of acks so outstanding data piles up.
        cycles_before_standalone_ack: 400,
        packets_before_standalone_ack: 1000,
        retry_timer_timeout: 6000,
        ..base_endpoint_cfg()
    };
    let mut sim = two_node_sim(endpoint, 30);

    sim.run_until_quiet(30_000).unwrap();

    let tx = &sim.endpoints[0];
    let rx = &sim.endpoints[1];
    assert!(
        tx.stats().puts_converted_to_rgets >= 1,
        "lagging acks should flip the conversion flag"
    );
    assert!(tx.stats().flits_dropped_for_rget_conversion >= 1);
    // The pull path completed: the target issued get-requests and the
    // initiator answered with get-replies.
    assert!(rx.stats().good_packets_received_full_sim >= 30);
    assert!(tx.opb_drained() && rx.opb_drained());
    assert!(tx.meters().all_zero() && rx.meters().all_zero());
    sim.assert_end_of_run_clean();
}

// ─── Scenario: read request / reply ─────────────────────────────────────────

#[test]
fn read_request_reply_round_trip() {
    let mut sim = two_node_sim(base_endpoint_cfg(), 3);
    sim.ctx.write_fraction = 0.0; // every generation is a READ_REQUEST

    sim.run_until_quiet(5000).unwrap();

    let tx = &sim.endpoints[0];
    let rx = &sim.endpoints[1];
    assert_eq!(rx.stats().good_packets_received_full_sim, 3);
    // Each read produced one 8-flit reply back to the requester.
    assert_eq!(tx.stats().good_packets_received_full_sim, 3);
    assert_eq!(tx.stats().good_data_flits_received_full_sim, 3 * 6);
    assert!(tx.opb_drained() && rx.opb_drained());
    assert!(tx.meters().all_zero() && rx.meters().all_zero());
    assert_eq!(tx.stats().retry_timeouts, 0);
    sim.assert_end_of_run_clean();
}

// ─── Scenario: lost ACK + timeout retry ─────────────────────────────────────

#[test]
fn timeout_retry_after_lost_ack() {
    let endpoint = EndpointConfig {
        retry_timer_timeout: 100,
        ..base_endpoint_cfg()
    };
    let mut sim = two_node_sim(endpoint, 1);
    // The receiver's standalone ACK is lost; the retry timer must recover.
    sim.fabric.add_drop_rule(DropRule {
        src: 1,
        dest: 0,
        seq: None,
        kind: Some(FlitKind::Ctrl),
    });

    sim.run_until_quiet(5000).unwrap();

    let tx = &sim.endpoints[0];
    let rx = &sim.endpoints[1];
    assert_eq!(tx.stats().retry_timeouts, 1);
    assert_eq!(tx.stats().packets_retransmitted_full_sim, 1);
    assert_eq!(
        rx.stats().duplicate_packets_received_full_sim,
        1,
        "the retransmission arrives as a duplicate and is re-acked"
    );
    assert_eq!(rx.stats().nacks_sent, 0, "duplicates are never nacked");
    assert!(tx.opb_drained());
    assert_eq!(tx.retry_state(1), &RetryState::Idle);
    assert!(tx.meters().all_zero());
    sim.assert_end_of_run_clean();
}

// ─── Scenario: host-control policy smoke ────────────────────────────────────

#[test]
fn mypolicy_traffic_drains_cleanly() {
    let endpoint = EndpointConfig {
        host_control_policy: HostControlPolicy::MyPolicy,
        cycles_before_standalone_ack: 30,
        ..base_endpoint_cfg()
    };
    let mut sim = two_node_sim(endpoint, 10);

    sim.run_until_quiet(20_000).unwrap();

    let tx = &sim.endpoints[0];
    let rx = &sim.endpoints[1];
    assert_eq!(rx.stats().good_packets_received_full_sim, 10);
    assert!(tx.opb_drained());
    assert!(tx.meters().all_zero());
    assert!(!tx.peer(1).halt_active, "no congestion, no halt");
    assert_eq!(rx.ack_response(0).last_valid_seq_num_recvd_and_ackd, 10);
    sim.assert_end_of_run_clean();
}

#[test]
fn homa_policy_drains_cleanly() {
    let endpoint = EndpointConfig {
        host_control_policy: HostControlPolicy::Homa,
        cycles_before_standalone_ack: 30,
        // The Homa retry timeout is 3x the RTT estimate; keep it short.
        estimate_round_trip_cycles: 600,
        ..base_endpoint_cfg()
    };
    let mut sim = two_node_sim(endpoint, 5);

    sim.run_until_quiet(20_000).unwrap();

    let tx = &sim.endpoints[0];
    let rx = &sim.endpoints[1];
    assert_eq!(rx.stats().good_packets_received_full_sim, 5);
    assert!(tx.opb_drained());
    assert!(tx.meters().all_zero());
    sim.assert_end_of_run_clean();
}
