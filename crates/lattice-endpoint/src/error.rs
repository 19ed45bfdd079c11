//! # Error taxonomy
//!
//! Fatal protocol errors abort the simulation: the per-cycle endpoint entry
//! points return `Result` and the harness terminates the run on the first
//! `Err`, after logging the cycle, node, and offending state. Everything the
//! protocol can recover from locally (duplicates, full buffers, exhausted
//! scheduler tokens) is expressed in normal control flow, not here.

use thiserror::Error;

use crate::flit::FlitKind;
use crate::{Cycle, NodeId, SeqNum};

/// Fatal protocol errors. Any of these ends the simulation.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("cycle {cycle} node {node}: packet seq {seq} to dest {dest} exceeded {max} transmit attempts ({attempts})")]
    RetryAttemptsExceeded {
        cycle: Cycle,
        node: NodeId,
        dest: NodeId,
        seq: SeqNum,
        attempts: u32,
        max: u32,
    },

    #[error("cycle {cycle} node {node}: {kind:?} seq {seq} to dest {dest} was acked at {acked_at} but expired waiting for its protocol response")]
    ResponseTimerExpired {
        cycle: Cycle,
        node: NodeId,
        dest: NodeId,
        seq: SeqNum,
        kind: FlitKind,
        acked_at: Cycle,
    },

    #[error("cycle {cycle} node {node}: replay index {index} beyond OPB length {opb_len} for dest {dest}")]
    ReplayIndexOutOfRange {
        cycle: Cycle,
        node: NodeId,
        dest: NodeId,
        index: usize,
        opb_len: usize,
    },

    #[error("cycle {cycle} node {node}: no OPB head with seq {seq} for dest {dest} while setting up a replay")]
    ReplayTargetMissing {
        cycle: Cycle,
        node: NodeId,
        dest: NodeId,
        seq: SeqNum,
    },

    #[error("cycle {cycle} node {node}: merged SACK from dest {dest} would clear previously acked bits (old 0x{old_vec:x}, shifted new 0x{new_vec:x})")]
    SackMergeClearsAckedBit {
        cycle: Cycle,
        node: NodeId,
        dest: NodeId,
        old_vec: u64,
        new_vec: u64,
    },

    #[error("cycle {cycle} node {node}: received the oldest missing packet seq {seq} from {src} but the receive sack vector LSB was already set (0x{sack_vec:x})")]
    SackLsbAlreadySet {
        cycle: Cycle,
        node: NodeId,
        src: NodeId,
        seq: SeqNum,
        sack_vec: u64,
    },

    #[error("cycle {cycle} node {node}: OPB bucket {bucket:#x} holds {count} residents, more than {ways} ways")]
    OpbWayOverflow {
        cycle: Cycle,
        node: NodeId,
        bucket: u64,
        count: u32,
        ways: u32,
    },

    #[error("cycle {cycle} node {node}: received flit {flit_id} intended for dest {dest}")]
    WrongDestination {
        cycle: Cycle,
        node: NodeId,
        flit_id: u64,
        dest: NodeId,
    },

    #[error("cycle {cycle} node {node}: non-head flit {flit_id} mismatches the head of its packet ({field}: got {got}, expected {expected})")]
    InterleavedFlit {
        cycle: Cycle,
        node: NodeId,
        flit_id: u64,
        field: &'static str,
        got: u64,
        expected: u64,
    },

    #[error("cycle {cycle} node {node}: tail of packet {packet_id} arrived with {missing} flits still outstanding")]
    MissingFlits {
        cycle: Cycle,
        node: NodeId,
        packet_id: u64,
        missing: usize,
    },

    #[error("cycle {cycle} node {node}: received flit with ack {ack} and nack {nack} both set")]
    AckNackBothSet {
        cycle: Cycle,
        node: NodeId,
        ack: SeqNum,
        nack: SeqNum,
    },

    #[error("cycle {cycle} node {node}: removing packet seq {seq} for dest {dest} from the OPB found no tail flit")]
    OpbTailNotFound {
        cycle: Cycle,
        node: NodeId,
        dest: NodeId,
        seq: SeqNum,
    },

    #[error("cycle {cycle} node {node}: packet seq {seq} for dest {dest} vanished from the OPB mid-retransmission")]
    RetryPacketVanished {
        cycle: Cycle,
        node: NodeId,
        dest: NodeId,
        seq: SeqNum,
    },

    #[error("cycle {cycle} node {node}: unexpected {kind:?} on the inbound response queue")]
    UnexpectedInboundResponse {
        cycle: Cycle,
        node: NodeId,
        kind: FlitKind,
    },
}

/// Configuration errors. Rejected at endpoint construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("sack_vec_length is {0}, but the wire format carries at most 64 bits")]
    SackVecTooLong(u32),

    #[error("rget_convert_num_samples is {0}; the conversion decision only supports a window of 2")]
    RgetSampleWindow(u32),

    #[error("load_balance_buf_size ({lbq}) must be smaller than put_wait_buf_size ({put}) under the load-balancing policy")]
    LoadBalanceExceedsPutBuffer { lbq: usize, put: usize },
}
