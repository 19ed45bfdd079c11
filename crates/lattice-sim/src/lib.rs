//! # lattice-sim
//!
//! Deterministic lockstep harness for lattice endpoints: a fixed-latency
//! fabric model with programmable packet drops, seedable traffic models,
//! and the per-cycle driver loop. The reliability scenarios live in this
//! crate's integration tests.

pub mod fabric;
pub mod sim;
pub mod traffic;

pub use fabric::{DropRule, Fabric, FabricConfig};
pub use sim::{init_tracing, SimConfig, Simulation};
pub use traffic::{BernoulliTraffic, DestPattern, ScriptedTraffic};
