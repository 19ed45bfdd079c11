//! # Lockstep simulation driver
//!
//! One simulated cycle is one complete pass over every endpoint in fixed
//! order: receive flit, receive credit, evaluate new-packet injection, step
//! (emit at most one flit into the fabric), process received flits (return
//! one credit). Single-threaded; all state is observed atomically between
//! cycles.

use anyhow::{bail, Context};
use serde::Deserialize;

use lattice_endpoint::{Endpoint, EndpointConfig, SimContext, TrafficModel};

use crate::fabric::{Fabric, FabricConfig};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub endpoint: EndpointConfig,
    pub fabric: FabricConfig,
}

pub struct Simulation {
    pub ctx: SimContext,
    pub endpoints: Vec<Endpoint>,
    pub fabric: Fabric,
    pub traffic: Box<dyn TrafficModel>,
    subnets: usize,
}

impl Simulation {
    pub fn new(cfg: SimConfig, traffic: Box<dyn TrafficModel>) -> anyhow::Result<Self> {
        let nodes = cfg.endpoint.nodes;
        let subnets = cfg.endpoint.subnets;
        let endpoints = (0..nodes)
            .map(|n| Endpoint::new(n, cfg.endpoint.clone()))
            .collect::<Result<Vec<_>, _>>()
            .context("endpoint configuration rejected")?;
        let mut ctx = SimContext::new(cfg.endpoint.classes);
        ctx.write_request_size = 8;
        Ok(Simulation {
            ctx,
            endpoints,
            fabric: Fabric::new(nodes, &cfg.fabric),
            traffic,
            subnets,
        })
    }

    /// Advance one cycle across all endpoints, in the fixed §4.1 ordering.
    pub fn cycle(&mut self) -> anyhow::Result<()> {
        self.ctx.time += 1;
        let now = self.ctx.time;
        for node in 0..self.endpoints.len() {
            let ep = &mut self.endpoints[node];
            ep.update_time(now);

            for subnet in 0..self.subnets {
                if let Some(flit) = self.fabric.read_flit(now, node) {
                    ep.receive_flit(&self.ctx, subnet, flit)
                        .with_context(|| format!("node {node} receive"))?;
                }
                if let Some(credit) = self.fabric.read_credit(now, node) {
                    ep.receive_credit(subnet, credit);
                }
            }

            ep.evaluate_new_packet_injection(&mut self.ctx, self.traffic.as_mut());

            for subnet in 0..self.subnets {
                if let Some(flit) = ep
                    .step(&mut self.ctx, subnet)
                    .with_context(|| format!("node {node} step"))?
                {
                    self.fabric.write_flit(now, node, flit);
                }
            }

            for subnet in 0..self.subnets {
                if let Some(credit) = ep
                    .process_received_flits(&mut self.ctx, subnet)
                    .with_context(|| format!("node {node} process received"))?
                {
                    self.fabric.write_credit(now, node, credit);
                }
            }
        }
        Ok(())
    }

    pub fn run(&mut self, cycles: u64) -> anyhow::Result<()> {
        for _ in 0..cycles {
            self.cycle()?;
        }
        Ok(())
    }

    /// Whether every queue, buffer, and in-flight map has emptied.
    pub fn quiet(&self) -> bool {
        self.ctx.all_in_flight_empty()
            && self.fabric.is_empty()
            && self.endpoints.iter().all(|ep| {
                ep.opb_drained()
                    && ep.pending_replies_drained()
                    && ep.pending_rget_get_request_queues_drained()
                    && ep.endpoint_processing_finished()
                    && (0..ep.config().classes).all(|c| ep.injection_buffers_empty(c))
            })
    }

    /// Run until the system quiesces, up to `max_cycles`.
    /// Returns the cycle count at quiescence.
    pub fn run_until_quiet(&mut self, max_cycles: u64) -> anyhow::Result<u64> {
        let start = self.ctx.time;
        while self.ctx.time - start < max_cycles {
            self.cycle()?;
            if self.quiet() {
                return Ok(self.ctx.time);
            }
        }
        bail!(
            "simulation did not quiesce within {max_cycles} cycles (in-flight: {})",
            self.ctx.in_flight_flits(0)
        )
    }

    /// Assert the end-of-run invariants on every endpoint.
    pub fn assert_end_of_run_clean(&self) {
        for ep in &self.endpoints {
            let report = ep.end_of_run_report();
            assert!(
                report.is_empty(),
                "node {} end-of-run failures: {report:?}",
                ep.node_id()
            );
        }
    }
}

/// Install the test-friendly tracing subscriber once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_config_deserializes_from_json() {
        let cfg: SimConfig = serde_json::from_str(
            r#"{"endpoint": {"nodes": 4, "enable_sack": true}, "fabric": {"latency": 9}}"#,
        )
        .unwrap();
        assert_eq!(cfg.endpoint.nodes, 4);
        assert!(cfg.endpoint.enable_sack);
        assert_eq!(cfg.fabric.latency, 9);
        assert_eq!(cfg.fabric.credit_latency, 2, "unset fields keep defaults");
    }
}
