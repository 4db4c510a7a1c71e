//! Pre-defined topologies and end-to-end scenario runs
//!
//! Includes the two-router enterprise network used throughout the tests,
//! a larger campus with parallel links and a BGP edge, and a seeded chaos
//! run that injects random faults and measures every recovery.

use chrono::{DateTime, Utc};
use netsim_core::{ConfigurationError, DeviceRole, FaultTarget, GraphBuilder, NetsimError, TopologyGraph};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::coordinator::{Coordinator, RecoveryReport, ShutdownReport};
use crate::fault::FaultOutcome;
use crate::harness::Day2Report;
use crate::sequencer::BringUpReport;
use crate::transport::BusStats;

/// Names accepted by [`by_name`]
pub const SCENARIOS: &[&str] = &["enterprise", "campus", "isolated"];

/// Two routers, one switch, two hosts
///
/// ```text
///   H1 ── SW1 ── R1 ════ R2 ── H2
///  .10.10      .10.1  .12/30  .20.1   .20.10
/// ```
pub fn enterprise() -> Result<TopologyGraph, ConfigurationError> {
    enterprise_builder().build()
}

fn enterprise_builder() -> GraphBuilder {
    GraphBuilder::new()
        .device("R1", DeviceRole::Router, |d| {
            d.hostname("core-r1")
                .interface("g0/0", "10.0.12.1/30")
                .interface("g0/1", "192.168.10.1/24")
                .ospf(0)
        })
        .device("R2", DeviceRole::Router, |d| {
            d.hostname("core-r2")
                .interface("g0/0", "10.0.12.2/30")
                .interface("g0/1", "192.168.20.1/24")
                .ospf(0)
        })
        .device("SW1", DeviceRole::Switch, |d| {
            d.hostname("access-sw1").port("fa0/1").port("fa0/2")
        })
        .device("H1", DeviceRole::Host, |d| {
            d.hostname("ws-h1")
                .interface("eth0", "192.168.10.10/24")
                .gateway("192.168.10.1")
        })
        .device("H2", DeviceRole::Host, |d| {
            d.hostname("ws-h2")
                .interface("eth0", "192.168.20.10/24")
                .gateway("192.168.20.1")
        })
        .link("R1-R2", ("R1", "g0/0"), ("R2", "g0/0"))
        .link("R1-SW1", ("R1", "g0/1"), ("SW1", "fa0/1"))
        .link("SW1-H1", ("SW1", "fa0/2"), ("H1", "eth0"))
        .link("R2-H2", ("R2", "g0/1"), ("H2", "eth0"))
}

/// The enterprise network plus a host whose interface is not cabled
pub fn with_isolated_host() -> Result<TopologyGraph, ConfigurationError> {
    enterprise_builder()
        .device("H3", DeviceRole::Host, |d| {
            d.hostname("ws-h3")
                .interface("eth0", "192.168.30.10/24")
                .gateway("192.168.30.1")
        })
        .warning("H3", "eth0 is not connected to any link")
        .build()
}

/// Three OSPF routers with a doubled R1-R2 trunk, and an eBGP edge from
/// R3 to a provider router
pub fn campus() -> Result<TopologyGraph, ConfigurationError> {
    GraphBuilder::new()
        .device("R1", DeviceRole::Router, |d| {
            d.hostname("dist-r1")
                .interface("g0/0", "10.0.12.1/30")
                .interface("g0/1", "10.0.21.1/30")
                .interface("g0/2", "192.168.10.1/24")
                .ospf(0)
        })
        .device("R2", DeviceRole::Router, |d| {
            d.hostname("core-r2")
                .interface("g0/0", "10.0.12.2/30")
                .interface("g0/1", "10.0.21.2/30")
                .interface("g0/2", "10.0.23.1/30")
                .ospf(0)
        })
        .device("R3", DeviceRole::Router, |d| {
            d.hostname("edge-r3")
                .interface("g0/0", "10.0.23.2/30")
                .interface("g0/1", "192.168.30.1/24")
                .interface("g0/2", "203.0.113.1/30")
                .ospf(0)
                .bgp(65001, &["203.0.113.2"])
        })
        .device("ISP1", DeviceRole::Router, |d| {
            d.hostname("provider-pe1")
                .interface("g0/0", "203.0.113.2/30")
                .interface("g0/1", "198.51.100.1/24")
                .bgp(65100, &["203.0.113.1"])
        })
        .device("SW1", DeviceRole::Switch, |d| {
            d.hostname("access-sw1").port("fa0/1").port("fa0/2").port("fa0/3")
        })
        .device("H1", DeviceRole::Host, |d| {
            d.hostname("ws-h1")
                .interface("eth0", "192.168.10.10/24")
                .gateway("192.168.10.1")
        })
        .device("H2", DeviceRole::Host, |d| {
            d.hostname("ws-h2")
                .interface("eth0", "192.168.10.11/24")
                .gateway("192.168.10.1")
        })
        .device("H3", DeviceRole::Host, |d| {
            d.hostname("ws-h3")
                .interface("eth0", "192.168.30.10/24")
                .gateway("192.168.30.1")
        })
        .device("SRV1", DeviceRole::Host, |d| {
            d.hostname("web-srv1")
                .interface("eth0", "198.51.100.10/24")
                .gateway("198.51.100.1")
        })
        .link("R1-R2a", ("R1", "g0/0"), ("R2", "g0/0"))
        .link("R1-R2b", ("R1", "g0/1"), ("R2", "g0/1"))
        .link("R2-R3", ("R2", "g0/2"), ("R3", "g0/0"))
        .link("R3-ISP1", ("R3", "g0/2"), ("ISP1", "g0/0"))
        .link("R1-SW1", ("R1", "g0/2"), ("SW1", "fa0/1"))
        .link("SW1-H1", ("SW1", "fa0/2"), ("H1", "eth0"))
        .link("SW1-H2", ("SW1", "fa0/3"), ("H2", "eth0"))
        .link("R3-H3", ("R3", "g0/1"), ("H3", "eth0"))
        .link("ISP1-SRV1", ("ISP1", "g0/1"), ("SRV1", "eth0"))
        .build()
}

/// Look up a built-in topology
pub fn by_name(name: &str) -> Result<TopologyGraph, ConfigurationError> {
    match name {
        "enterprise" => enterprise(),
        "campus" => campus(),
        "isolated" => with_isolated_host(),
        other => Err(ConfigurationError::Parse(format!(
            "unknown scenario '{}' (expected one of: {})",
            other,
            SCENARIOS.join(", ")
        ))),
    }
}

/// Everything a scenario run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub day1: BringUpReport,
    /// Day-2 before any fault
    pub baseline: Day2Report,
    pub faults: Vec<FaultRun>,
    pub shutdown: ShutdownReport,
    pub bus: BusStats,
    pub events: usize,
}

impl ScenarioReport {
    /// Bring-up completed, the baseline passed and every recovery
    /// re-converged
    pub fn is_healthy(&self) -> bool {
        self.day1.is_complete()
            && self.baseline.failed == 0
            && self.faults.iter().all(|f| f.recovery.reconverged)
    }
}

/// One inject/test/recover cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRun {
    pub target: FaultTarget,
    pub injected: FaultOutcome,
    /// Day-2 while the fault was active
    pub during: Day2Report,
    pub recovery: RecoveryReport,
}

/// Bring up `graph`, run the baseline Day-2, then cycle each fault in turn
pub async fn run_scenario(
    name: &str,
    graph: TopologyGraph,
    config: EngineConfig,
    faults: &[FaultTarget],
) -> Result<ScenarioReport, NetsimError> {
    let coordinator = Coordinator::new(config)?.with_name(name);
    let run_id = coordinator.initialize(graph)?;
    info!(scenario = name, %run_id, "=== Running scenario ===");

    let day1 = coordinator.start_day1().await?;
    let baseline = coordinator.run_day2().await?;
    info!(summary = %baseline.summary(), "Baseline Day-2");

    let mut runs = Vec::with_capacity(faults.len());
    for target in faults {
        runs.push(fault_cycle(&coordinator, target.clone(), 0).await?);
    }

    let status = coordinator.status()?;
    let shutdown = coordinator.stop().await?;
    Ok(ScenarioReport {
        scenario: name.to_string(),
        run_id,
        generated_at: Utc::now(),
        day1,
        baseline,
        faults: runs,
        shutdown,
        bus: status.bus,
        events: status.events,
    })
}

async fn fault_cycle(coordinator: &Coordinator, target: FaultTarget, hold_ticks: u64) -> Result<FaultRun, NetsimError> {
    let injected = coordinator.inject_fault(target.clone()).await?;
    if hold_ticks > 0 {
        coordinator.wait_ticks(hold_ticks).await?;
    }
    let during = coordinator.run_day2().await?;
    let recovery = coordinator.recover(target.clone()).await?;
    if !recovery.reconverged {
        warn!(%target, not_operational = ?recovery.not_operational, "Recovery did not re-converge");
    }
    Ok(FaultRun {
        target,
        injected,
        during,
        recovery,
    })
}

/// The enterprise network with one fault on the inter-router link
pub async fn run_demo(config: EngineConfig) -> Result<ScenarioReport, NetsimError> {
    let target = FaultTarget::Link("R1-R2".parse()?);
    run_scenario("enterprise", enterprise()?, config, &[target]).await
}

/// Outcome of a chaos run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosReport {
    pub seed: u64,
    pub generated_at: DateTime<Utc>,
    pub day1: BringUpReport,
    pub rounds: Vec<FaultRun>,
    /// Day-2 after the last recovery
    pub final_day2: Day2Report,
    pub shutdown: ShutdownReport,
}

impl ChaosReport {
    pub fn mean_recovery_ticks(&self) -> Option<f64> {
        let measured: Vec<u64> = self
            .rounds
            .iter()
            .filter_map(|r| r.recovery.recovery_ticks)
            .collect();
        if measured.is_empty() {
            return None;
        }
        Some(measured.iter().sum::<u64>() as f64 / measured.len() as f64)
    }
}

/// Random link and router faults on the campus network, reproducible
/// from `seed`
pub async fn run_chaos(config: EngineConfig, seed: u64, rounds: usize) -> Result<ChaosReport, NetsimError> {
    let graph = campus()?;
    let links: Vec<_> = graph.links.iter().map(|l| l.id.clone()).collect();
    let routers: Vec<_> = graph.devices_with_role(DeviceRole::Router).cloned().collect();

    let coordinator = Coordinator::new(config)?.with_name("chaos");
    coordinator.initialize(graph)?;
    info!(seed, rounds, "=== Running chaos scenario ===");
    let day1 = coordinator.start_day1().await?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut runs = Vec::with_capacity(rounds);
    for round in 0..rounds {
        let target = if rng.random_bool(0.25) && !routers.is_empty() {
            FaultTarget::Device(routers[rng.random_range(0..routers.len())].clone())
        } else {
            FaultTarget::Link(links[rng.random_range(0..links.len())].clone())
        };
        let hold = rng.random_range(1..=10);
        info!(round, %target, hold, "Chaos round");
        runs.push(fault_cycle(&coordinator, target, hold).await?);
    }

    let final_day2 = coordinator.run_day2().await?;
    let shutdown = coordinator.stop().await?;
    Ok(ChaosReport {
        seed,
        generated_at: Utc::now(),
        day1,
        rounds: runs,
        final_day2,
        shutdown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsim_core::DeviceId;

    #[test]
    fn test_enterprise_layout() {
        let graph = enterprise().unwrap();
        assert_eq!(graph.devices.len(), 5);
        assert_eq!(graph.links.len(), 4);
        assert_eq!(graph.devices_with_role(DeviceRole::Router).count(), 2);

        let r1 = DeviceId::new("R1").unwrap();
        let r2 = DeviceId::new("R2").unwrap();
        assert_eq!(graph.link_between(&r1, &r2).unwrap().id.as_str(), "R1-R2");
    }

    #[test]
    fn test_isolated_host_has_no_link() {
        let graph = with_isolated_host().unwrap();
        let h3 = DeviceId::new("H3").unwrap();
        assert!(graph.device(&h3).is_some());
        assert_eq!(graph.links_of(&h3).count(), 0);
        assert_eq!(graph.warnings.len(), 1);
    }

    #[test]
    fn test_campus_has_parallel_trunk() {
        let graph = campus().unwrap();
        let r1 = DeviceId::new("R1").unwrap();
        let r2 = DeviceId::new("R2").unwrap();
        let trunk = graph
            .links_of(&r1)
            .filter(|l| l.peer_of(&r1).is_some_and(|p| p.device == r2))
            .count();
        assert_eq!(trunk, 2);
    }

    #[test]
    fn test_by_name() {
        for name in SCENARIOS {
            assert!(by_name(name).is_ok(), "{} should build", name);
        }
        assert!(matches!(by_name("datacenter"), Err(ConfigurationError::Parse(_))));
    }
}
