//! # Enterprise network simulation
//!
//! A concurrent simulation of a small enterprise network. Every router,
//! switch and host runs as its own tokio task and talks to its neighbours
//! only through typed messages on per-link channels.
//!
//! ## Overview
//!
//! - **Day-1**: devices are started in parallel, resolve their neighbours'
//!   addresses, form OSPF/BGP adjacencies and converge their routing
//!   tables. A partially converged device never blocks the others.
//! - **Faults**: links can be cut and devices powered off at any time;
//!   the affected ends are notified within one tick and re-converge when
//!   the fault is recovered. Injection and recovery are idempotent.
//! - **Day-2**: a fixed catalog of tests (configuration, lifecycle,
//!   adjacency, reachability, MTU, load balancing, post-fault
//!   reachability) evaluated against stable snapshots.
//! - **Pause/resume**: a single gate freezes the logical clock and every
//!   actor at a well-defined point.
//!
//! ## Architecture
//!
//! - **Clock** (`clock.rs`): logical ticks and the pause gate
//! - **Transport** (`transport.rs`): per-link FIFO delivery with latency
//! - **Actors** (`actor.rs`): the device lifecycle, ARP, adjacencies and
//!   distance-vector routing
//! - **Sequencer** (`sequencer.rs`): the Day-1 barrier
//! - **Faults** (`fault.rs`): the single writer of link status
//! - **Harness** (`harness.rs`): Day-2 test catalog
//! - **Coordinator** (`coordinator.rs`): the caller-facing control surface
//! - **Control** (`control.rs`): JSON-lines TCP front end
//! - **Scenarios** (`scenarios.rs`): built-in topologies and runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use netsim_simulation::*;
//!
//! let coordinator = Coordinator::new(EngineConfig::default())?;
//! coordinator.initialize(scenarios::enterprise()?)?;
//!
//! let day1 = coordinator.start_day1().await?;
//! assert!(day1.is_complete());
//!
//! let link = FaultTarget::Link("R1-R2".parse()?);
//! coordinator.inject_fault(link.clone()).await?;
//! let recovery = coordinator.recover(link).await?;
//! println!("recovered in {:?} ticks", recovery.recovery_ticks);
//!
//! let day2 = coordinator.run_day2().await?;
//! println!("{}", day2.summary());
//! coordinator.stop().await?;
//! ```

pub mod actor;
pub mod clock;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod events;
pub mod fault;
pub mod harness;
pub mod scenarios;
pub mod sequencer;
pub mod topology;
pub mod transport;

pub use actor::{DeviceActor, DeviceHandle};
pub use clock::Clock;
pub use config::EngineConfig;
pub use control::{ControlRequest, ControlResponse, ControlServer};
pub use coordinator::{Coordinator, RecoveryReport, ShutdownReport, SimulationStatus};
pub use events::EventLog;
pub use fault::{ActiveFault, FaultHandle, FaultOutcome};
pub use harness::{
    Day2Report, FailureReason, Harness, LiveSource, SnapshotSource, TestCase, TestCategory,
    TestOutcome, TopologyView,
};
pub use scenarios::{ChaosReport, FaultRun, ScenarioReport};
pub use sequencer::{BringUpReport, DeviceBringUp, Sequencer};
pub use transport::{BusStats, MessageBus};

// Re-export the core model for callers building their own graphs
pub use netsim_core::{
    ControlError, DeviceId, DeviceRole, DeviceSnapshot, FaultTarget, GraphBuilder, LifecycleState,
    LinkId, NetsimError, NetsimResult, SimulationEvent, TopologyGraph,
};
