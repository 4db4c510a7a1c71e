//! Simulation coordinator
//!
//! Owns a running simulation and exposes the caller-facing operations:
//! `initialize`, `start_day1`, `pause`, `resume`, `inject_fault`,
//! `recover`, `run_day2` and `stop`. Every operation can be called from
//! any task; all of them talk to the actors through channels.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use netsim_core::{
    ActorId, ConfigurationError, ControlError, DeviceId, DeviceSnapshot, EventKind, FaultTarget,
    LifecycleState, LinkSnapshot, NetsimError, SimulationEvent, TopologyGraph,
};
use netsim_logging::run_span;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, info, warn};
use uuid::Uuid;

use crate::actor::{ActorContext, DeviceActor, DeviceHandle};
use crate::clock::{self, Clock};
use crate::config::EngineConfig;
use crate::events::EventLog;
use crate::fault::{ActiveFault, FaultHandle, FaultInjector, FaultOutcome};
use crate::harness::{Day2Report, Harness, LiveSource, TopologyView};
use crate::sequencer::{BringUpReport, Sequencer};
use crate::transport::{BusStats, MessageBus};

/// Outcome of `recover`, with the measured recovery duration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub target: FaultTarget,
    pub outcome: FaultOutcome,
    /// Devices whose links or power the recovery restored
    pub touched: Vec<DeviceId>,
    /// Ticks from injection until every touched device was operational
    pub recovery_ticks: Option<u64>,
    pub reconverged: bool,
    pub not_operational: Vec<DeviceId>,
}

/// Outcome of `stop`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub final_tick: u64,
    pub discarded_messages: usize,
    /// Actors aborted after the grace period
    pub aborted: Vec<DeviceId>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.aborted.is_empty()
    }
}

/// Point-in-time summary of a running simulation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationStatus {
    pub run_id: Uuid,
    pub tick: u64,
    pub paused: bool,
    pub day1_complete: bool,
    pub devices: BTreeMap<DeviceId, LifecycleState>,
    pub operational: usize,
    pub faulted: usize,
    pub bus: BusStats,
    pub events: usize,
}

struct Runtime {
    run_id: Uuid,
    span: Span,
    graph: Arc<TopologyGraph>,
    clock: Arc<Clock>,
    events: EventLog,
    bus: Arc<MessageBus>,
    handles: BTreeMap<DeviceId, DeviceHandle>,
    actors: Mutex<Vec<(DeviceId, JoinHandle<()>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    faults: FaultHandle,
    shutdown: broadcast::Sender<()>,
    day1: RwLock<Option<BringUpReport>>,
}

impl Runtime {
    fn handle(&self, id: &DeviceId) -> Result<&DeviceHandle, ControlError> {
        self.handles
            .get(id)
            .ok_or_else(|| ControlError::NoSuchDevice(id.clone()))
    }
}

/// Caller-facing control surface of one simulation
pub struct Coordinator {
    name: String,
    config: Arc<EngineConfig>,
    runtime: RwLock<Option<Arc<Runtime>>>,
    stopped: AtomicBool,
}

impl Coordinator {
    /// Validate `config` and create an idle coordinator
    pub fn new(config: EngineConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            name: "netsim".to_string(),
            config: Arc::new(config),
            runtime: RwLock::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Scenario name carried on the run span
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn runtime(&self) -> Result<Arc<Runtime>, ControlError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ControlError::Stopped);
        }
        self.runtime
            .read()
            .clone()
            .ok_or(ControlError::NotInitialized)
    }

    /// Build the actors for `graph` and start the clock. Must be called
    /// from within a tokio runtime.
    pub fn initialize(&self, graph: TopologyGraph) -> Result<Uuid, NetsimError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ControlError::Stopped.into());
        }
        let mut slot = self.runtime.write();
        if slot.is_some() {
            return Err(ControlError::AlreadyInitialized.into());
        }
        graph.validate()?;

        let graph = Arc::new(graph);
        let (span, run_id) = run_span(&self.name);
        let _entered = span.enter();

        let clock = Arc::new(Clock::new());
        let events = EventLog::new(clock.clone());

        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for link in &graph.links {
            let (tx, rx) = watch::channel(link.status);
            senders.insert(link.id.clone(), tx);
            receivers.insert(link.id.clone(), rx);
        }
        let bus = Arc::new(MessageBus::new(
            &graph,
            receivers,
            clock.clone(),
            events.clone(),
            self.config.link_latency_ticks,
            self.config.link_queue_capacity,
        ));

        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(4);
        let ctx = ActorContext {
            config: self.config.clone(),
            bus: bus.clone(),
            clock: clock.clone(),
            events: events.clone(),
            acks: acks_tx,
            shutdown: shutdown.clone(),
        };

        let mut handles = BTreeMap::new();
        let mut actors = Vec::new();
        for id in graph.device_ids() {
            let (handle, join) = DeviceActor::spawn(id.clone(), &graph, ctx.clone())?;
            handles.insert(id.clone(), handle);
            actors.push((id.clone(), join));
        }

        let driver = clock::spawn_driver(
            clock.clone(),
            bus.clone(),
            self.config.tick_interval(),
            shutdown.subscribe(),
        );
        let injector = FaultInjector::new(graph.clone(), senders, handles.clone(), clock.clone(), events.clone());
        let (faults, injector_task) = injector.spawn(acks_rx, shutdown.subscribe());

        for warning in &graph.warnings {
            events.record(
                ActorId::Coordinator,
                EventKind::Warning,
                format!("pre-flight [{}]: {}", warning.subject, warning.message),
            );
        }
        info!(
            devices = handles.len(),
            links = graph.links.len(),
            warnings = graph.warnings.len(),
            "Simulation initialized"
        );

        drop(_entered);
        *slot = Some(Arc::new(Runtime {
            run_id,
            span,
            graph,
            clock,
            events,
            bus,
            handles,
            actors: Mutex::new(actors),
            tasks: Mutex::new(vec![driver, injector_task]),
            faults,
            shutdown,
            day1: RwLock::new(None),
        }));
        Ok(run_id)
    }

    /// Day-1 bring-up. Returns the cached report if it already ran.
    pub async fn start_day1(&self) -> Result<BringUpReport, ControlError> {
        let rt = self.runtime()?;
        if let Some(report) = rt.day1.read().clone() {
            return Ok(report);
        }
        let sequencer = Sequencer::new(rt.clock.clone(), rt.events.clone(), self.config.clone());
        let report = sequencer
            .run(&rt.handles, &rt.graph.warnings)
            .instrument(rt.span.clone())
            .await;
        *rt.day1.write() = Some(report.clone());
        Ok(report)
    }

    /// Close the gate and freeze the clock. Returns false if already paused.
    pub fn pause(&self) -> Result<bool, ControlError> {
        let rt = self.runtime()?;
        if !rt.clock.pause() {
            return Ok(false);
        }
        // Stamped with the frozen tick
        let tick = rt.clock.now();
        info!(tick, "Simulation paused");
        rt.events
            .record(ActorId::Coordinator, EventKind::Paused, format!("Paused at tick {}", tick));
        Ok(true)
    }

    /// Reopen the gate. Returns false if not paused.
    pub fn resume(&self) -> Result<bool, ControlError> {
        let rt = self.runtime()?;
        let changed = rt.clock.resume();
        if changed {
            let tick = rt.clock.now();
            info!(tick, "Simulation resumed");
            rt.events
                .record(ActorId::Coordinator, EventKind::Resumed, format!("Resumed at tick {}", tick));
        }
        Ok(changed)
    }

    pub fn is_paused(&self) -> Result<bool, ControlError> {
        Ok(self.runtime()?.clock.is_paused())
    }

    pub async fn inject_fault(&self, target: FaultTarget) -> Result<FaultOutcome, ControlError> {
        let rt = self.runtime()?;
        rt.faults.inject(target).await
    }

    /// Restore `target`, wait for the touched devices to re-converge and
    /// measure the recovery duration
    pub async fn recover(&self, target: FaultTarget) -> Result<RecoveryReport, ControlError> {
        let rt = self.runtime()?;
        let outcome = rt.faults.recover(target.clone()).await?;

        let FaultOutcome::Recovered { fault_at, links, .. } = outcome.clone() else {
            return Ok(RecoveryReport {
                target,
                outcome,
                touched: Vec::new(),
                recovery_ticks: None,
                reconverged: true,
                not_operational: Vec::new(),
            });
        };

        let mut touched = BTreeSet::new();
        if let FaultTarget::Device(device) = &target {
            touched.insert(device.clone());
        }
        for link in &links {
            if let Some(record) = rt.graph.link(link) {
                touched.extend(record.endpoints.iter().map(|e| e.device.clone()));
            }
        }

        let deadline = rt.clock.now().saturating_add(self.config.reconvergence_deadline_ticks);
        let all = async {
            for id in &touched {
                if let Some(handle) = rt.handles.get(id) {
                    handle
                        .wait_for(|s| s.is_operational() && s.operational_at.is_some_and(|t| t >= fault_at))
                        .await;
                }
            }
        };
        let reconverged = tokio::select! {
            _ = all => true,
            _ = rt.clock.wait_until(deadline) => false,
        };

        let mut last = fault_at;
        let mut not_operational = Vec::new();
        for id in &touched {
            let Ok(handle) = rt.handle(id) else { continue };
            let snapshot = handle.snapshot();
            match snapshot.operational_at {
                Some(t) if snapshot.is_operational() && t >= fault_at => last = last.max(t),
                _ => not_operational.push(id.clone()),
            }
        }
        let recovery_ticks = if reconverged {
            last.saturating_sub(fault_at).max(1)
        } else {
            rt.clock.now().saturating_sub(fault_at).max(1)
        };

        if reconverged {
            info!(%target, recovery_ticks, "Recovery measured");
        } else {
            warn!(%target, recovery_ticks, not_operational = not_operational.len(), "Re-convergence deadline passed");
        }
        rt.events.record(
            ActorId::Coordinator,
            EventKind::RecoveryMeasured {
                target: target.clone(),
                ticks: recovery_ticks,
            },
            format!("{} recovered in {} ticks", target, recovery_ticks),
        );

        Ok(RecoveryReport {
            target,
            outcome,
            touched: touched.into_iter().collect(),
            recovery_ticks: Some(recovery_ticks),
            reconverged,
            not_operational,
        })
    }

    pub async fn active_faults(&self) -> Result<Vec<ActiveFault>, ControlError> {
        self.runtime()?.faults.active().await
    }

    /// Run the Day-2 catalog against the live simulation
    pub async fn run_day2(&self) -> Result<Day2Report, ControlError> {
        let rt = self.runtime()?;
        let active = rt.faults.active().await?.len();
        let source = LiveSource::new(
            rt.handles.clone(),
            rt.bus.clone(),
            rt.clock.clone(),
            self.config.snapshot_stability_ticks,
            self.config.test_timeout_ticks,
        );
        let day1_complete = rt.day1.read().is_some();
        let harness = Harness::new(&rt.graph, &source, rt.events.clone())
            .with_day1_complete(day1_complete)
            .with_active_faults(active);
        Ok(harness.run(rt.clock.now()).await)
    }

    /// Signal every actor to halt, abort stragglers after the grace period
    pub async fn stop(&self) -> Result<ShutdownReport, ControlError> {
        let rt = self.runtime()?;
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(ControlError::Stopped);
        }

        info!(tick = rt.clock.now(), "Stopping simulation");
        let _ = rt.shutdown.send(());
        let discarded = rt.bus.discard_in_flight();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();
        let actors = std::mem::take(&mut *rt.actors.lock());
        let mut aborted = Vec::new();
        for (id, mut join) in actors {
            if tokio::time::timeout_at(deadline, &mut join).await.is_err() {
                join.abort();
                aborted.push(id);
            }
        }
        let tasks = std::mem::take(&mut *rt.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
            }
        }

        let final_tick = rt.clock.now();
        if aborted.is_empty() {
            info!(final_tick, discarded, "Simulation stopped");
            rt.events.record(
                ActorId::Coordinator,
                EventKind::ShutdownComplete,
                format!("Stopped at tick {}", final_tick),
            );
        } else {
            let err = NetsimError::UncleanShutdown {
                devices: aborted.clone(),
            };
            warn!(error = %err, "Unclean shutdown");
            rt.events.record(
                ActorId::Coordinator,
                EventKind::UncleanShutdown {
                    aborted: aborted.clone(),
                },
                err.to_string(),
            );
        }

        Ok(ShutdownReport {
            final_tick,
            discarded_messages: discarded,
            aborted,
        })
    }

    pub fn status(&self) -> Result<SimulationStatus, ControlError> {
        let rt = self.runtime()?;
        let devices: BTreeMap<DeviceId, LifecycleState> =
            rt.handles.iter().map(|(id, h)| (id.clone(), h.state())).collect();
        Ok(SimulationStatus {
            run_id: rt.run_id,
            tick: rt.clock.now(),
            paused: rt.clock.is_paused(),
            day1_complete: rt.day1.read().is_some(),
            operational: devices.values().filter(|s| **s == LifecycleState::Operational).count(),
            faulted: devices.values().filter(|s| **s == LifecycleState::Faulted).count(),
            devices,
            bus: rt.bus.stats(),
            events: rt.events.len(),
        })
    }

    pub fn snapshot(&self, id: &DeviceId) -> Result<DeviceSnapshot, ControlError> {
        Ok(self.runtime()?.handle(id)?.snapshot())
    }

    pub fn snapshots(&self) -> Result<BTreeMap<DeviceId, DeviceSnapshot>, ControlError> {
        let rt = self.runtime()?;
        Ok(rt.handles.iter().map(|(id, h)| (id.clone(), h.snapshot())).collect())
    }

    pub fn link_snapshots(&self) -> Result<Vec<LinkSnapshot>, ControlError> {
        Ok(self.runtime()?.bus.link_snapshots())
    }

    /// Snapshot of every device and link
    pub fn view(&self) -> Result<TopologyView, ControlError> {
        let rt = self.runtime()?;
        let source = LiveSource::new(rt.handles.clone(), rt.bus.clone(), rt.clock.clone(), 1, 1);
        Ok(source.view())
    }

    pub fn events(&self) -> Result<Vec<SimulationEvent>, ControlError> {
        Ok(self.event_log()?.snapshot())
    }

    /// Shared handle to the event log. Stays readable after `stop`.
    pub fn event_log(&self) -> Result<EventLog, ControlError> {
        self.runtime
            .read()
            .as_ref()
            .map(|rt| rt.events.clone())
            .ok_or(ControlError::NotInitialized)
    }

    pub fn bring_up_report(&self) -> Option<BringUpReport> {
        self.runtime.read().as_ref().and_then(|rt| rt.day1.read().clone())
    }

    pub fn graph(&self) -> Result<Arc<TopologyGraph>, ControlError> {
        Ok(self.runtime()?.graph.clone())
    }

    pub fn now(&self) -> Result<u64, ControlError> {
        Ok(self.runtime()?.clock.now())
    }

    /// Wait `ticks` logical ticks. Halts while paused.
    pub async fn wait_ticks(&self, ticks: u64) -> Result<(), ControlError> {
        let rt = self.runtime()?;
        rt.clock.wait_ticks(ticks).await;
        Ok(())
    }
}
