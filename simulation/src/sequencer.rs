//! Day-1 bring-up sequencer
//!
//! Every device is driven by its own task; the only synchronisation point
//! is the final join. A device that stalls holds up nobody but itself and
//! is reported as not operational once the deadline passes.

use std::collections::BTreeMap;
use std::sync::Arc;

use netsim_core::{
    ActorId, ControlError, DeviceId, DeviceRole, EventKind, LifecycleState, PreflightWarning,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::actor::DeviceHandle;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::events::EventLog;

/// Bring-up outcome for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBringUp {
    pub device: DeviceId,
    pub role: DeviceRole,
    pub state: LifecycleState,
    /// Ticks from the start of bring-up until `Operational`
    pub time_to_converge: Option<u64>,
    /// Phases that ended on their timeout
    pub partial_phases: Vec<LifecycleState>,
}

impl DeviceBringUp {
    pub fn is_partial(&self) -> bool {
        !self.partial_phases.is_empty()
    }
}

/// Day-1 report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BringUpReport {
    pub started_at: u64,
    pub completed_at: u64,
    /// The global deadline passed before every device was operational
    pub deadline_reached: bool,
    pub devices: Vec<DeviceBringUp>,
    pub partially_converged: Vec<DeviceId>,
    pub not_operational: Vec<DeviceId>,
    pub warnings: Vec<PreflightWarning>,
    /// Devices whose commands could not be delivered
    pub errors: Vec<String>,
}

impl BringUpReport {
    pub fn device(&self, id: &DeviceId) -> Option<&DeviceBringUp> {
        self.devices.iter().find(|d| &d.device == id)
    }

    pub fn operational_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| d.state == LifecycleState::Operational)
            .count()
    }

    /// Every device operational without a timed-out phase
    pub fn is_complete(&self) -> bool {
        self.not_operational.is_empty() && self.partially_converged.is_empty()
    }

    pub fn slowest(&self) -> Option<&DeviceBringUp> {
        self.devices
            .iter()
            .filter(|d| d.time_to_converge.is_some())
            .max_by_key(|d| d.time_to_converge)
    }
}

/// Drives Day-1 across all device actors
#[derive(Debug, Clone)]
pub struct Sequencer {
    clock: Arc<Clock>,
    events: EventLog,
    config: Arc<EngineConfig>,
}

impl Sequencer {
    pub fn new(clock: Arc<Clock>, events: EventLog, config: Arc<EngineConfig>) -> Self {
        Self { clock, events, config }
    }

    /// Start every device, wait for the barrier, then let routes settle
    pub async fn run(
        &self,
        handles: &BTreeMap<DeviceId, DeviceHandle>,
        warnings: &[PreflightWarning],
    ) -> BringUpReport {
        let started_at = self.clock.now();
        let deadline = started_at.saturating_add(self.config.bring_up_deadline_ticks);

        info!(devices = handles.len(), deadline, "Starting Day-1 bring-up");
        self.events.record(
            ActorId::Sequencer,
            EventKind::BringUpStarted {
                devices: handles.len(),
            },
            format!("Bring-up of {} devices, deadline tick {}", handles.len(), deadline),
        );
        for warning in warnings {
            warn!(subject = %warning.subject, message = %warning.message, "Pre-flight warning");
        }

        let mut set = JoinSet::new();
        for handle in handles.values() {
            let handle = handle.clone();
            let clock = self.clock.clone();
            set.spawn(async move {
                let id = handle.id().clone();
                if let Err(e) = drive(&handle) {
                    return (id, Err(e));
                }
                tokio::select! {
                    _ = handle.wait_for(|s| s.state.is_stable()) => {}
                    _ = clock.wait_until(deadline) => {}
                }
                (id, Ok(()))
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => {
                    warn!(device = %id, error = %e, "Device could not be started");
                    errors.push(format!("{}: {}", id, e));
                }
                Err(e) => {
                    warn!(error = %e, "Bring-up task failed");
                    errors.push(e.to_string());
                }
            }
        }

        let completed_at = self.clock.now();
        let mut devices = Vec::new();
        let mut partially_converged = Vec::new();
        let mut not_operational = Vec::new();
        for handle in handles.values() {
            let snapshot = handle.snapshot();
            let entry = DeviceBringUp {
                device: snapshot.id.clone(),
                role: snapshot.role,
                state: snapshot.state,
                time_to_converge: snapshot
                    .operational_at
                    .map(|t| t.saturating_sub(started_at)),
                partial_phases: snapshot.timeouts.clone(),
            };
            if entry.is_partial() {
                partially_converged.push(entry.device.clone());
            }
            if entry.state != LifecycleState::Operational {
                not_operational.push(entry.device.clone());
            }
            devices.push(entry);
        }

        let report = BringUpReport {
            started_at,
            completed_at,
            deadline_reached: completed_at >= deadline && !not_operational.is_empty(),
            devices,
            partially_converged,
            not_operational,
            warnings: warnings.to_vec(),
            errors,
        };

        if report.is_complete() {
            info!(
                operational = report.operational_count(),
                ticks = completed_at.saturating_sub(started_at),
                "Day-1 bring-up complete"
            );
        } else {
            warn!(
                operational = report.operational_count(),
                partial = report.partially_converged.len(),
                not_operational = report.not_operational.len(),
                "Day-1 bring-up finished with partial convergence"
            );
        }
        self.events.record(
            ActorId::Sequencer,
            EventKind::BringUpComplete {
                operational: report.operational_count(),
                partial: report.partially_converged.len(),
            },
            format!(
                "{}/{} devices operational after {} ticks",
                report.operational_count(),
                report.devices.len(),
                completed_at.saturating_sub(started_at)
            ),
        );

        if self.config.stabilization_ticks > 0 {
            self.clock.wait_ticks(self.config.stabilization_ticks).await;
        }
        report
    }
}

fn drive(handle: &DeviceHandle) -> Result<(), ControlError> {
    handle.start()?;
    handle.begin_resolution()
}
