//! Append-only event log stamped with the logical clock

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use netsim_core::{ActorId, EventKind, SimulationEvent};
use parking_lot::Mutex;
use tracing::debug;

use crate::clock::Clock;

/// Cloneable handle to the shared event log
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<SimulationEvent>>>,
    clock: Arc<Clock>,
}

impl EventLog {
    pub fn new(clock: Arc<Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            clock,
        }
    }

    /// Append an event stamped with the current tick
    pub fn record(&self, actor: ActorId, kind: EventKind, description: impl Into<String>) -> SimulationEvent {
        // Stamp under the log lock so entries stay ordered by tick
        let mut entries = self.entries.lock();
        let event = SimulationEvent::new(self.clock.now(), actor, kind, description);
        debug!(
            tick = event.timestamp,
            actor = %event.actor,
            description = %event.description,
            "event"
        );
        entries.push(event.clone());
        event
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of every entry
    pub fn snapshot(&self) -> Vec<SimulationEvent> {
        self.entries.lock().clone()
    }

    /// Entries from index `start` on
    pub fn since(&self, start: usize) -> Vec<SimulationEvent> {
        let entries = self.entries.lock();
        entries.get(start..).map(|s| s.to_vec()).unwrap_or_default()
    }

    /// Entries matching a predicate
    pub fn filter<F>(&self, predicate: F) -> Vec<SimulationEvent>
    where
        F: Fn(&SimulationEvent) -> bool,
    {
        self.entries
            .lock()
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SimulationEvent) -> bool,
    {
        self.entries.lock().iter().filter(|e| predicate(e)).count()
    }

    /// The whole log as JSON lines
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let entries = self.entries.lock();
        let mut out = String::new();
        for event in entries.iter() {
            out.push_str(&event.to_json_line()?);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn write_jsonl(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let body = self.to_jsonl().map_err(std::io::Error::other)?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(body.as_bytes())
    }
}
