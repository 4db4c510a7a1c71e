//! Engine configuration
//!
//! All durations except the tick interval and shutdown grace are counted
//! in logical ticks.

use std::path::Path;
use std::time::Duration;

use netsim_core::ConfigurationError;
use serde::{Deserialize, Serialize};

/// Timing and capacity knobs for a simulation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Wall-clock length of one logical tick
    pub tick_interval_ms: u64,
    /// Ticks a message spends on a link (0 delivers inline)
    pub link_latency_ticks: u64,
    /// Per-direction link queue capacity
    pub link_queue_capacity: usize,
    /// Data-plane inbox capacity per device
    pub inbox_capacity: usize,

    pub arp_retry_ticks: u64,
    /// Resolution phase timeout
    pub arp_timeout_ticks: u64,
    /// Hello/open retry interval while an adjacency is forming
    pub hello_interval_ticks: u64,
    /// Convergence phase timeout (also bounds re-convergence per device)
    pub convergence_timeout_ticks: u64,
    pub keepalive_interval_ticks: u64,
    /// Silence after which an up adjacency is torn down
    pub hold_time_ticks: u64,

    /// Day-1 barrier deadline
    pub bring_up_deadline_ticks: u64,
    /// Settling period after the Day-1 barrier
    pub stabilization_ticks: u64,
    /// How long `recover` waits for touched devices to become operational
    pub reconvergence_deadline_ticks: u64,
    /// Ticks with no snapshot change before a view counts as stable
    pub snapshot_stability_ticks: u64,
    /// Deadline for a Day-2 test to obtain a stable view
    pub test_timeout_ticks: u64,

    /// Wall-clock grace for actors to halt on stop
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5,
            link_latency_ticks: 1,
            link_queue_capacity: 256,
            inbox_capacity: 1024,
            arp_retry_ticks: 3,
            arp_timeout_ticks: 20,
            hello_interval_ticks: 3,
            convergence_timeout_ticks: 40,
            keepalive_interval_ticks: 10,
            hold_time_ticks: 40,
            bring_up_deadline_ticks: 200,
            stabilization_ticks: 5,
            reconvergence_deadline_ticks: 100,
            snapshot_stability_ticks: 3,
            test_timeout_ticks: 100,
            shutdown_grace_ms: 500,
        }
    }
}

impl EngineConfig {
    /// Parse from TOML; missing keys take their defaults
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigurationError> {
        let config: EngineConfig =
            toml::from_str(raw).map_err(|e| ConfigurationError::Parse(format!("engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    /// Reject configurations that could never make progress
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let positive = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("arp_retry_ticks", self.arp_retry_ticks),
            ("arp_timeout_ticks", self.arp_timeout_ticks),
            ("hello_interval_ticks", self.hello_interval_ticks),
            ("convergence_timeout_ticks", self.convergence_timeout_ticks),
            ("keepalive_interval_ticks", self.keepalive_interval_ticks),
            ("bring_up_deadline_ticks", self.bring_up_deadline_ticks),
            ("reconvergence_deadline_ticks", self.reconvergence_deadline_ticks),
            ("snapshot_stability_ticks", self.snapshot_stability_ticks),
            ("test_timeout_ticks", self.test_timeout_ticks),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigurationError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if self.link_queue_capacity == 0 || self.inbox_capacity == 0 {
            return Err(ConfigurationError::InvalidConfig(
                "queue capacities must be positive".into(),
            ));
        }
        if self.hold_time_ticks <= self.keepalive_interval_ticks {
            return Err(ConfigurationError::InvalidConfig(format!(
                "hold_time_ticks ({}) must exceed keepalive_interval_ticks ({})",
                self.hold_time_ticks, self.keepalive_interval_ticks
            )));
        }
        // Every device must be able to leave address resolution before the barrier
        let resolution = self.arp_timeout_ticks.saturating_add(self.link_latency_ticks);
        if self.bring_up_deadline_ticks <= resolution {
            return Err(ConfigurationError::InvalidConfig(format!(
                "bring_up_deadline_ticks ({}) must exceed arp_timeout_ticks + link_latency_ticks ({})",
                self.bring_up_deadline_ticks, resolution
            )));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Set the tick interval
    pub fn with_tick_interval_ms(mut self, ms: u64) -> Self {
        self.tick_interval_ms = ms;
        self
    }

    /// Set link latency in ticks
    pub fn with_link_latency_ticks(mut self, ticks: u64) -> Self {
        self.link_latency_ticks = ticks;
        self
    }

    pub fn with_link_queue_capacity(mut self, capacity: usize) -> Self {
        self.link_queue_capacity = capacity;
        self
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    pub fn with_convergence_timeout_ticks(mut self, ticks: u64) -> Self {
        self.convergence_timeout_ticks = ticks;
        self
    }

    pub fn with_arp_timeout_ticks(mut self, ticks: u64) -> Self {
        self.arp_timeout_ticks = ticks;
        self
    }

    pub fn with_bring_up_deadline_ticks(mut self, ticks: u64) -> Self {
        self.bring_up_deadline_ticks = ticks;
        self
    }

    pub fn with_stabilization_ticks(mut self, ticks: u64) -> Self {
        self.stabilization_ticks = ticks;
        self
    }

    pub fn with_test_timeout_ticks(mut self, ticks: u64) -> Self {
        self.test_timeout_ticks = ticks;
        self
    }

    pub fn with_shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.shutdown_grace_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval(), Duration::from_millis(5));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            tick_interval_ms = 2
            link_latency_ticks = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.tick_interval_ms, 2);
        assert_eq!(config.link_latency_ticks, 0);
        assert_eq!(config.hold_time_ticks, EngineConfig::default().hold_time_ticks);
    }

    #[test]
    fn test_rejects_zero_and_bad_hold_time() {
        assert!(matches!(
            EngineConfig::default().with_tick_interval_ms(0).validate(),
            Err(ConfigurationError::InvalidConfig(_))
        ));
        let raw = "keepalive_interval_ticks = 10\nhold_time_ticks = 5";
        assert!(EngineConfig::from_toml_str(raw).is_err());
        assert!(matches!(
            EngineConfig::from_toml_str("tick_interval_ms = \"fast\""),
            Err(ConfigurationError::Parse(_))
        ));
    }

    #[test]
    fn test_rejects_deadline_inside_resolution() {
        let config = EngineConfig::default().with_bring_up_deadline_ticks(1);
        assert!(matches!(config.validate(), Err(ConfigurationError::InvalidConfig(_))));

        // arp_timeout_ticks 20 + link_latency_ticks 1
        let edge = EngineConfig::default().with_bring_up_deadline_ticks(21);
        assert!(edge.validate().is_err());
        let ok = EngineConfig::default().with_bring_up_deadline_ticks(22);
        assert!(ok.validate().is_ok());

        let raw = "arp_timeout_ticks = 60\nbring_up_deadline_ticks = 40";
        assert!(matches!(
            EngineConfig::from_toml_str(raw),
            Err(ConfigurationError::InvalidConfig(_))
        ));
        assert!(matches!(
            crate::coordinator::Coordinator::new(EngineConfig::default().with_bring_up_deadline_ticks(1)),
            Err(ConfigurationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "bring_up_deadline_ticks = 50\n").unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.bring_up_deadline_ticks, 50);
        assert!(matches!(
            EngineConfig::from_file(dir.path().join("missing.toml")),
            Err(ConfigurationError::Io(_))
        ));
    }
}
