//! Error types for the network simulator

use thiserror::Error;

use crate::identity::{DeviceId, LinkId};
use crate::lifecycle::LifecycleState;

/// Top-level error type for the simulator
#[derive(Debug, Error)]
pub enum NetsimError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    /// Bring-up or re-convergence did not finish before its deadline.
    /// Recorded as partial success, never fatal.
    #[error("Convergence timeout on {device} in {phase} after {ticks} ticks")]
    ConvergenceTimeout {
        device: DeviceId,
        phase: LifecycleState,
        ticks: u64,
    },

    /// Actors that did not halt within the shutdown grace period
    #[error("Unclean shutdown: {} actor(s) aborted ({})", devices.len(), join_ids(devices))]
    UncleanShutdown { devices: Vec<DeviceId> },
}

fn join_ids(devices: &[DeviceId]) -> String {
    devices
        .iter()
        .map(|d| d.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors related to device and link identifiers
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Empty {0} id")]
    Empty(String),

    #[error("Invalid identity format: {0}")]
    InvalidFormat(String),
}

/// Malformed input graph or engine configuration.
///
/// Fatal: surfaced before the simulation starts.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid identifier: {0}")]
    Identity(#[from] IdentityError),

    #[error("Topology has no devices")]
    EmptyTopology,

    #[error("Link {link} references unknown device {device}")]
    UnknownDevice { link: LinkId, device: DeviceId },

    #[error("Link {link} references unknown interface {device}/{interface}")]
    UnknownInterface {
        link: LinkId,
        device: DeviceId,
        interface: String,
    },

    #[error("Link {0} connects a device to itself")]
    SelfLoop(LinkId),

    #[error("Duplicate link id {0}")]
    DuplicateLink(LinkId),

    #[error("Interface {device}/{interface} is bound to both {first} and {second}")]
    InterfaceAlreadyBound {
        device: DeviceId,
        interface: String,
        first: LinkId,
        second: LinkId,
    },

    #[error("Device {device} declares interface {interface} twice")]
    DuplicateInterface { device: DeviceId, interface: String },

    #[error("Device {device}: {reason}")]
    InvalidDevice { device: DeviceId, reason: String },

    #[error("Invalid address {value:?}: {reason}")]
    InvalidAddress { value: String, reason: String },

    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse input: {0}")]
    Parse(String),

    #[error("Failed to read input: {0}")]
    Io(String),
}

/// Errors from the message bus
#[derive(Debug, Error)]
pub enum TransportError {
    /// No link connects the two devices
    #[error("No link from {from} to {to}")]
    NoSuchLink { from: DeviceId, to: DeviceId },

    #[error("Unknown link {0}")]
    UnknownLink(LinkId),

    #[error("Device {device} is not an endpoint of link {link}")]
    NotAnEndpoint { device: DeviceId, link: LinkId },

    /// The link is down; the message was dropped, not queued
    #[error("Link {0} is down")]
    LinkDown(LinkId),

    /// Link queue or receiver inbox full; the message was dropped
    #[error("Backpressure on link {link} toward {receiver}")]
    Backpressure { link: LinkId, receiver: DeviceId },

    #[error("Inbox of {0} is closed")]
    InboxClosed(DeviceId),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Invalid message payloads, rejected at construction
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid AS number {0}")]
    InvalidAsn(u32),

    #[error("Metric {metric} for {prefix} exceeds infinity ({infinity})")]
    MetricOutOfRange {
        prefix: String,
        metric: u32,
        infinity: u32,
    },

    #[error("Duplicate prefix {0} in update")]
    DuplicatePrefix(String),

    #[error("Notice for link {notice} carried on link {carrier}")]
    NoticeLinkMismatch { notice: LinkId, carrier: LinkId },

    #[error("{kind} must be sent by {expected}")]
    WrongSender {
        kind: &'static str,
        expected: &'static str,
    },
}

/// Invalid controller commands. Reported to the caller, no state change.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("No such device: {0}")]
    NoSuchDevice(DeviceId),

    #[error("No such link: {0}")]
    NoSuchLink(LinkId),

    #[error("Simulation not initialized")]
    NotInitialized,

    #[error("Simulation already initialized")]
    AlreadyInitialized,

    #[error("Simulation stopped")]
    Stopped,

    #[error("Control channel closed: {0}")]
    ChannelClosed(String),
}

/// Result type alias for simulator operations
pub type NetsimResult<T> = Result<T, NetsimError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    fn link(id: &str) -> LinkId {
        LinkId::new(id).unwrap()
    }

    #[test]
    fn test_configuration_error_display() {
        let err = ConfigurationError::UnknownDevice {
            link: link("L1"),
            device: dev("R9"),
        };
        let msg = err.to_string();
        assert!(msg.contains("L1"));
        assert!(msg.contains("R9"));

        assert!(ConfigurationError::SelfLoop(link("L2"))
            .to_string()
            .contains("itself"));
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::NoSuchLink {
            from: dev("H1"),
            to: dev("H2"),
        };
        assert!(err.to_string().contains("No link from H1 to H2"));
        assert!(TransportError::LinkDown(link("R1-R2"))
            .to_string()
            .contains("down"));
    }

    #[test]
    fn test_unclean_shutdown_lists_devices() {
        let err = NetsimError::UncleanShutdown {
            devices: vec![dev("R1"), dev("SW1")],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 actor(s)"));
        assert!(msg.contains("R1, SW1"));
    }

    #[test]
    fn test_convergence_timeout_display() {
        let err = NetsimError::ConvergenceTimeout {
            device: dev("R2"),
            phase: LifecycleState::Converging,
            ticks: 40,
        };
        let msg = err.to_string();
        assert!(msg.contains("R2"));
        assert!(msg.contains("converging"));
        assert!(msg.contains("40"));
    }

    #[test]
    fn test_error_conversions() {
        let err: NetsimError = ConfigurationError::EmptyTopology.into();
        assert!(matches!(err, NetsimError::Configuration(_)));

        let err: NetsimError = ControlError::NotInitialized.into();
        assert!(matches!(err, NetsimError::Control(_)));

        let err: NetsimError = ProtocolError::InvalidAsn(0).into();
        assert!(matches!(err, NetsimError::Protocol(_)));

        let err: TransportError = ProtocolError::InvalidAsn(0).into();
        assert!(matches!(err, TransportError::Protocol(_)));

        let err: NetsimError = IdentityError::Empty("device".into()).into();
        assert!(err.to_string().contains("Identity error"));
    }
}
