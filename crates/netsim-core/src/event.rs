//! Simulation events
//!
//! The event log is append-only and is the artifact reporting tools
//! consume. Every entry is stamped with the logical tick it happened at.

use serde::{Deserialize, Serialize};

use crate::device::Protocol;
use crate::error::IdentityError;
use crate::identity::{ActorId, DeviceId, LinkId};
use crate::lifecycle::LifecycleState;
use crate::message::MessageTag;

/// What a fault was aimed at
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "target", content = "id", rename_all = "snake_case")]
pub enum FaultTarget {
    Link(LinkId),
    Device(DeviceId),
}

impl std::fmt::Display for FaultTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Link(id) => write!(f, "link {}", id),
            Self::Device(id) => write!(f, "device {}", id),
        }
    }
}

/// Parses `link:<id>` or `device:<id>`
impl std::str::FromStr for FaultTarget {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("link", id)) => Ok(Self::Link(LinkId::new(id)?)),
            Some(("device", id)) => Ok(Self::Device(DeviceId::new(id)?)),
            _ => Err(IdentityError::InvalidFormat(format!(
                "fault target {:?}, expected link:<id> or device:<id>",
                s
            ))),
        }
    }
}

/// Reasons a message was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Link was down at send or delivery time
    LinkDown,
    /// Link queue or receiver inbox full
    Backpressure,
    /// Sequence number not newer than the last one seen
    Stale,
    /// No link between sender and peer
    NoSuchLink,
    /// Receiver is powered off or not started
    PoweredOff,
    /// Receiver inbox closed
    Closed,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LinkDown => write!(f, "Link down"),
            Self::Backpressure => write!(f, "Backpressure"),
            Self::Stale => write!(f, "Stale sequence number"),
            Self::NoSuchLink => write!(f, "No such link"),
            Self::PoweredOff => write!(f, "Receiver powered off"),
            Self::Closed => write!(f, "Inbox closed"),
        }
    }
}

/// Typed event payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PoweredOn,
    PoweredOff,
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    MessageDelivered {
        message: MessageTag,
        link: LinkId,
    },
    MessageDropped {
        message: MessageTag,
        link: LinkId,
        reason: DropReason,
    },
    /// Not applicable to the receiving device
    MessageIgnored {
        message: MessageTag,
        link: LinkId,
    },
    AdjacencyUp {
        peer: DeviceId,
        link: LinkId,
        protocol: Protocol,
    },
    AdjacencyDown {
        peer: DeviceId,
        link: LinkId,
        protocol: Protocol,
    },
    RoutesChanged {
        routes: usize,
    },
    /// A phase ended on its timeout; recorded as partial convergence
    ConvergenceTimeout {
        phase: LifecycleState,
    },
    FaultInjected {
        target: FaultTarget,
    },
    FaultRecovered {
        target: FaultTarget,
    },
    /// Ticks from injection until every touched device was operational
    RecoveryMeasured {
        target: FaultTarget,
        ticks: u64,
    },
    BringUpStarted {
        devices: usize,
    },
    BringUpComplete {
        operational: usize,
        partial: usize,
    },
    TestsCompleted {
        passed: usize,
        failed: usize,
        skipped: usize,
    },
    Paused,
    Resumed,
    Warning,
    ShutdownComplete,
    UncleanShutdown {
        aborted: Vec<DeviceId>,
    },
}

/// One entry of the event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationEvent {
    /// Logical tick
    pub timestamp: u64,
    pub actor: ActorId,
    #[serde(flatten)]
    pub kind: EventKind,
    pub description: String,
}

impl SimulationEvent {
    pub fn new(timestamp: u64, actor: ActorId, kind: EventKind, description: impl Into<String>) -> Self {
        Self {
            timestamp,
            actor,
            kind,
            description: description.into(),
        }
    }

    /// The device this event concerns, if it was emitted by one
    pub fn device(&self) -> Option<&DeviceId> {
        self.actor.device()
    }

    /// Serialize as a single JSON line
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
