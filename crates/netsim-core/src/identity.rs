//! Identifiers for devices, links, and the actors that emit events
//!
//! Device and link ids come from the topology builder as plain strings
//! (`"R1"`, `"R1-R2"`). They are validated once on construction so the
//! rest of the engine can treat them as opaque, cheap-to-clone keys.

use std::fmt::{self, Display};
use std::str::FromStr;

use derive_more::Display as DeriveDisplay;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::IdentityError;

fn check_identifier(kind: &str, raw: &str) -> Result<(), IdentityError> {
    if raw.is_empty() {
        return Err(IdentityError::Empty(kind.to_string()));
    }
    if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(IdentityError::InvalidFormat(format!(
            "{} id {:?} contains whitespace",
            kind, raw
        )));
    }
    Ok(())
}

/// Unique identifier of a device (router, switch, or host)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, DeriveDisplay)]
#[display("{_0}")]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id, rejecting empty ids and ids with whitespace
    pub fn new(raw: impl Into<String>) -> Result<Self, IdentityError> {
        let raw = raw.into();
        check_identifier("device", &raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Unique identifier of a link
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, DeriveDisplay)]
#[display("{_0}")]
#[serde(transparent)]
pub struct LinkId(String);

impl LinkId {
    /// Create a link id, rejecting empty ids and ids with whitespace
    pub fn new(raw: impl Into<String>) -> Result<Self, IdentityError> {
        let raw = raw.into();
        check_identifier("link", &raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for LinkId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for LinkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Who produced a message or an event
///
/// Devices send protocol messages; the control-plane units (coordinator,
/// sequencer, fault injector, harness) issue notices and record events.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "actor", content = "id")]
pub enum ActorId {
    Device(DeviceId),
    Coordinator,
    Sequencer,
    FaultInjector,
    Transport,
    Harness,
}

impl ActorId {
    /// The device behind this actor, if it is one
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            ActorId::Device(id) => Some(id),
            _ => None,
        }
    }
}

impl From<DeviceId> for ActorId {
    fn from(id: DeviceId) -> Self {
        ActorId::Device(id)
    }
}

impl Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorId::Device(id) => write!(f, "{}", id),
            ActorId::Coordinator => write!(f, "coordinator"),
            ActorId::Sequencer => write!(f, "sequencer"),
            ActorId::FaultInjector => write!(f, "fault-injector"),
            ActorId::Transport => write!(f, "transport"),
            ActorId::Harness => write!(f, "harness"),
        }
    }
}
