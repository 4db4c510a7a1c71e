//! Links between device interfaces

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::{DeviceId, LinkId};

fn default_capacity() -> u32 {
    1000
}

/// Operational status of a link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    #[default]
    Up,
    Down,
    /// Still carries traffic
    Degraded,
}

impl LinkStatus {
    pub fn is_usable(self) -> bool {
        !matches!(self, LinkStatus::Down)
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Up => write!(f, "up"),
            LinkStatus::Down => write!(f, "down"),
            LinkStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// One side of a link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub device: DeviceId,
    pub interface: String,
}

impl Endpoint {
    pub fn new(device: DeviceId, interface: impl Into<String>) -> Self {
        Self {
            device,
            interface: interface.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.interface)
    }
}

/// Point-to-point link. Exactly two endpoints by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub id: LinkId,
    pub endpoints: [Endpoint; 2],
    #[serde(default = "default_capacity")]
    pub capacity_mbps: u32,
    /// Status at load time
    #[serde(default)]
    pub status: LinkStatus,
}

impl LinkRecord {
    pub fn new(id: LinkId, a: Endpoint, b: Endpoint) -> Self {
        Self {
            id,
            endpoints: [a, b],
            capacity_mbps: default_capacity(),
            status: LinkStatus::Up,
        }
    }

    pub fn touches(&self, device: &DeviceId) -> bool {
        self.endpoints.iter().any(|e| &e.device == device)
    }

    /// The endpoint on `device`'s side
    pub fn endpoint_of(&self, device: &DeviceId) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| &e.device == device)
    }

    /// The endpoint opposite `device`
    pub fn peer_of(&self, device: &DeviceId) -> Option<&Endpoint> {
        match &self.endpoints {
            [a, b] if &a.device == device => Some(b),
            [a, b] if &b.device == device => Some(a),
            _ => None,
        }
    }

    pub fn connects(&self, a: &DeviceId, b: &DeviceId) -> bool {
        self.peer_of(a).map(|e| &e.device == b).unwrap_or(false)
    }
}

/// Live view of a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub id: LinkId,
    pub endpoints: [Endpoint; 2],
    pub capacity_mbps: u32,
    pub status: LinkStatus,
    /// Messages queued in either direction
    pub in_flight: usize,
    pub delivered: u64,
    pub dropped: u64,
}

impl LinkSnapshot {
    pub fn reference(&self) -> String {
        format!("link:{}({})", self.id, self.status)
    }
}
