//! Device records and snapshots
//!
//! [`DeviceRecord`] is the static description handed over by the topology
//! builder. [`DeviceSnapshot`] is the immutable view a device actor
//! publishes after each processed envelope.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::identity::{DeviceId, LinkId};
use crate::lifecycle::LifecycleState;
use crate::routing::RoutingTable;

/// Default interface MTU
pub const DEFAULT_MTU: u32 = 1500;

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

/// What kind of box a device is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Router,
    Switch,
    Host,
}

impl DeviceRole {
    /// Routers are the only devices that run routing protocols
    pub fn routes(self) -> bool {
        matches!(self, DeviceRole::Router)
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Router => write!(f, "router"),
            DeviceRole::Switch => write!(f, "switch"),
            DeviceRole::Host => write!(f, "host"),
        }
    }
}

/// Routing protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Ospf,
    Bgp,
}

impl Protocol {
    /// Administrative distance of routes learned through this protocol
    pub fn admin_distance(self) -> u8 {
        match self {
            Protocol::Bgp => 20,
            Protocol::Ospf => 110,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ospf => write!(f, "ospf"),
            Protocol::Bgp => write!(f, "bgp"),
        }
    }
}

/// Configured routing protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolConfig {
    Ospf {
        #[serde(default)]
        area: u32,
    },
    Bgp {
        asn: u32,
        /// Peer interface addresses
        #[serde(default)]
        neighbors: Vec<Ipv4Addr>,
    },
}

impl ProtocolConfig {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolConfig::Ospf { .. } => Protocol::Ospf,
            ProtocolConfig::Bgp { .. } => Protocol::Bgp,
        }
    }
}

/// Interface as described by the topology builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceRecord {
    pub name: String,
    #[serde(default)]
    pub address: Option<Ipv4Network>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    /// Default gateway, hosts only
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub description: Option<String>,
}

impl InterfaceRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            mtu: DEFAULT_MTU,
            gateway: None,
            description: None,
        }
    }
}

/// Device as described by the topology builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub role: DeviceRole,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceRecord>,
    #[serde(default)]
    pub protocols: Vec<ProtocolConfig>,
}

impl DeviceRecord {
    pub fn new(role: DeviceRole) -> Self {
        Self {
            role,
            hostname: None,
            interfaces: Vec::new(),
            protocols: Vec::new(),
        }
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceRecord> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// OSPF area, when OSPF is configured
    pub fn ospf_area(&self) -> Option<u32> {
        self.protocols.iter().find_map(|p| match p {
            ProtocolConfig::Ospf { area } => Some(*area),
            _ => None,
        })
    }

    /// BGP AS number and configured neighbour addresses
    pub fn bgp(&self) -> Option<(u32, &[Ipv4Addr])> {
        self.protocols.iter().find_map(|p| match p {
            ProtocolConfig::Bgp { asn, neighbors } => Some((*asn, neighbors.as_slice())),
            _ => None,
        })
    }

    pub fn runs(&self, protocol: Protocol) -> bool {
        self.protocols.iter().any(|p| p.protocol() == protocol)
    }

    /// Whether any interface carries the given address
    pub fn owns_address(&self, addr: Ipv4Addr) -> bool {
        self.interfaces
            .iter()
            .any(|i| i.address.map(|a| a.ip() == addr).unwrap_or(false))
    }

    /// The host's default gateway, taken from the first interface that has one
    pub fn default_gateway(&self) -> Option<(&InterfaceRecord, Ipv4Addr)> {
        self.interfaces
            .iter()
            .find_map(|i| i.gateway.map(|gw| (i, gw)))
    }
}

/// Interface state inside a running device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub address: Option<Ipv4Network>,
    pub mtu: u32,
    pub gateway: Option<Ipv4Addr>,
    /// Bound link, by id only
    pub link: Option<LinkId>,
}

impl Interface {
    pub fn from_record(record: &InterfaceRecord, link: Option<LinkId>) -> Self {
        Self {
            name: record.name.clone(),
            address: record.address,
            mtu: record.mtu,
            gateway: record.gateway,
            link,
        }
    }
}

/// Adjacency progress with one peer over one link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjacencyState {
    /// Hello or open sent, two-way not yet seen
    Init,
    Up,
    Down,
}

impl fmt::Display for AdjacencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjacencyState::Init => write!(f, "init"),
            AdjacencyState::Up => write!(f, "up"),
            AdjacencyState::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjacencySnapshot {
    pub peer: DeviceId,
    pub link: LinkId,
    pub protocol: Protocol,
    pub state: AdjacencyState,
}

/// Neighbour learned through address resolution on a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpEntry {
    pub peer: DeviceId,
    /// Switches answer without an address
    pub address: Option<Ipv4Addr>,
    pub learned_at: u64,
}

/// Per-device message counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub ignored: u64,
    pub ticks: u64,
}

/// Immutable copy of a device's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub role: DeviceRole,
    pub hostname: Option<String>,
    pub state: LifecycleState,
    /// False between a power-off and the matching power-on
    pub powered: bool,
    pub interfaces: Vec<Interface>,
    pub routing_table: RoutingTable,
    pub adjacencies: Vec<AdjacencySnapshot>,
    pub arp_table: BTreeMap<LinkId, ArpEntry>,
    pub faulted_links: BTreeSet<LinkId>,
    pub stats: DeviceStats,
    pub started_at: Option<u64>,
    pub operational_at: Option<u64>,
    /// Phases that ended on a timeout rather than completion
    pub timeouts: Vec<LifecycleState>,
    pub version: u64,
    pub taken_at: u64,
}

impl DeviceSnapshot {
    /// Initial snapshot of a device that has not been started
    pub fn initial(id: DeviceId, record: &DeviceRecord, interfaces: Vec<Interface>) -> Self {
        Self {
            id,
            role: record.role,
            hostname: record.hostname.clone(),
            state: LifecycleState::Uninitialized,
            powered: false,
            interfaces,
            routing_table: RoutingTable::new(),
            adjacencies: Vec::new(),
            arp_table: BTreeMap::new(),
            faulted_links: BTreeSet::new(),
            stats: DeviceStats::default(),
            started_at: None,
            operational_at: None,
            timeouts: Vec::new(),
            version: 0,
            taken_at: 0,
        }
    }

    /// Evidence reference, `<device>@t<tick>#v<version>`
    pub fn evidence(&self) -> String {
        format!("{}@t{}#v{}", self.id, self.taken_at, self.version)
    }

    pub fn is_operational(&self) -> bool {
        self.state == LifecycleState::Operational
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn interface_on(&self, link: &LinkId) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.link.as_ref() == Some(link))
    }

    pub fn owns_address(&self, addr: Ipv4Addr) -> bool {
        self.interfaces
            .iter()
            .any(|i| i.address.map(|a| a.ip() == addr).unwrap_or(false))
    }

    /// Adjacencies currently up
    pub fn up_adjacencies(&self) -> impl Iterator<Item = &AdjacencySnapshot> {
        self.adjacencies
            .iter()
            .filter(|a| a.state == AdjacencyState::Up)
    }

    pub fn adjacency(&self, peer: &DeviceId, link: &LinkId, protocol: Protocol) -> Option<&AdjacencySnapshot> {
        self.adjacencies
            .iter()
            .find(|a| &a.peer == peer && &a.link == link && a.protocol == protocol)
    }
}
