//! Topology graph consumed by the engine
//!
//! The graph arrives from the topology builder as JSON. [`GraphBuilder`]
//! offers the same structure in code for scenarios and tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::device::{DeviceRecord, DeviceRole, InterfaceRecord, ProtocolConfig};
use crate::error::ConfigurationError;
use crate::identity::{DeviceId, LinkId};
use crate::link::{Endpoint, LinkRecord, LinkStatus};

/// Non-fatal finding passed along by the validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightWarning {
    pub subject: String,
    pub message: String,
}

impl PreflightWarning {
    pub fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// Devices, links, and validator warnings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyGraph {
    pub devices: BTreeMap<DeviceId, DeviceRecord>,
    #[serde(default)]
    pub links: Vec<LinkRecord>,
    #[serde(default)]
    pub warnings: Vec<PreflightWarning>,
}

impl TopologyGraph {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        let graph: TopologyGraph =
            serde_json::from_str(json).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigurationError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigurationError::Parse(e.to_string()))
    }

    /// Check structural invariants: links reference live devices and
    /// declared interfaces, and no interface is bound twice.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.devices.is_empty() {
            return Err(ConfigurationError::EmptyTopology);
        }

        for (id, device) in &self.devices {
            let mut names = HashSet::new();
            for iface in &device.interfaces {
                if !names.insert(iface.name.as_str()) {
                    return Err(ConfigurationError::DuplicateInterface {
                        device: id.clone(),
                        interface: iface.name.clone(),
                    });
                }
                if !(68..=65535).contains(&iface.mtu) {
                    return Err(ConfigurationError::InvalidDevice {
                        device: id.clone(),
                        reason: format!("interface {} has MTU {}", iface.name, iface.mtu),
                    });
                }
            }
            if let Some((0, _)) = device.bgp() {
                return Err(ConfigurationError::InvalidDevice {
                    device: id.clone(),
                    reason: "BGP AS number must be non-zero".into(),
                });
            }
            if device.role != DeviceRole::Router && !device.protocols.is_empty() {
                return Err(ConfigurationError::InvalidDevice {
                    device: id.clone(),
                    reason: format!("{} cannot run routing protocols", device.role),
                });
            }
        }

        let mut link_ids = HashSet::new();
        let mut bound: HashMap<(&DeviceId, &str), &LinkId> = HashMap::new();
        for link in &self.links {
            if !link_ids.insert(&link.id) {
                return Err(ConfigurationError::DuplicateLink(link.id.clone()));
            }
            let [a, b] = &link.endpoints;
            if a.device == b.device {
                return Err(ConfigurationError::SelfLoop(link.id.clone()));
            }
            for endpoint in &link.endpoints {
                let device = self.devices.get(&endpoint.device).ok_or_else(|| {
                    ConfigurationError::UnknownDevice {
                        link: link.id.clone(),
                        device: endpoint.device.clone(),
                    }
                })?;
                if device.interface(&endpoint.interface).is_none() {
                    return Err(ConfigurationError::UnknownInterface {
                        link: link.id.clone(),
                        device: endpoint.device.clone(),
                        interface: endpoint.interface.clone(),
                    });
                }
                if let Some(first) = bound.insert((&endpoint.device, endpoint.interface.as_str()), &link.id) {
                    return Err(ConfigurationError::InterfaceAlreadyBound {
                        device: endpoint.device.clone(),
                        interface: endpoint.interface.clone(),
                        first: first.clone(),
                        second: link.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn device(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    pub fn link(&self, id: &LinkId) -> Option<&LinkRecord> {
        self.links.iter().find(|l| &l.id == id)
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.devices.keys()
    }

    /// Links with an endpoint on `device`
    pub fn links_of<'a>(&'a self, device: &'a DeviceId) -> impl Iterator<Item = &'a LinkRecord> + 'a {
        self.links.iter().filter(move |l| l.touches(device))
    }

    /// First link connecting `a` and `b`
    pub fn link_between(&self, a: &DeviceId, b: &DeviceId) -> Option<&LinkRecord> {
        self.links.iter().find(|l| l.connects(a, b))
    }

    /// Link bound to a device interface
    pub fn link_on(&self, device: &DeviceId, interface: &str) -> Option<&LinkRecord> {
        self.links.iter().find(|l| {
            l.endpoint_of(device)
                .map(|e| e.interface == interface)
                .unwrap_or(false)
        })
    }

    /// Devices with the given role
    pub fn devices_with_role(&self, role: DeviceRole) -> impl Iterator<Item = &DeviceId> {
        self.devices
            .iter()
            .filter(move |(_, d)| d.role == role)
            .map(|(id, _)| id)
    }
}

/// Fluent builder for a [`TopologyGraph`]
///
/// Parse errors are collected and reported from [`GraphBuilder::build`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: TopologyGraph,
    errors: Vec<ConfigurationError>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device configured by `configure`
    pub fn device<F>(mut self, id: &str, role: DeviceRole, configure: F) -> Self
    where
        F: FnOnce(DeviceBuilder) -> DeviceBuilder,
    {
        match DeviceId::new(id) {
            Ok(device_id) => {
                let built = configure(DeviceBuilder::new(role));
                self.errors.extend(built.errors);
                self.graph.devices.insert(device_id, built.record);
            }
            Err(e) => self.errors.push(e.into()),
        }
        self
    }

    /// Connect two `(device, interface)` endpoints
    pub fn link(self, id: &str, a: (&str, &str), b: (&str, &str)) -> Self {
        self.link_with(id, a, b, 1000, LinkStatus::Up)
    }

    pub fn link_with(
        mut self,
        id: &str,
        a: (&str, &str),
        b: (&str, &str),
        capacity_mbps: u32,
        status: LinkStatus,
    ) -> Self {
        let parsed = (|| -> Result<LinkRecord, ConfigurationError> {
            let mut record = LinkRecord::new(
                LinkId::new(id)?,
                Endpoint::new(DeviceId::new(a.0)?, a.1),
                Endpoint::new(DeviceId::new(b.0)?, b.1),
            );
            record.capacity_mbps = capacity_mbps;
            record.status = status;
            Ok(record)
        })();
        match parsed {
            Ok(record) => self.graph.links.push(record),
            Err(e) => self.errors.push(e),
        }
        self
    }

    pub fn warning(mut self, subject: &str, message: &str) -> Self {
        self.graph
            .warnings
            .push(PreflightWarning::new(subject, message));
        self
    }

    /// Finish and validate
    pub fn build(mut self) -> Result<TopologyGraph, ConfigurationError> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }
        self.graph.validate()?;
        Ok(self.graph)
    }
}

/// Builder for one device inside [`GraphBuilder::device`]
#[derive(Debug)]
pub struct DeviceBuilder {
    record: DeviceRecord,
    errors: Vec<ConfigurationError>,
}

impl DeviceBuilder {
    fn new(role: DeviceRole) -> Self {
        Self {
            record: DeviceRecord::new(role),
            errors: Vec::new(),
        }
    }

    pub fn hostname(mut self, hostname: &str) -> Self {
        self.record.hostname = Some(hostname.to_string());
        self
    }

    /// Addressed interface, `address` in CIDR form
    pub fn interface(mut self, name: &str, address: &str) -> Self {
        let mut iface = InterfaceRecord::new(name);
        match address.parse::<Ipv4Network>() {
            Ok(net) => iface.address = Some(net),
            Err(e) => self.errors.push(ConfigurationError::InvalidAddress {
                value: address.to_string(),
                reason: e.to_string(),
            }),
        }
        self.record.interfaces.push(iface);
        self
    }

    /// Unaddressed interface, as on a switch
    pub fn port(mut self, name: &str) -> Self {
        self.record.interfaces.push(InterfaceRecord::new(name));
        self
    }

    /// Default gateway on the most recently added interface
    pub fn gateway(mut self, gateway: &str) -> Self {
        match gateway.parse::<Ipv4Addr>() {
            Ok(addr) => match self.record.interfaces.last_mut() {
                Some(iface) => iface.gateway = Some(addr),
                None => self.errors.push(ConfigurationError::InvalidAddress {
                    value: gateway.to_string(),
                    reason: "gateway set before any interface".into(),
                }),
            },
            Err(e) => self.errors.push(ConfigurationError::InvalidAddress {
                value: gateway.to_string(),
                reason: e.to_string(),
            }),
        }
        self
    }

    /// MTU on the most recently added interface
    pub fn mtu(mut self, mtu: u32) -> Self {
        if let Some(iface) = self.record.interfaces.last_mut() {
            iface.mtu = mtu;
        }
        self
    }

    pub fn ospf(mut self, area: u32) -> Self {
        self.record.protocols.push(ProtocolConfig::Ospf { area });
        self
    }

    pub fn bgp(mut self, asn: u32, neighbors: &[&str]) -> Self {
        let mut parsed = Vec::with_capacity(neighbors.len());
        for raw in neighbors {
            match raw.parse::<Ipv4Addr>() {
                Ok(addr) => parsed.push(addr),
                Err(e) => self.errors.push(ConfigurationError::InvalidAddress {
                    value: raw.to_string(),
                    reason: e.to_string(),
                }),
            }
        }
        self.record.protocols.push(ProtocolConfig::Bgp {
            asn,
            neighbors: parsed,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    fn two_routers() -> GraphBuilder {
        GraphBuilder::new()
            .device("R1", DeviceRole::Router, |d| {
                d.hostname("r1").interface("g0/0", "10.0.12.1/30").ospf(0)
            })
            .device("R2", DeviceRole::Router, |d| {
                d.hostname("r2").interface("g0/0", "10.0.12.2/30").ospf(0)
            })
    }

    #[test]
    fn test_build_valid_graph() {
        let graph = two_routers()
            .link("R1-R2", ("R1", "g0/0"), ("R2", "g0/0"))
            .build()
            .unwrap();
        assert_eq!(graph.devices.len(), 2);
        let link = graph.link_between(&dev("R2"), &dev("R1")).unwrap();
        assert_eq!(link.id.as_str(), "R1-R2");
        assert!(graph.link_on(&dev("R1"), "g0/0").is_some());
        assert_eq!(graph.links_of(&dev("R1")).count(), 1);
    }

    #[test]
    fn test_rejects_unknown_device() {
        let err = two_routers()
            .link("R1-R9", ("R1", "g0/0"), ("R9", "g0/0"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownDevice { .. }));
    }

    #[test]
    fn test_rejects_unknown_interface_and_self_loop() {
        let err = two_routers()
            .link("L1", ("R1", "g0/9"), ("R2", "g0/0"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownInterface { .. }));

        let err = two_routers()
            .link("L1", ("R1", "g0/0"), ("R1", "g0/0"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::SelfLoop(_)));
    }

    #[test]
    fn test_rejects_interface_bound_twice() {
        let err = two_routers()
            .device("R3", DeviceRole::Router, |d| d.interface("g0/0", "10.0.13.2/30"))
            .link("L1", ("R1", "g0/0"), ("R2", "g0/0"))
            .link("L2", ("R1", "g0/0"), ("R3", "g0/0"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InterfaceAlreadyBound { .. }));
    }

    #[test]
    fn test_rejects_bad_address() {
        let err = GraphBuilder::new()
            .device("H1", DeviceRole::Host, |d| d.interface("eth0", "192.168.1.300/24"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidAddress { .. }));
    }

    #[test]
    fn test_rejects_empty_and_protocol_on_host() {
        assert!(matches!(
            GraphBuilder::new().build(),
            Err(ConfigurationError::EmptyTopology)
        ));
        let err = GraphBuilder::new()
            .device("H1", DeviceRole::Host, |d| d.interface("eth0", "10.0.0.2/24").ospf(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidDevice { .. }));
    }

    #[test]
    fn test_json_round_trip_keeps_warnings() {
        let graph = two_routers()
            .link("R1-R2", ("R1", "g0/0"), ("R2", "g0/0"))
            .warning("R2", "no description on g0/0")
            .build()
            .unwrap();
        let json = graph.to_json_pretty().unwrap();
        let parsed = TopologyGraph::from_json_str(&json).unwrap();
        assert_eq!(parsed, graph);
        assert_eq!(parsed.warnings.len(), 1);
    }

    #[test]
    fn test_from_json_str_validates() {
        let json = r#"{"devices": {}, "links": []}"#;
        assert!(matches!(
            TopologyGraph::from_json_str(json),
            Err(ConfigurationError::EmptyTopology)
        ));
        assert!(matches!(
            TopologyGraph::from_json_str("not json"),
            Err(ConfigurationError::Parse(_))
        ));
    }
}
