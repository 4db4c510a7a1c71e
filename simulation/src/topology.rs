//! Static views of the topology graph
//!
//! Ports pair each bound interface with the device across its link and the
//! adjacencies the two ends are expected to form. Device actors and the
//! Day-2 harness derive their expectations from the same function.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use netsim_core::{
    DeviceId, DeviceRecord, DeviceRole, Interface, LinkId, LinkStatus, Protocol, TopologyGraph,
};

/// An interface bound to a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub interface: Interface,
    pub link: LinkId,
    pub peer: DeviceId,
    pub peer_interface: String,
    /// Protocols both ends are configured to run over this link
    pub expected: Vec<Protocol>,
}

/// Adjacencies `device` should form toward `peer` over a link
pub fn expected_protocols(
    device: &DeviceRecord,
    peer: &DeviceRecord,
    peer_interface: &str,
) -> Vec<Protocol> {
    let mut expected = Vec::new();
    if !(device.role.routes() && peer.role.routes()) {
        return expected;
    }
    if let (Some(a), Some(b)) = (device.ospf_area(), peer.ospf_area()) {
        if a == b {
            expected.push(Protocol::Ospf);
        }
    }
    if let (Some((_, neighbors)), Some(_)) = (device.bgp(), peer.bgp()) {
        let peer_addr = peer
            .interface(peer_interface)
            .and_then(|i| i.address)
            .map(|a| a.ip());
        if let Some(addr) = peer_addr {
            if neighbors.contains(&addr) {
                expected.push(Protocol::Bgp);
            }
        }
    }
    expected
}

/// Interfaces of `device`, each with its bound link (if any)
pub fn interfaces_of(graph: &TopologyGraph, device: &DeviceId) -> Vec<Interface> {
    let Some(record) = graph.device(device) else {
        return Vec::new();
    };
    record
        .interfaces
        .iter()
        .map(|i| {
            let link = graph.link_on(device, &i.name).map(|l| l.id.clone());
            Interface::from_record(i, link)
        })
        .collect()
}

/// Ports of `device`, in interface order
pub fn ports_of(graph: &TopologyGraph, device: &DeviceId) -> Vec<Port> {
    let Some(record) = graph.device(device) else {
        return Vec::new();
    };
    let mut ports = Vec::new();
    for iface in &record.interfaces {
        let Some(link) = graph.link_on(device, &iface.name) else {
            continue;
        };
        let Some(peer_end) = link.peer_of(device) else {
            continue;
        };
        let Some(peer) = graph.device(&peer_end.device) else {
            continue;
        };
        ports.push(Port {
            interface: Interface::from_record(iface, Some(link.id.clone())),
            link: link.id.clone(),
            peer: peer_end.device.clone(),
            peer_interface: peer_end.interface.clone(),
            expected: expected_protocols(record, peer, &peer_end.interface),
        });
    }
    ports
}

/// Devices reachable from `start` over links whose status passes
/// `usable`, skipping devices for which `alive` is false.
pub fn physical_component<F, G>(graph: &TopologyGraph, start: &DeviceId, usable: F, alive: G) -> BTreeSet<DeviceId>
where
    F: Fn(&LinkId) -> bool,
    G: Fn(&DeviceId) -> bool,
{
    let mut seen = BTreeSet::new();
    if !alive(start) {
        return seen;
    }
    let mut queue = VecDeque::from([start.clone()]);
    seen.insert(start.clone());
    while let Some(current) = queue.pop_front() {
        for link in graph.links_of(&current) {
            if !usable(&link.id) {
                continue;
            }
            if let Some(peer) = link.peer_of(&current) {
                if alive(&peer.device) && seen.insert(peer.device.clone()) {
                    queue.push_back(peer.device.clone());
                }
            }
        }
    }
    seen
}

/// Human-readable summary of a graph
pub fn describe(graph: &TopologyGraph) -> String {
    let mut output = String::new();
    output.push_str("Enterprise Topology:\n");
    output.push_str(&format!("  Devices: {}\n", graph.devices.len()));
    output.push_str(&format!("  Links: {}\n\n", graph.links.len()));

    let mut by_role: BTreeMap<DeviceRole, Vec<&DeviceId>> = BTreeMap::new();
    for (id, record) in &graph.devices {
        by_role.entry(record.role).or_default().push(id);
    }
    for (role, ids) in by_role {
        let names: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
        output.push_str(&format!("  {:<7} [{}]\n", format!("{}:", role), names.join(", ")));
    }
    output.push('\n');

    for link in &graph.links {
        let [a, b] = &link.endpoints;
        let status = if link.status == LinkStatus::Up {
            String::new()
        } else {
            format!(" ({})", link.status)
        };
        output.push_str(&format!("  {}: {} <-> {}{}\n", link.id, a, b, status));
    }
    for warning in &graph.warnings {
        output.push_str(&format!("  warning [{}]: {}\n", warning.subject, warning.message));
    }
    output
}
