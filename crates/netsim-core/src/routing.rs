//! Routing table
//!
//! Keyed by normalised prefix. Each prefix holds a single best route, which
//! may carry several equal-cost next hops.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::device::Protocol;
use crate::identity::{DeviceId, LinkId};

/// Where a route came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    Connected,
    Static,
    Ospf,
    Bgp,
}

impl RouteSource {
    /// Lower wins
    pub fn admin_distance(self) -> u8 {
        match self {
            RouteSource::Connected => 0,
            RouteSource::Static => 1,
            RouteSource::Ospf => Protocol::Ospf.admin_distance(),
            RouteSource::Bgp => Protocol::Bgp.admin_distance(),
        }
    }

    pub fn protocol(self) -> Option<Protocol> {
        match self {
            RouteSource::Ospf => Some(Protocol::Ospf),
            RouteSource::Bgp => Some(Protocol::Bgp),
            _ => None,
        }
    }
}

impl From<Protocol> for RouteSource {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Ospf => RouteSource::Ospf,
            Protocol::Bgp => RouteSource::Bgp,
        }
    }
}

impl fmt::Display for RouteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteSource::Connected => write!(f, "C"),
            RouteSource::Static => write!(f, "S"),
            RouteSource::Ospf => write!(f, "O"),
            RouteSource::Bgp => write!(f, "B"),
        }
    }
}

/// Neighbour a route forwards through
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NextHop {
    pub device: DeviceId,
    pub link: LinkId,
}

impl NextHop {
    pub fn new(device: DeviceId, link: LinkId) -> Self {
        Self { device, link }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: Ipv4Network,
    pub source: RouteSource,
    pub metric: u32,
    /// Equal-cost next hops. For connected routes, the device across the
    /// attached link.
    pub next_hops: BTreeSet<NextHop>,
    /// Outgoing interface for connected and static routes
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
}

impl Route {
    pub fn connected(prefix: Ipv4Network, interface: impl Into<String>, peer: Option<NextHop>) -> Self {
        Self {
            prefix: normalize(prefix),
            source: RouteSource::Connected,
            metric: 0,
            next_hops: peer.into_iter().collect(),
            interface: Some(interface.into()),
            gateway: None,
        }
    }

    /// Static default route toward a gateway
    pub fn default_via(gateway: Ipv4Addr, interface: impl Into<String>, next_hop: Option<NextHop>) -> Self {
        Self {
            prefix: default_prefix(),
            source: RouteSource::Static,
            metric: 1,
            next_hops: next_hop.into_iter().collect(),
            interface: Some(interface.into()),
            gateway: Some(gateway),
        }
    }

    pub fn learned(prefix: Ipv4Network, protocol: Protocol, metric: u32, next_hops: BTreeSet<NextHop>) -> Self {
        Self {
            prefix: normalize(prefix),
            source: protocol.into(),
            metric,
            next_hops,
            interface: None,
            gateway: None,
        }
    }

    /// Whether this route is preferred over `other` for the same prefix
    pub fn better_than(&self, other: &Route) -> bool {
        (self.source.admin_distance(), self.metric) < (other.source.admin_distance(), other.metric)
    }

    pub fn via_link(&self, link: &LinkId) -> bool {
        self.next_hops.iter().any(|h| &h.link == link)
    }
}

/// `0.0.0.0/0`
pub fn default_prefix() -> Ipv4Network {
    Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)
        .unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::UNSPECIFIED))
}

/// Clear host bits, so `192.168.10.1/24` keys as `192.168.10.0/24`
pub fn normalize(prefix: Ipv4Network) -> Ipv4Network {
    Ipv4Network::new(prefix.network(), prefix.prefix()).unwrap_or(prefix)
}

type RouteKey = (Ipv4Addr, u8);

fn key_of(prefix: &Ipv4Network) -> RouteKey {
    (prefix.network(), prefix.prefix())
}

/// Destination prefix to best route
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Route>", into = "Vec<Route>")]
pub struct RoutingTable {
    routes: BTreeMap<RouteKey, Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the route for its prefix
    pub fn insert(&mut self, route: Route) -> Option<Route> {
        self.routes.insert(key_of(&route.prefix), route)
    }

    pub fn remove(&mut self, prefix: &Ipv4Network) -> Option<Route> {
        self.routes.remove(&key_of(&normalize(*prefix)))
    }

    pub fn get(&self, prefix: &Ipv4Network) -> Option<&Route> {
        self.routes.get(&key_of(&normalize(*prefix)))
    }

    /// Longest-prefix match
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<&Route> {
        self.routes
            .values()
            .filter(|r| r.prefix.contains(addr))
            .max_by_key(|r| r.prefix.prefix())
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes using a next hop on `link`
    pub fn via_link<'a>(&'a self, link: &'a LinkId) -> impl Iterator<Item = &'a Route> + 'a {
        self.routes.values().filter(move |r| r.via_link(link))
    }

    /// Routes learned through a routing protocol
    pub fn learned(&self) -> impl Iterator<Item = &Route> {
        self.routes.values().filter(|r| r.source.protocol().is_some())
    }
}

impl From<Vec<Route>> for RoutingTable {
    fn from(routes: Vec<Route>) -> Self {
        let mut table = RoutingTable::new();
        for route in routes {
            table.insert(route);
        }
        table
    }
}

impl From<RoutingTable> for Vec<Route> {
    fn from(table: RoutingTable) -> Self {
        table.routes.into_values().collect()
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for route in self.routes.values() {
            write!(f, "{} {} [{}/{}]", route.source, route.prefix, route.source.admin_distance(), route.metric)?;
            for hop in &route.next_hops {
                write!(f, " via {} ({})", hop.device, hop.link)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(device: &str, link: &str) -> NextHop {
        NextHop::new(DeviceId::new(device).unwrap(), LinkId::new(link).unwrap())
    }

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_longest_prefix_match() {
        let mut table = RoutingTable::new();
        table.insert(Route::default_via("192.168.10.1".parse().unwrap(), "eth0", Some(hop("SW1", "L3"))));
        table.insert(Route::connected(net("192.168.10.10/24"), "eth0", Some(hop("SW1", "L3"))));
        table.insert(Route::learned(
            net("192.168.20.0/24"),
            Protocol::Ospf,
            2,
            [hop("R2", "L1")].into_iter().collect(),
        ));

        let route = table.lookup("192.168.10.77".parse().unwrap()).unwrap();
        assert_eq!(route.source, RouteSource::Connected);
        assert_eq!(route.prefix, net("192.168.10.0/24"));

        let route = table.lookup("192.168.20.10".parse().unwrap()).unwrap();
        assert_eq!(route.source, RouteSource::Ospf);

        let route = table.lookup("8.8.8.8".parse().unwrap()).unwrap();
        assert_eq!(route.source, RouteSource::Static);
        assert_eq!(route.prefix.prefix(), 0);
    }

    #[test]
    fn test_normalised_keys() {
        let mut table = RoutingTable::new();
        table.insert(Route::connected(net("10.0.12.1/30"), "g0/0", None));
        assert!(table.get(&net("10.0.12.2/30")).is_some());
        assert!(table.remove(&net("10.0.12.0/30")).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_preference() {
        let ospf = Route::learned(net("10.1.0.0/16"), Protocol::Ospf, 1, BTreeSet::new());
        let bgp = Route::learned(net("10.1.0.0/16"), Protocol::Bgp, 5, BTreeSet::new());
        let connected = Route::connected(net("10.1.0.0/16"), "g0/2", None);
        assert!(bgp.better_than(&ospf));
        assert!(connected.better_than(&bgp));
        assert!(!ospf.better_than(&ospf));
    }

    #[test]
    fn test_serializes_as_list() {
        let mut table = RoutingTable::new();
        table.insert(Route::connected(net("10.0.12.1/30"), "g0/0", Some(hop("R2", "L1"))));
        let json = serde_json::to_value(&table).unwrap();
        assert!(json.is_array());
        let back: RoutingTable = serde_json::from_value(json).unwrap();
        assert_eq!(back, table);
        assert_eq!(back.via_link(&LinkId::new("L1").unwrap()).count(), 1);
    }
}
