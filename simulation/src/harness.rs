//! Day-2 functional test harness
//!
//! The catalog is fixed and derived from the topology graph. Each case
//! obtains a fresh stable [`TopologyView`] from a [`SnapshotSource`] and
//! evaluates a predicate over it. A case that cannot get a stable view in
//! time fails with [`FailureReason::Timeout`]; nothing is left pending.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use derive_more::Display;
use netsim_core::{
    ActorId, AdjacencyState, DeviceId, DeviceRole, DeviceSnapshot, EventKind, LifecycleState, LinkId,
    LinkSnapshot, LinkStatus, Protocol, RouteSource, TopologyGraph,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::actor::DeviceHandle;
use crate::clock::Clock;
use crate::events::EventLog;
use crate::topology;
use crate::transport::MessageBus;

const MAX_HOPS: usize = 64;

/// Point-in-time view of every device and link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyView {
    pub taken_at: u64,
    pub devices: BTreeMap<DeviceId, DeviceSnapshot>,
    pub links: BTreeMap<LinkId, LinkSnapshot>,
}

impl TopologyView {
    pub fn device(&self, id: &DeviceId) -> Option<&DeviceSnapshot> {
        self.devices.get(id)
    }

    /// Link is not down. Unknown links count as down.
    pub fn link_usable(&self, link: &LinkId) -> bool {
        self.links
            .get(link)
            .map(|l| l.status.is_usable())
            .unwrap_or(false)
    }

    fn usable_from(&self, device: &DeviceSnapshot, link: &LinkId) -> bool {
        self.link_usable(link) && !device.faulted_links.contains(link)
    }

    /// Changes whenever any device publishes a new version or a link
    /// changes status
    pub fn fingerprint(&self) -> Vec<(String, u64)> {
        let devices = self
            .devices
            .iter()
            .map(|(id, s)| (id.to_string(), s.version));
        let links = self
            .links
            .iter()
            .map(|(id, l)| (id.to_string(), l.status as u64));
        devices.chain(links).collect()
    }
}

/// Supplies stable views to the harness
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// A view that held still for the stability window, or `None` if none
    /// could be obtained before the test timeout
    async fn stable_view(&self) -> Option<TopologyView>;
}

/// Views assembled from running device actors
#[derive(Debug, Clone)]
pub struct LiveSource {
    handles: BTreeMap<DeviceId, DeviceHandle>,
    bus: Arc<MessageBus>,
    clock: Arc<Clock>,
    stability_ticks: u64,
    timeout_ticks: u64,
}

impl LiveSource {
    pub fn new(
        handles: BTreeMap<DeviceId, DeviceHandle>,
        bus: Arc<MessageBus>,
        clock: Arc<Clock>,
        stability_ticks: u64,
        timeout_ticks: u64,
    ) -> Self {
        Self {
            handles,
            bus,
            clock,
            stability_ticks,
            timeout_ticks,
        }
    }

    /// Snapshot every device and link right now
    pub fn view(&self) -> TopologyView {
        TopologyView {
            taken_at: self.clock.now(),
            devices: self
                .handles
                .iter()
                .map(|(id, h)| (id.clone(), h.snapshot()))
                .collect(),
            links: self
                .bus
                .link_snapshots()
                .into_iter()
                .map(|l| (l.id.clone(), l))
                .collect(),
        }
    }
}

#[async_trait]
impl SnapshotSource for LiveSource {
    async fn stable_view(&self) -> Option<TopologyView> {
        let deadline = self.clock.now().saturating_add(self.timeout_ticks);
        let settle = async {
            loop {
                let before = self.view();
                self.clock.wait_ticks(self.stability_ticks.max(1)).await;
                let after = self.view();
                if before.fingerprint() == after.fingerprint() {
                    return after;
                }
            }
        };
        tokio::select! {
            view = settle => Some(view),
            _ = self.clock.wait_until(deadline) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum TestCategory {
    #[display("configuration")]
    Configuration,
    #[display("lifecycle")]
    Lifecycle,
    #[display("adjacency")]
    Adjacency,
    #[display("reachability")]
    Reachability,
    #[display("mtu")]
    Mtu,
    #[display("load-balancing")]
    LoadBalancing,
    #[display("post-fault-reachability")]
    PostFaultReachability,
}

/// What must hold before a case runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precondition {
    None,
    /// Day-1 bring-up has completed
    Converged,
    /// At least one fault is in effect
    FaultActive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    #[display("timed out waiting for a stable snapshot")]
    Timeout,
    #[display("{host} has no usable link")]
    NoConnectivity { host: DeviceId },
    #[display("{device} has no route to {destination}")]
    NoRoute { device: DeviceId, destination: Ipv4Addr },
    #[display("no layer-2 path from {from} to {to}")]
    NoL2Path { from: DeviceId, to: Ipv4Addr },
    #[display("routing loop at {at}")]
    RoutingLoop { at: DeviceId },
    #[display("{device} is powered off")]
    PoweredOff { device: DeviceId },
    #[display("{device} is {state}")]
    NotOperational { device: DeviceId, state: LifecycleState },
    #[display("{protocol} adjacency with {peer} on {link} is not up")]
    AdjacencyDown {
        peer: DeviceId,
        link: LinkId,
        protocol: Protocol,
    },
    #[display("MTU mismatch on {link}: {a} vs {b}")]
    MtuMismatch { link: LinkId, a: u32, b: u32 },
    #[display("routes via {neighbor} do not use parallel link {link}")]
    UnusedParallelLink { neighbor: DeviceId, link: LinkId },
    #[display("multipath route {prefix} uses dead next hop on {link}")]
    DeadNextHop { prefix: String, link: LinkId },
    #[display("{detail}")]
    Misconfigured { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TestOutcome {
    Pass,
    Fail { reason: FailureReason },
    Skipped { reason: String },
}

impl TestOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, Self::Fail { .. })
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Fail { reason } => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub category: TestCategory,
    pub description: String,
    pub precondition: Precondition,
    pub outcome: TestOutcome,
    pub evidence: Vec<String>,
}

/// Aggregate Day-2 result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Day2Report {
    pub started_at: u64,
    pub completed_at: u64,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cases: Vec<TestCase>,
}

impl Day2Report {
    fn from_cases(started_at: u64, completed_at: u64, cases: Vec<TestCase>) -> Self {
        let passed = cases.iter().filter(|c| c.outcome.is_pass()).count();
        let failed = cases.iter().filter(|c| c.outcome.is_fail()).count();
        Self {
            started_at,
            completed_at,
            total: cases.len(),
            passed,
            failed,
            skipped: cases.len() - passed - failed,
            cases,
        }
    }

    pub fn case(&self, id: &str) -> Option<&TestCase> {
        self.cases.iter().find(|c| c.id == id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.iter().filter(|c| c.outcome.is_fail())
    }

    pub fn by_category(&self, category: TestCategory) -> impl Iterator<Item = &TestCase> {
        self.cases.iter().filter(move |c| c.category == category)
    }

    pub fn pass_rate(&self) -> f64 {
        let ran = self.passed + self.failed;
        if ran == 0 {
            return 0.0;
        }
        self.passed as f64 / ran as f64
    }

    pub fn summary(&self) -> String {
        format!(
            "{} tests: {} passed, {} failed, {} skipped",
            self.total, self.passed, self.failed, self.skipped
        )
    }
}

#[derive(Debug, Clone)]
enum Subject {
    Device(DeviceId),
    Link(LinkId),
    Pair(DeviceId, DeviceId),
}

#[derive(Debug, Clone)]
struct CaseSpec {
    id: String,
    category: TestCategory,
    description: String,
    precondition: Precondition,
    subject: Subject,
}

type Verdict = (TestOutcome, Vec<String>);

fn pass(evidence: Vec<String>) -> Verdict {
    (TestOutcome::Pass, evidence)
}

fn fail(reason: FailureReason, evidence: Vec<String>) -> Verdict {
    (TestOutcome::Fail { reason }, evidence)
}

/// Runs the fixed catalog against a snapshot source
pub struct Harness<'a> {
    graph: &'a TopologyGraph,
    source: &'a dyn SnapshotSource,
    events: EventLog,
    day1_complete: bool,
    active_faults: usize,
}

impl<'a> Harness<'a> {
    pub fn new(graph: &'a TopologyGraph, source: &'a dyn SnapshotSource, events: EventLog) -> Self {
        Self {
            graph,
            source,
            events,
            day1_complete: false,
            active_faults: 0,
        }
    }

    pub fn with_day1_complete(mut self, complete: bool) -> Self {
        self.day1_complete = complete;
        self
    }

    pub fn with_active_faults(mut self, count: usize) -> Self {
        self.active_faults = count;
        self
    }

    fn catalog(&self) -> Vec<CaseSpec> {
        let graph = self.graph;
        let mut cases = Vec::new();
        let hosts: Vec<DeviceId> = graph.devices_with_role(DeviceRole::Host).cloned().collect();
        let mut pairs = Vec::new();
        for (i, a) in hosts.iter().enumerate() {
            for b in &hosts[i + 1..] {
                pairs.push((a.clone(), b.clone()));
            }
        }

        for id in graph.device_ids() {
            cases.push(CaseSpec {
                id: format!("configuration:{}", id),
                category: TestCategory::Configuration,
                description: format!("{} has a usable base configuration", id),
                precondition: Precondition::None,
                subject: Subject::Device(id.clone()),
            });
        }
        for id in graph.device_ids() {
            cases.push(CaseSpec {
                id: format!("lifecycle:{}", id),
                category: TestCategory::Lifecycle,
                description: format!("{} is operational", id),
                precondition: Precondition::Converged,
                subject: Subject::Device(id.clone()),
            });
        }
        for id in graph.devices_with_role(DeviceRole::Router) {
            let expects = topology::ports_of(graph, id)
                .iter()
                .any(|p| !p.expected.is_empty());
            if expects {
                cases.push(CaseSpec {
                    id: format!("adjacency:{}", id),
                    category: TestCategory::Adjacency,
                    description: format!("{} has every configured adjacency up", id),
                    precondition: Precondition::Converged,
                    subject: Subject::Device(id.clone()),
                });
            }
        }
        for (a, b) in &pairs {
            cases.push(CaseSpec {
                id: format!("reachability:{}<->{}", a, b),
                category: TestCategory::Reachability,
                description: format!("{} and {} reach each other", a, b),
                precondition: Precondition::Converged,
                subject: Subject::Pair(a.clone(), b.clone()),
            });
        }
        for link in &graph.links {
            cases.push(CaseSpec {
                id: format!("mtu:{}", link.id),
                category: TestCategory::Mtu,
                description: format!("both ends of {} agree on MTU", link.id),
                precondition: Precondition::None,
                subject: Subject::Link(link.id.clone()),
            });
        }
        for id in graph.devices_with_role(DeviceRole::Router) {
            cases.push(CaseSpec {
                id: format!("load-balancing:{}", id),
                category: TestCategory::LoadBalancing,
                description: format!("{} spreads traffic over equal-cost paths", id),
                precondition: Precondition::Converged,
                subject: Subject::Device(id.clone()),
            });
        }
        for (a, b) in &pairs {
            cases.push(CaseSpec {
                id: format!("post-fault-reachability:{}<->{}", a, b),
                category: TestCategory::PostFaultReachability,
                description: format!("{} and {} stay reachable while connected", a, b),
                precondition: Precondition::FaultActive,
                subject: Subject::Pair(a.clone(), b.clone()),
            });
        }
        cases
    }

    /// Run every case and record the aggregate
    pub async fn run(&self, started_at: u64) -> Day2Report {
        let catalog = self.catalog();
        info!(cases = catalog.len(), "Running Day-2 tests");

        let mut cases = Vec::with_capacity(catalog.len());
        let mut completed_at = started_at;
        for spec in catalog {
            let (outcome, evidence) = match self.unmet(spec.precondition) {
                Some(reason) => (TestOutcome::Skipped { reason }, Vec::new()),
                None => match self.source.stable_view().await {
                    Some(view) => {
                        completed_at = completed_at.max(view.taken_at);
                        evaluate(self.graph, &view, &spec)
                    }
                    None => fail(FailureReason::Timeout, Vec::new()),
                },
            };
            match &outcome {
                TestOutcome::Fail { reason } => warn!(case = %spec.id, %reason, "Test failed"),
                TestOutcome::Skipped { reason } => debug!(case = %spec.id, reason, "Test skipped"),
                TestOutcome::Pass => debug!(case = %spec.id, "Test passed"),
            }
            cases.push(TestCase {
                id: spec.id,
                category: spec.category,
                description: spec.description,
                precondition: spec.precondition,
                outcome,
                evidence,
            });
        }

        let report = Day2Report::from_cases(started_at, completed_at, cases);
        info!(
            total = report.total,
            passed = report.passed,
            failed = report.failed,
            skipped = report.skipped,
            "Day-2 tests complete"
        );
        self.events.record(
            ActorId::Harness,
            EventKind::TestsCompleted {
                passed: report.passed,
                failed: report.failed,
                skipped: report.skipped,
            },
            report.summary(),
        );
        report
    }

    fn unmet(&self, precondition: Precondition) -> Option<String> {
        match precondition {
            Precondition::None => None,
            Precondition::Converged if !self.day1_complete => Some("Day-1 bring-up has not completed".into()),
            Precondition::FaultActive if self.active_faults == 0 => Some("no fault is active".into()),
            _ => None,
        }
    }
}

fn evaluate(graph: &TopologyGraph, view: &TopologyView, spec: &CaseSpec) -> Verdict {
    match (&spec.category, &spec.subject) {
        (TestCategory::Configuration, Subject::Device(id)) => check_configuration(graph, id),
        (TestCategory::Lifecycle, Subject::Device(id)) => check_lifecycle(view, id),
        (TestCategory::Adjacency, Subject::Device(id)) => check_adjacency(graph, view, id),
        (TestCategory::Reachability, Subject::Pair(a, b)) => check_reachability(graph, view, a, b),
        (TestCategory::Mtu, Subject::Link(link)) => check_mtu(graph, view, link),
        (TestCategory::LoadBalancing, Subject::Device(id)) => check_load_balancing(graph, view, id),
        (TestCategory::PostFaultReachability, Subject::Pair(a, b)) => {
            check_post_fault_reachability(graph, view, a, b)
        }
        (category, subject) => fail(
            FailureReason::Misconfigured {
                detail: format!("{} case has no check for {:?}", category, subject),
            },
            Vec::new(),
        ),
    }
}

fn check_configuration(graph: &TopologyGraph, id: &DeviceId) -> Verdict {
    let Some(record) = graph.device(id) else {
        return fail(
            FailureReason::Misconfigured {
                detail: format!("{} is not in the topology", id),
            },
            Vec::new(),
        );
    };
    let mut evidence = vec![format!("{} interfaces", record.interfaces.len())];
    let mut problems = Vec::new();
    match &record.hostname {
        Some(name) if !name.is_empty() => evidence.push(format!("hostname {}", name)),
        _ => problems.push("no hostname"),
    }
    if record.interfaces.is_empty() {
        problems.push("no interfaces");
    }
    match record.role {
        DeviceRole::Host if record.default_gateway().is_none() => problems.push("no default gateway"),
        DeviceRole::Router if record.interfaces.iter().all(|i| i.address.is_none()) => {
            problems.push("no addressed interface")
        }
        _ => {}
    }
    if problems.is_empty() {
        pass(evidence)
    } else {
        fail(
            FailureReason::Misconfigured {
                detail: format!("{}: {}", id, problems.join(", ")),
            },
            evidence,
        )
    }
}

fn check_lifecycle(view: &TopologyView, id: &DeviceId) -> Verdict {
    let Some(snapshot) = view.device(id) else {
        return fail(FailureReason::NoConnectivity { host: id.clone() }, Vec::new());
    };
    let evidence = vec![snapshot.evidence()];
    if snapshot.state == LifecycleState::Operational {
        pass(evidence)
    } else {
        fail(
            FailureReason::NotOperational {
                device: id.clone(),
                state: snapshot.state,
            },
            evidence,
        )
    }
}

fn check_adjacency(graph: &TopologyGraph, view: &TopologyView, id: &DeviceId) -> Verdict {
    let Some(snapshot) = view.device(id) else {
        return fail(FailureReason::NoConnectivity { host: id.clone() }, Vec::new());
    };
    let mut evidence = vec![snapshot.evidence()];
    for port in topology::ports_of(graph, id) {
        if !view.usable_from(snapshot, &port.link) {
            evidence.push(format!("{} down, adjacency not expected", port.link));
            continue;
        }
        for protocol in &port.expected {
            let up = snapshot
                .adjacency(&port.peer, &port.link, *protocol)
                .map(|a| a.state == AdjacencyState::Up)
                .unwrap_or(false);
            if !up {
                return fail(
                    FailureReason::AdjacencyDown {
                        peer: port.peer.clone(),
                        link: port.link.clone(),
                        protocol: *protocol,
                    },
                    evidence,
                );
            }
            evidence.push(format!("{} {} via {} up", protocol, port.peer, port.link));
        }
    }
    pass(evidence)
}

/// First addressed interface of a device
fn address_of(graph: &TopologyGraph, id: &DeviceId) -> Option<Ipv4Addr> {
    graph
        .device(id)?
        .interfaces
        .iter()
        .find_map(|i| i.address.map(|a| a.ip()))
}

/// A host is isolated when it has no link or every link is down
fn isolated(graph: &TopologyGraph, view: &TopologyView, id: &DeviceId) -> bool {
    let Some(snapshot) = view.device(id) else {
        return true;
    };
    !graph
        .links_of(id)
        .any(|l| view.usable_from(snapshot, &l.id))
}

fn check_reachability(graph: &TopologyGraph, view: &TopologyView, a: &DeviceId, b: &DeviceId) -> Verdict {
    for host in [a, b] {
        if isolated(graph, view, host) {
            return fail(
                FailureReason::NoConnectivity { host: host.clone() },
                vec![format!("{} has {} links", host, graph.links_of(host).count())],
            );
        }
    }
    let mut evidence = Vec::new();
    for (from, to) in [(a, b), (b, a)] {
        let Some(address) = address_of(graph, to) else {
            return fail(
                FailureReason::Misconfigured {
                    detail: format!("{} has no address", to),
                },
                evidence,
            );
        };
        match trace(graph, view, from, address) {
            Ok(path) => evidence.push(format_path(&path, address)),
            Err(reason) => return fail(reason, evidence),
        }
    }
    pass(evidence)
}

fn check_post_fault_reachability(
    graph: &TopologyGraph,
    view: &TopologyView,
    a: &DeviceId,
    b: &DeviceId,
) -> Verdict {
    let alive = |d: &DeviceId| view.device(d).map(|s| s.powered).unwrap_or(false);
    let component = topology::physical_component(graph, a, |l| view.link_usable(l), alive);
    if !component.contains(b) {
        return (
            TestOutcome::Skipped {
                reason: format!("{} and {} are partitioned by the fault", a, b),
            },
            Vec::new(),
        );
    }
    check_reachability(graph, view, a, b)
}

fn check_mtu(graph: &TopologyGraph, view: &TopologyView, link: &LinkId) -> Verdict {
    let Some(record) = graph.link(link) else {
        return fail(
            FailureReason::Misconfigured {
                detail: format!("{} is not in the topology", link),
            },
            Vec::new(),
        );
    };
    let mtu_of = |end: usize| {
        let endpoint = &record.endpoints[end];
        view.device(&endpoint.device)
            .and_then(|s| s.interface(&endpoint.interface))
            .map(|i| i.mtu)
    };
    let (Some(a), Some(b)) = (mtu_of(0), mtu_of(1)) else {
        return fail(
            FailureReason::Misconfigured {
                detail: format!("{} endpoint interface missing", link),
            },
            Vec::new(),
        );
    };
    let mut evidence = vec![format!("{} {}={} {}={}", link, record.endpoints[0], a, record.endpoints[1], b)];
    if let Some(snapshot) = view.links.get(link) {
        evidence.push(format!(
            "{} delivered={} dropped={} in_flight={}",
            snapshot.reference(),
            snapshot.delivered,
            snapshot.dropped,
            snapshot.in_flight
        ));
        if snapshot.status == LinkStatus::Degraded {
            evidence.push(format!("{} is degraded", link));
        }
    }
    if a == b {
        pass(evidence)
    } else {
        fail(FailureReason::MtuMismatch { link: link.clone(), a, b }, evidence)
    }
}

fn check_load_balancing(graph: &TopologyGraph, view: &TopologyView, id: &DeviceId) -> Verdict {
    let Some(snapshot) = view.device(id) else {
        return fail(FailureReason::NoConnectivity { host: id.clone() }, Vec::new());
    };
    let mut evidence = vec![snapshot.evidence()];

    // Usable links with an up adjacency, grouped by neighbour
    let mut parallel: BTreeMap<DeviceId, BTreeSet<LinkId>> = BTreeMap::new();
    for port in topology::ports_of(graph, id) {
        if !view.usable_from(snapshot, &port.link) {
            continue;
        }
        let up = snapshot
            .up_adjacencies()
            .any(|a| a.peer == port.peer && a.link == port.link);
        if up {
            parallel.entry(port.peer).or_default().insert(port.link);
        }
    }

    for (neighbor, links) in parallel.iter().filter(|(_, l)| l.len() > 1) {
        let via: Vec<_> = snapshot
            .routing_table
            .learned()
            .filter(|r| r.next_hops.iter().any(|h| &h.device == neighbor))
            .collect();
        for route in &via {
            for link in links {
                if !route.next_hops.iter().any(|h| &h.link == link) {
                    return fail(
                        FailureReason::UnusedParallelLink {
                            neighbor: neighbor.clone(),
                            link: link.clone(),
                        },
                        evidence,
                    );
                }
            }
        }
        evidence.push(format!("{} routes via {} over {} links", via.len(), neighbor, links.len()));
    }

    let mut multipath = 0;
    for route in snapshot.routing_table.routes().filter(|r| r.next_hops.len() > 1) {
        multipath += 1;
        for hop in &route.next_hops {
            let live = view.usable_from(snapshot, &hop.link)
                && (route.source == RouteSource::Connected
                    || snapshot.up_adjacencies().any(|a| a.link == hop.link));
            if !live {
                return fail(
                    FailureReason::DeadNextHop {
                        prefix: route.prefix.to_string(),
                        link: hop.link.clone(),
                    },
                    evidence,
                );
            }
        }
    }
    evidence.push(format!("{} multipath routes", multipath));
    pass(evidence)
}

fn format_path(path: &[DeviceId], to: Ipv4Addr) -> String {
    let hops: Vec<&str> = path.iter().map(|d| d.as_str()).collect();
    format!("{} ({})", hops.join(" -> "), to)
}

/// Search the layer-2 segment behind `switch` for a powered layer-3
/// device owning `target`
fn find_on_segment(
    graph: &TopologyGraph,
    view: &TopologyView,
    switch: &DeviceId,
    target: Ipv4Addr,
) -> Option<DeviceId> {
    let mut seen = BTreeSet::from([switch.clone()]);
    let mut queue = VecDeque::from([switch.clone()]);
    while let Some(current) = queue.pop_front() {
        let snapshot = view.device(&current)?;
        if !snapshot.powered {
            continue;
        }
        for link in graph.links_of(&current) {
            if !view.usable_from(snapshot, &link.id) {
                continue;
            }
            let Some(peer) = link.peer_of(&current) else {
                continue;
            };
            if !seen.insert(peer.device.clone()) {
                continue;
            }
            let Some(peer_snapshot) = view.device(&peer.device) else {
                continue;
            };
            if peer_snapshot.role == DeviceRole::Switch {
                queue.push_back(peer.device.clone());
            } else if peer_snapshot.owns_address(target) {
                return Some(peer.device.clone());
            }
        }
    }
    None
}

/// Follow routing tables hop by hop from `from` toward `to`.
/// Returns the layer-3 path on success.
pub fn trace(
    graph: &TopologyGraph,
    view: &TopologyView,
    from: &DeviceId,
    to: Ipv4Addr,
) -> Result<Vec<DeviceId>, FailureReason> {
    let mut path = vec![from.clone()];
    let mut current = from.clone();

    for _ in 0..MAX_HOPS {
        let snapshot = view
            .device(&current)
            .ok_or_else(|| FailureReason::NoConnectivity { host: current.clone() })?;
        if !snapshot.powered {
            return Err(FailureReason::PoweredOff { device: current });
        }
        if snapshot.owns_address(to) {
            return Ok(path);
        }

        let no_route = || FailureReason::NoRoute {
            device: current.clone(),
            destination: to,
        };
        let route = snapshot.routing_table.lookup(to).ok_or_else(no_route)?;
        let hop = route
            .next_hops
            .iter()
            .find(|h| view.usable_from(snapshot, &h.link))
            .ok_or_else(no_route)?;

        // Address the next layer-3 device must own, if the route names one
        let target = match route.source {
            RouteSource::Connected => Some(to),
            RouteSource::Static => Some(route.gateway.unwrap_or(to)),
            RouteSource::Ospf | RouteSource::Bgp => None,
        };
        let no_path = |addr: Ipv4Addr| FailureReason::NoL2Path {
            from: current.clone(),
            to: addr,
        };

        let peer = view
            .device(&hop.device)
            .ok_or_else(|| no_path(target.unwrap_or(to)))?;
        let next = if peer.role == DeviceRole::Switch {
            let addr = target.unwrap_or(to);
            find_on_segment(graph, view, &hop.device, addr).ok_or_else(|| no_path(addr))?
        } else {
            if let Some(addr) = target {
                if !peer.owns_address(addr) {
                    return Err(no_path(addr));
                }
            }
            hop.device.clone()
        };

        if path.contains(&next) {
            return Err(FailureReason::RoutingLoop { at: next });
        }
        path.push(next.clone());
        current = next;
    }
    Err(FailureReason::RoutingLoop { at: current })
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsim_core::{GraphBuilder, NextHop, Route};

    use crate::clock::Clock;

    struct FixedSource(Option<TopologyView>);

    #[async_trait]
    impl SnapshotSource for FixedSource {
        async fn stable_view(&self) -> Option<TopologyView> {
            self.0.clone()
        }
    }

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    fn link(id: &str) -> LinkId {
        LinkId::new(id).unwrap()
    }

    fn graph() -> TopologyGraph {
        GraphBuilder::new()
            .device("R1", DeviceRole::Router, |d| {
                d.hostname("r1")
                    .interface("g0/0", "192.168.10.1/24")
                    .interface("g0/1", "192.168.20.1/24")
            })
            .device("SW1", DeviceRole::Switch, |d| d.hostname("sw1").port("fa0/1").port("fa0/2"))
            .device("H1", DeviceRole::Host, |d| {
                d.hostname("h1")
                    .interface("eth0", "192.168.10.10/24")
                    .gateway("192.168.10.1")
            })
            .device("H2", DeviceRole::Host, |d| {
                d.hostname("h2")
                    .interface("eth0", "192.168.20.10/24")
                    .gateway("192.168.20.1")
                    .mtu(9000)
            })
            .device("H3", DeviceRole::Host, |d| {
                d.hostname("h3")
                    .interface("eth0", "192.168.30.10/24")
                    .gateway("192.168.30.1")
            })
            .link("R1-SW1", ("R1", "g0/0"), ("SW1", "fa0/1"))
            .link("SW1-H1", ("SW1", "fa0/2"), ("H1", "eth0"))
            .link("R1-H2", ("R1", "g0/1"), ("H2", "eth0"))
            .build()
            .unwrap()
    }

    /// Operational view with hand-built routing tables
    fn converged_view(graph: &TopologyGraph) -> TopologyView {
        let mut devices = BTreeMap::new();
        for id in graph.device_ids() {
            let record = graph.device(id).unwrap();
            let mut snapshot = DeviceSnapshot::initial(id.clone(), record, topology::interfaces_of(graph, id));
            snapshot.state = LifecycleState::Operational;
            snapshot.powered = true;
            devices.insert(id.clone(), snapshot);
        }
        let hop = |d: &str, l: &str| Some(NextHop::new(dev(d), link(l)));

        let r1 = devices.get_mut(&dev("R1")).unwrap();
        r1.routing_table
            .insert(Route::connected("192.168.10.1/24".parse().unwrap(), "g0/0", hop("SW1", "R1-SW1")));
        r1.routing_table
            .insert(Route::connected("192.168.20.1/24".parse().unwrap(), "g0/1", hop("H2", "R1-H2")));

        let h1 = devices.get_mut(&dev("H1")).unwrap();
        h1.routing_table
            .insert(Route::connected("192.168.10.10/24".parse().unwrap(), "eth0", hop("SW1", "SW1-H1")));
        h1.routing_table.insert(Route::default_via(
            "192.168.10.1".parse().unwrap(),
            "eth0",
            hop("SW1", "SW1-H1"),
        ));

        let h2 = devices.get_mut(&dev("H2")).unwrap();
        h2.routing_table
            .insert(Route::connected("192.168.20.10/24".parse().unwrap(), "eth0", hop("R1", "R1-H2")));
        h2.routing_table.insert(Route::default_via(
            "192.168.20.1".parse().unwrap(),
            "eth0",
            hop("R1", "R1-H2"),
        ));

        let links = graph
            .links
            .iter()
            .map(|l| {
                (
                    l.id.clone(),
                    LinkSnapshot {
                        id: l.id.clone(),
                        endpoints: l.endpoints.clone(),
                        capacity_mbps: l.capacity_mbps,
                        status: l.status,
                        in_flight: 0,
                        delivered: 0,
                        dropped: 0,
                    },
                )
            })
            .collect();
        TopologyView {
            taken_at: 10,
            devices,
            links,
        }
    }

    fn events() -> EventLog {
        EventLog::new(Arc::new(Clock::new()))
    }

    #[test]
    fn test_trace_through_switch_and_router() {
        let graph = graph();
        let view = converged_view(&graph);
        let path = trace(&graph, &view, &dev("H1"), "192.168.20.10".parse().unwrap()).unwrap();
        assert_eq!(path, vec![dev("H1"), dev("R1"), dev("H2")]);
        let back = trace(&graph, &view, &dev("H2"), "192.168.10.10".parse().unwrap()).unwrap();
        assert_eq!(back, vec![dev("H2"), dev("R1"), dev("H1")]);
    }

    #[test]
    fn test_trace_reports_missing_route() {
        let graph = graph();
        let view = converged_view(&graph);
        let err = trace(&graph, &view, &dev("H1"), "10.9.9.9".parse().unwrap()).unwrap_err();
        assert_eq!(
            err,
            FailureReason::NoRoute {
                device: dev("R1"),
                destination: "10.9.9.9".parse().unwrap()
            }
        );
    }

    #[test]
    fn test_trace_stops_at_powered_off_switch() {
        let graph = graph();
        let mut view = converged_view(&graph);
        view.devices.get_mut(&dev("SW1")).unwrap().powered = false;
        let err = trace(&graph, &view, &dev("H1"), "192.168.20.10".parse().unwrap()).unwrap_err();
        assert!(matches!(err, FailureReason::NoL2Path { .. }));
    }

    #[tokio::test]
    async fn test_isolated_host_fails_with_connectivity_reason() {
        let graph = graph();
        let source = FixedSource(Some(converged_view(&graph)));
        let report = Harness::new(&graph, &source, events())
            .with_day1_complete(true)
            .run(0)
            .await;

        let case = report.case("reachability:H1<->H3").unwrap();
        assert_eq!(
            case.outcome.failure(),
            Some(&FailureReason::NoConnectivity { host: dev("H3") })
        );
        assert!(report.case("reachability:H1<->H2").unwrap().outcome.is_pass());
        assert_eq!(report.total, report.passed + report.failed + report.skipped);
    }

    #[tokio::test]
    async fn test_mtu_mismatch_detected() {
        let graph = graph();
        let source = FixedSource(Some(converged_view(&graph)));
        let report = Harness::new(&graph, &source, events()).run(0).await;
        let case = report.case("mtu:R1-H2").unwrap();
        assert_eq!(
            case.outcome.failure(),
            Some(&FailureReason::MtuMismatch {
                link: link("R1-H2"),
                a: 1500,
                b: 9000
            })
        );
        assert!(report.case("mtu:R1-SW1").unwrap().outcome.is_pass());
    }

    #[tokio::test]
    async fn test_preconditions_skip_cases() {
        let graph = graph();
        let source = FixedSource(Some(converged_view(&graph)));
        let report = Harness::new(&graph, &source, events()).run(0).await;
        assert!(report
            .by_category(TestCategory::Lifecycle)
            .all(|c| matches!(c.outcome, TestOutcome::Skipped { .. })));
        assert!(report
            .by_category(TestCategory::PostFaultReachability)
            .all(|c| matches!(c.outcome, TestOutcome::Skipped { .. })));
        assert!(report.case("configuration:R1").unwrap().outcome.is_pass());
    }

    #[tokio::test]
    async fn test_unstable_source_times_out() {
        let graph = graph();
        let source = FixedSource(None);
        let log = events();
        let report = Harness::new(&graph, &source, log.clone())
            .with_day1_complete(true)
            .run(0)
            .await;
        assert_eq!(report.passed, 0);
        assert_eq!(report.failed, report.total - report.skipped);
        assert!(report
            .failures()
            .all(|c| c.outcome.failure() == Some(&FailureReason::Timeout)));
        assert_eq!(
            log.count(|e| matches!(e.kind, EventKind::TestsCompleted { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_post_fault_skips_partitioned_pairs() {
        let graph = graph();
        let mut view = converged_view(&graph);
        view.links.get_mut(&link("R1-H2")).unwrap().status = LinkStatus::Down;
        let source = FixedSource(Some(view));
        let report = Harness::new(&graph, &source, events())
            .with_day1_complete(true)
            .with_active_faults(1)
            .run(0)
            .await;
        let case = report.case("post-fault-reachability:H1<->H2").unwrap();
        assert!(matches!(case.outcome, TestOutcome::Skipped { .. }));
        let case = report.case("reachability:H1<->H2").unwrap();
        assert_eq!(
            case.outcome.failure(),
            Some(&FailureReason::NoConnectivity { host: dev("H2") })
        );
    }
}
