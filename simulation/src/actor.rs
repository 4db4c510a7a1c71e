//! Device actors
//!
//! Each device runs as one tokio task that owns all of its state. It reads
//! two inboxes: a bounded data-plane inbox fed by the [`MessageBus`] and an
//! unbounded control inbox for commands and link notices. Timers run off
//! the logical clock. After every step the actor publishes a
//! [`DeviceSnapshot`] on a watch channel.
//!
//! The pause gate is checked after an item is received and before it is
//! processed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use netsim_core::{
    ActorId, AdjacencySnapshot, AdjacencyState, ArpEntry, ControlError, DeviceId, DeviceRecord,
    DeviceRole, DeviceSnapshot, DeviceStats, DropReason, EventKind, Interface, LifecycleState, LinkId,
    Message, MessageKind, MessageTag, METRIC_INFINITY, NextHop, Protocol, Route, RouteAdvertisement,
    RouteSource, RoutingTable, TopologyGraph, TransportError, Trigger,
};
use netsim_logging::device_span;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::clock::{Clock, Gate};
use crate::config::EngineConfig;
use crate::events::EventLog;
use crate::topology::{self, Port};
use crate::transport::MessageBus;

/// Control-plane input to a device
#[derive(Debug, Clone)]
pub enum Command {
    /// Power on and begin processing (`Uninitialized -> PoweredOn`)
    Start,
    /// Begin address resolution (`PoweredOn -> ResolvingAddresses`)
    BeginResolution,
    PowerOff,
    PowerOn,
    /// Link-down or link-up notice from the fault injector
    Notice(Message),
}

/// A device has applied a link notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeAck {
    pub device: DeviceId,
    pub link: LinkId,
    pub sequence: u64,
}

/// Shared pieces every actor needs
#[derive(Debug, Clone)]
pub struct ActorContext {
    pub config: Arc<EngineConfig>,
    pub bus: Arc<MessageBus>,
    pub clock: Arc<Clock>,
    pub events: EventLog,
    pub acks: mpsc::UnboundedSender<NoticeAck>,
    pub shutdown: broadcast::Sender<()>,
}

/// Handle for talking to a running device actor
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    id: DeviceId,
    role: DeviceRole,
    control: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<DeviceSnapshot>,
    bus: Arc<MessageBus>,
}

impl DeviceHandle {
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    fn command(&self, command: Command) -> Result<(), ControlError> {
        self.control
            .send(command)
            .map_err(|_| ControlError::ChannelClosed(format!("device {}", self.id)))
    }

    /// Power on. Idempotent once started.
    pub fn start(&self) -> Result<(), ControlError> {
        self.command(Command::Start)
    }

    pub fn begin_resolution(&self) -> Result<(), ControlError> {
        self.command(Command::BeginResolution)
    }

    pub fn power_off(&self) -> Result<(), ControlError> {
        self.command(Command::PowerOff)
    }

    pub fn power_on(&self) -> Result<(), ControlError> {
        self.command(Command::PowerOn)
    }

    pub fn notify(&self, notice: Message) -> Result<(), ControlError> {
        self.command(Command::Notice(notice))
    }

    /// Send a message to a directly connected peer
    pub fn send(&self, peer: &DeviceId, kind: MessageKind) -> Result<u64, TransportError> {
        self.bus.send(&self.id, peer, kind)
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.snapshot.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    /// Returns `None` if the actor has stopped.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Option<DeviceSnapshot>
    where
        F: FnMut(&DeviceSnapshot) -> bool,
    {
        let mut rx = self.subscribe();
        let result = rx.wait_for(|s| predicate(s)).await;
        result.ok().map(|s| s.clone())
    }
}

#[derive(Debug, Clone)]
struct Adjacency {
    peer: DeviceId,
    state: AdjacencyState,
    last_heard: u64,
    last_sent: Option<u64>,
    last_keepalive: u64,
}

impl Adjacency {
    fn new(peer: DeviceId) -> Self {
        Self {
            peer,
            state: AdjacencyState::Down,
            last_heard: 0,
            last_sent: None,
            last_keepalive: 0,
        }
    }
}

/// One device's state machine
pub struct DeviceActor {
    id: DeviceId,
    record: DeviceRecord,
    interfaces: Vec<Interface>,
    ports: Vec<Port>,
    ctx: ActorContext,

    data_rx: mpsc::Receiver<Message>,
    control_rx: mpsc::UnboundedReceiver<Command>,
    ticks: watch::Receiver<u64>,
    gate: Gate,
    shutdown: broadcast::Receiver<()>,
    snapshot_tx: watch::Sender<DeviceSnapshot>,

    state: LifecycleState,
    powered: bool,
    phase_started: u64,
    arp: BTreeMap<LinkId, ArpEntry>,
    last_arp: HashMap<LinkId, u64>,
    adjacencies: BTreeMap<(LinkId, Protocol), Adjacency>,
    received: HashMap<(LinkId, Protocol), Vec<RouteAdvertisement>>,
    advertised: HashMap<(LinkId, Protocol), Vec<RouteAdvertisement>>,
    table: RoutingTable,
    faulted_links: BTreeSet<LinkId>,
    last_sequence: HashMap<(ActorId, LinkId), u64>,
    stats: DeviceStats,
    started_at: Option<u64>,
    operational_at: Option<u64>,
    timeouts: Vec<LifecycleState>,
    version: u64,
    dirty: bool,
}

impl DeviceActor {
    /// Spawn the actor for `id` and register its inbox with the bus
    pub fn spawn(
        id: DeviceId,
        graph: &TopologyGraph,
        ctx: ActorContext,
    ) -> Result<(DeviceHandle, JoinHandle<()>), ControlError> {
        let record = graph
            .device(&id)
            .cloned()
            .ok_or_else(|| ControlError::NoSuchDevice(id.clone()))?;
        let interfaces = topology::interfaces_of(graph, &id);
        let ports = topology::ports_of(graph, &id);

        let (data_tx, data_rx) = mpsc::channel(ctx.config.inbox_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let initial = DeviceSnapshot::initial(id.clone(), &record, interfaces.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        ctx.bus.register(id.clone(), data_tx);

        let handle = DeviceHandle {
            id: id.clone(),
            role: record.role,
            control: control_tx,
            snapshot: snapshot_rx,
            bus: ctx.bus.clone(),
        };

        let span = device_span(&id, record.role);
        let actor = DeviceActor {
            ticks: ctx.clock.subscribe(),
            gate: ctx.clock.gate(),
            shutdown: ctx.shutdown.subscribe(),
            id,
            record,
            interfaces,
            ports,
            ctx,
            data_rx,
            control_rx,
            snapshot_tx,
            state: LifecycleState::Uninitialized,
            powered: false,
            phase_started: 0,
            arp: BTreeMap::new(),
            last_arp: HashMap::new(),
            adjacencies: BTreeMap::new(),
            received: HashMap::new(),
            advertised: HashMap::new(),
            table: RoutingTable::new(),
            faulted_links: BTreeSet::new(),
            last_sequence: HashMap::new(),
            stats: DeviceStats::default(),
            started_at: None,
            operational_at: None,
            timeouts: Vec::new(),
            version: 0,
            dirty: false,
        };

        let join = tokio::spawn(actor.run().instrument(span));
        Ok((handle, join))
    }

    async fn run(mut self) {
        debug!(ports = self.ports.len(), "Device actor started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => break,
                command = self.control_rx.recv() => {
                    let Some(command) = command else { break };
                    if !self.pass_gate().await {
                        break;
                    }
                    self.handle_command(command);
                }
                changed = self.ticks.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let tick = *self.ticks.borrow_and_update();
                    if !self.pass_gate().await {
                        break;
                    }
                    self.on_tick(tick);
                }
                message = self.data_rx.recv() => {
                    let Some(message) = message else { break };
                    if !self.pass_gate().await {
                        break;
                    }
                    self.handle_message(message);
                }
            }
            self.publish();
        }

        let discarded = self.drain();
        self.ctx.bus.unregister(&self.id);
        self.publish();
        debug!(state = %self.state, discarded, "Device actor halted");
    }

    /// Block while paused. Returns false if shutdown arrives first.
    async fn pass_gate(&mut self) -> bool {
        if self.gate.is_open() {
            return true;
        }
        tokio::select! {
            _ = self.shutdown.recv() => false,
            _ = self.gate.wait_open() => true,
        }
    }

    /// Discard what is left in both inboxes
    fn drain(&mut self) -> usize {
        let mut discarded = 0;
        while self.data_rx.try_recv().is_ok() {
            discarded += 1;
        }
        while self.control_rx.try_recv().is_ok() {
            discarded += 1;
        }
        self.stats.dropped += discarded as u64;
        discarded
    }

    fn now(&self) -> u64 {
        self.ctx.clock.now()
    }

    fn actor(&self) -> ActorId {
        ActorId::Device(self.id.clone())
    }

    fn record_event(&self, kind: EventKind, description: impl Into<String>) {
        self.ctx.events.record(self.actor(), kind, description);
    }

    fn publish(&mut self) {
        if self.dirty {
            self.version += 1;
            self.dirty = false;
        }
        let adjacencies = self
            .adjacencies
            .iter()
            .map(|((link, protocol), adj)| AdjacencySnapshot {
                peer: adj.peer.clone(),
                link: link.clone(),
                protocol: *protocol,
                state: adj.state,
            })
            .collect();
        let snapshot = DeviceSnapshot {
            id: self.id.clone(),
            role: self.record.role,
            hostname: self.record.hostname.clone(),
            state: self.state,
            powered: self.powered,
            interfaces: self.interfaces.clone(),
            routing_table: self.table.clone(),
            adjacencies,
            arp_table: self.arp.clone(),
            faulted_links: self.faulted_links.clone(),
            stats: self.stats,
            started_at: self.started_at,
            operational_at: self.operational_at,
            timeouts: self.timeouts.clone(),
            version: self.version,
            taken_at: self.now(),
        };
        self.snapshot_tx.send_replace(snapshot);
    }

    // ---- lifecycle ----

    fn transition(&mut self, trigger: Trigger, reason: &str) -> bool {
        let from = self.state;
        let next = match from.apply(trigger) {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "Rejected lifecycle trigger");
                return false;
            }
        };
        let now = self.now();
        self.state = next;
        self.phase_started = now;
        self.dirty = true;
        if next == LifecycleState::Operational {
            self.operational_at = Some(now);
        }
        info!(%from, to = %next, reason, "Lifecycle transition");
        self.record_event(
            EventKind::StateChanged { from, to: next },
            format!("{} -> {}: {}", from, next, reason),
        );
        self.on_enter(next);
        true
    }

    fn on_enter(&mut self, state: LifecycleState) {
        match state {
            LifecycleState::ResolvingAddresses => {
                let links: Vec<LinkId> = self.usable_ports().map(|p| p.link.clone()).collect();
                for link in links {
                    self.send_arp_request(&link);
                }
            }
            LifecycleState::Converging => self.form_adjacencies(true),
            LifecycleState::Operational => self.advertise(),
            _ => {}
        }
    }

    fn record_timeout(&mut self, phase: LifecycleState) {
        let elapsed = self.now().saturating_sub(self.phase_started);
        warn!(%phase, elapsed, "Phase timed out, continuing with partial state");
        self.timeouts.push(phase);
        self.dirty = true;
        self.record_event(
            EventKind::ConvergenceTimeout { phase },
            format!("{} timed out after {} ticks", phase, elapsed),
        );
    }

    /// Apply any transition whose condition now holds
    fn check_progress(&mut self) {
        if !self.powered {
            return;
        }
        let config = self.ctx.config.clone();
        for _ in 0..3 {
            let elapsed = self.now().saturating_sub(self.phase_started);
            let moved = match self.state {
                LifecycleState::ResolvingAddresses => {
                    if self.resolution_complete() {
                        self.transition(Trigger::AddressesResolved, "all neighbours resolved")
                    } else if elapsed >= config.arp_timeout_ticks {
                        self.record_timeout(LifecycleState::ResolvingAddresses);
                        self.transition(Trigger::ResolutionTimedOut, "address resolution timed out")
                    } else {
                        false
                    }
                }
                LifecycleState::Converging => {
                    if self.adjacencies_complete() {
                        self.transition(Trigger::AdjacenciesEstablished, "configured adjacencies up")
                    } else if elapsed >= config.convergence_timeout_ticks {
                        self.record_timeout(LifecycleState::Converging);
                        self.transition(Trigger::ConvergenceTimedOut, "convergence timed out")
                    } else {
                        false
                    }
                }
                LifecycleState::Recovering => {
                    if self.resolution_complete() && self.adjacencies_complete() {
                        self.transition(Trigger::Reconverged, "restored links re-converged")
                    } else if elapsed >= config.convergence_timeout_ticks {
                        self.record_timeout(LifecycleState::Recovering);
                        self.transition(Trigger::ConvergenceTimedOut, "re-convergence timed out")
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if !moved {
                break;
            }
        }
    }

    fn maybe_clear_fault(&mut self) {
        if self.state == LifecycleState::Faulted && self.powered && self.faulted_links.is_empty() {
            self.transition(Trigger::FaultCleared, "all faults cleared");
        }
    }

    fn detect_fault(&mut self, reason: &str) {
        if self.state.next(Trigger::FaultDetected).is_some() {
            self.transition(Trigger::FaultDetected, reason);
        }
    }

    // ---- ports and links ----

    fn link_usable(&self, link: &LinkId) -> bool {
        !self.faulted_links.contains(link)
            && self
                .ctx
                .bus
                .link_status(link)
                .map(|s| s.is_usable())
                .unwrap_or(false)
    }

    fn usable_ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().filter(|p| self.link_usable(&p.link))
    }

    fn port(&self, link: &LinkId) -> Option<&Port> {
        self.ports.iter().find(|p| &p.link == link)
    }

    fn resolution_complete(&self) -> bool {
        self.usable_ports().all(|p| self.arp.contains_key(&p.link))
    }

    fn adjacencies_complete(&self) -> bool {
        self.usable_ports().all(|p| {
            p.expected.iter().all(|proto| {
                self.adjacencies
                    .get(&(p.link.clone(), *proto))
                    .map(|a| a.state == AdjacencyState::Up)
                    .unwrap_or(false)
            })
        })
    }

    fn send_on(&mut self, link: &LinkId, kind: MessageKind) -> bool {
        let tag = kind.tag();
        match self.ctx.bus.send_on(&self.id, link, kind) {
            Ok(sequence) => {
                self.stats.sent += 1;
                debug!(%link, message = %tag, sequence, "sent");
                true
            }
            Err(e) => {
                self.stats.dropped += 1;
                debug!(%link, message = %tag, error = %e, "send failed");
                false
            }
        }
    }

    fn address_on(&self, link: &LinkId) -> Option<std::net::Ipv4Addr> {
        self.port(link)
            .and_then(|p| p.interface.address)
            .map(|a| a.ip())
    }

    fn send_arp_request(&mut self, link: &LinkId) {
        let sender_address = self.address_on(link);
        self.last_arp.insert(link.clone(), self.now());
        self.send_on(link, MessageKind::ArpRequest { sender_address });
    }

    fn learn_neighbour(&mut self, link: &LinkId, peer: DeviceId, address: Option<std::net::Ipv4Addr>) {
        let known = self
            .arp
            .get(link)
            .map(|e| e.peer == peer && e.address == address)
            .unwrap_or(false);
        if known {
            return;
        }
        debug!(%link, %peer, ?address, "neighbour resolved");
        let learned_at = self.now();
        self.arp.insert(
            link.clone(),
            ArpEntry {
                peer,
                address,
                learned_at,
            },
        );
        self.dirty = true;
    }

    // ---- adjacencies ----

    fn hello_for(&self, protocol: Protocol, acknowledged: bool) -> Option<MessageKind> {
        match protocol {
            Protocol::Ospf => self.record.ospf_area().map(|area| MessageKind::Hello { area, acknowledged }),
            Protocol::Bgp => self.record.bgp().map(|(asn, _)| MessageKind::BgpOpen { asn }),
        }
    }

    /// Send hellos/opens for expected adjacencies that are not up.
    /// With `force`, ignore the retry interval.
    fn form_adjacencies(&mut self, force: bool) {
        if !self.powered {
            return;
        }
        let now = self.now();
        let interval = self.ctx.config.hello_interval_ticks;
        let wanted: Vec<(LinkId, DeviceId, Protocol)> = self
            .usable_ports()
            .flat_map(|p| p.expected.iter().map(|proto| (p.link.clone(), p.peer.clone(), *proto)))
            .collect();

        for (link, peer, protocol) in wanted {
            let key = (link.clone(), protocol);
            let adj = self
                .adjacencies
                .entry(key.clone())
                .or_insert_with(|| Adjacency::new(peer));
            if adj.state == AdjacencyState::Up {
                continue;
            }
            let due = force || adj.last_sent.map(|t| now.saturating_sub(t) >= interval).unwrap_or(true);
            if !due {
                continue;
            }
            if adj.state == AdjacencyState::Down {
                adj.state = AdjacencyState::Init;
                self.dirty = true;
            }
            adj.last_sent = Some(now);
            if let Some(kind) = self.hello_for(protocol, false) {
                self.send_on(&link, kind);
            }
        }
    }

    fn mark_up(&mut self, link: &LinkId, protocol: Protocol) {
        let now = self.now();
        let Some(adj) = self.adjacencies.get_mut(&(link.clone(), protocol)) else {
            return;
        };
        if adj.state == AdjacencyState::Up {
            return;
        }
        adj.state = AdjacencyState::Up;
        adj.last_heard = now;
        adj.last_keepalive = now;
        let peer = adj.peer.clone();
        self.dirty = true;
        self.advertised.remove(&(link.clone(), protocol));

        info!(%peer, %link, %protocol, "Adjacency up");
        self.record_event(
            EventKind::AdjacencyUp {
                peer: peer.clone(),
                link: link.clone(),
                protocol,
            },
            format!("{} adjacency with {} on {} up", protocol, peer, link),
        );
        self.recompute_and_advertise();
    }

    fn teardown(&mut self, link: &LinkId, protocol: Protocol, reason: &str) {
        let key = (link.clone(), protocol);
        let Some(adj) = self.adjacencies.get_mut(&key) else {
            return;
        };
        let was_up = adj.state == AdjacencyState::Up;
        adj.state = AdjacencyState::Down;
        adj.last_sent = None;
        adj.last_heard = 0;
        let peer = adj.peer.clone();
        self.received.remove(&key);
        self.advertised.remove(&key);
        self.dirty = true;

        if was_up {
            warn!(%peer, %link, %protocol, reason, "Adjacency down");
            self.record_event(
                EventKind::AdjacencyDown {
                    peer: peer.clone(),
                    link: link.clone(),
                    protocol,
                },
                format!("{} adjacency with {} on {} down: {}", protocol, peer, link, reason),
            );
        }
    }

    fn on_hello(&mut self, link: &LinkId, peer: DeviceId, acknowledged: bool) {
        let now = self.now();
        let adj = self
            .adjacencies
            .entry((link.clone(), Protocol::Ospf))
            .or_insert_with(|| Adjacency::new(peer));
        adj.last_heard = now;
        let up = adj.state == AdjacencyState::Up;

        if up {
            if !acknowledged {
                // Peer restarted its side; let it complete two-way and
                // resend the full table once it has
                self.advertised.remove(&(link.clone(), Protocol::Ospf));
                if let Some(kind) = self.hello_for(Protocol::Ospf, true) {
                    self.send_on(link, kind);
                }
            }
            return;
        }
        // The acknowledgement must reach the peer ahead of our first update
        if let Some(kind) = self.hello_for(Protocol::Ospf, true) {
            self.send_on(link, kind);
        }
        if acknowledged {
            self.mark_up(link, Protocol::Ospf);
        }
    }

    fn on_open(&mut self, link: &LinkId, peer: DeviceId) {
        let now = self.now();
        let adj = self
            .adjacencies
            .entry((link.clone(), Protocol::Bgp))
            .or_insert_with(|| Adjacency::new(peer));
        adj.last_heard = now;
        if adj.state == AdjacencyState::Up {
            return;
        }
        if let Some(kind) = self.hello_for(Protocol::Bgp, true) {
            self.send_on(link, kind);
        }
        self.mark_up(link, Protocol::Bgp);
    }

    fn adjacency_up(&self, link: &LinkId, protocol: Protocol) -> bool {
        self.adjacencies
            .get(&(link.clone(), protocol))
            .map(|a| a.state == AdjacencyState::Up)
            .unwrap_or(false)
    }

    fn refresh(&mut self, link: &LinkId, protocol: Protocol) -> bool {
        let now = self.now();
        match self.adjacencies.get_mut(&(link.clone(), protocol)) {
            Some(adj) if adj.state == AdjacencyState::Up => {
                adj.last_heard = now;
                true
            }
            _ => false,
        }
    }

    // ---- routing ----

    fn compute_table(&self) -> RoutingTable {
        let mut table = RoutingTable::new();
        if !self.powered {
            return table;
        }

        for iface in &self.interfaces {
            let (Some(address), Some(link)) = (iface.address, iface.link.as_ref()) else {
                continue;
            };
            if !self.link_usable(link) {
                continue;
            }
            let peer = self
                .port(link)
                .map(|p| NextHop::new(p.peer.clone(), link.clone()));
            table.insert(Route::connected(address, iface.name.clone(), peer));
        }

        if self.record.role == DeviceRole::Host {
            if let Some((iface, gateway)) = self.record.default_gateway() {
                let port = self.ports.iter().find(|p| p.interface.name == iface.name);
                if let Some(port) = port {
                    if self.link_usable(&port.link) {
                        let hop = NextHop::new(port.peer.clone(), port.link.clone());
                        table.insert(Route::default_via(gateway, iface.name.clone(), Some(hop)));
                    }
                }
            }
        }

        if self.record.role.routes() {
            let mut best: BTreeMap<(std::net::Ipv4Addr, u8), Route> = BTreeMap::new();
            for ((link, protocol), routes) in &self.received {
                if !self.adjacency_up(link, *protocol) || !self.link_usable(link) {
                    continue;
                }
                let Some(port) = self.port(link) else {
                    continue;
                };
                for adv in routes {
                    let metric = adv.metric.saturating_add(1);
                    if metric >= METRIC_INFINITY {
                        continue;
                    }
                    let hop = NextHop::new(port.peer.clone(), link.clone());
                    let candidate = Route::learned(adv.prefix, *protocol, metric, BTreeSet::from([hop]));
                    let key = (candidate.prefix.network(), candidate.prefix.prefix());
                    match best.get_mut(&key) {
                        None => {
                            best.insert(key, candidate);
                        }
                        Some(current) => {
                            if candidate.better_than(current) {
                                *current = candidate;
                            } else if candidate.source == current.source && candidate.metric == current.metric {
                                current.next_hops.extend(candidate.next_hops);
                            }
                        }
                    }
                }
            }
            for route in best.into_values() {
                let keep = table
                    .get(&route.prefix)
                    .map(|existing| route.better_than(existing))
                    .unwrap_or(true);
                if keep {
                    table.insert(route);
                }
            }
        }
        table
    }

    fn recompute_and_advertise(&mut self) {
        let table = self.compute_table();
        if table != self.table {
            self.table = table;
            self.dirty = true;
            debug!(routes = self.table.len(), "routing table changed");
            self.record_event(
                EventKind::RoutesChanged {
                    routes: self.table.len(),
                },
                format!("{} now has {} routes", self.id, self.table.len()),
            );
        }
        self.advertise();
    }

    /// Send the full table to each up adjacency whose last advertisement
    /// differs. Split horizon: routes through a neighbour are not
    /// advertised back to it.
    fn advertise(&mut self) {
        if !self.powered || !self.record.role.routes() {
            return;
        }
        let targets: Vec<(LinkId, DeviceId, Protocol)> = self
            .ports
            .iter()
            .flat_map(|p| p.expected.iter().map(|proto| (p.link.clone(), p.peer.clone(), *proto)))
            .filter(|(link, _, proto)| self.adjacency_up(link, *proto))
            .collect();

        for (link, peer, protocol) in targets {
            let routes: Vec<RouteAdvertisement> = self
                .table
                .routes()
                .filter(|r| match r.source {
                    RouteSource::Connected => true,
                    source => source.protocol() == Some(protocol),
                })
                .filter(|r| !r.next_hops.iter().any(|h| h.device == peer))
                .map(|r| {
                    let metric = if r.source == RouteSource::Connected { 0 } else { r.metric };
                    RouteAdvertisement::new(r.prefix, metric)
                })
                .collect();

            let key = (link.clone(), protocol);
            if self.advertised.get(&key) == Some(&routes) {
                continue;
            }
            let kind = match protocol {
                Protocol::Ospf => MessageKind::RouteUpdate { routes: routes.clone() },
                Protocol::Bgp => match self.record.bgp() {
                    Some((asn, _)) => MessageKind::BgpUpdate {
                        asn,
                        routes: routes.clone(),
                    },
                    None => continue,
                },
            };
            if self.send_on(&link, kind) {
                self.advertised.insert(key, routes);
            }
        }
    }

    // ---- inputs ----

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.on_start(),
            Command::BeginResolution => {
                if self.powered && self.state == LifecycleState::PoweredOn {
                    self.transition(Trigger::BeginResolution, "sequencer command");
                } else {
                    debug!(state = %self.state, "BeginResolution ignored");
                }
            }
            Command::PowerOff => self.on_power_off(),
            Command::PowerOn => self.on_power_on(),
            Command::Notice(notice) => self.on_notice(notice),
        }
        self.check_progress();
    }

    fn on_start(&mut self) {
        if self.state != LifecycleState::Uninitialized {
            return;
        }
        self.powered = true;
        self.started_at = Some(self.now());
        self.record_event(EventKind::PoweredOn, format!("{} powered on", self.id));
        self.transition(Trigger::PowerOn, "start");
        self.recompute_and_advertise();
    }

    fn on_power_off(&mut self) {
        if !self.powered {
            return;
        }
        self.powered = false;
        self.dirty = true;
        let keys: Vec<(LinkId, Protocol)> = self.adjacencies.keys().cloned().collect();
        for (link, protocol) in keys {
            self.teardown(&link, protocol, "powered off");
        }
        self.arp.clear();
        self.received.clear();
        self.advertised.clear();
        self.recompute_and_advertise();
        warn!("Device powered off");
        self.record_event(EventKind::PoweredOff, format!("{} powered off", self.id));
        self.detect_fault("powered off");
    }

    fn on_power_on(&mut self) {
        if self.powered || self.state == LifecycleState::Uninitialized {
            return;
        }
        self.powered = true;
        self.dirty = true;
        info!("Device powered back on");
        self.record_event(EventKind::PoweredOn, format!("{} powered back on", self.id));
        let links: Vec<LinkId> = self.usable_ports().map(|p| p.link.clone()).collect();
        for link in links {
            self.send_arp_request(&link);
        }
        self.form_adjacencies(true);
        self.recompute_and_advertise();
        self.maybe_clear_fault();
    }

    fn is_stale(&mut self, sender: &ActorId, link: &LinkId, sequence: u64) -> bool {
        let key = (sender.clone(), link.clone());
        match self.last_sequence.get(&key) {
            Some(last) if sequence <= *last => true,
            _ => {
                self.last_sequence.insert(key, sequence);
                false
            }
        }
    }

    fn on_notice(&mut self, notice: Message) {
        let link = notice.link().clone();
        let sequence = notice.sequence();
        let tag = notice.tag();

        if self.is_stale(notice.sender(), &link, sequence) {
            self.stats.dropped += 1;
            warn!(%link, sequence, message = %tag, "stale notice dropped");
        } else {
            self.stats.received += 1;
            info!(%link, message = %tag, "Link notice");
            self.record_event(
                EventKind::MessageDelivered {
                    message: tag,
                    link: link.clone(),
                },
                format!("{} for {} delivered to {}", tag, link, self.id),
            );
            match notice.kind() {
                MessageKind::LinkDownNotice { .. } => self.on_link_down(&link),
                MessageKind::LinkUpNotice { .. } => self.on_link_up(&link),
                _ => {}
            }
        }

        let _ = self.ctx.acks.send(NoticeAck {
            device: self.id.clone(),
            link,
            sequence,
        });
    }

    fn on_link_down(&mut self, link: &LinkId) {
        if !self.faulted_links.insert(link.clone()) {
            return;
        }
        self.dirty = true;
        self.arp.remove(link);
        self.last_arp.remove(link);
        for protocol in [Protocol::Ospf, Protocol::Bgp] {
            self.teardown(link, protocol, "link down");
        }
        self.recompute_and_advertise();
        if self.powered {
            self.detect_fault("link down");
        }
    }

    fn on_link_up(&mut self, link: &LinkId) {
        if !self.faulted_links.remove(link) {
            return;
        }
        self.dirty = true;
        if self.powered && self.state != LifecycleState::Uninitialized && self.port(link).is_some() {
            self.send_arp_request(link);
            self.form_adjacencies(true);
        }
        self.recompute_and_advertise();
        self.maybe_clear_fault();
    }

    fn ignore(&mut self, tag: MessageTag, link: &LinkId, why: &str) {
        self.stats.ignored += 1;
        debug!(%link, message = %tag, why, "message ignored");
        self.record_event(
            EventKind::MessageIgnored {
                message: tag,
                link: link.clone(),
            },
            format!("{} on {} ignored by {}: {}", tag, link, self.id, why),
        );
    }

    fn drop_message(&mut self, tag: MessageTag, link: &LinkId, reason: DropReason) {
        self.stats.dropped += 1;
        debug!(%link, message = %tag, %reason, "message dropped");
        self.record_event(
            EventKind::MessageDropped {
                message: tag,
                link: link.clone(),
                reason,
            },
            format!("{} on {} dropped by {}: {}", tag, link, self.id, reason),
        );
    }

    fn handle_message(&mut self, message: Message) {
        let link = message.link().clone();
        let tag = message.tag();

        if !self.powered {
            self.drop_message(tag, &link, DropReason::PoweredOff);
            return;
        }
        if self.is_stale(message.sender(), &link, message.sequence()) {
            self.drop_message(tag, &link, DropReason::Stale);
            return;
        }
        if self.faulted_links.contains(&link) {
            self.drop_message(tag, &link, DropReason::LinkDown);
            return;
        }
        self.stats.received += 1;
        let Some(port) = self.port(&link).cloned() else {
            self.ignore(tag, &link, "no interface on this link");
            return;
        };
        if let Some(protocol) = message.kind().protocol() {
            if !port.expected.contains(&protocol) {
                self.ignore(tag, &link, "protocol not configured toward this peer");
                return;
            }
        }

        match message.into_kind() {
            MessageKind::ArpRequest { sender_address } => {
                self.learn_neighbour(&link, port.peer.clone(), sender_address);
                let address = port.interface.address.map(|a| a.ip());
                self.send_on(&link, MessageKind::ArpReply { address });
            }
            MessageKind::ArpReply { address } => {
                self.learn_neighbour(&link, port.peer.clone(), address);
            }
            MessageKind::Hello { area, acknowledged } => {
                if self.record.ospf_area() != Some(area) {
                    self.ignore(tag, &link, "OSPF area mismatch");
                } else {
                    self.on_hello(&link, port.peer.clone(), acknowledged);
                }
            }
            MessageKind::BgpOpen { .. } => self.on_open(&link, port.peer.clone()),
            MessageKind::RouteUpdate { routes } => self.on_routes(&link, Protocol::Ospf, routes, tag),
            MessageKind::BgpUpdate { routes, .. } => self.on_routes(&link, Protocol::Bgp, routes, tag),
            MessageKind::Keepalive { protocol } => {
                if !self.refresh(&link, protocol) {
                    self.ignore(tag, &link, "no adjacency");
                }
            }
            MessageKind::LinkDownNotice { .. } | MessageKind::LinkUpNotice { .. } => {
                self.ignore(tag, &link, "notices travel on the control inbox");
            }
        }
        self.check_progress();
    }

    fn on_routes(&mut self, link: &LinkId, protocol: Protocol, routes: Vec<RouteAdvertisement>, tag: MessageTag) {
        if !self.refresh(link, protocol) {
            self.ignore(tag, link, "adjacency not up");
            return;
        }
        let key = (link.clone(), protocol);
        if self.received.get(&key) == Some(&routes) {
            return;
        }
        self.received.insert(key, routes);
        self.recompute_and_advertise();
    }

    fn on_tick(&mut self, tick: u64) {
        self.stats.ticks += 1;
        if !self.powered || self.state == LifecycleState::Uninitialized {
            return;
        }

        if self.state != LifecycleState::PoweredOn {
            let retry = self.ctx.config.arp_retry_ticks;
            let pending: Vec<LinkId> = self
                .usable_ports()
                .filter(|p| !self.arp.contains_key(&p.link))
                .filter(|p| {
                    self.last_arp
                        .get(&p.link)
                        .map(|t| tick.saturating_sub(*t) >= retry)
                        .unwrap_or(true)
                })
                .map(|p| p.link.clone())
                .collect();
            for link in pending {
                self.send_arp_request(&link);
            }
        }

        if !matches!(self.state, LifecycleState::PoweredOn | LifecycleState::ResolvingAddresses) {
            self.form_adjacencies(false);
            self.run_adjacency_timers(tick);
            self.advertise();
        }

        self.check_progress();
    }

    fn run_adjacency_timers(&mut self, tick: u64) {
        let keepalive = self.ctx.config.keepalive_interval_ticks;
        let hold = self.ctx.config.hold_time_ticks;
        let mut expired = Vec::new();
        let mut due = Vec::new();

        for ((link, protocol), adj) in self.adjacencies.iter_mut() {
            if adj.state != AdjacencyState::Up {
                continue;
            }
            if tick.saturating_sub(adj.last_heard) > hold {
                expired.push((link.clone(), *protocol));
            } else if tick.saturating_sub(adj.last_keepalive) >= keepalive {
                adj.last_keepalive = tick;
                due.push((link.clone(), *protocol));
            }
        }

        for (link, protocol) in due {
            self.send_on(&link, MessageKind::Keepalive { protocol });
        }
        if !expired.is_empty() {
            for (link, protocol) in &expired {
                self.teardown(link, *protocol, "hold timer expired");
            }
            self.recompute_and_advertise();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsim_core::{GraphBuilder, LinkStatus};
    use std::time::Duration;

    struct Harness {
        ctx: ActorContext,
        handles: BTreeMap<String, DeviceHandle>,
        acks: mpsc::UnboundedReceiver<NoticeAck>,
        status: HashMap<LinkId, watch::Sender<LinkStatus>>,
        driver: JoinHandle<()>,
    }

    fn pair_graph() -> TopologyGraph {
        GraphBuilder::new()
            .device("R1", DeviceRole::Router, |d| {
                d.hostname("r1")
                    .interface("g0/0", "10.0.12.1/30")
                    .interface("g0/1", "192.168.10.1/24")
                    .ospf(0)
            })
            .device("R2", DeviceRole::Router, |d| {
                d.hostname("r2")
                    .interface("g0/0", "10.0.12.2/30")
                    .interface("g0/1", "192.168.20.1/24")
                    .ospf(0)
            })
            .device("H1", DeviceRole::Host, |d| {
                d.hostname("h1")
                    .interface("eth0", "192.168.10.10/24")
                    .gateway("192.168.10.1")
            })
            .device("H2", DeviceRole::Host, |d| {
                d.hostname("h2")
                    .interface("eth0", "192.168.20.10/24")
                    .gateway("192.168.20.1")
            })
            .link("R1-R2", ("R1", "g0/0"), ("R2", "g0/0"))
            .link("R1-H1", ("R1", "g0/1"), ("H1", "eth0"))
            .link("R2-H2", ("R2", "g0/1"), ("H2", "eth0"))
            .build()
            .unwrap()
    }

    fn spawn_all(graph: &TopologyGraph) -> Harness {
        let config = Arc::new(EngineConfig::default().with_tick_interval_ms(2));
        let clock = Arc::new(Clock::new());
        let events = EventLog::new(clock.clone());
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for l in &graph.links {
            let (tx, rx) = watch::channel(l.status);
            senders.insert(l.id.clone(), tx);
            receivers.insert(l.id.clone(), rx);
        }
        let bus = Arc::new(MessageBus::new(
            graph,
            receivers,
            clock.clone(),
            events.clone(),
            config.link_latency_ticks,
            config.link_queue_capacity,
        ));
        let (acks_tx, acks) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        let ctx = ActorContext {
            config: config.clone(),
            bus: bus.clone(),
            clock: clock.clone(),
            events,
            acks: acks_tx,
            shutdown: shutdown.clone(),
        };
        let mut handles = BTreeMap::new();
        for id in graph.device_ids() {
            let (handle, _join) = DeviceActor::spawn(id.clone(), graph, ctx.clone()).unwrap();
            handles.insert(id.to_string(), handle);
        }
        let driver = crate::clock::spawn_driver(clock, bus, config.tick_interval(), shutdown.subscribe());
        Harness {
            ctx,
            handles,
            acks,
            status: senders,
            driver,
        }
    }

    async fn bring_up(h: &Harness) {
        for handle in h.handles.values() {
            handle.start().unwrap();
            handle.begin_resolution().unwrap();
        }
        for handle in h.handles.values() {
            tokio::time::timeout(Duration::from_secs(5), handle.wait_for(|s| s.is_operational()))
                .await
                .expect("device did not become operational")
                .unwrap();
        }
    }

    fn link(id: &str) -> LinkId {
        LinkId::new(id).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_is_idempotent() {
        let graph = pair_graph();
        let h = spawn_all(&graph);
        let r1 = &h.handles["R1"];
        r1.start().unwrap();
        r1.start().unwrap();
        let snap = r1
            .wait_for(|s| s.state == LifecycleState::PoweredOn)
            .await
            .unwrap();
        assert!(snap.powered);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(r1.state(), LifecycleState::PoweredOn);
        let _ = h.ctx.shutdown.send(());
        h.driver.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_router_bring_up_routes() {
        let graph = pair_graph();
        let h = spawn_all(&graph);
        bring_up(&h).await;

        let r1 = h.handles["R1"].clone();
        let snap = tokio::time::timeout(
            Duration::from_secs(5),
            r1.wait_for(|s| s.routing_table.lookup("192.168.20.10".parse().unwrap()).is_some()),
        )
        .await
        .unwrap()
        .unwrap();
        let route = snap.routing_table.lookup("192.168.20.10".parse().unwrap()).unwrap();
        assert_eq!(route.source, RouteSource::Ospf);
        assert_eq!(route.metric, 1);
        assert_eq!(snap.up_adjacencies().count(), 1);
        assert!(snap.timeouts.is_empty());

        let h1 = h.handles["H1"].snapshot();
        let default = h1.routing_table.lookup("8.8.8.8".parse().unwrap()).unwrap();
        assert_eq!(default.source, RouteSource::Static);
        let _ = h.ctx.shutdown.send(());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_link_down_notice_faults_both_ends() {
        let graph = pair_graph();
        let mut h = spawn_all(&graph);
        bring_up(&h).await;

        let l = link("R1-R2");
        h.status[&l].send_replace(LinkStatus::Down);
        for (seq, id) in ["R1", "R2"].iter().enumerate() {
            let notice = Message::new(
                ActorId::FaultInjector,
                l.clone(),
                seq as u64 + 1,
                MessageKind::LinkDownNotice { link: l.clone() },
            )
            .unwrap();
            h.handles[*id].notify(notice).unwrap();
        }
        for id in ["R1", "R2"] {
            let snap = h.handles[id]
                .wait_for(|s| s.state == LifecycleState::Faulted)
                .await
                .unwrap();
            assert!(snap.faulted_links.contains(&l));
            assert_eq!(snap.up_adjacencies().count(), 0);
        }
        let first = h.acks.recv().await.unwrap();
        let second = h.acks.recv().await.unwrap();
        assert_eq!(first.link, l);
        assert_ne!(first.device, second.device);

        let r1 = h.handles["R1"].snapshot();
        assert!(r1.routing_table.lookup("192.168.20.10".parse().unwrap()).is_none());
        let _ = h.ctx.shutdown.send(());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_power_off_faults_device() {
        let graph = pair_graph();
        let h = spawn_all(&graph);
        bring_up(&h).await;

        let h2 = &h.handles["H2"];
        h2.power_off().unwrap();
        let snap = h2.wait_for(|s| !s.powered).await.unwrap();
        assert_eq!(snap.state, LifecycleState::Faulted);
        assert!(snap.routing_table.is_empty());

        h2.power_on().unwrap();
        let snap = tokio::time::timeout(Duration::from_secs(5), h2.wait_for(|s| s.is_operational()))
            .await
            .unwrap()
            .unwrap();
        assert!(snap.powered);
        assert!(!snap.routing_table.is_empty());
        let _ = h.ctx.shutdown.send(());
    }

    fn arp_reply_from_r2(sequence: u64, address: &str) -> Message {
        Message::new(
            ActorId::Device(DeviceId::new("R2").unwrap()),
            link("R1-R2"),
            sequence,
            MessageKind::ArpReply {
                address: Some(address.parse().unwrap()),
            },
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_and_unpowered_messages_are_dropped_uncounted() {
        let graph = pair_graph();
        let h = spawn_all(&graph);
        let r1 = &h.handles["R1"];

        // Not started yet
        h.ctx.bus.deliver(arp_reply_from_r2(1, "10.0.12.7")).unwrap();
        let snap = r1.wait_for(|s| s.stats.dropped == 1).await.unwrap();
        assert_eq!(snap.stats.received, 0);
        assert!(snap.arp_table.is_empty());

        r1.start().unwrap();
        r1.wait_for(|s| s.powered).await.unwrap();
        h.ctx.bus.deliver(arp_reply_from_r2(5, "10.0.12.2")).unwrap();
        let before = r1.wait_for(|s| s.stats.received == 1).await.unwrap();
        let learned = before.arp_table[&link("R1-R2")].address;
        assert_eq!(learned, Some("10.0.12.2".parse().unwrap()));

        // Same and lower sequence on the same link from the same sender
        h.ctx.bus.deliver(arp_reply_from_r2(5, "10.0.12.9")).unwrap();
        h.ctx.bus.deliver(arp_reply_from_r2(4, "10.0.12.9")).unwrap();
        let after = r1.wait_for(|s| s.stats.dropped == 3).await.unwrap();
        assert_eq!(after.stats.received, 1);
        assert_eq!(after.arp_table[&link("R1-R2")].address, learned);
        assert_eq!(after.state, before.state);

        let r1_id = ActorId::Device(DeviceId::new("R1").unwrap());
        let drops = |wanted: DropReason| {
            h.ctx.events.count(|e| {
                e.actor == r1_id
                    && matches!(&e.kind, EventKind::MessageDropped { reason, .. } if *reason == wanted)
            })
        };
        assert_eq!(drops(DropReason::Stale), 2);
        assert_eq!(drops(DropReason::PoweredOff), 1);
        let _ = h.ctx.shutdown.send(());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handle_send_reports_missing_link() {
        let graph = pair_graph();
        let h = spawn_all(&graph);
        let err = h.handles["H1"]
            .send(
                &DeviceId::new("H2").unwrap(),
                MessageKind::ArpRequest { sender_address: None },
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::NoSuchLink { .. }));
        let _ = h.ctx.shutdown.send(());
    }
}
