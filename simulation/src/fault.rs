//! Fault injector and recovery controller
//!
//! The injector task is the only writer of link status: it owns every
//! `watch::Sender<LinkStatus>` and applies faults one request at a time.
//! Devices learn about changes through link-down/link-up notices on their
//! control inboxes and acknowledge each one. A recovery that arrives while
//! its fault still has unacknowledged notices is queued until they land.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use netsim_core::{
    ActorId, ControlError, DeviceId, EventKind, FaultTarget, LinkId, LinkStatus, Message, MessageKind,
    TopologyGraph,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actor::{DeviceHandle, NoticeAck};
use crate::clock::Clock;
use crate::events::EventLog;

/// Result of an inject or recover request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FaultOutcome {
    Injected { at: u64, links: Vec<LinkId> },
    /// Target was already down; nothing changed
    AlreadyDown,
    Recovered {
        fault_at: u64,
        recovered_at: u64,
        links: Vec<LinkId>,
    },
    /// Target was not faulted; nothing changed
    AlreadyUp,
}

impl FaultOutcome {
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::AlreadyDown | Self::AlreadyUp)
    }
}

/// A fault currently in effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveFault {
    pub target: FaultTarget,
    pub injected_at: u64,
    /// Links this fault holds down
    pub links: Vec<LinkId>,
    /// Every endpoint has applied the down notices
    pub settled: bool,
}

type Reply = oneshot::Sender<Result<FaultOutcome, ControlError>>;

#[derive(Debug)]
enum FaultRequest {
    Inject { target: FaultTarget, reply: Reply },
    Recover { target: FaultTarget, reply: Reply },
    Active { reply: oneshot::Sender<Vec<ActiveFault>> },
}

/// Cloneable handle to the injector task
#[derive(Debug, Clone)]
pub struct FaultHandle {
    requests: mpsc::Sender<FaultRequest>,
}

impl FaultHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> FaultRequest,
    ) -> Result<T, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| ControlError::ChannelClosed("fault injector".into()))?;
        rx.await
            .map_err(|_| ControlError::ChannelClosed("fault injector".into()))
    }

    /// Take a link or device down
    pub async fn inject(&self, target: FaultTarget) -> Result<FaultOutcome, ControlError> {
        self.request(|reply| FaultRequest::Inject { target, reply }).await?
    }

    /// Restore a faulted link or device. Waits for a pending fault on the
    /// same target to settle first.
    pub async fn recover(&self, target: FaultTarget) -> Result<FaultOutcome, ControlError> {
        self.request(|reply| FaultRequest::Recover { target, reply }).await?
    }

    pub async fn active(&self) -> Result<Vec<ActiveFault>, ControlError> {
        self.request(|reply| FaultRequest::Active { reply }).await
    }
}

#[derive(Debug)]
struct FaultState {
    fault: ActiveFault,
    /// Outstanding (device, link, sequence) acknowledgements
    pending: HashSet<(DeviceId, LinkId, u64)>,
    queued: Vec<Reply>,
}

/// Single writer of link status
pub struct FaultInjector {
    graph: Arc<TopologyGraph>,
    status: HashMap<LinkId, watch::Sender<LinkStatus>>,
    devices: BTreeMap<DeviceId, DeviceHandle>,
    clock: Arc<Clock>,
    events: EventLog,
    active: BTreeMap<FaultTarget, FaultState>,
    /// Fault that took each link down
    owner: HashMap<LinkId, FaultTarget>,
    prior: HashMap<LinkId, LinkStatus>,
    notice_sequence: HashMap<LinkId, u64>,
}

impl FaultInjector {
    pub fn new(
        graph: Arc<TopologyGraph>,
        status: HashMap<LinkId, watch::Sender<LinkStatus>>,
        devices: BTreeMap<DeviceId, DeviceHandle>,
        clock: Arc<Clock>,
        events: EventLog,
    ) -> Self {
        Self {
            graph,
            status,
            devices,
            clock,
            events,
            active: BTreeMap::new(),
            owner: HashMap::new(),
            prior: HashMap::new(),
            notice_sequence: HashMap::new(),
        }
    }

    /// Run the injector until shutdown
    pub fn spawn(
        self,
        acks: mpsc::UnboundedReceiver<NoticeAck>,
        shutdown: broadcast::Receiver<()>,
    ) -> (FaultHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let join = tokio::spawn(self.run(rx, acks, shutdown));
        (FaultHandle { requests: tx }, join)
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<FaultRequest>,
        mut acks: mpsc::UnboundedReceiver<NoticeAck>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(links = self.status.len(), "Fault injector started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                Some(ack) = acks.recv() => self.on_ack(ack),
                request = requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
            }
        }
        debug!(active = self.active.len(), "Fault injector stopped");
    }

    fn handle(&mut self, request: FaultRequest) {
        match request {
            FaultRequest::Inject { target, reply } => {
                let _ = reply.send(self.inject(target));
            }
            FaultRequest::Recover { target, reply } => {
                if let Err(e) = self.check_target(&target) {
                    let _ = reply.send(Err(e));
                    return;
                }
                match self.active.get_mut(&target) {
                    None => {
                        debug!(%target, "Recover on a target that is not faulted");
                        let _ = reply.send(Ok(FaultOutcome::AlreadyUp));
                    }
                    Some(state) if !state.fault.settled => {
                        info!(%target, pending = state.pending.len(), "Recovery queued until fault settles");
                        state.queued.push(reply);
                    }
                    Some(_) => {
                        let outcome = self.recover(&target);
                        let _ = reply.send(outcome);
                    }
                }
            }
            FaultRequest::Active { reply } => {
                let _ = reply.send(self.active.values().map(|s| s.fault.clone()).collect());
            }
        }
    }

    fn check_target(&self, target: &FaultTarget) -> Result<(), ControlError> {
        match target {
            FaultTarget::Link(link) if self.graph.link(link).is_none() => {
                Err(ControlError::NoSuchLink(link.clone()))
            }
            FaultTarget::Device(device) if self.graph.device(device).is_none() => {
                Err(ControlError::NoSuchDevice(device.clone()))
            }
            _ => Ok(()),
        }
    }

    fn current(&self, link: &LinkId) -> LinkStatus {
        self.status
            .get(link)
            .map(|tx| *tx.borrow())
            .unwrap_or(LinkStatus::Down)
    }

    fn next_sequence(&mut self, link: &LinkId) -> u64 {
        let seq = self.notice_sequence.entry(link.clone()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Send a notice about `link` to both endpoints. Returns the acks to await.
    fn notify_endpoints(&mut self, link: &LinkId, down: bool) -> Vec<(DeviceId, LinkId, u64)> {
        let Some(record) = self.graph.link(link).cloned() else {
            return Vec::new();
        };
        let mut expected = Vec::new();
        for endpoint in &record.endpoints {
            let Some(handle) = self.devices.get(&endpoint.device).cloned() else {
                continue;
            };
            let sequence = self.next_sequence(link);
            let kind = if down {
                MessageKind::LinkDownNotice { link: link.clone() }
            } else {
                MessageKind::LinkUpNotice { link: link.clone() }
            };
            let notice = match Message::new(ActorId::FaultInjector, link.clone(), sequence, kind) {
                Ok(notice) => notice,
                Err(e) => {
                    warn!(%link, error = %e, "Could not build notice");
                    continue;
                }
            };
            match handle.notify(notice) {
                Ok(()) => expected.push((endpoint.device.clone(), link.clone(), sequence)),
                Err(e) => warn!(device = %endpoint.device, error = %e, "Notice not delivered"),
            }
        }
        expected
    }

    fn take_down(&mut self, link: &LinkId, target: &FaultTarget) -> Vec<(DeviceId, LinkId, u64)> {
        let previous = self.current(link);
        if let Some(tx) = self.status.get(link) {
            tx.send_replace(LinkStatus::Down);
        }
        self.prior.insert(link.clone(), previous);
        self.owner.insert(link.clone(), target.clone());
        info!(%link, %previous, "Link down");
        self.notify_endpoints(link, true)
    }

    fn bring_back(&mut self, link: &LinkId) {
        let status = self.prior.remove(link).unwrap_or(LinkStatus::Up);
        if let Some(tx) = self.status.get(link) {
            tx.send_replace(status);
        }
        self.owner.remove(link);
        info!(%link, %status, "Link restored");
        self.notify_endpoints(link, false);
    }

    /// An active device fault on either end of `link`
    fn powered_off_endpoint(&self, link: &LinkId) -> Option<FaultTarget> {
        let record = self.graph.link(link)?;
        record
            .endpoints
            .iter()
            .map(|e| FaultTarget::Device(e.device.clone()))
            .find(|t| self.active.contains_key(t))
    }

    fn hand_over(&mut self, link: &LinkId, holder: FaultTarget) {
        if let Some(state) = self.active.get_mut(&holder) {
            if !state.fault.links.contains(link) {
                state.fault.links.push(link.clone());
            }
        }
        info!(%link, %holder, "Link stays down with device fault");
        self.owner.insert(link.clone(), holder);
    }

    fn inject(&mut self, target: FaultTarget) -> Result<FaultOutcome, ControlError> {
        self.check_target(&target)?;
        if self.active.contains_key(&target) {
            debug!(%target, "Fault already active");
            return Ok(FaultOutcome::AlreadyDown);
        }

        let at = self.clock.now();
        let mut links = Vec::new();
        let mut pending = HashSet::new();

        match &target {
            FaultTarget::Link(link) => {
                if self.current(link) == LinkStatus::Down {
                    debug!(%link, "Link already down");
                    return Ok(FaultOutcome::AlreadyDown);
                }
                pending.extend(self.take_down(link, &target));
                links.push(link.clone());
            }
            FaultTarget::Device(device) => {
                let powered = self
                    .devices
                    .get(device)
                    .map(|h| h.snapshot().powered)
                    .unwrap_or(false);
                if !powered {
                    debug!(%device, "Device already down");
                    return Ok(FaultOutcome::AlreadyDown);
                }
                let touching: Vec<LinkId> = self
                    .graph
                    .links_of(device)
                    .map(|l| l.id.clone())
                    .filter(|l| self.current(l) != LinkStatus::Down)
                    .collect();
                for link in touching {
                    pending.extend(self.take_down(&link, &target));
                    links.push(link);
                }
                // Links first, then the device itself
                if let Some(handle) = self.devices.get(device) {
                    if let Err(e) = handle.power_off() {
                        warn!(%device, error = %e, "Power-off not delivered");
                    }
                }
            }
        }

        warn!(%target, at, links = links.len(), "Fault injected");
        self.events.record(
            ActorId::FaultInjector,
            EventKind::FaultInjected {
                target: target.clone(),
            },
            format!("Fault injected on {}", target),
        );

        let settled = pending.is_empty();
        self.active.insert(
            target.clone(),
            FaultState {
                fault: ActiveFault {
                    target,
                    injected_at: at,
                    links: links.clone(),
                    settled,
                },
                pending,
                queued: Vec::new(),
            },
        );
        Ok(FaultOutcome::Injected { at, links })
    }

    fn recover(&mut self, target: &FaultTarget) -> Result<FaultOutcome, ControlError> {
        let Some(state) = self.active.remove(target) else {
            return Ok(FaultOutcome::AlreadyUp);
        };

        if let FaultTarget::Device(device) = target {
            if let Some(handle) = self.devices.get(device) {
                if let Err(e) = handle.power_on() {
                    warn!(%device, error = %e, "Power-on not delivered");
                }
            }
        }

        // Only links this fault owns; others stay down with their own fault.
        // A link whose far end is still powered off passes to that device's fault.
        let mut restored = Vec::new();
        for link in &state.fault.links {
            if self.owner.get(link) != Some(target) {
                continue;
            }
            match self.powered_off_endpoint(link) {
                Some(holder) => self.hand_over(link, holder),
                None => {
                    self.bring_back(link);
                    restored.push(link.clone());
                }
            }
        }

        let recovered_at = self.clock.now();
        info!(%target, fault_at = state.fault.injected_at, recovered_at, "Fault recovered");
        self.events.record(
            ActorId::FaultInjector,
            EventKind::FaultRecovered {
                target: target.clone(),
            },
            format!("Recovered {}", target),
        );

        for extra in state.queued {
            let _ = extra.send(Ok(FaultOutcome::AlreadyUp));
        }
        Ok(FaultOutcome::Recovered {
            fault_at: state.fault.injected_at,
            recovered_at,
            links: restored,
        })
    }

    fn on_ack(&mut self, ack: NoticeAck) {
        let key = (ack.device, ack.link, ack.sequence);
        let mut ready = None;
        for (target, state) in self.active.iter_mut() {
            if state.pending.remove(&key) {
                if state.pending.is_empty() && !state.fault.settled {
                    state.fault.settled = true;
                    debug!(%target, "Fault settled");
                    if !state.queued.is_empty() {
                        ready = Some(target.clone());
                    }
                }
                break;
            }
        }

        if let Some(target) = ready {
            let mut queued = self
                .active
                .get_mut(&target)
                .map(|s| std::mem::take(&mut s.queued))
                .unwrap_or_default();
            let outcome = self.recover(&target);
            if !queued.is_empty() {
                let first = queued.remove(0);
                let _ = first.send(outcome);
            }
            for extra in queued {
                let _ = extra.send(Ok(FaultOutcome::AlreadyUp));
            }
        }
    }
}
