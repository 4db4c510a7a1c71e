//! Message bus between device actors
//!
//! Each link has one FIFO queue per direction. Sequence numbers are
//! assigned under the link lock, so they strictly increase per
//! (sender, link) and the queue preserves that order. Messages wait
//! `link_latency_ticks` on the link; the clock driver releases them with
//! [`MessageBus::deliver_due`]. Nothing here blocks: a full queue or a full
//! inbox drops the message and logs it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use netsim_core::{
    ActorId, DeviceId, DropReason, EventKind, LinkId, LinkRecord, LinkSnapshot, LinkStatus, Message,
    MessageKind, TopologyGraph, TransportError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::events::EventLog;

#[derive(Debug)]
struct InFlight {
    due: u64,
    message: Message,
}

#[derive(Debug, Default)]
struct LinkQueues {
    /// Indexed by receiving endpoint
    queues: [VecDeque<InFlight>; 2],
    /// Last sequence per sending endpoint
    sequences: [u64; 2],
    delivered: u64,
    dropped: u64,
}

#[derive(Debug)]
struct LinkChannel {
    record: LinkRecord,
    status: watch::Receiver<LinkStatus>,
    queues: Mutex<LinkQueues>,
}

impl LinkChannel {
    fn side_of(&self, device: &DeviceId) -> Option<usize> {
        self.record.endpoints.iter().position(|e| &e.device == device)
    }

    fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }
}

/// Aggregate bus counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub in_flight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Per-link, per-direction FIFO transport
#[derive(Debug)]
pub struct MessageBus {
    links: HashMap<LinkId, LinkChannel>,
    inboxes: DashMap<DeviceId, mpsc::Sender<Message>>,
    clock: Arc<Clock>,
    events: EventLog,
    latency_ticks: u64,
    queue_capacity: usize,
    counters: Counters,
}

impl MessageBus {
    /// Build the bus over a graph's links. `status` must hold a receiver
    /// for every link.
    pub fn new(
        graph: &TopologyGraph,
        mut status: HashMap<LinkId, watch::Receiver<LinkStatus>>,
        clock: Arc<Clock>,
        events: EventLog,
        latency_ticks: u64,
        queue_capacity: usize,
    ) -> Self {
        let links = graph
            .links
            .iter()
            .map(|record| {
                let rx = status.remove(&record.id).unwrap_or_else(|| {
                    // No injector owns this link; it keeps its initial status
                    let (_tx, rx) = watch::channel(record.status);
                    rx
                });
                (
                    record.id.clone(),
                    LinkChannel {
                        record: record.clone(),
                        status: rx,
                        queues: Mutex::new(LinkQueues::default()),
                    },
                )
            })
            .collect();

        Self {
            links,
            inboxes: DashMap::new(),
            clock,
            events,
            latency_ticks,
            queue_capacity,
            counters: Counters::default(),
        }
    }

    /// Attach a device's data-plane inbox
    pub fn register(&self, device: DeviceId, inbox: mpsc::Sender<Message>) {
        self.inboxes.insert(device, inbox);
    }

    pub fn unregister(&self, device: &DeviceId) {
        self.inboxes.remove(device);
    }

    pub fn link_status(&self, link: &LinkId) -> Option<LinkStatus> {
        self.links.get(link).map(|c| c.status())
    }

    /// Subscribe to status changes of a link
    pub fn watch_link(&self, link: &LinkId) -> Option<watch::Receiver<LinkStatus>> {
        self.links.get(link).map(|c| c.status.clone())
    }

    /// Links connecting two devices, in graph order
    pub fn links_between(&self, a: &DeviceId, b: &DeviceId) -> Vec<LinkId> {
        let mut found: Vec<&LinkChannel> = self
            .links
            .values()
            .filter(|c| c.record.connects(a, b))
            .collect();
        found.sort_by(|x, y| x.record.id.cmp(&y.record.id));
        found.into_iter().map(|c| c.record.id.clone()).collect()
    }

    /// Send to the device across a link, picking the first usable one
    pub fn send(&self, from: &DeviceId, peer: &DeviceId, kind: MessageKind) -> Result<u64, TransportError> {
        let candidates = self.links_between(from, peer);
        if candidates.is_empty() {
            return Err(TransportError::NoSuchLink {
                from: from.clone(),
                to: peer.clone(),
            });
        }
        let usable = candidates
            .iter()
            .find(|id| self.link_status(id).map(LinkStatus::is_usable).unwrap_or(false));
        match usable {
            Some(link) => self.send_on(from, link, kind),
            None => {
                let link = candidates[0].clone();
                self.note_drop(from, &link, kind.tag(), DropReason::LinkDown);
                Err(TransportError::LinkDown(link))
            }
        }
    }

    /// Send on a specific link
    pub fn send_on(&self, from: &DeviceId, link: &LinkId, kind: MessageKind) -> Result<u64, TransportError> {
        let channel = self
            .links
            .get(link)
            .ok_or_else(|| TransportError::UnknownLink(link.clone()))?;
        let side = channel
            .side_of(from)
            .ok_or_else(|| TransportError::NotAnEndpoint {
                device: from.clone(),
                link: link.clone(),
            })?;
        let tag = kind.tag();
        if !channel.status().is_usable() {
            self.note_drop(from, link, tag, DropReason::LinkDown);
            return Err(TransportError::LinkDown(link.clone()));
        }
        let receiver = channel.record.endpoints[1 - side].device.clone();

        let message = {
            let mut queues = channel.queues.lock();
            if self.latency_ticks > 0 && queues.queues[1 - side].len() >= self.queue_capacity {
                queues.dropped += 1;
                drop(queues);
                self.note_drop(from, link, tag, DropReason::Backpressure);
                return Err(TransportError::Backpressure {
                    link: link.clone(),
                    receiver,
                });
            }
            let sequence = queues.sequences[side] + 1;
            let message = Message::new(ActorId::Device(from.clone()), link.clone(), sequence, kind)?;
            queues.sequences[side] = sequence;
            self.counters.sent.fetch_add(1, Ordering::Relaxed);

            if self.latency_ticks > 0 {
                let due = self.clock.now() + self.latency_ticks;
                trace!(%link, %from, %receiver, sequence, due, message = %tag, "queued");
                queues.queues[1 - side].push_back(InFlight { due, message });
                return Ok(sequence);
            }
            message
        };

        let sequence = message.sequence();
        self.deliver(message)?;
        Ok(sequence)
    }

    /// Hand a message to the receiving device's inbox
    pub fn deliver(&self, message: Message) -> Result<(), TransportError> {
        let link = message.link().clone();
        let channel = self
            .links
            .get(&link)
            .ok_or_else(|| TransportError::UnknownLink(link.clone()))?;
        let sender = match message.sender() {
            ActorId::Device(id) => id.clone(),
            _ => {
                return Err(TransportError::Protocol(netsim_core::ProtocolError::WrongSender {
                    kind: message.tag().as_str(),
                    expected: "device",
                }));
            }
        };
        let side = channel
            .side_of(&sender)
            .ok_or_else(|| TransportError::NotAnEndpoint {
                device: sender.clone(),
                link: link.clone(),
            })?;
        let receiver = channel.record.endpoints[1 - side].device.clone();
        let tag = message.tag();

        if !channel.status().is_usable() {
            channel.queues.lock().dropped += 1;
            self.note_drop(&sender, &link, tag, DropReason::LinkDown);
            return Err(TransportError::LinkDown(link));
        }

        let inbox = match self.inboxes.get(&receiver) {
            Some(entry) => entry.value().clone(),
            None => {
                channel.queues.lock().dropped += 1;
                self.note_drop(&sender, &link, tag, DropReason::Closed);
                return Err(TransportError::InboxClosed(receiver));
            }
        };

        match inbox.try_send(message) {
            Ok(()) => {
                channel.queues.lock().delivered += 1;
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                channel.queues.lock().dropped += 1;
                self.note_drop(&sender, &link, tag, DropReason::Backpressure);
                Err(TransportError::Backpressure { link, receiver })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                channel.queues.lock().dropped += 1;
                self.note_drop(&sender, &link, tag, DropReason::Closed);
                Err(TransportError::InboxClosed(receiver))
            }
        }
    }

    /// Release every message due at or before `tick`. Returns how many were
    /// handed on (delivered or dropped).
    pub fn deliver_due(&self, tick: u64) -> usize {
        let mut released = 0;
        let mut ids: Vec<&LinkId> = self.links.keys().collect();
        ids.sort();
        for id in ids {
            let channel = &self.links[id];
            let due: Vec<Message> = {
                let mut queues = channel.queues.lock();
                let mut due = Vec::new();
                for queue in queues.queues.iter_mut() {
                    while queue.front().map(|f| f.due <= tick).unwrap_or(false) {
                        if let Some(in_flight) = queue.pop_front() {
                            due.push(in_flight.message);
                        }
                    }
                }
                due
            };
            for message in due {
                released += 1;
                if let Err(e) = self.deliver(message) {
                    debug!(link = %id, error = %e, "delivery failed");
                }
            }
        }
        released
    }

    /// Drop everything still queued, e.g. on shutdown
    pub fn discard_in_flight(&self) -> usize {
        let mut discarded = 0;
        for channel in self.links.values() {
            let mut queues = channel.queues.lock();
            let mut on_link = 0;
            for queue in queues.queues.iter_mut() {
                on_link += queue.len();
                queue.clear();
            }
            queues.dropped += on_link as u64;
            discarded += on_link;
        }
        self.counters
            .dropped
            .fetch_add(discarded as u64, Ordering::Relaxed);
        discarded
    }

    pub fn stats(&self) -> BusStats {
        let in_flight = self
            .links
            .values()
            .map(|c| {
                let q = c.queues.lock();
                (q.queues[0].len() + q.queues[1].len()) as u64
            })
            .sum();
        BusStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            in_flight,
        }
    }

    pub fn link_snapshot(&self, link: &LinkId) -> Option<LinkSnapshot> {
        let channel = self.links.get(link)?;
        let queues = channel.queues.lock();
        Some(LinkSnapshot {
            id: channel.record.id.clone(),
            endpoints: channel.record.endpoints.clone(),
            capacity_mbps: channel.record.capacity_mbps,
            status: channel.status(),
            in_flight: queues.queues[0].len() + queues.queues[1].len(),
            delivered: queues.delivered,
            dropped: queues.dropped,
        })
    }

    /// Snapshots of every link, ordered by id
    pub fn link_snapshots(&self) -> Vec<LinkSnapshot> {
        let mut ids: Vec<&LinkId> = self.links.keys().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| self.link_snapshot(id)).collect()
    }

    fn note_drop(&self, from: &DeviceId, link: &LinkId, tag: netsim_core::MessageTag, reason: DropReason) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(%from, %link, message = %tag, %reason, "message dropped");
        self.events.record(
            ActorId::Transport,
            EventKind::MessageDropped {
                message: tag,
                link: link.clone(),
                reason,
            },
            format!("{} from {} on {} dropped: {}", tag, from, link, reason),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsim_core::{DeviceRole, GraphBuilder};

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    fn link(id: &str) -> LinkId {
        LinkId::new(id).unwrap()
    }

    fn graph() -> TopologyGraph {
        GraphBuilder::new()
            .device("R1", DeviceRole::Router, |d| {
                d.interface("g0/0", "10.0.12.1/30").interface("g0/1", "10.0.13.1/30")
            })
            .device("R2", DeviceRole::Router, |d| d.interface("g0/0", "10.0.12.2/30"))
            .device("R3", DeviceRole::Router, |d| d.interface("g0/0", "10.0.13.2/30"))
            .link("R1-R2", ("R1", "g0/0"), ("R2", "g0/0"))
            .link("R1-R3", ("R1", "g0/1"), ("R3", "g0/0"))
            .build()
            .unwrap()
    }

    struct Fixture {
        bus: MessageBus,
        clock: Arc<Clock>,
        events: EventLog,
        status: HashMap<LinkId, watch::Sender<LinkStatus>>,
    }

    fn fixture(latency: u64, capacity: usize) -> Fixture {
        let graph = graph();
        let clock = Arc::new(Clock::new());
        let events = EventLog::new(clock.clone());
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for l in &graph.links {
            let (tx, rx) = watch::channel(l.status);
            senders.insert(l.id.clone(), tx);
            receivers.insert(l.id.clone(), rx);
        }
        let bus = MessageBus::new(&graph, receivers, clock.clone(), events.clone(), latency, capacity);
        Fixture {
            bus,
            clock,
            events,
            status: senders,
        }
    }

    fn hello() -> MessageKind {
        MessageKind::Hello {
            area: 0,
            acknowledged: false,
        }
    }

    #[test]
    fn test_fifo_per_sender_and_link() {
        let f = fixture(1, 64);
        let (tx, mut rx) = mpsc::channel(64);
        f.bus.register(dev("R2"), tx);

        for _ in 0..10 {
            f.bus.send(&dev("R1"), &dev("R2"), hello()).unwrap();
        }
        assert!(rx.try_recv().is_err());

        let tick = f.clock.advance().unwrap();
        assert_eq!(f.bus.deliver_due(tick), 10);

        let mut last = 0;
        while let Ok(msg) = rx.try_recv() {
            assert!(msg.sequence() > last);
            assert_eq!(msg.link(), &link("R1-R2"));
            last = msg.sequence();
        }
        assert_eq!(last, 10);
    }

    #[test]
    fn test_no_such_link() {
        let f = fixture(0, 8);
        let err = f.bus.send(&dev("R2"), &dev("R3"), hello()).unwrap_err();
        assert!(matches!(err, TransportError::NoSuchLink { .. }));
    }

    #[test]
    fn test_send_on_down_link_drops() {
        let f = fixture(0, 8);
        let (tx, mut rx) = mpsc::channel(8);
        f.bus.register(dev("R2"), tx);
        f.status[&link("R1-R2")].send_replace(LinkStatus::Down);

        let err = f.bus.send(&dev("R1"), &dev("R2"), hello()).unwrap_err();
        assert!(matches!(err, TransportError::LinkDown(_)));
        assert!(rx.try_recv().is_err());
        assert_eq!(
            f.events.count(|e| matches!(
                e.kind,
                EventKind::MessageDropped {
                    reason: DropReason::LinkDown,
                    ..
                }
            )),
            1
        );
    }

    #[test]
    fn test_queued_message_dropped_when_link_fails() {
        let f = fixture(2, 8);
        let (tx, mut rx) = mpsc::channel(8);
        f.bus.register(dev("R2"), tx);

        f.bus.send(&dev("R1"), &dev("R2"), hello()).unwrap();
        f.status[&link("R1-R2")].send_replace(LinkStatus::Down);
        f.clock.advance();
        let tick = f.clock.advance().unwrap();
        assert_eq!(f.bus.deliver_due(tick), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(f.bus.link_snapshot(&link("R1-R2")).unwrap().dropped, 1);
    }

    #[test]
    fn test_degraded_link_still_carries() {
        let f = fixture(0, 8);
        let (tx, mut rx) = mpsc::channel(8);
        f.bus.register(dev("R3"), tx);
        f.status[&link("R1-R3")].send_replace(LinkStatus::Degraded);
        f.bus.send(&dev("R1"), &dev("R3"), hello()).unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_backpressure_on_full_queue_and_inbox() {
        let f = fixture(1, 2);
        let (tx, _rx) = mpsc::channel(1);
        f.bus.register(dev("R2"), tx);

        f.bus.send(&dev("R1"), &dev("R2"), hello()).unwrap();
        f.bus.send(&dev("R1"), &dev("R2"), hello()).unwrap();
        let err = f.bus.send(&dev("R1"), &dev("R2"), hello()).unwrap_err();
        assert!(matches!(err, TransportError::Backpressure { .. }));

        // Inbox holds one; the second release overflows it
        let tick = f.clock.advance().unwrap();
        f.bus.deliver_due(tick);
        let stats = f.bus.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn test_not_an_endpoint() {
        let f = fixture(0, 8);
        let err = f.bus.send_on(&dev("R2"), &link("R1-R3"), hello()).unwrap_err();
        assert!(matches!(err, TransportError::NotAnEndpoint { .. }));
        let err = f.bus.send_on(&dev("R1"), &link("nope"), hello()).unwrap_err();
        assert!(matches!(err, TransportError::UnknownLink(_)));
    }

    #[test]
    fn test_invalid_payload_rejected_before_queueing() {
        let f = fixture(1, 8);
        let err = f
            .bus
            .send(&dev("R1"), &dev("R2"), MessageKind::BgpOpen { asn: 0 })
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
        assert_eq!(f.bus.stats().in_flight, 0);
    }
}
