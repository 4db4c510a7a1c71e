//! Protocol messages exchanged between device actors
//!
//! The message set is closed. Payloads are checked once in
//! [`Message::new`], so a `Message` in hand is always well formed.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::device::Protocol;
use crate::error::ProtocolError;
use crate::identity::{ActorId, LinkId};

/// Hop count that means unreachable
pub const METRIC_INFINITY: u32 = 16;

/// One prefix in a routing advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAdvertisement {
    pub prefix: Ipv4Network,
    pub metric: u32,
}

impl RouteAdvertisement {
    pub fn new(prefix: Ipv4Network, metric: u32) -> Self {
        Self { prefix, metric }
    }

    pub fn is_withdrawal(&self) -> bool {
        self.metric >= METRIC_INFINITY
    }
}

/// Message payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MessageKind {
    ArpRequest {
        sender_address: Option<Ipv4Addr>,
    },
    ArpReply {
        address: Option<Ipv4Addr>,
    },
    /// OSPF-style hello. `acknowledged` is set once the sender has heard
    /// the receiver, which completes the two-way check.
    Hello {
        area: u32,
        acknowledged: bool,
    },
    /// Full table for the link (LSA)
    RouteUpdate {
        routes: Vec<RouteAdvertisement>,
    },
    BgpOpen {
        asn: u32,
    },
    BgpUpdate {
        asn: u32,
        routes: Vec<RouteAdvertisement>,
    },
    Keepalive {
        protocol: Protocol,
    },
    LinkDownNotice {
        link: LinkId,
    },
    LinkUpNotice {
        link: LinkId,
    },
}

/// Payload-free message discriminant, used in events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageTag {
    ArpRequest,
    ArpReply,
    Hello,
    RouteUpdate,
    BgpOpen,
    BgpUpdate,
    Keepalive,
    LinkDownNotice,
    LinkUpNotice,
}

impl MessageTag {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageTag::ArpRequest => "arp-request",
            MessageTag::ArpReply => "arp-reply",
            MessageTag::Hello => "hello",
            MessageTag::RouteUpdate => "route-update",
            MessageTag::BgpOpen => "bgp-open",
            MessageTag::BgpUpdate => "bgp-update",
            MessageTag::Keepalive => "keepalive",
            MessageTag::LinkDownNotice => "link-down-notice",
            MessageTag::LinkUpNotice => "link-up-notice",
        }
    }

    pub fn is_notice(self) -> bool {
        matches!(self, MessageTag::LinkDownNotice | MessageTag::LinkUpNotice)
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MessageKind {
    pub fn tag(&self) -> MessageTag {
        match self {
            MessageKind::ArpRequest { .. } => MessageTag::ArpRequest,
            MessageKind::ArpReply { .. } => MessageTag::ArpReply,
            MessageKind::Hello { .. } => MessageTag::Hello,
            MessageKind::RouteUpdate { .. } => MessageTag::RouteUpdate,
            MessageKind::BgpOpen { .. } => MessageTag::BgpOpen,
            MessageKind::BgpUpdate { .. } => MessageTag::BgpUpdate,
            MessageKind::Keepalive { .. } => MessageTag::Keepalive,
            MessageKind::LinkDownNotice { .. } => MessageTag::LinkDownNotice,
            MessageKind::LinkUpNotice { .. } => MessageTag::LinkUpNotice,
        }
    }

    /// Routing protocol the message belongs to, if any
    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            MessageKind::Hello { .. } | MessageKind::RouteUpdate { .. } => Some(Protocol::Ospf),
            MessageKind::BgpOpen { .. } | MessageKind::BgpUpdate { .. } => Some(Protocol::Bgp),
            MessageKind::Keepalive { protocol } => Some(*protocol),
            _ => None,
        }
    }

    /// Check payload constraints
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            MessageKind::BgpOpen { asn } => check_asn(*asn),
            MessageKind::BgpUpdate { asn, routes } => {
                check_asn(*asn)?;
                check_routes(routes)
            }
            MessageKind::RouteUpdate { routes } => check_routes(routes),
            _ => Ok(()),
        }
    }
}

fn check_asn(asn: u32) -> Result<(), ProtocolError> {
    if asn == 0 {
        return Err(ProtocolError::InvalidAsn(asn));
    }
    Ok(())
}

fn check_routes(routes: &[RouteAdvertisement]) -> Result<(), ProtocolError> {
    let mut seen = HashSet::with_capacity(routes.len());
    for route in routes {
        if route.metric > METRIC_INFINITY {
            return Err(ProtocolError::MetricOutOfRange {
                prefix: route.prefix.to_string(),
                metric: route.metric,
                infinity: METRIC_INFINITY,
            });
        }
        if !seen.insert((route.prefix.network(), route.prefix.prefix())) {
            return Err(ProtocolError::DuplicatePrefix(route.prefix.to_string()));
        }
    }
    Ok(())
}

/// A message in flight on a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    sender: ActorId,
    link: LinkId,
    sequence: u64,
    kind: MessageKind,
}

impl Message {
    /// Build a validated message.
    ///
    /// Notices must come from the fault injector and name the link they
    /// travel on; everything else must come from a device.
    pub fn new(
        sender: ActorId,
        link: LinkId,
        sequence: u64,
        kind: MessageKind,
    ) -> Result<Self, ProtocolError> {
        kind.validate()?;
        match &kind {
            MessageKind::LinkDownNotice { link: notice } | MessageKind::LinkUpNotice { link: notice } => {
                if sender != ActorId::FaultInjector {
                    return Err(ProtocolError::WrongSender {
                        kind: kind.tag().as_str(),
                        expected: "fault-injector",
                    });
                }
                if notice != &link {
                    return Err(ProtocolError::NoticeLinkMismatch {
                        notice: notice.clone(),
                        carrier: link,
                    });
                }
            }
            _ => {
                if sender.device().is_none() {
                    return Err(ProtocolError::WrongSender {
                        kind: kind.tag().as_str(),
                        expected: "device",
                    });
                }
            }
        }
        Ok(Self {
            sender,
            link,
            sequence,
            kind,
        })
    }

    pub fn sender(&self) -> &ActorId {
        &self.sender
    }

    pub fn link(&self) -> &LinkId {
        &self.link
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn tag(&self) -> MessageTag {
        self.kind.tag()
    }

    pub fn into_kind(self) -> MessageKind {
        self.kind
    }
}
