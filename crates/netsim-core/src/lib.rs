//! # Netsim Core
//!
//! Data model, identities, messages, events, and errors for the
//! enterprise network simulator.
//!
//! The engine itself lives in `netsim-simulation`; this crate holds the
//! types every part of it shares, plus the topology graph it consumes.
//!
//! ## Key Types
//!
//! - [`TopologyGraph`]: Devices, links, and validator warnings
//! - [`LifecycleState`]: Device lifecycle with its transition table
//! - [`Message`]: Validated protocol message on a link
//! - [`SimulationEvent`]: Entry of the append-only event log
//! - [`DeviceSnapshot`]: Immutable view of a running device

pub mod device;
pub mod error;
pub mod event;
pub mod graph;
pub mod identity;
pub mod lifecycle;
pub mod link;
pub mod message;
pub mod routing;

// Re-export main types
pub use device::*;
pub use error::*;
pub use event::*;
pub use graph::*;
pub use identity::*;
pub use lifecycle::*;
pub use link::*;
pub use message::*;
pub use routing::*;
