//! Relay Module for P2Proxy
//!
//! Splices an inbound duplex stream (TCP or overlay) with a lazily dialed
//! outbound one, and tracks every relay's lifecycle.

pub mod engine;
mod pipe;
pub mod registry;

pub use engine::{RelayEngine, RelayHandle, RelayState};
pub use registry::{
    ConnectionEvent, ConnectionRegistry, ConnectionTicket, PeerDescriptor, ProxyStats, RelayStats,
};
