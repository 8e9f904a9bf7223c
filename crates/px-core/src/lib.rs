//! P2Proxy Core Library
//!
//! This crate provides the core logic shared by both ends of a P2Proxy tunnel.
//! It includes:
//! - Seed-derived identity and the same-seed admission policy
//! - libp2p overlay node with QUIC transport and NAT traversal
//! - Authenticated tunnel streams
//! - The relay engine and connection registry

pub mod brand;
pub mod config;
pub mod error;
pub mod network;
pub mod relay;

pub use config::{ProxyConfig, Role};
pub use error::{P2ProxyError, Result};
pub use network::{
    open_tunnel, Firewall, OverlayNode, Seed, SeedIdentity, TransportConfig, TunnelStream,
    TUNNEL_PROTOCOL,
};
pub use relay::{
    ConnectionEvent, ConnectionRegistry, PeerDescriptor, ProxyStats, RelayEngine, RelayHandle,
    RelayState, RelayStats,
};

// Re-export libp2p types we expose
pub use libp2p::{identity::PublicKey, Multiaddr, PeerId};
