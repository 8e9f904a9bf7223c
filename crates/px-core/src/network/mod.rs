//! Overlay networking: seed identity, libp2p swarm, tunnel handshake

pub mod behaviour;
pub mod identity;
pub mod node;
pub mod transport;
pub mod tunnel;

pub use behaviour::TUNNEL_PROTOCOL;
pub use identity::{Firewall, Seed, SeedIdentity};
pub use node::OverlayNode;
pub use transport::TransportConfig;
pub use tunnel::{open_tunnel, TunnelStream};
