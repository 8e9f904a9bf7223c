//! Network Behaviour for P2Proxy
//!
//! Combines libp2p protocols for the overlay:
//! - Identify: Peer info exchange
//! - Ping: Connection liveness (driven by the configured keep-alive)
//! - mDNS: Local network discovery (optional)
//! - Relay/DCUtR: NAT traversal
//! - Stream: Raw bidirectional streams for tunnel data

use libp2p::{
    dcutr,
    identify,
    mdns,
    ping,
    relay,
    swarm::{NetworkBehaviour, behaviour::toggle::Toggle},
    StreamProtocol,
};

/// The protocol identifier for P2Proxy tunnel streams
pub const TUNNEL_PROTOCOL: StreamProtocol = StreamProtocol::new("/p2proxy/tunnel/1.0.0");

/// Combined network behaviour for an overlay node
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "OverlayBehaviourEvent")]
pub struct OverlayBehaviour {
    /// Identify protocol for peer info exchange
    pub identify: identify::Behaviour,
    /// Ping protocol for connection liveness
    pub ping: ping::Behaviour,
    /// mDNS for local network discovery
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    /// Relay client for NAT traversal
    pub relay: relay::client::Behaviour,
    /// DCUtR for hole punching
    pub dcutr: dcutr::Behaviour,
    /// Stream behaviour for raw tunnel streams
    pub stream: libp2p_stream::Behaviour,
}

/// Events emitted by the overlay behaviour
#[derive(Debug)]
pub enum OverlayBehaviourEvent {
    Identify(identify::Event),
    Ping(ping::Event),
    Mdns(mdns::Event),
    Relay(relay::client::Event),
    Dcutr(dcutr::Event),
    /// `libp2p_stream::Behaviour` never emits; its event type is `()`
    Stream,
}

impl From<identify::Event> for OverlayBehaviourEvent {
    fn from(event: identify::Event) -> Self {
        OverlayBehaviourEvent::Identify(event)
    }
}

impl From<ping::Event> for OverlayBehaviourEvent {
    fn from(event: ping::Event) -> Self {
        OverlayBehaviourEvent::Ping(event)
    }
}

impl From<mdns::Event> for OverlayBehaviourEvent {
    fn from(event: mdns::Event) -> Self {
        OverlayBehaviourEvent::Mdns(event)
    }
}

impl From<relay::client::Event> for OverlayBehaviourEvent {
    fn from(event: relay::client::Event) -> Self {
        OverlayBehaviourEvent::Relay(event)
    }
}

impl From<dcutr::Event> for OverlayBehaviourEvent {
    fn from(event: dcutr::Event) -> Self {
        OverlayBehaviourEvent::Dcutr(event)
    }
}

// Required by the derive for the `stream` field
impl From<()> for OverlayBehaviourEvent {
    fn from(_: ()) -> Self {
        OverlayBehaviourEvent::Stream
    }
}
