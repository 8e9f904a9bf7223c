//! Connection Registry
//!
//! Hands out relay ids and publishes the open/close lifecycle of every relay.
//! A [`ConnectionTicket`] is issued on open; closing it (or dropping it)
//! publishes the matching close, so each id sees exactly one of each.

use libp2p::PeerId;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the lifecycle event channel
const EVENT_CAPACITY: usize = 1024;

/// Who is on the inbound side of a relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerDescriptor {
    /// A local TCP client of the entry point
    Tcp(SocketAddr),
    /// An authenticated overlay peer of the exposer
    Overlay {
        /// Peer ID of the public key the remote proved
        identity: PeerId,
        /// Transport peer ID of the overlay connection
        transport: PeerId,
    },
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerDescriptor::Tcp(addr) => write!(f, "{}", addr),
            PeerDescriptor::Overlay { identity, transport } => write!(f, "{} via {}", identity, transport),
        }
    }
}

/// Bytes moved by one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Inbound to outbound
    pub upstream_bytes: u64,
    /// Outbound to inbound
    pub downstream_bytes: u64,
}

impl RelayStats {
    pub fn total(&self) -> u64 {
        self.upstream_bytes + self.downstream_bytes
    }
}

/// Relay lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened { id: u64, peer: PeerDescriptor },
    Closed { id: u64, peer: PeerDescriptor, stats: RelayStats },
}

impl ConnectionEvent {
    pub fn id(&self) -> u64 {
        match self {
            ConnectionEvent::Opened { id, .. } | ConnectionEvent::Closed { id, .. } => *id,
        }
    }

    pub fn peer(&self) -> &PeerDescriptor {
        match self {
            ConnectionEvent::Opened { peer, .. } | ConnectionEvent::Closed { peer, .. } => peer,
        }
    }
}

/// Statistics for a service
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub bytes_upstream: AtomicU64,
    pub bytes_downstream: AtomicU64,
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
}

impl ProxyStats {
    fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self, stats: &RelayStats) {
        self.bytes_upstream.fetch_add(stats.upstream_bytes, Ordering::Relaxed);
        self.bytes_downstream.fetch_add(stats.downstream_bytes, Ordering::Relaxed);
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get_bytes_upstream(&self) -> u64 {
        self.bytes_upstream.load(Ordering::Relaxed)
    }

    pub fn get_bytes_downstream(&self) -> u64 {
        self.bytes_downstream.load(Ordering::Relaxed)
    }

    pub fn get_total_connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn get_active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }
}

struct RegistryInner {
    next_id: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
    stats: ProxyStats,
}

/// Id allocator and lifecycle event source, one per service
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(0),
                events,
                stats: ProxyStats::default(),
            }),
        }
    }

    /// Subscribe to lifecycle events published after this call.
    /// A receiver that falls more than the channel capacity behind loses events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.inner.stats
    }

    /// Register a new relay: assigns its id and publishes `Opened`
    pub fn open(&self, peer: PeerDescriptor) -> ConnectionTicket {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.connection_opened();

        debug!("Connection {} opened with {}", id, peer);
        let _ = self.inner.events.send(ConnectionEvent::Opened { id, peer: peer.clone() });

        ConnectionTicket {
            id,
            peer: Some(peer),
            registry: self.clone(),
        }
    }

    fn publish_close(&self, id: u64, peer: PeerDescriptor, stats: RelayStats) {
        self.inner.stats.connection_closed(&stats);

        debug!("Connection {} closed with {} ({} bytes)", id, peer, stats.total());
        let _ = self.inner.events.send(ConnectionEvent::Closed { id, peer, stats });
    }
}

/// Proof that a relay was announced; consumed by the matching close
pub struct ConnectionTicket {
    id: u64,
    peer: Option<PeerDescriptor>,
    registry: ConnectionRegistry,
}

impl ConnectionTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<&PeerDescriptor> {
        self.peer.as_ref()
    }

    /// Publish `Closed` for this relay
    pub fn close(mut self, stats: RelayStats) {
        if let Some(peer) = self.peer.take() {
            self.registry.publish_close(self.id, peer, stats);
        }
    }
}

impl Drop for ConnectionTicket {
    fn drop(&mut self) {
        if let Some(peer) = self.peer.take() {
            self.registry.publish_close(self.id, peer, RelayStats::default());
        }
    }
}
