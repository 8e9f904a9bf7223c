//! Exposer Service
//!
//! Publishes a local TCP service on the overlay under the seed identity.
//! Every tunnel stream is authenticated and checked against the same-seed
//! firewall off the accept loop; admitted tunnels are relayed to a fresh TCP
//! connection to the configured target.

use futures::StreamExt;
use libp2p::Stream;
use libp2p_stream::IncomingStreams;
use px_core::network::tunnel;
use px_core::{
    ConnectionEvent, ConnectionRegistry, Multiaddr, OverlayNode, P2ProxyError, PeerDescriptor,
    PeerId, ProxyConfig, ProxyStats, PublicKey, RelayEngine, Result, Role, SeedIdentity,
    TransportConfig,
};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lifecycle::{Lifecycle, ServiceState};
use crate::service::RunningService;

/// Where an exposer can be reached, and what it exposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    /// Hex of the seed-derived ed25519 public key
    pub public_key: String,
    pub peer_id: PeerId,
    /// Local TCP target
    pub host: String,
    pub port: u16,
    /// Overlay listen addresses, each ending in `/p2p/<peer_id>`
    pub listen_addrs: Vec<Multiaddr>,
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}:{}", self.peer_id, self.host, self.port)
    }
}

/// The exposer role
pub struct ProxyServer {
    config: ProxyConfig,
    identity: Arc<SeedIdentity>,
    engine: RelayEngine,
    lifecycle: Lifecycle<RunningService>,
    listen_addrs: OnceLock<Vec<Multiaddr>>,
}

impl ProxyServer {
    /// Validate `config` and derive the seed identity. Nothing is bound yet.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate(Role::Exposer)?;
        let identity = SeedIdentity::from_seed(config.seed()?)?;
        let engine = RelayEngine::new(ConnectionRegistry::new(), config.dial_timeout());

        Ok(Self {
            config,
            identity: Arc::new(identity),
            engine,
            lifecycle: Lifecycle::new(),
            listen_addrs: OnceLock::new(),
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    /// Public key, local target and, once open, the overlay listen addresses
    pub fn address(&self) -> ServerAddress {
        ServerAddress {
            public_key: self.identity.public_key_hex(),
            peer_id: *self.identity.peer_id(),
            host: self.config.host.clone(),
            port: self.config.port(),
            listen_addrs: self.listen_addrs.get().cloned().unwrap_or_default(),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ServiceState> {
        self.lifecycle.subscribe()
    }

    /// Lifecycle events of every relay this service runs
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.engine.registry().subscribe()
    }

    pub fn stats(&self) -> &ProxyStats {
        self.engine.registry().stats()
    }

    /// Bind the overlay listener and start accepting tunnels
    pub async fn open(&self) -> Result<()> {
        self.lifecycle.open(|| self.start()).await
    }

    /// Stop accepting, drain or force down relays, release the overlay node
    pub async fn close(&self) {
        let engine = self.engine.clone();
        let grace = self.config.shutdown_grace();
        self.lifecycle
            .close(|running| async move { running.stop(&engine, grace).await })
            .await;
    }

    async fn start(&self) -> Result<RunningService> {
        let listen = self.config.listen_multiaddr()?;
        let bootstrap = self.config.bootstrap_addrs()?;
        let transport = TransportConfig::from(&self.config);

        let node = OverlayNode::spawn(self.identity.keypair().clone(), &transport, &bootstrap)?;
        let (bound, incoming) = match bind(&node, listen).await {
            Ok(bound) => bound,
            Err(e) => {
                node.destroy().await;
                return Err(e);
            }
        };

        info!("Exposing {} as {}", self.config.local_address(), self.identity);
        info!("Listening on {}", bound);
        let _ = self.listen_addrs.set(vec![bound]);

        let stop_accepting = CancellationToken::new();
        let accept_loop = tokio::spawn(accept_loop(
            incoming,
            self.identity.clone(),
            self.engine.clone(),
            self.config.local_address(),
            self.config.handshake_timeout(),
            stop_accepting.clone(),
        ));

        Ok(RunningService {
            node,
            accept_loop,
            stop_accepting,
        })
    }
}

async fn bind(node: &OverlayNode, listen: Multiaddr) -> Result<(Multiaddr, IncomingStreams)> {
    let incoming = node.accept_tunnels()?;
    let bound = node.listen(listen).await?;
    Ok((bound, incoming))
}

async fn accept_loop(
    mut incoming: IncomingStreams,
    identity: Arc<SeedIdentity>,
    engine: RelayEngine,
    target: String,
    handshake_timeout: Duration,
    stop: CancellationToken,
) {
    loop {
        let (peer, stream) = tokio::select! {
            _ = stop.cancelled() => break,
            next = incoming.next() => match next {
                Some(accepted) => accepted,
                None => break,
            },
        };

        debug!("Incoming tunnel stream from {}", peer);
        let shutdown = engine.shutdown_token();
        let handshake = admit_and_relay(
            stream,
            peer,
            identity.clone(),
            engine.clone(),
            target.clone(),
            handshake_timeout,
        );
        engine.spawn(async move {
            tokio::select! {
                _ = handshake => {}
                _ = shutdown.cancelled() => {}
            }
        });
    }

    debug!("Stopped accepting tunnels");
}

/// Authenticate and admit one tunnel, then relay it to the local target.
/// Rejected tunnels are dropped without creating a relay.
async fn admit_and_relay(
    stream: Stream,
    peer: PeerId,
    identity: Arc<SeedIdentity>,
    engine: RelayEngine,
    target: String,
    handshake_timeout: Duration,
) {
    let mut stream = stream.compat();
    let admitted = tokio::time::timeout(
        handshake_timeout,
        tunnel::admit(&mut stream, identity.as_ref(), identity.peer_id(), &peer),
    )
    .await;

    let public_key = match admitted {
        Ok(Ok(public_key)) => public_key,
        Ok(Err(e)) => {
            warn!("Rejected tunnel from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!("Tunnel handshake with {} timed out", peer);
            return;
        }
    };

    let descriptor = PeerDescriptor::Overlay {
        identity: public_key.to_peer_id(),
        transport: peer,
    };
    engine.relay(stream, descriptor, move || connect_target(target));
}

async fn connect_target(address: String) -> Result<TcpStream> {
    let stream = TcpStream::connect(address.as_str())
        .await
        .map_err(|e| P2ProxyError::TargetUnreachable {
            address: address.clone(),
            reason: e.to_string(),
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY towards {}: {}", address, e);
    }
    Ok(stream)
}
