//! Entry-Point Service
//!
//! Listens on a local TCP port and forwards every accepted connection through
//! an authenticated tunnel to the exposer named by the shared seed. The
//! overlay node runs under an ephemeral transport identity; the seed identity
//! is only used to prove membership during the tunnel handshake.

use libp2p::identity::Keypair;
use px_core::{
    open_tunnel, ConnectionEvent, ConnectionRegistry, OverlayNode, P2ProxyError, PeerDescriptor,
    PeerId, ProxyConfig, ProxyStats, RelayEngine, Result, Role, SeedIdentity, TransportConfig,
};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lifecycle::{Lifecycle, ServiceState};
use crate::service::RunningService;

/// Pause after a failed accept so a persistent error (fd exhaustion) does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The entry-point role
pub struct ProxyClient {
    config: ProxyConfig,
    identity: Arc<SeedIdentity>,
    engine: RelayEngine,
    lifecycle: Lifecycle<RunningService>,
    local_addr: OnceLock<SocketAddr>,
}

impl ProxyClient {
    /// Validate `config` and derive the seed identity. Nothing is bound yet.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate(Role::EntryPoint)?;
        let identity = SeedIdentity::from_seed(config.seed()?)?;
        let engine = RelayEngine::new(ConnectionRegistry::new(), config.dial_timeout());

        Ok(Self {
            config,
            identity: Arc::new(identity),
            engine,
            lifecycle: Lifecycle::new(),
            local_addr: OnceLock::new(),
        })
    }

    /// Bound local TCP address, once open
    pub fn address(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// The exposer every tunnel is dialed to, derived from the seed
    pub fn exposer_peer_id(&self) -> &PeerId {
        self.identity.peer_id()
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

    /// Bind the local TCP listener, start the overlay node and begin accepting
    pub async fn open(&self) -> Result<()> {
        self.lifecycle.open(|| self.start()).await
    }

    /// Stop the TCP listener, drain or force down relays, release the overlay node
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

        let address = self.config.local_address();
        let listener = TcpListener::bind(address.as_str())
            .await
            .map_err(|e| P2ProxyError::PortBindFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        let node = OverlayNode::spawn(Keypair::generate_ed25519(), &transport, &bootstrap)?;
        if let Err(e) = node.listen(listen).await {
            node.destroy().await;
            return Err(e);
        }

        info!("Listening at {}, forwarding to {}", local_addr, self.identity.peer_id());
        let _ = self.local_addr.set(local_addr);

        let stop_accepting = CancellationToken::new();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            node.stream_control(),
            self.identity.clone(),
            *node.peer_id(),
            self.engine.clone(),
            stop_accepting.clone(),
        ));

        Ok(RunningService {
            node,
            accept_loop,
            stop_accepting,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    control: libp2p_stream::Control,
    identity: Arc<SeedIdentity>,
    local_peer_id: PeerId,
    engine: RelayEngine,
    stop: CancellationToken,
) {
    let exposer = *identity.peer_id();

    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (tcp, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept TCP connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", remote, e);
        }

        let mut control = control.clone();
        let identity = identity.clone();
        engine.relay(tcp, PeerDescriptor::Tcp(remote), move || async move {
            open_tunnel(&mut control, &identity, &local_peer_id, exposer).await
        });
    }

    // Dropping the listener here releases the port
    debug!("Stopped accepting TCP connections");
}
