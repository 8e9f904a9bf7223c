//! Relay Engine
//!
//! Bridges an already-open inbound stream with an outbound stream that is
//! dialed lazily, once the relay has been announced. Each relay runs on its
//! own task; teardown drops both streams and publishes the close exactly once.

use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::pipe::{splice, Counters};
use super::registry::{ConnectionRegistry, ConnectionTicket, PeerDescriptor};
use crate::error::{P2ProxyError, Result};

/// Where a relay is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Inbound open, outbound not dialed yet
    Pending,
    /// Both streams open, bytes flowing
    Established,
    /// One side finished or failed, tearing down
    Closing,
    /// Both streams released
    Closed,
}

/// Observer for one relay
#[derive(Debug, Clone)]
pub struct RelayHandle {
    id: u64,
    peer: PeerDescriptor,
    state: watch::Receiver<RelayState>,
}

impl RelayHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &PeerDescriptor {
        &self.peer
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Resolves once the relay reached [`RelayState::Closed`]
    pub async fn closed(&mut self) {
        // The sender is only dropped after publishing Closed
        let _ = self.state.wait_for(|state| *state == RelayState::Closed).await;
    }
}

/// Spawns and tracks the relays of one service
#[derive(Clone)]
pub struct RelayEngine {
    registry: ConnectionRegistry,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    dial_timeout: Duration,
}

impl RelayEngine {
    pub fn new(registry: ConnectionRegistry, dial_timeout: Duration) -> Self {
        Self {
            registry,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            dial_timeout,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Cancelled when in-flight work must stop immediately
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of tracked tasks still running
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Run `task` under this engine's shutdown tracking
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Announce a relay for `inbound` and start it.
    ///
    /// The `Opened` event is published before this returns. `make_outbound`
    /// is called once, on the relay's task.
    pub fn relay<I, O, F, Fut>(&self, inbound: I, peer: PeerDescriptor, make_outbound: F) -> RelayHandle
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        O: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let ticket = self.registry.open(peer.clone());
        let (state_tx, state_rx) = watch::channel(RelayState::Pending);
        let handle = RelayHandle {
            id: ticket.id(),
            peer,
            state: state_rx,
        };

        self.tracker.spawn(run_relay(
            inbound,
            make_outbound,
            ticket,
            state_tx,
            self.shutdown.clone(),
            self.dial_timeout,
        ));

        handle
    }

    /// Stop the engine: wait up to `grace` for relays to finish, then force
    /// the rest down. Returns true if everything drained within `grace`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();

        let drained = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !drained {
            warn!("{} relays still active after {:?}, forcing teardown", self.tracker.len(), grace);
            self.shutdown.cancel();
            self.tracker.wait().await;
        }

        drained
    }
}

async fn run_relay<I, O, F, Fut>(
    inbound: I,
    make_outbound: F,
    ticket: ConnectionTicket,
    state: watch::Sender<RelayState>,
    shutdown: CancellationToken,
    dial_timeout: Duration,
) where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    O: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    let id = ticket.id();
    let counters = Counters::default();

    let outbound = tokio::select! {
        result = tokio::time::timeout(dial_timeout, make_outbound()) => match result {
            Ok(result) => result,
            Err(_) => Err(P2ProxyError::Timeout(format!("outbound dial after {:?}", dial_timeout))),
        },
        _ = shutdown.cancelled() => Err(P2ProxyError::ServiceClosed),
    };

    match outbound {
        Ok(outbound) => {
            state.send_replace(RelayState::Established);
            debug!("Connection {} established", id);

            let (mut inbound_read, mut inbound_write) = tokio::io::split(inbound);
            let (mut outbound_read, mut outbound_write) = tokio::io::split(outbound);

            let result = tokio::select! {
                result = splice(
                    &mut inbound_read,
                    &mut inbound_write,
                    &mut outbound_read,
                    &mut outbound_write,
                    &counters,
                ) => result.map_err(P2ProxyError::from),
                _ = shutdown.cancelled() => Err(P2ProxyError::ServiceClosed),
            };

            state.send_replace(RelayState::Closing);
            match result {
                Ok(()) => debug!("Connection {} finished", id),
                Err(e) => debug!("Connection {} torn down: {}", id, e),
            }

            drop((inbound_read, inbound_write));
            drop((outbound_read, outbound_write));
        }
        Err(e) => {
            info!("Connection {} outbound dial failed: {}", id, e);
            state.send_replace(RelayState::Closing);
            drop(inbound);
        }
    }

    state.send_replace(RelayState::Closed);
    ticket.close(counters.snapshot());
}
