//! Service Lifecycle
//!
//! Explicit `Unopened → Opening → Open → Closing → Closed` state machine shared
//! by both services. Open and close are serialized behind one async lock, so
//! a close issued while an open is in flight waits for that open to finish.

use px_core::{P2ProxyError, Result};
use std::future::Future;
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Where a service is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Unopened,
    Opening,
    Open,
    Closing,
    Closed,
}

/// Owns the running resources `T` of a service between open and close
pub struct Lifecycle<T> {
    running: Mutex<Option<T>>,
    state: watch::Sender<ServiceState>,
}

impl<T> Default for Lifecycle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Lifecycle<T> {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ServiceState::Unopened);
        Self {
            running: Mutex::new(None),
            state,
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ServiceState) {
        let previous = self.state.send_replace(next);
        debug!("Service state {:?} -> {:?}", previous, next);
    }

    /// Run `start` unless already open. A failed start leaves the service
    /// closed; opening a closed service is an error.
    pub async fn open<F, Fut>(&self, start: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut running = self.running.lock().await;

        match self.state() {
            ServiceState::Open => return Ok(()),
            ServiceState::Closing | ServiceState::Closed => return Err(P2ProxyError::ServiceClosed),
            // Opening here means an earlier open was cancelled midway
            ServiceState::Unopened | ServiceState::Opening => {}
        }

        self.transition(ServiceState::Opening);
        match start().await {
            Ok(resources) => {
                *running = Some(resources);
                self.transition(ServiceState::Open);
                Ok(())
            }
            Err(e) => {
                self.transition(ServiceState::Closed);
                Err(e)
            }
        }
    }

    /// Hand the running resources to `stop` and mark the service closed.
    /// Closing a never-opened service just marks it closed.
    pub async fn close<F, Fut>(&self, stop: F)
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut running = self.running.lock().await;

        if self.state() == ServiceState::Closed {
            return;
        }

        if let Some(resources) = running.take() {
            self.transition(ServiceState::Closing);
            stop(resources).await;
        }
        self.transition(ServiceState::Closed);
    }
}
