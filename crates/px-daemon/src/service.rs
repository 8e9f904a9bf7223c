//! Resources held by an open service, released in shutdown order.

use px_core::{OverlayNode, RelayEngine};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) struct RunningService {
    pub(crate) node: OverlayNode,
    pub(crate) accept_loop: JoinHandle<()>,
    pub(crate) stop_accepting: CancellationToken,
}

impl RunningService {
    /// Stop accepting, drain relays within `grace`, then release the node
    pub(crate) async fn stop(self, engine: &RelayEngine, grace: Duration) {
        self.stop_accepting.cancel();
        if let Err(e) = self.accept_loop.await {
            warn!("Accept loop ended abnormally: {}", e);
        }
        debug!("Listener released");

        if !engine.shutdown(grace).await {
            debug!("Forced remaining relays closed");
        }

        self.node.destroy().await;
    }
}
