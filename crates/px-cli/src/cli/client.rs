//! Client Command Implementation

use anyhow::Result;
use px_core::ProxyConfig;
use px_daemon::ProxyClient;
use tracing::info;

use super::report_events;
use super::signal::ShutdownSignal;

/// Run the entry point until SIGINT or SIGTERM
pub async fn run(config: ProxyConfig) -> Result<()> {
    let client = ProxyClient::new(config)?;
    let mut shutdown = ShutdownSignal::register()?;
    let reporter = report_events(client.subscribe());

    client.open().await?;

    if let Some(address) = client.address() {
        info!("The proxy client is listening at {}", address);
    }
    info!("Forwarding to {}", client.exposer_peer_id());

    shutdown.recv().await;

    info!("Shutting down");
    client.close().await;
    reporter.abort();
    info!("Shut down");

    Ok(())
}
