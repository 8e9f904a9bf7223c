//! Server Command Implementation

use anyhow::Result;
use px_core::ProxyConfig;
use px_daemon::ProxyServer;
use tracing::info;

use super::report_events;
use super::signal::ShutdownSignal;

/// Run the exposer until SIGINT or SIGTERM
pub async fn run(config: ProxyConfig) -> Result<()> {
    let server = ProxyServer::new(config)?;
    let mut shutdown = ShutdownSignal::register()?;
    let reporter = report_events(server.subscribe());

    server.open().await?;

    let address = server.address();
    info!("The proxy server is listening. Connect by running a client with the same seed.");
    info!("Exposing {}:{} as {}", address.host, address.port, address.peer_id);
    for addr in &address.listen_addrs {
        info!("Bootstrap address: {}", addr);
    }

    shutdown.recv().await;

    info!("Shutting down");
    server.close().await;
    reporter.abort();
    info!("Shut down");

    Ok(())
}
