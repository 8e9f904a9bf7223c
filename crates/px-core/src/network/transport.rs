//! Transport Configuration for P2Proxy
//!
//! Builds the libp2p swarm: QUIC transport, relay client with noise/yamux,
//! and the overlay behaviour tuned by the configured keep-alive.

use libp2p::{identify, identity::Keypair, mdns, ping, Swarm};
use std::time::Duration;

use super::behaviour::OverlayBehaviour;
use crate::config::ProxyConfig;
use crate::error::{P2ProxyError, Result};

/// Default idle connection timeout
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default keep alive interval
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_millis(5000);

/// Transport configuration options
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interval between liveness pings on every overlay connection
    pub keep_alive_interval: Duration,

    /// How long an overlay connection without streams is kept open
    pub idle_timeout: Duration,

    /// Discover peers on the local network
    pub enable_mdns: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            enable_mdns: true,
        }
    }
}

impl TransportConfig {
    /// Create a new transport configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set keep alive interval
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable/disable mDNS
    pub fn with_mdns(mut self, enable: bool) -> Self {
        self.enable_mdns = enable;
        self
    }
}

impl From<&ProxyConfig> for TransportConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            keep_alive_interval: config.keep_alive(),
            idle_timeout: config.idle_timeout(),
            enable_mdns: config.enable_mdns,
        }
    }
}

/// Build the swarm for an overlay node owning `keypair`
pub fn build_swarm(keypair: Keypair, config: &TransportConfig) -> Result<Swarm<OverlayBehaviour>> {
    let local_peer_id = keypair.public().to_peer_id();
    let keep_alive = config.keep_alive_interval;
    let enable_mdns = config.enable_mdns;

    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_relay_client(libp2p::noise::Config::new, libp2p::yamux::Config::default)
        .map_err(|e| P2ProxyError::NetworkInitialization(e.to_string()))?
        .with_behaviour(|key, relay| {
            let identify = identify::Behaviour::new(
                identify::Config::new("/p2proxy/id/1.0.0".to_string(), key.public())
                    .with_agent_version(format!("p2proxy/{}", env!("CARGO_PKG_VERSION"))),
            );

            let ping = ping::Behaviour::new(
                ping::Config::new()
                    .with_interval(keep_alive)
                    .with_timeout(keep_alive.max(Duration::from_secs(10))),
            );

            let mdns = if enable_mdns {
                Some(mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?)
            } else {
                None
            };
            let dcutr = libp2p::dcutr::Behaviour::new(local_peer_id);
            let stream = libp2p_stream::Behaviour::new();

            Ok(OverlayBehaviour {
                identify,
                ping,
                mdns: mdns.into(),
                relay,
                dcutr,
                stream,
            })
        })
        .map_err(|e| P2ProxyError::NetworkInitialization(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_timeout))
        .build();

    Ok(swarm)
}
