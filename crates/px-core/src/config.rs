//! Configuration management for P2Proxy
//!
//! Holds everything a service needs: the shared seed, the local TCP endpoint,
//! overlay bootstrap peers and timing knobs. Loaded from TOML and/or built by
//! the CLI, validated once, then frozen inside the service.

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{P2ProxyError, Result};
use crate::network::identity::Seed;

/// Which side of the tunnel a configuration is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Republishes a local TCP service on the overlay
    Exposer,
    /// Listens locally and forwards into the overlay
    EntryPoint,
}

/// Main configuration for P2Proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Shared seed (hex); required by both roles
    pub seed: Option<Seed>,

    /// Local TCP host: target for the exposer, bind address for the entry point
    pub host: String,

    /// Local TCP port: required for the exposer, 0 = random for the entry point
    pub port: Option<u16>,

    /// Bootstrap peers (multiaddr or host:port)
    pub bootstrap_peers: Vec<String>,

    /// Host for the overlay QUIC listener
    pub listen_host: String,

    /// Port for the overlay QUIC listener (0 = random)
    pub listen_port: u16,

    /// Keep-alive interval in milliseconds
    pub keep_alive_ms: u64,

    /// Idle overlay connection timeout in seconds
    pub idle_timeout_secs: u64,

    /// Outbound dial timeout in milliseconds
    pub dial_timeout_ms: u64,

    /// Tunnel handshake timeout in seconds
    pub handshake_timeout_secs: u64,

    /// Grace period for in-flight relays on shutdown, in milliseconds
    pub shutdown_grace_ms: u64,

    /// Enable mDNS for local network peer discovery
    pub enable_mdns: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            seed: None,
            host: "127.0.0.1".to_string(),
            port: None,
            bootstrap_peers: Vec::new(),
            listen_host: "0.0.0.0".to_string(),
            listen_port: 0,
            keep_alive_ms: 5000,
            idle_timeout_secs: 60,
            dial_timeout_ms: 30_000,
            handshake_timeout_secs: 10,
            shutdown_grace_ms: 5000,
            enable_mdns: true,
        }
    }
}

impl ProxyConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file
    pub fn load(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| P2ProxyError::ConfigError(e.to_string()))
    }

    /// Saves configuration to a file
    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| P2ProxyError::ConfigError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;

        // The file carries the seed
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Returns the default configuration directory
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("p2proxy")
    }

    /// Returns the default configuration file path
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Checks everything a service of `role` needs before it is constructed
    pub fn validate(&self, role: Role) -> Result<()> {
        self.seed()?;

        if role == Role::Exposer && matches!(self.port, None | Some(0)) {
            return Err(P2ProxyError::ConfigError(
                "the exposer needs the port of the service to proxy".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(P2ProxyError::ConfigError("host must not be empty".to_string()));
        }

        let durations = [
            ("keep_alive_ms", self.keep_alive_ms),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("dial_timeout_ms", self.dial_timeout_ms),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(P2ProxyError::ConfigError(format!("{} must be greater than zero", name)));
        }

        self.listen_multiaddr()?;
        self.bootstrap_addrs()?;
        Ok(())
    }

    pub fn seed(&self) -> Result<&Seed> {
        self.seed
            .as_ref()
            .ok_or_else(|| P2ProxyError::ConfigError("a valid seed must be set".to_string()))
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(0)
    }

    /// `host:port` of the local TCP endpoint
    pub fn local_address(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }

    /// Parsed bootstrap peers
    pub fn bootstrap_addrs(&self) -> Result<Vec<Multiaddr>> {
        self.bootstrap_peers.iter().map(|s| parse_bootstrap(s)).collect()
    }

    /// QUIC multiaddr for the overlay listener
    pub fn listen_multiaddr(&self) -> Result<Multiaddr> {
        let ip: IpAddr = self.listen_host.parse().map_err(|e| {
            P2ProxyError::ConfigError(format!("invalid listen host {}: {}", self.listen_host, e))
        })?;
        Ok(quic_multiaddr(SocketAddr::new(ip, self.listen_port)))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Builder pattern: set seed
    pub fn with_seed(mut self, seed: Seed) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builder pattern: set local host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Builder pattern: set local port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Builder pattern: add bootstrap peer
    pub fn with_bootstrap_peer(mut self, peer: impl Into<String>) -> Self {
        self.bootstrap_peers.push(peer.into());
        self
    }

    /// Builder pattern: set overlay listen host
    pub fn with_listen_host(mut self, host: impl Into<String>) -> Self {
        self.listen_host = host.into();
        self
    }

    /// Builder pattern: set keep-alive interval
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive_ms = keep_alive.as_millis() as u64;
        self
    }

    /// Builder pattern: set dial timeout
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder pattern: set shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Builder pattern: enable/disable mDNS
    pub fn with_mdns(mut self, enable: bool) -> Self {
        self.enable_mdns = enable;
        self
    }
}

/// QUIC-v1 multiaddr for a socket address
pub fn quic_multiaddr(addr: SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => Protocol::Ip4(ip),
        IpAddr::V6(ip) => Protocol::Ip6(ip),
    };
    Multiaddr::empty()
        .with(ip)
        .with(Protocol::Udp(addr.port()))
        .with(Protocol::QuicV1)
}

/// Parses a bootstrap entry: a multiaddr, or `host:port` for a QUIC peer
pub fn parse_bootstrap(raw: &str) -> Result<Multiaddr> {
    let raw = raw.trim();
    let invalid = |reason: String| P2ProxyError::InvalidBootstrap {
        address: raw.to_string(),
        reason,
    };

    if raw.starts_with('/') {
        return raw.parse().map_err(|e: libp2p::multiaddr::Error| invalid(e.to_string()));
    }

    let addr: SocketAddr = raw
        .parse()
        .map_err(|e: std::net::AddrParseError| invalid(e.to_string()))?;
    Ok(quic_multiaddr(addr))
}
