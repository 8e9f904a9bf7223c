//! CLI Command Definitions
//!
//! Defines the command-line interface using clap. Every option can also be
//! supplied through a `P2PROXY_*` environment variable or a `.env` file.

pub mod client;
pub mod info;
pub mod server;
pub mod signal;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use px_core::{brand, ConnectionEvent, ProxyConfig, Seed};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// P2Proxy - expose a local TCP service over a P2P overlay
///
/// Run `server` next to the service you want to publish and `client` where
/// you want to reach it. Both sides must use the same seed.
#[derive(Parser, Debug)]
#[command(name = brand::BIN_NAME)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (TOML); defaults to the user config directory
    #[arg(short, long, global = true, env = "P2PROXY_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Expose a local TCP port on the overlay
    ///
    /// Connections from clients started with the same seed are forwarded
    /// to HOST:PORT.
    #[command(visible_alias = "s")]
    Server {
        /// Local port of the service to expose
        #[arg(short, long, env = "P2PROXY_PORT")]
        port: Option<u16>,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Listen locally and forward connections to the server
    ///
    /// Every connection accepted on HOST:PORT is tunneled to the server
    /// started with the same seed.
    #[command(visible_alias = "c")]
    Client {
        /// Local port to listen on (0 picks a free port)
        #[arg(short, long, env = "P2PROXY_PORT")]
        port: Option<u16>,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Show the identity derived from a seed
    #[command(visible_alias = "i")]
    Info {
        /// Shared seed: 64 hex characters or standard base64 of 32 bytes (z-base32 is not accepted)
        #[arg(short, long, env = "P2PROXY_SEED", hide_env_values = true)]
        seed: Option<String>,
    },
}

/// Options shared by both roles
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Shared seed: 64 hex characters or standard base64 of 32 bytes (z-base32 is not accepted)
    #[arg(short, long, env = "P2PROXY_SEED", hide_env_values = true)]
    pub seed: Option<String>,

    /// Local host: the exposed service (server) or the bind address (client)
    #[arg(long, env = "P2PROXY_HOST")]
    pub host: Option<String>,

    /// Bootstrap peers: multiaddrs or host:port, comma separated
    #[arg(short, long, env = "P2PROXY_BOOTSTRAP", value_delimiter = ',')]
    pub bootstrap: Vec<String>,

    /// Host for the overlay QUIC listener
    #[arg(long)]
    pub listen_host: Option<String>,

    /// Port for the overlay QUIC listener
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Keep-alive interval in milliseconds
    #[arg(long, value_name = "MS")]
    pub keep_alive: Option<u64>,

    /// Disable mDNS discovery on the local network
    #[arg(long)]
    pub no_mdns: bool,
}

/// Load the config file, then apply command-line and environment overrides
pub fn build_config(path: Option<PathBuf>, port: Option<u16>, common: CommonArgs) -> Result<ProxyConfig> {
    let mut config = match path {
        Some(path) => ProxyConfig::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let default_path = ProxyConfig::default_config_path();
            if default_path.exists() {
                ProxyConfig::load(&default_path)
                    .with_context(|| format!("failed to load config from {}", default_path.display()))?
            } else {
                ProxyConfig::default()
            }
        }
    };

    if let Some(seed) = common.seed {
        config.seed = Some(parse_seed(&seed)?);
    }
    if let Some(port) = port {
        config.port = Some(port);
    }
    if let Some(host) = common.host {
        config.host = host;
    }
    config.bootstrap_peers.extend(common.bootstrap);
    if let Some(listen_host) = common.listen_host {
        config.listen_host = listen_host;
    }
    if let Some(listen_port) = common.listen_port {
        config.listen_port = listen_port;
    }
    if let Some(keep_alive) = common.keep_alive {
        config = config.with_keep_alive(Duration::from_millis(keep_alive));
    }
    if common.no_mdns {
        config.enable_mdns = false;
    }

    Ok(config)
}

pub fn parse_seed(raw: &str) -> Result<Seed> {
    raw.parse::<Seed>().context("P2PROXY_SEED must be 64 hex characters or base64 of 32 bytes")
}

/// Log every relay lifecycle event until the service's registry goes away
pub fn report_events(mut events: broadcast::Receiver<ConnectionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Opened { id, peer }) => {
                    info!("Opened connection {} with {}", id, peer);
                }
                Ok(ConnectionEvent::Closed { id, peer, stats }) => {
                    info!(
                        "Closed connection {} with {} ({} bytes up, {} bytes down)",
                        id, peer, stats.upstream_bytes, stats.downstream_bytes
                    );
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Skipped {} connection events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_server_args_build_config() {
        let seed = "ab".repeat(32);
        let cli = parse(&[
            "p2proxy",
            "server",
            "--port",
            "8080",
            "--seed",
            &seed,
            "--bootstrap",
            "127.0.0.1:4001,/ip4/10.0.0.1/udp/4001/quic-v1",
            "--no-mdns",
        ]);

        match cli.command {
            Commands::Server { port, common } => {
                let config = build_config(None, port, common).unwrap();
                assert_eq!(config.port, Some(8080));
                assert_eq!(config.bootstrap_peers.len(), 2);
                assert!(!config.enable_mdns);
                assert_eq!(config.seed().unwrap().to_hex(), seed);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_bad_seed_is_rejected() {
        assert!(parse_seed("not a seed").is_err());
        assert!(parse_seed(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_zbase32_seed_is_rejected() {
        let zbase32 = "ybndrfg8ejkmcpqxot1uwisza345h769ybndrfg8ejkmcpqxot1u";
        assert_eq!(zbase32.len(), 52);
        assert!(parse_seed(zbase32).is_err());

        let cli = parse(&["p2proxy", "client", "--seed", zbase32]);
        match cli.command {
            Commands::Client { port, common } => assert!(build_config(None, port, common).is_err()),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_missing_config_file_fails() {
        let common = CommonArgs {
            seed: None,
            host: None,
            bootstrap: Vec::new(),
            listen_host: None,
            listen_port: None,
            keep_alive: None,
            no_mdns: false,
        };
        assert!(build_config(Some(PathBuf::from("/nonexistent/p2proxy.toml")), None, common).is_err());
    }
}
