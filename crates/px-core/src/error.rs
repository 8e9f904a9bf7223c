//! Error types for P2Proxy
//!
//! Provides a unified error handling strategy using thiserror.

use thiserror::Error;

/// Result type alias for P2Proxy operations
pub type Result<T> = std::result::Result<T, P2ProxyError>;

/// Unified error type for all P2Proxy operations
#[derive(Error, Debug)]
pub enum P2ProxyError {
    // ─────────────────────────────────────────────────────────────
    // Network Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to initialize P2P network: {0}")]
    NetworkInitialization(String),

    #[error("Failed to listen on {address}: {reason}")]
    ListenFailed { address: String, reason: String },

    #[error("Dial error: {0}")]
    DialError(String),

    #[error("Overlay node has shut down")]
    NodeShutdown,

    // ─────────────────────────────────────────────────────────────
    // Tunnel Handshake Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Tunnel authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Tunnel rejected by remote admission policy")]
    AdmissionRejected,

    #[error("Unsupported tunnel protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    // ─────────────────────────────────────────────────────────────
    // Proxy/Relay Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to bind to {address}: {reason}")]
    PortBindFailed { address: String, reason: String },

    #[error("Failed to connect to local target {address}: {reason}")]
    TargetUnreachable { address: String, reason: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Service is closed")]
    ServiceClosed,

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    #[error("Invalid bootstrap address {address}: {reason}")]
    InvalidBootstrap { address: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for P2ProxyError {
    fn from(err: bincode::Error) -> Self {
        P2ProxyError::Serialization(err.to_string())
    }
}
