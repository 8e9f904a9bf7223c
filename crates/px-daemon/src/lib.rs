//! P2Proxy Daemon
//!
//! The two services of a tunnel: the exposer (`ProxyServer`), which publishes
//! a local TCP port on the overlay, and the entry point (`ProxyClient`), which
//! forwards local TCP connections to it.

pub mod client;
pub mod lifecycle;
pub mod server;
mod service;

pub use client::ProxyClient;
pub use lifecycle::{Lifecycle, ServiceState};
pub use server::{ProxyServer, ServerAddress};
