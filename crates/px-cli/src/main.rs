//! P2Proxy CLI
//!
//! Command-line interface for the P2Proxy TCP tunnel.

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // A local .env may carry the P2PROXY_* variables
    dotenv::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Execute command
    match cli.command {
        Commands::Server { port, common } => {
            let config = cli::build_config(cli.config, port, common)?;
            cli::server::run(config).await?;
        }
        Commands::Client { port, common } => {
            let config = cli::build_config(cli.config, port, common)?;
            cli::client::run(config).await?;
        }
        Commands::Info { seed } => {
            cli::info::run(seed)?;
        }
    }

    Ok(())
}
