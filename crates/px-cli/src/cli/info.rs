//! Info Command Implementation

use anyhow::{bail, Result};
use px_core::{brand, SeedIdentity};

use super::parse_seed;

/// Print the identity both roles derive from `seed`
pub fn run(seed: Option<String>) -> Result<()> {
    let Some(seed) = seed else {
        bail!("a seed is required (--seed or P2PROXY_SEED)");
    };
    let identity = SeedIdentity::from_seed(&parse_seed(&seed)?)?;

    println!();
    println!("{} identity", brand::PRODUCT_NAME);
    println!("  Public key: {}", identity.public_key_hex());
    println!("  Peer ID:    {}", identity.peer_id());
    println!();
    println!("Servers and clients started with this seed reach each other at this peer ID.");
    println!();

    Ok(())
}
