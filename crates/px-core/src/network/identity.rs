//! Seed-derived Identity
//!
//! A 32-byte seed deterministically yields the ed25519 keypair that names the
//! exposer on the overlay. The same seed doubles as the shared secret: only a
//! holder of the seed can sign a tunnel handshake for that public key.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use libp2p::identity::{Keypair, PeerId, PublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{P2ProxyError, Result};

/// Length of a seed in bytes
pub const SEED_LEN: usize = 32;

/// The shared secret both roles are configured with
#[derive(Clone, PartialEq, Eq)]
pub struct Seed([u8; SEED_LEN]);

impl Seed {
    pub fn from_bytes(bytes: [u8; SEED_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SEED_LEN] {
        &self.0
    }

    /// Hex form, as accepted by `FromStr`
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Seed {
    type Err = P2ProxyError;

    /// Accepts 64 hex characters or standard base64 of 32 bytes. Other
    /// encodings such as z-base32 are rejected.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let bytes = if s.len() == SEED_LEN * 2 {
            hex::decode(s).map_err(|e| P2ProxyError::InvalidSeed(format!("bad hex: {}", e)))?
        } else {
            BASE64
                .decode(s)
                .map_err(|_| P2ProxyError::InvalidSeed("expected 64 hex chars or base64".to_string()))?
        };

        let bytes: [u8; SEED_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            P2ProxyError::InvalidSeed(format!("expected {} bytes, got {}", SEED_LEN, b.len()))
        })?;

        Ok(Self(bytes))
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(<redacted>)")
    }
}

impl Serialize for Seed {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Seed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Admission predicate applied to every inbound tunnel before a relay exists
pub trait Firewall: Send + Sync {
    /// Returns true if a peer proving `remote` may reach the protected service
    fn admits(&self, remote: &PublicKey) -> bool;
}

impl<F> Firewall for F
where
    F: Fn(&PublicKey) -> bool + Send + Sync,
{
    fn admits(&self, remote: &PublicKey) -> bool {
        self(remote)
    }
}

/// Keypair derived from a [`Seed`]
#[derive(Clone)]
pub struct SeedIdentity {
    keypair: Keypair,
    public_key: PublicKey,
    peer_id: PeerId,
}

impl SeedIdentity {
    /// Derive the keypair for `seed`. Identical seeds give identical keys.
    pub fn from_seed(seed: &Seed) -> Result<Self> {
        let mut secret = *seed.as_bytes();
        let keypair = Keypair::ed25519_from_bytes(&mut secret)
            .map_err(|e| P2ProxyError::InvalidSeed(e.to_string()))?;
        let public_key = keypair.public();
        let peer_id = public_key.to_peer_id();

        Ok(Self {
            keypair,
            public_key,
            peer_id,
        })
    }

    /// The keypair, used as the exposer's transport identity
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// The overlay address of the exposer
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Raw ed25519 public key as hex
    pub fn public_key_hex(&self) -> String {
        match self.public_key.clone().try_into_ed25519() {
            Ok(key) => hex::encode(key.to_bytes()),
            Err(_) => hex::encode(self.public_key.encode_protobuf()),
        }
    }

    /// Byte-for-byte comparison against our own public key
    pub fn is_self(&self, candidate: &PublicKey) -> bool {
        candidate.encode_protobuf() == self.public_key.encode_protobuf()
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.keypair
            .sign(message)
            .map_err(|e| P2ProxyError::AuthenticationFailed(format!("signing failed: {}", e)))
    }
}

impl Firewall for SeedIdentity {
    fn admits(&self, remote: &PublicKey) -> bool {
        self.is_self(remote)
    }
}

impl fmt::Debug for SeedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedIdentity")
            .field("peer_id", &self.peer_id.to_string())
            .finish()
    }
}

impl fmt::Display for SeedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.peer_id)
    }
}
