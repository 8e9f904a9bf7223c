//! Tunnel Authentication Handshake
//!
//! Every tunnel stream starts with the dialer proving possession of the seed
//! keypair. The exposer verifies the signature, then applies its admission
//! predicate; only an admitted stream is answered and handed to the relay.
//!
//! Frames are length-prefixed (u32 big-endian) bincode.

use libp2p::identity::PublicKey;
use libp2p::{PeerId, Stream};
use libp2p_stream as stream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};
use tracing::debug;

use super::behaviour::TUNNEL_PROTOCOL;
use super::identity::{Firewall, SeedIdentity};
use crate::error::{P2ProxyError, Result};

/// Current handshake version
pub const TUNNEL_VERSION: u32 = 1;

/// Domain separation for handshake signatures
const AUTH_CONTEXT: &[u8] = b"p2proxy/tunnel-auth/1";

/// Upper bound on a handshake frame
const MAX_FRAME_LEN: usize = 16 * 1024;

/// A tunnel stream usable with tokio I/O
pub type TunnelStream = Compat<Stream>;

/// First frame on a tunnel stream, sent by the dialer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelHello {
    pub version: u32,
    /// Protobuf-encoded public key the dialer claims
    pub public_key: Vec<u8>,
    /// Signature over [`auth_payload`]
    pub signature: Vec<u8>,
}

/// Exposer's answer once the dialer is admitted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelAccept {
    pub version: u32,
}

/// Bytes signed by the dialer, bound to both transport identities
pub fn auth_payload(exposer: &PeerId, dialer: &PeerId) -> Vec<u8> {
    let exposer = exposer.to_bytes();
    let dialer = dialer.to_bytes();

    let mut payload = Vec::with_capacity(AUTH_CONTEXT.len() + exposer.len() + dialer.len());
    payload.extend_from_slice(AUTH_CONTEXT);
    payload.extend_from_slice(&exposer);
    payload.extend_from_slice(&dialer);
    payload
}

/// Send a serializable frame with length prefix
pub async fn write_frame<T: Serialize, W: AsyncWrite + Unpin>(writer: &mut W, frame: &T) -> Result<()> {
    let bytes = bincode::serialize(frame)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(P2ProxyError::InvalidMessage("Frame too large".to_string()));
    }

    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a deserializable frame with length prefix
pub async fn read_frame<T: serde::de::DeserializeOwned, R: AsyncRead + Unpin>(reader: &mut R) -> Result<T> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(P2ProxyError::InvalidMessage("Frame too large".to_string()));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    Ok(bincode::deserialize(&buf)?)
}

/// Dialer side: prove the seed identity and wait for admission.
///
/// `dialer` is the local transport identity, `exposer` the peer the stream
/// was opened to.
pub async fn initiate<S>(
    stream: &mut S,
    identity: &SeedIdentity,
    dialer: &PeerId,
    exposer: &PeerId,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = TunnelHello {
        version: TUNNEL_VERSION,
        public_key: identity.public_key().encode_protobuf(),
        signature: identity.sign(&auth_payload(exposer, dialer))?,
    };
    write_frame(stream, &hello).await?;

    // A rejected tunnel is dropped without an answer
    match read_frame::<TunnelAccept, _>(stream).await {
        Ok(accept) if accept.version == TUNNEL_VERSION => Ok(()),
        Ok(accept) => Err(P2ProxyError::UnsupportedVersion(accept.version)),
        Err(P2ProxyError::Io(e)) => {
            debug!("Tunnel to {} closed during handshake: {}", exposer, e);
            Err(P2ProxyError::AdmissionRejected)
        }
        Err(e) => Err(e),
    }
}

/// Exposer side: authenticate the dialer, then apply `firewall`.
///
/// Returns the authenticated public key. On any error the caller drops the
/// stream, which is all the dialer ever sees of a rejection.
pub async fn admit<S, F>(stream: &mut S, firewall: &F, exposer: &PeerId, dialer: &PeerId) -> Result<PublicKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Firewall + ?Sized,
{
    let hello: TunnelHello = read_frame(stream).await?;
    if hello.version != TUNNEL_VERSION {
        return Err(P2ProxyError::UnsupportedVersion(hello.version));
    }

    let public_key = PublicKey::try_decode_protobuf(&hello.public_key)
        .map_err(|e| P2ProxyError::AuthenticationFailed(format!("bad public key: {}", e)))?;

    if !public_key.verify(&auth_payload(exposer, dialer), &hello.signature) {
        return Err(P2ProxyError::AuthenticationFailed("bad signature".to_string()));
    }

    if !firewall.admits(&public_key) {
        return Err(P2ProxyError::AdmissionRejected);
    }

    write_frame(stream, &TunnelAccept { version: TUNNEL_VERSION }).await?;
    Ok(public_key)
}

/// Open an authenticated tunnel stream to `exposer`
pub async fn open_tunnel(
    control: &mut stream::Control,
    identity: &SeedIdentity,
    local_peer_id: &PeerId,
    exposer: PeerId,
) -> Result<TunnelStream> {
    let stream = control
        .open_stream(exposer, TUNNEL_PROTOCOL)
        .await
        .map_err(|e| P2ProxyError::DialError(format!("Failed to open stream to {}: {:?}", exposer, e)))?;

    let mut stream = stream.compat();
    initiate(&mut stream, identity, local_peer_id, &exposer).await?;
    Ok(stream)
}
