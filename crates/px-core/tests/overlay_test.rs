//! Overlay tunnel tests
//!
//! Runs two overlay nodes on loopback QUIC: an exposer named by the seed
//! identity, and dialers with ephemeral transport identities proving either
//! the same seed or a different one.

use futures::StreamExt;
use libp2p::identity::Keypair;
use px_core::network::tunnel;
use px_core::{open_tunnel, Multiaddr, OverlayNode, P2ProxyError, Seed, SeedIdentity, TransportConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::compat::FuturesAsyncReadCompatExt;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn transport() -> TransportConfig {
    TransportConfig::new().with_mdns(false)
}

fn identity(byte: u8) -> SeedIdentity {
    SeedIdentity::from_seed(&Seed::from_bytes([byte; 32])).unwrap()
}

/// Start an exposer node that answers admitted tunnels with a fixed payload
async fn start_exposer(identity: SeedIdentity, admitted: Arc<AtomicUsize>) -> (OverlayNode, Multiaddr) {
    let node = OverlayNode::spawn(identity.keypair().clone(), &transport(), &[]).unwrap();
    let addr = node
        .listen("/ip4/127.0.0.1/udp/0/quic-v1".parse().unwrap())
        .await
        .unwrap();

    let mut incoming = node.accept_tunnels().unwrap();
    tokio::spawn(async move {
        while let Some((peer, stream)) = incoming.next().await {
            let identity = identity.clone();
            let admitted = admitted.clone();
            tokio::spawn(async move {
                let mut stream = stream.compat();
                if tunnel::admit(&mut stream, &identity, identity.peer_id(), &peer).await.is_ok() {
                    admitted.fetch_add(1, Ordering::SeqCst);
                    let _ = stream.write_all(b"You got served").await;
                    let _ = stream.shutdown().await;
                }
            });
        }
    });

    (node, addr)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_same_seed_tunnel_is_admitted() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,px_core=debug")
        .try_init();

    let exposer_identity = identity(0xaa);
    let exposer_peer = *exposer_identity.peer_id();
    let admitted = Arc::new(AtomicUsize::new(0));
    let (exposer, addr) = start_exposer(exposer_identity, admitted.clone()).await;

    let dialer = OverlayNode::spawn(Keypair::generate_ed25519(), &transport(), &[addr]).unwrap();
    let mut control = dialer.stream_control();

    let same_seed = identity(0xaa);
    let mut stream = timeout(
        TEST_TIMEOUT,
        open_tunnel(&mut control, &same_seed, dialer.peer_id(), exposer_peer),
    )
    .await
    .expect("tunnel timed out")
    .expect("tunnel should be admitted");

    let mut body = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut body))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body, b"You got served");
    assert_eq!(admitted.load(Ordering::SeqCst), 1);

    dialer.destroy().await;
    exposer.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_different_seed_tunnel_is_rejected() {
    let exposer_identity = identity(0xaa);
    let exposer_peer = *exposer_identity.peer_id();
    let admitted = Arc::new(AtomicUsize::new(0));
    let (exposer, addr) = start_exposer(exposer_identity, admitted.clone()).await;

    let dialer = OverlayNode::spawn(Keypair::generate_ed25519(), &transport(), &[addr]).unwrap();
    let mut control = dialer.stream_control();

    let other_seed = identity(0xbb);
    let result = timeout(
        TEST_TIMEOUT,
        open_tunnel(&mut control, &other_seed, dialer.peer_id(), exposer_peer),
    )
    .await
    .expect("tunnel timed out");

    assert!(matches!(result, Err(P2ProxyError::AdmissionRejected)));
    assert_eq!(admitted.load(Ordering::SeqCst), 0);

    dialer.destroy().await;
    exposer.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listen_reports_peer_address() {
    let identity = identity(0x11);
    let node = OverlayNode::spawn(identity.keypair().clone(), &transport(), &[]).unwrap();
    let addr = node
        .listen("/ip4/127.0.0.1/udp/0/quic-v1".parse().unwrap())
        .await
        .unwrap();

    assert!(addr.to_string().starts_with("/ip4/127.0.0.1/udp/"));
    assert!(addr.to_string().ends_with(&format!("/p2p/{}", identity.peer_id())));
    assert_eq!(node.peer_id(), identity.peer_id());

    node.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listen_on_invalid_address_fails() {
    let node = OverlayNode::spawn(Keypair::generate_ed25519(), &transport(), &[]).unwrap();

    // No transport handles plain UDP
    let result = node.listen("/ip4/127.0.0.1/udp/0".parse().unwrap()).await;
    assert!(matches!(result, Err(P2ProxyError::ListenFailed { .. })));

    node.destroy().await;
}
