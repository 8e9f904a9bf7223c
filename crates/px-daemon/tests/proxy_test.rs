//! End-to-end tunnel tests
//!
//! An exposer and an entry point run in the same process over loopback QUIC,
//! in front of a tiny HTTP server answering "You got served".

use px_core::{ConnectionEvent, P2ProxyError, PeerDescriptor, ProxyConfig, Seed};
use px_daemon::{ProxyClient, ProxyServer, ServiceState};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);
const BODY: &[u8] = b"You got served";

fn seed(byte: u8) -> Seed {
    Seed::from_bytes([byte; 32])
}

fn base_config(seed: Seed) -> ProxyConfig {
    ProxyConfig::new()
        .with_seed(seed)
        .with_host("127.0.0.1")
        .with_listen_host("127.0.0.1")
        .with_mdns(false)
        .with_shutdown_grace(Duration::from_millis(500))
}

/// A port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// HTTP server answering every request with a fixed body
async fn start_http_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }

                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    BODY.len()
                );
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(BODY).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    port
}

async fn open_server(seed: Seed, target_port: u16) -> ProxyServer {
    let server = ProxyServer::new(base_config(seed).with_port(target_port)).unwrap();
    timeout(TEST_TIMEOUT, server.open()).await.unwrap().unwrap();
    server
}

async fn open_client(seed: Seed, server: &ProxyServer) -> ProxyClient {
    let mut config = base_config(seed);
    for addr in server.address().listen_addrs {
        config = config.with_bootstrap_peer(addr.to_string());
    }

    let client = ProxyClient::new(config).unwrap();
    timeout(TEST_TIMEOUT, client.open()).await.unwrap().unwrap();
    client
}

/// Raw HTTP GET; returns whatever came back before the connection closed
async fn http_get(addr: SocketAddr) -> Vec<u8> {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    let _ = timeout(TEST_TIMEOUT, socket.read_to_end(&mut response))
        .await
        .expect("response timed out");
    response
}

async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_through_tunnel() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,px_core=debug,px_daemon=debug")
        .try_init();

    let target = start_http_server().await;
    let server = open_server(seed(0xaa), target).await;
    let client = open_client(seed(0xaa), &server).await;
    let mut server_events = server.subscribe();
    let mut client_events = client.subscribe();

    assert_eq!(server.state(), ServiceState::Open);
    assert_eq!(client.state(), ServiceState::Open);

    let response = http_get(client.address().unwrap()).await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "unexpected response: {}", text);
    assert!(response.ends_with(BODY), "unexpected response: {}", text);

    match next_event(&mut client_events).await {
        ConnectionEvent::Opened { id, peer } => {
            assert_eq!(id, 0);
            assert!(matches!(peer, PeerDescriptor::Tcp(_)));
        }
        other => panic!("unexpected event {:?}", other),
    }
    match next_event(&mut server_events).await {
        ConnectionEvent::Opened { id, peer } => {
            assert_eq!(id, 0);
            match peer {
                PeerDescriptor::Overlay { identity, .. } => assert_eq!(&identity, server.peer_id()),
                other => panic!("unexpected peer {:?}", other),
            }
        }
        other => panic!("unexpected event {:?}", other),
    }
    match next_event(&mut server_events).await {
        ConnectionEvent::Closed { id, stats, .. } => {
            assert_eq!(id, 0);
            assert!(stats.downstream_bytes >= BODY.len() as u64);
        }
        other => panic!("unexpected event {:?}", other),
    }

    client.close().await;
    server.close().await;
    assert_eq!(client.state(), ServiceState::Closed);
    assert_eq!(server.state(), ServiceState::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sequential_connections_get_increasing_ids() {
    let target = start_http_server().await;
    let server = open_server(seed(0xab), target).await;
    let client = open_client(seed(0xab), &server).await;
    let mut events = client.subscribe();

    for _ in 0..3 {
        let response = http_get(client.address().unwrap()).await;
        assert!(response.ends_with(BODY));
    }

    let mut opened = Vec::new();
    let mut closed = Vec::new();
    while closed.len() < 3 {
        match next_event(&mut events).await {
            ConnectionEvent::Opened { id, .. } => opened.push(id),
            ConnectionEvent::Closed { id, .. } => {
                assert!(opened.contains(&id));
                closed.push(id);
            }
        }
    }
    assert_eq!(opened, vec![0, 1, 2]);
    assert_eq!(client.stats().get_total_connections(), 3);

    client.close().await;
    server.close().await;
}

#[test]
fn test_identity_agreement() {
    let server = ProxyServer::new(base_config(seed(0x42)).with_port(8080)).unwrap();
    let client = ProxyClient::new(base_config(seed(0x42))).unwrap();
    assert_eq!(client.exposer_peer_id(), server.peer_id());
    assert_eq!(server.address().peer_id, *server.peer_id());

    let stranger = ProxyClient::new(base_config(seed(0x43))).unwrap();
    assert_ne!(stranger.exposer_peer_id(), server.peer_id());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_different_seed_reaches_nothing() {
    let target = start_http_server().await;
    let server = open_server(seed(0xaa), target).await;
    let mut server_events = server.subscribe();

    // Dial the exposer's address while proving a different seed
    let mut config = base_config(seed(0xbb));
    for addr in server.address().listen_addrs {
        config = config.with_bootstrap_peer(addr.to_string());
    }
    let stranger = ProxyClient::new(config).unwrap();
    let mut stranger_events = stranger.subscribe();
    timeout(TEST_TIMEOUT, stranger.open()).await.unwrap().unwrap();

    let response = http_get(stranger.address().unwrap()).await;
    assert!(response.is_empty());

    // The stranger's relay ends without ever reaching the exposer's registry
    assert!(matches!(next_event(&mut stranger_events).await, ConnectionEvent::Opened { .. }));
    assert!(matches!(next_event(&mut stranger_events).await, ConnectionEvent::Closed { .. }));
    assert!(matches!(server_events.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    assert_eq!(server.stats().get_total_connections(), 0);

    stranger.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_target_closes_with_zero_bytes() {
    let target = closed_port().await;
    let server = open_server(seed(0xac), target).await;
    let client = open_client(seed(0xac), &server).await;
    let mut server_events = server.subscribe();

    let response = http_get(client.address().unwrap()).await;
    assert!(response.is_empty());

    assert!(matches!(next_event(&mut server_events).await, ConnectionEvent::Opened { id: 0, .. }));
    match next_event(&mut server_events).await {
        ConnectionEvent::Closed { id, stats, .. } => {
            assert_eq!(id, 0);
            assert_eq!(stats.total(), 0);
        }
        other => panic!("unexpected event {:?}", other),
    }

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_is_idempotent_and_final() {
    let target = start_http_server().await;
    let server = open_server(seed(0xad), target).await;

    server.close().await;
    server.close().await;
    assert_eq!(server.state(), ServiceState::Closed);

    let reopened = server.open().await;
    assert!(matches!(reopened, Err(P2ProxyError::ServiceClosed)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_before_open() {
    let client = ProxyClient::new(base_config(seed(0xae))).unwrap();
    client.close().await;

    assert_eq!(client.state(), ServiceState::Closed);
    assert!(client.address().is_none());
    assert!(matches!(client.open().await, Err(P2ProxyError::ServiceClosed)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_releases_local_port() {
    let port = closed_port().await;

    for _ in 0..2 {
        let client = ProxyClient::new(base_config(seed(0xaf)).with_port(port)).unwrap();
        timeout(TEST_TIMEOUT, client.open()).await.unwrap().unwrap();
        assert_eq!(client.address().unwrap().port(), port);
        client.close().await;
    }
}

/// Target that accepts connections and never answers or closes them.
/// The receiver yields once per accepted connection.
async fn start_silent_server() -> (u16, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
            let _ = accepted_tx.send(());
        }
    });

    (port, accepted_rx)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_with_relay_in_flight_releases_port() {
    let (target, mut accepted) = start_silent_server().await;
    let port = closed_port().await;

    let server = open_server(seed(0xb1), target).await;
    let mut config = base_config(seed(0xb1)).with_port(port);
    for addr in server.address().listen_addrs {
        config = config.with_bootstrap_peer(addr.to_string());
    }
    let client = ProxyClient::new(config).unwrap();
    timeout(TEST_TIMEOUT, client.open()).await.unwrap().unwrap();

    let mut server_events = server.subscribe();
    let mut client_events = client.subscribe();

    let mut socket = TcpStream::connect(client.address().unwrap()).await.unwrap();
    socket.write_all(b"still talking").await.unwrap();

    assert!(matches!(next_event(&mut client_events).await, ConnectionEvent::Opened { .. }));
    assert!(matches!(next_event(&mut server_events).await, ConnectionEvent::Opened { .. }));
    timeout(TEST_TIMEOUT, accepted.recv())
        .await
        .expect("target never saw the relayed connection")
        .unwrap();
    assert_eq!(client.stats().get_active_connections(), 1);

    timeout(Duration::from_secs(10), async {
        client.close().await;
        server.close().await;
    })
    .await
    .expect("close hung on a live relay");
    assert_eq!(client.state(), ServiceState::Closed);
    assert_eq!(server.state(), ServiceState::Closed);

    let mut buf = [0u8; 16];
    let read = timeout(TEST_TIMEOUT, socket.read(&mut buf))
        .await
        .expect("relay socket left open after close");
    assert!(matches!(read, Ok(0) | Err(_)));

    let fresh = ProxyClient::new(base_config(seed(0xb1)).with_port(port)).unwrap();
    timeout(TEST_TIMEOUT, fresh.open()).await.unwrap().unwrap();
    assert_eq!(fresh.address().unwrap().port(), port);
    fresh.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_port_in_use_fails_open() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let client = ProxyClient::new(base_config(seed(0xb0)).with_port(port)).unwrap();
    let result = client.open().await;

    assert!(matches!(result, Err(P2ProxyError::PortBindFailed { .. })));
    assert_eq!(client.state(), ServiceState::Closed);
}

#[test]
fn test_invalid_config_is_rejected() {
    assert!(matches!(
        ProxyServer::new(ProxyConfig::new().with_port(80)),
        Err(P2ProxyError::ConfigError(_))
    ));
    assert!(matches!(
        ProxyServer::new(base_config(seed(1))),
        Err(P2ProxyError::ConfigError(_))
    ));
    assert!(ProxyClient::new(base_config(seed(1))).is_ok());
}
