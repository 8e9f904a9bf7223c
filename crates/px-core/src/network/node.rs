//! Overlay Node
//!
//! Owns a libp2p swarm on a background task and hands out what the services
//! need: a stream control for dialing tunnels, an accept handle for incoming
//! tunnels, and listen addresses. Destroying the node stops the driver task,
//! which closes every listener and overlay connection the node held.

use futures::StreamExt;
use libp2p::{
    core::transport::ListenerId,
    identify, mdns,
    multiaddr::Protocol,
    swarm::SwarmEvent,
    identity::Keypair,
    Multiaddr, PeerId, Swarm,
};
use libp2p_stream as stream;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::behaviour::{OverlayBehaviour, OverlayBehaviourEvent, TUNNEL_PROTOCOL};
use super::transport::{build_swarm, TransportConfig};
use crate::error::{P2ProxyError, Result};

/// Commands handled by the swarm driver
enum NodeCommand {
    Listen {
        address: Multiaddr,
        reply: oneshot::Sender<Result<Multiaddr>>,
    },
    Shutdown,
}

/// Handle to a running overlay node
pub struct OverlayNode {
    peer_id: PeerId,
    control: stream::Control,
    command_tx: mpsc::Sender<NodeCommand>,
    driver: JoinHandle<()>,
}

impl OverlayNode {
    /// Build the swarm for `keypair`, dial `bootstrap` and start driving it
    pub fn spawn(keypair: Keypair, config: &TransportConfig, bootstrap: &[Multiaddr]) -> Result<Self> {
        let peer_id = keypair.public().to_peer_id();
        let mut swarm = build_swarm(keypair, config)?;
        let control = swarm.behaviour().stream.new_control();

        info!("Local peer ID: {}", peer_id);

        // Dial bootstrap peers for relay/overlay connectivity
        for addr in bootstrap {
            let remote = match addr.iter().last() {
                Some(Protocol::P2p(remote)) => Some(remote),
                _ => None,
            };
            if let Some(remote) = remote {
                let mut bare = addr.clone();
                bare.pop();
                swarm.add_peer_address(remote, bare);
            }

            info!("Dialing bootstrap peer: {}", addr);
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!("Failed to dial bootstrap peer {}: {}", addr, e);
            }
        }

        let (command_tx, command_rx) = mpsc::channel(16);
        let driver = tokio::spawn(drive(swarm, command_rx));

        Ok(Self {
            peer_id,
            control,
            command_tx,
            driver,
        })
    }

    /// Get our transport peer ID
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Get a control handle for opening outgoing streams
    pub fn stream_control(&self) -> stream::Control {
        self.control.clone()
    }

    /// Start accepting tunnel streams. Dropping the returned receiver stops
    /// accepting; further tunnel streams are refused by the remote's node.
    pub fn accept_tunnels(&self) -> Result<stream::IncomingStreams> {
        self.control
            .clone()
            .accept(TUNNEL_PROTOCOL)
            .map_err(|e| P2ProxyError::NetworkInitialization(e.to_string()))
    }

    /// Listen on `address`, resolving once the listener is bound.
    /// Returns the bound address with `/p2p/<peer-id>` appended.
    pub async fn listen(&self, address: Multiaddr) -> Result<Multiaddr> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(NodeCommand::Listen { address, reply })
            .await
            .map_err(|_| P2ProxyError::NodeShutdown)?;

        let bound = rx.await.map_err(|_| P2ProxyError::NodeShutdown)??;
        Ok(bound.with(Protocol::P2p(self.peer_id)))
    }

    /// Release every overlay resource held by this node
    pub async fn destroy(self) {
        info!("Shutting down overlay node {}", self.peer_id);
        let _ = self.command_tx.send(NodeCommand::Shutdown).await;
        if let Err(e) = self.driver.await {
            warn!("Overlay driver ended abnormally: {}", e);
        }
    }
}

/// Run the swarm until shutdown is requested or every handle is gone
async fn drive(mut swarm: Swarm<OverlayBehaviour>, mut command_rx: mpsc::Receiver<NodeCommand>) {
    let mut pending_listens: HashMap<ListenerId, (Multiaddr, oneshot::Sender<Result<Multiaddr>>)> =
        HashMap::new();
    let mut listeners = Vec::new();

    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(NodeCommand::Listen { address, reply }) => match swarm.listen_on(address.clone()) {
                    Ok(id) => {
                        listeners.push(id);
                        pending_listens.insert(id, (address, reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(P2ProxyError::ListenFailed {
                            address: address.to_string(),
                            reason: e.to_string(),
                        }));
                    }
                },
                Some(NodeCommand::Shutdown) | None => break,
            },

            event = swarm.select_next_some() => {
                handle_swarm_event(&mut swarm, &mut pending_listens, event);
            }
        }
    }

    for id in listeners {
        swarm.remove_listener(id);
    }
    debug!("Overlay driver for {} stopped", swarm.local_peer_id());
}

fn handle_swarm_event(
    swarm: &mut Swarm<OverlayBehaviour>,
    pending_listens: &mut HashMap<ListenerId, (Multiaddr, oneshot::Sender<Result<Multiaddr>>)>,
    event: SwarmEvent<OverlayBehaviourEvent>,
) {
    match event {
        SwarmEvent::NewListenAddr { listener_id, address } => {
            info!("Listening on {}", address);
            if let Some((_, reply)) = pending_listens.remove(&listener_id) {
                let _ = reply.send(Ok(address));
            }
        }

        SwarmEvent::ListenerClosed { listener_id, reason, .. } => {
            if let Some((address, reply)) = pending_listens.remove(&listener_id) {
                let reason = match reason {
                    Ok(()) => "listener closed".to_string(),
                    Err(e) => e.to_string(),
                };
                let _ = reply.send(Err(P2ProxyError::ListenFailed {
                    address: address.to_string(),
                    reason,
                }));
            }
        }

        SwarmEvent::ListenerError { listener_id, error } => {
            warn!("Listener error: {}", error);
            if let Some((address, reply)) = pending_listens.remove(&listener_id) {
                let _ = reply.send(Err(P2ProxyError::ListenFailed {
                    address: address.to_string(),
                    reason: error.to_string(),
                }));
            }
        }

        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            debug!("Connected to peer: {}", peer_id);
        }

        SwarmEvent::ConnectionClosed { peer_id, .. } => {
            debug!("Disconnected from peer: {}", peer_id);
        }

        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
            if let Some(peer_id) = peer_id {
                warn!("Failed to connect to {}: {}", peer_id, error);
            }
        }

        SwarmEvent::Behaviour(event) => handle_behaviour_event(swarm, event),

        _ => {}
    }
}

fn handle_behaviour_event(swarm: &mut Swarm<OverlayBehaviour>, event: OverlayBehaviourEvent) {
    match event {
        OverlayBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
            for (peer_id, addr) in peers {
                debug!("Discovered peer via mDNS: {} at {}", peer_id, addr);
                swarm.add_peer_address(peer_id, addr);
            }
        }

        OverlayBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
            debug!("Identified peer {}: {:?}", peer_id, info.agent_version);
            for addr in info.listen_addrs {
                swarm.add_peer_address(peer_id, addr);
            }
        }

        OverlayBehaviourEvent::Dcutr(libp2p::dcutr::Event { remote_peer_id, result }) => match result {
            Ok(_) => info!("Hole punch succeeded with {}", remote_peer_id),
            Err(e) => warn!("Hole punch failed with {}: {:?}", remote_peer_id, e),
        },

        _ => {}
    }
}
