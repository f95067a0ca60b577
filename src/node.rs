//! # Node
//!
//! Wires an [`Identity`], a [`PeerDirectory`] and a [`Transport`] into one
//! running peer. The node answers pings on its own and turns everything else
//! the console cares about into [`NodeEvent`]s.

use anyhow::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::Identity;
use crate::peers::{PeerDirectory, PeerRecord};
use crate::transport::{Transport, TransportConfig};
use crate::wire::{MessageKind, WireMessage};

/// Something the user should see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Connected(String),
    Disconnected(String),
    Text { peer_id: String, text: String },
    Pong { peer_id: String },
    PeerList { peer_id: String, peers: Vec<String> },
}

pub struct Node {
    identity: Identity,
    directory: PeerDirectory,
    transport: Transport,
    peers_file: PathBuf,
}

impl Node {
    /// Build a node and the receiver for its events.
    pub fn new(
        identity: Identity,
        listen_port: u16,
        peers_file: PathBuf,
        transport_config: TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let directory = PeerDirectory::new();
        directory.set_local(PeerRecord {
            id: identity.peer_id(),
            address: "0.0.0.0".to_string(),
            port: listen_port,
            public_key: identity.public_key_bytes().to_vec(),
            connected: true,
            last_seen: chrono::Utc::now(),
        });

        let transport = Transport::new(directory.clone(), transport_config);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        install_handlers(&transport, events_tx);

        let node = Self {
            identity,
            directory,
            transport,
            peers_file,
        };
        (node, events_rx)
    }

    pub fn from_config(
        identity: Identity,
        config: &Config,
    ) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        Self::new(
            identity,
            config.listen_port,
            config.peers_file.clone(),
            config.transport_config(),
        )
    }

    /// Start listening. Bind failures are returned to the caller.
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        let addr = self.transport.start(port).await?;
        let mut local = self.directory.get_local();
        local.port = addr.port();
        self.directory.set_local(local);
        Ok(addr)
    }

    pub async fn connect(&self, address: &str, port: u16) -> Result<()> {
        self.transport.connect_to_peer(address, port).await?;
        Ok(())
    }

    pub fn disconnect(&self, peer_id: &str) -> bool {
        self.transport.disconnect_peer(peer_id)
    }

    pub fn send(&self, peer_id: &str, text: &str) -> Result<()> {
        self.transport.send_message(peer_id, &WireMessage::text(text))?;
        Ok(())
    }

    /// Returns the number of peers the text was queued for.
    pub fn broadcast(&self, text: &str) -> usize {
        self.transport.broadcast_message(&WireMessage::text(text))
    }

    pub fn ping(&self, peer_id: &str) -> Result<()> {
        self.transport.send_message(peer_id, &WireMessage::ping())?;
        Ok(())
    }

    /// Send `peer_id` the endpoints of every other connected peer.
    pub fn share_peers(&self, peer_id: &str) -> Result<usize> {
        let endpoints: Vec<String> = self
            .directory
            .list_connected()
            .into_iter()
            .filter(|record| record.id != peer_id)
            .map(|record| record.endpoint())
            .collect();

        self.transport
            .send_message(peer_id, &WireMessage::peer_list(&endpoints)?)?;
        Ok(endpoints.len())
    }

    pub fn list_peers(&self) -> Vec<PeerRecord> {
        let mut peers = self.directory.list_all();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn local_peer_info(&self) -> PeerRecord {
        self.directory.get_local()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub async fn load_peers(&self) -> Result<usize> {
        self.directory.load(&self.peers_file).await
    }

    pub async fn save_peers(&self) -> Result<usize> {
        self.directory.save(&self.peers_file).await
    }

    /// Close every session, then persist the directory.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down node {}", self.identity.peer_id());
        self.transport.stop().await;
        self.save_peers().await?;
        Ok(())
    }
}

fn install_handlers(transport: &Transport, events: mpsc::UnboundedSender<NodeEvent>) {
    let replies = transport.downgrade();
    let message_events = events.clone();
    transport.set_message_handler(Some(Arc::new(move |peer_id: &str, message: &WireMessage| {
        let event = match message.kind() {
            MessageKind::Text => Some(NodeEvent::Text {
                peer_id: peer_id.to_string(),
                text: message.text_payload().into_owned(),
            }),
            MessageKind::Ping => {
                if let Some(transport) = replies.upgrade() {
                    if let Err(e) = transport.send_message(peer_id, &WireMessage::pong()) {
                        warn!("Failed to answer ping from {}: {}", peer_id, e);
                    }
                }
                None
            }
            MessageKind::Pong => Some(NodeEvent::Pong {
                peer_id: peer_id.to_string(),
            }),
            MessageKind::PeerList => match message.to_peer_list() {
                Ok(peers) => Some(NodeEvent::PeerList {
                    peer_id: peer_id.to_string(),
                    peers,
                }),
                Err(e) => {
                    warn!("Ignoring malformed peer list from {}: {}", peer_id, e);
                    None
                }
            },
            kind => {
                debug!("Ignoring {:?} message from {}", kind, peer_id);
                None
            }
        };

        if let Some(event) = event {
            let _ = message_events.send(event);
        }
    })));

    transport.set_connection_handler(Some(Arc::new(move |peer_id: &str, connected: bool| {
        let event = if connected {
            NodeEvent::Connected(peer_id.to_string())
        } else {
            NodeEvent::Disconnected(peer_id.to_string())
        };
        let _ = events.send(event);
    })));
}
