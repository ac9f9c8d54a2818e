//! Async P2P networking layer for the chain-and-pool engine
//!
//! Outbound-only: the node dials its configured seed peers, completes the
//! version handshake, and surfaces parsed messages through a single event
//! stream. Peer discovery beyond the seed list is out of scope.

pub mod peer;
pub mod protocol;
pub mod sender;

use peer::Connection;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Network error types
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("network timeout")]
    Timeout,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("message checksum mismatch")]
    ChecksumMismatch,

    #[error("unexpected network magic {0:#010x}")]
    BadMagic(u32),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetworkError>;

/// Network configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Network magic bytes (mainnet/testnet)
    pub magic: u32,
    /// Protocol version advertised in the handshake
    pub protocol_version: u32,
    /// User agent advertised in the handshake
    pub user_agent: String,
    /// Seed peers to dial on startup
    pub seeds: Vec<SocketAddr>,
    /// TCP connect timeout
    pub connection_timeout: Duration,
    /// Version/verack exchange timeout
    pub handshake_timeout: Duration,
    /// Best height advertised in the handshake
    pub start_height: i32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            magic: protocol::MAINNET_MAGIC,
            protocol_version: protocol::PROTOCOL_VERSION,
            user_agent: "/rustcoin:0.4.0/".to_string(),
            seeds: Vec::new(),
            connection_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            start_height: 0,
        }
    }
}

/// Events surfaced to the node
#[derive(Debug)]
pub enum NetEvent {
    /// First peer finished its handshake
    NetConnected,
    /// A parsed message arrived from a peer
    Message {
        conn: Arc<Connection>,
        message: protocol::Message,
    },
    /// A peer connection closed
    Disconnected { conn_id: Uuid, reason: String },
}

/// Manages the set of outbound peer connections
pub struct PeerManager {
    config: NetworkConfig,
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
    events_tx: mpsc::UnboundedSender<NetEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<NetEvent>>>,
    connected_once: AtomicBool,
}

impl PeerManager {
    pub fn new(config: NetworkConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            connected_once: AtomicBool::new(false),
        }
    }

    /// Take the event stream. Yields once; the node owns the receiver.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<NetEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Dial every configured seed. Connections that fail are logged and
    /// skipped; the first success emits [`NetEvent::NetConnected`].
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.config.seeds.is_empty() {
            warn!("no seed peers configured; the node will idle until peers exist");
        }
        for seed in self.config.seeds.clone() {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                match manager.connect(seed).await {
                    Ok(conn) => {
                        info!("🤝 Connected to peer {} ({})", seed, conn.id);
                    }
                    Err(e) => {
                        warn!("failed to connect to seed {}: {}", seed, e);
                    }
                }
            });
        }
        Ok(())
    }

    /// Dial one peer and register the resulting connection.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<Connection>> {
        let (conn_events_tx, mut conn_events_rx) = mpsc::unbounded_channel();
        let conn = Connection::connect(addr, &self.config, conn_events_tx).await?;

        self.connections
            .write()
            .await
            .insert(conn.id, Arc::clone(&conn));

        if !self.connected_once.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(NetEvent::NetConnected);
        }

        // Pump connection events into the shared stream, dropping the
        // registration when the peer goes away
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = conn_events_rx.recv().await {
                match event {
                    peer::ConnectionEvent::Message { conn, message } => {
                        let _ = manager.events_tx.send(NetEvent::Message { conn, message });
                    }
                    peer::ConnectionEvent::Disconnected { conn_id, reason } => {
                        manager.connections.write().await.remove(&conn_id);
                        let _ = manager
                            .events_tx
                            .send(NetEvent::Disconnected { conn_id, reason });
                        break;
                    }
                }
            }
        });

        Ok(conn)
    }

    /// All currently registered connections
    pub async fn active_connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a message to every active connection; returns how many accepted it
    pub async fn broadcast(&self, message: protocol::Message) -> usize {
        let connections = self.active_connections().await;
        let mut sent = 0;
        for conn in connections {
            if conn.send(message.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_config_default() {
        let config = NetworkConfig::default();
        assert_eq!(config.magic, protocol::MAINNET_MAGIC);
        assert!(config.seeds.is_empty());
        assert!(config.user_agent.contains("rustcoin"));
    }

    #[tokio::test]
    async fn test_take_events_yields_once() {
        let manager = PeerManager::new(NetworkConfig::default());
        assert!(manager.take_events().await.is_some());
        assert!(manager.take_events().await.is_none());
    }
}
