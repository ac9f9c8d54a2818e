//! Peer connection handling
//!
//! One [`Connection`] per outbound peer: TCP dial, version/verack handshake,
//! then a reader task that surfaces parsed messages and a writer task that
//! drains a send queue. The node never blocks on a peer; sends enqueue and
//! the writer flushes them in order.

use crate::protocol::{
    self, encode_frame, FrameHeader, InvItem, Message, NetworkAddress, VersionMessage,
    HEADER_SIZE,
};
use crate::{NetworkConfig, NetworkError, Result};
use rustcoin_core::{Hash256, ZERO_HASH};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
    time::timeout,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Events emitted by one connection
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A parsed message arrived
    Message {
        conn: Arc<Connection>,
        message: Message,
    },
    /// The connection closed
    Disconnected { conn_id: Uuid, reason: String },
}

/// An established, fully-handshaken peer connection
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub addr: SocketAddr,
    /// Peer's advertised protocol version
    pub peer_version: u32,
    /// Peer's advertised best height at handshake time
    pub start_height: i32,
    /// Peer's advertised user agent
    pub user_agent: String,
    magic: u32,
    writer_tx: mpsc::UnboundedSender<Message>,
}

impl Connection {
    /// Dial a peer and complete the version handshake. The returned
    /// connection is ready to relay; inbound messages flow to `events`.
    pub async fn connect(
        addr: SocketAddr,
        config: &NetworkConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<Self>> {
        let stream = timeout(config.connection_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        let (mut reader, mut writer) = stream.into_split();

        let version = handshake(addr, config, &mut reader, &mut writer).await?;
        debug!(
            "handshake complete with {} ({}, height {})",
            addr, version.user_agent, version.start_height
        );

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            addr,
            peer_version: version.version,
            start_height: version.start_height,
            user_agent: version.user_agent,
            magic: config.magic,
            writer_tx,
        });

        conn.spawn_writer(writer, writer_rx);
        conn.spawn_reader(reader, events);

        Ok(conn)
    }

    /// Queue a message for delivery
    pub fn send(&self, message: Message) -> Result<()> {
        self.writer_tx
            .send(message)
            .map_err(|_| NetworkError::ConnectionFailed("send queue closed".to_string()))
    }

    pub fn send_inv(&self, items: Vec<InvItem>) -> Result<()> {
        self.send(Message::Inv(items))
    }

    pub fn send_getdata(&self, items: Vec<InvItem>) -> Result<()> {
        self.send(Message::GetData(items))
    }

    pub fn send_tx(&self, tx: rustcoin_core::transaction::Transaction) -> Result<()> {
        self.send(Message::Tx(tx))
    }

    pub fn send_getblocks(&self, locator: Vec<Hash256>) -> Result<()> {
        self.send(Message::GetBlocks {
            version: protocol::PROTOCOL_VERSION,
            locator,
            hash_stop: ZERO_HASH,
        })
    }

    fn spawn_writer(
        self: &Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut writer_rx: mpsc::UnboundedReceiver<Message>,
    ) {
        let magic = self.magic;
        let conn_id = self.id;
        tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                let frame = encode_frame(magic, &message);
                if let Err(e) = writer.write_all(&frame).await {
                    warn!("write to peer {} failed: {}", conn_id, e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    warn!("flush to peer {} failed: {}", conn_id, e);
                    break;
                }
            }
            debug!("writer for peer {} terminated", conn_id);
        });
    }

    fn spawn_reader(
        self: &Arc<Self>,
        mut reader: OwnedReadHalf,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let reason = loop {
                match read_message(&mut reader, conn.magic).await {
                    Ok(Some(Message::Ping(nonce))) => {
                        // Keep-alive is answered here; the node never sees it
                        let _ = conn.send(Message::Pong(nonce));
                    }
                    Ok(Some(Message::Pong(_))) => {}
                    Ok(Some(message)) => {
                        let event = ConnectionEvent::Message {
                            conn: Arc::clone(&conn),
                            message,
                        };
                        if events.send(event).is_err() {
                            break "event stream closed".to_string();
                        }
                    }
                    Ok(None) => {}
                    Err(NetworkError::IoError(e)) => break format!("read failed: {e}"),
                    Err(e) => {
                        warn!("peer {} sent a bad frame: {}", conn.id, e);
                        break format!("protocol violation: {e}");
                    }
                }
            };
            let _ = events.send(ConnectionEvent::Disconnected {
                conn_id: conn.id,
                reason,
            });
        });
    }
}

/// Read one frame; `Ok(None)` for commands this node does not speak.
async fn read_message(reader: &mut OwnedReadHalf, magic: u32) -> Result<Option<Message>> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::parse(&header_bytes, magic)?;

    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload).await?;
    header.check_payload(&payload)?;

    Message::decode_payload(&header.command, &payload)
}

async fn write_message(writer: &mut OwnedWriteHalf, magic: u32, message: &Message) -> Result<()> {
    let frame = encode_frame(magic, message);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Version/verack exchange: send our version, collect the peer's version
/// (acknowledging it) and their verack, in either order.
async fn handshake(
    addr: SocketAddr,
    config: &NetworkConfig,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
) -> Result<VersionMessage> {
    let local_version = Message::Version(VersionMessage {
        version: config.protocol_version,
        services: protocol::services::NODE_NETWORK,
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64,
        addr_recv: match addr {
            SocketAddr::V4(v4) => {
                NetworkAddress::from_ipv4(v4.ip().octets(), v4.port(), 0)
            }
            SocketAddr::V6(v6) => NetworkAddress::new(v6.ip().octets(), v6.port(), 0),
        },
        addr_from: NetworkAddress::unspecified(),
        nonce: rand::random(),
        user_agent: config.user_agent.clone(),
        start_height: config.start_height,
    });
    write_message(writer, config.magic, &local_version).await?;

    let exchange = async {
        let mut peer_version: Option<VersionMessage> = None;
        let mut acked = false;
        while peer_version.is_none() || !acked {
            match read_message(reader, config.magic).await? {
                Some(Message::Version(v)) => {
                    write_message(writer, config.magic, &Message::Verack).await?;
                    peer_version = Some(v);
                }
                Some(Message::Verack) => {
                    acked = true;
                }
                Some(other) => {
                    return Err(NetworkError::HandshakeFailed(format!(
                        "unexpected {} before handshake finished",
                        other.command()
                    )));
                }
                None => {}
            }
        }
        Ok(peer_version.expect("loop exits only with a version"))
    };

    timeout(config.handshake_timeout, exchange)
        .await
        .map_err(|_| NetworkError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal peer side of the handshake, for loopback tests
    async fn accept_one(listener: TcpListener) -> TcpStream {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let config = NetworkConfig::default();

        // Expect the dialer's version first
        match read_message(&mut reader, config.magic).await.unwrap() {
            Some(Message::Version(_)) => {}
            other => panic!("expected version, got {other:?}"),
        }
        let version = Message::Version(VersionMessage {
            version: protocol::PROTOCOL_VERSION,
            services: protocol::services::NODE_NETWORK,
            timestamp: 0,
            addr_recv: NetworkAddress::unspecified(),
            addr_from: NetworkAddress::unspecified(),
            nonce: 1,
            user_agent: "/peer:1.0/".to_string(),
            start_height: 7,
        });
        write_message(&mut writer, config.magic, &version)
            .await
            .unwrap();
        write_message(&mut writer, config.magic, &Message::Verack)
            .await
            .unwrap();
        match read_message(&mut reader, config.magic).await.unwrap() {
            Some(Message::Verack) => {}
            other => panic!("expected verack, got {other:?}"),
        }
        reader.reunite(writer).unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer_side = tokio::spawn(accept_one(listener));

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let conn = Connection::connect(addr, &NetworkConfig::default(), events_tx)
            .await
            .unwrap();
        assert_eq!(conn.start_height, 7);
        assert_eq!(conn.user_agent, "/peer:1.0/");

        // Peer announces an inventory; it surfaces as a parsed event
        let stream = peer_side.await.unwrap();
        let (_reader, mut writer) = stream.into_split();
        let inv = Message::Inv(vec![InvItem::tx([9u8; 32])]);
        write_message(&mut writer, protocol::MAINNET_MAGIC, &inv)
            .await
            .unwrap();

        match events_rx.recv().await.unwrap() {
            ConnectionEvent::Message {
                message: Message::Inv(items),
                ..
            } => assert_eq!(items[0].hash, [9u8; 32]),
            other => panic!("expected inv event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_surfaces_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer_side = tokio::spawn(accept_one(listener));

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let conn = Connection::connect(addr, &NetworkConfig::default(), events_tx)
            .await
            .unwrap();

        // Closing the peer side ends the reader
        drop(peer_side.await.unwrap());

        match events_rx.recv().await.unwrap() {
            ConnectionEvent::Disconnected { conn_id, .. } => assert_eq!(conn_id, conn.id),
            other => panic!("expected disconnect event, got {other:?}"),
        }
    }
}
