//! Peer manager flow against a scripted remote peer.

use rustcoin_network::peer::Connection;
use rustcoin_network::protocol::{
    encode_frame, FrameHeader, InvItem, Message, NetworkAddress, VersionMessage, HEADER_SIZE,
    MAINNET_MAGIC, PROTOCOL_VERSION,
};
use rustcoin_network::{NetEvent, NetworkConfig, PeerManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn read_remote(stream: &mut TcpStream) -> Option<Message> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_bytes).await.ok()?;
    let header = FrameHeader::parse(&header_bytes, MAINNET_MAGIC).unwrap();
    let mut payload = vec![0u8; header.length as usize];
    stream.read_exact(&mut payload).await.unwrap();
    header.check_payload(&payload).unwrap();
    Message::decode_payload(&header.command, &payload).unwrap()
}

async fn write_remote(stream: &mut TcpStream, message: &Message) {
    let frame = encode_frame(MAINNET_MAGIC, message);
    stream.write_all(&frame).await.unwrap();
    stream.flush().await.unwrap();
}

/// Play the remote side of the handshake and hand back the raw stream.
async fn remote_peer(listener: TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    match read_remote(&mut stream).await {
        Some(Message::Version(_)) => {}
        other => panic!("expected version first, got {other:?}"),
    }
    let version = Message::Version(VersionMessage {
        version: PROTOCOL_VERSION,
        services: 1,
        timestamp: 0,
        addr_recv: NetworkAddress::unspecified(),
        addr_from: NetworkAddress::unspecified(),
        nonce: 99,
        user_agent: "/remote:0.1/".to_string(),
        start_height: 123,
    });
    write_remote(&mut stream, &version).await;
    write_remote(&mut stream, &Message::Verack).await;
    match read_remote(&mut stream).await {
        Some(Message::Verack) => {}
        other => panic!("expected verack, got {other:?}"),
    }
    stream
}

#[tokio::test]
async fn test_manager_connects_and_signals_net_connected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let remote = tokio::spawn(remote_peer(listener));

    let manager = Arc::new(PeerManager::new(NetworkConfig::default()));
    let mut events = manager.take_events().await.unwrap();

    let conn: Arc<Connection> = manager.connect(addr).await.unwrap();
    assert_eq!(conn.start_height, 123);
    assert_eq!(manager.connection_count().await, 1);

    match tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        NetEvent::NetConnected => {}
        other => panic!("expected NetConnected, got {other:?}"),
    }

    // Messages from the remote surface through the shared stream
    let mut stream = remote.await.unwrap();
    write_remote(&mut stream, &Message::Inv(vec![InvItem::block([7u8; 32])])).await;
    match tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        NetEvent::Message {
            message: Message::Inv(items),
            ..
        } => assert_eq!(items[0].hash, [7u8; 32]),
        other => panic!("expected inv, got {other:?}"),
    }

    // Broadcast reaches the one registered connection
    assert_eq!(manager.broadcast(Message::Ping(5)).await, 1);
    match read_remote(&mut stream).await {
        Some(Message::Ping(5)) => {}
        other => panic!("expected ping, got {other:?}"),
    }

    // Dropping the remote unregisters the connection
    drop(stream);
    match tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        NetEvent::Disconnected { conn_id, .. } => assert_eq!(conn_id, conn.id),
        other => panic!("expected disconnect, got {other:?}"),
    }
    assert_eq!(manager.connection_count().await, 0);
}
