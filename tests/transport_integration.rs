//! Integration tests for the TCP transport
//!
//! These tests run real transports on loopback ports and drive them either
//! from another transport or from a raw `TcpStream` speaking the wire format.

use std::time::Duration;

use assert_matches::assert_matches;
use peerchat::peers::{PeerDirectory, PeerRecord};
use peerchat::transport::{Transport, TransportConfig, TransportError};
use peerchat::wire::{declared_payload_len, MessageKind, WireMessage, HEADER_LEN, MAX_PAYLOAD_LEN};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

struct TestPeer {
    id: String,
    port: u16,
    transport: Transport,
    directory: PeerDirectory,
    messages: UnboundedReceiver<(String, WireMessage)>,
    connections: UnboundedReceiver<(String, bool)>,
}

async fn start_peer(id: &str) -> TestPeer {
    let directory = PeerDirectory::new();
    directory.set_local(PeerRecord {
        id: id.to_string(),
        address: "127.0.0.1".to_string(),
        port: 0,
        public_key: vec![id.len() as u8; 32],
        connected: true,
        last_seen: chrono::Utc::now(),
    });

    let transport = Transport::new(
        directory.clone(),
        TransportConfig {
            connect_timeout: Duration::from_secs(2),
            max_pending_frames: 4,
            max_pending_bytes: 1024,
            ..TransportConfig::default()
        },
    );

    let (message_tx, messages) = mpsc::unbounded_channel();
    transport.set_message_handler(Some(Arc::new(move |peer_id: &str, message: &WireMessage| {
        let _ = message_tx.send((peer_id.to_string(), message.clone()));
    })));

    let (connection_tx, connections) = mpsc::unbounded_channel();
    transport.set_connection_handler(Some(Arc::new(move |peer_id: &str, connected: bool| {
        let _ = connection_tx.send((peer_id.to_string(), connected));
    })));

    let addr = transport.start(0).await.unwrap();

    TestPeer {
        id: id.to_string(),
        port: addr.port(),
        transport,
        directory,
        messages,
        connections,
    }
}

async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("callback channel closed")
}

/// Next message of `kind`, skipping anything else (handshakes, mostly).
async fn recv_kind(rx: &mut UnboundedReceiver<(String, WireMessage)>, kind: MessageKind) -> (String, WireMessage) {
    loop {
        let (peer_id, message) = recv(rx).await;
        if message.kind() == kind {
            return (peer_id, message);
        }
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Assert nothing else arrives within a short grace period.
async fn assert_quiet<T: std::fmt::Debug>(rx: &mut UnboundedReceiver<T>) {
    sleep(Duration::from_millis(200)).await;
    assert_matches!(rx.try_recv(), Err(_));
}

async fn read_message(stream: &mut TcpStream) -> WireMessage {
    timeout(WAIT, async {
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).await.unwrap();
        let mut frame = header.to_vec();
        frame.resize(HEADER_LEN + declared_payload_len(&header), 0);
        stream.read_exact(&mut frame[HEADER_LEN..]).await.unwrap();
        WireMessage::deserialize(&frame).unwrap()
    })
    .await
    .expect("timed out reading frame")
}

/// Wait until the remote end closes the connection.
async fn assert_closed(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    let result = timeout(WAIT, stream.read_to_end(&mut rest)).await;
    assert!(result.is_ok(), "connection was not closed");
}

async fn raw_handshake(port: u16, peer_id: &str) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let hello = WireMessage::handshake(peer_id, &[7u8; 32]).unwrap();
    stream.write_all(&hello.serialize()).await.unwrap();
    stream
}

#[tokio::test]
async fn test_handshake_binds_both_sides() {
    let mut alice = start_peer("alice").await;
    let mut bob = start_peer("bob").await;

    alice.transport.connect_to_peer("127.0.0.1", bob.port).await.unwrap();

    assert_eq!(recv(&mut bob.connections).await, ("alice".to_string(), true));
    assert_eq!(recv(&mut alice.connections).await, ("bob".to_string(), true));
    assert_eq!(alice.transport.connected_peers(), vec!["bob".to_string()]);
    assert_eq!(bob.transport.connected_peers(), vec!["alice".to_string()]);

    // Outbound side records the address it dialed.
    let bob_record = alice.directory.get("bob").unwrap();
    assert!(bob_record.connected);
    assert_eq!(bob_record.address, "127.0.0.1");
    assert_eq!(bob_record.port, bob.port);
    assert_eq!(bob_record.public_key, vec![3u8; 32]);

    // Inbound side records what it observed.
    let alice_record = bob.directory.get("alice").unwrap();
    assert!(alice_record.connected);
    assert_eq!(alice_record.address, "127.0.0.1");
    assert_eq!(alice_record.public_key, vec![5u8; 32]);

    alice.transport.stop().await;
    bob.transport.stop().await;
}

#[tokio::test]
async fn test_text_delivered_exactly_once() {
    let mut alice = start_peer("alice").await;
    let mut bob = start_peer("bob").await;

    alice.transport.connect_to_peer("127.0.0.1", bob.port).await.unwrap();
    recv(&mut alice.connections).await;

    alice
        .transport
        .send_message("bob", &WireMessage::text("Hello"))
        .unwrap();

    let (from, message) = recv_kind(&mut bob.messages, MessageKind::Text).await;
    assert_eq!(from, alice.id);
    assert_eq!(message.payload(), b"Hello");
    assert_quiet(&mut bob.messages).await;

    alice.transport.stop().await;
    bob.transport.stop().await;
}

#[tokio::test]
async fn test_inbound_session_replies_with_handshake() {
    let bob = start_peer("bob").await;
    let mut client = raw_handshake(bob.port, "carol").await;

    let reply = read_message(&mut client).await;
    let handshake = reply.to_handshake().unwrap();
    assert_eq!(handshake.peer_id, bob.id);
    assert_eq!(handshake.public_key, vec![3u8; 32]);

    bob.transport.stop().await;
}

#[tokio::test]
async fn test_duplicate_handshake_supersedes_old_session() {
    let mut bob = start_peer("bob").await;

    let mut first = raw_handshake(bob.port, "xavier").await;
    assert_eq!(recv(&mut bob.connections).await, ("xavier".to_string(), true));
    read_message(&mut first).await;

    let mut second = raw_handshake(bob.port, "xavier").await;
    assert_eq!(recv(&mut bob.connections).await, ("xavier".to_string(), true));
    read_message(&mut second).await;

    assert_closed(&mut first).await;
    wait_for(|| bob.transport.session_count() == 1).await;
    assert_eq!(bob.transport.connected_peers(), vec!["xavier".to_string()]);
    assert_quiet(&mut bob.connections).await;

    bob.transport
        .send_message("xavier", &WireMessage::text("still here"))
        .unwrap();
    let message = read_message(&mut second).await;
    assert_eq!(message.kind(), MessageKind::Text);
    assert_eq!(message.payload(), b"still here");

    bob.transport.stop().await;
}

#[tokio::test]
async fn test_oversized_frame_closes_only_that_session() {
    let mut alice = start_peer("alice").await;
    let mut bob = start_peer("bob").await;

    alice.transport.connect_to_peer("127.0.0.1", bob.port).await.unwrap();
    assert_eq!(recv(&mut bob.connections).await.0, "alice");

    let mut rogue = raw_handshake(bob.port, "rogue").await;
    assert_eq!(recv(&mut bob.connections).await, ("rogue".to_string(), true));

    let mut header = WireMessage::text("").serialize();
    header[1..5].copy_from_slice(&((MAX_PAYLOAD_LEN as u32) + 1).to_be_bytes());
    rogue.write_all(&header).await.unwrap();

    assert_closed(&mut rogue).await;
    assert_eq!(recv(&mut bob.connections).await, ("rogue".to_string(), false));
    assert!(!bob.directory.get("rogue").unwrap().connected);
    assert_eq!(bob.transport.connected_peers(), vec!["alice".to_string()]);

    alice
        .transport
        .send_message("bob", &WireMessage::text("unaffected"))
        .unwrap();
    let (_, message) = recv_kind(&mut bob.messages, MessageKind::Text).await;
    assert_eq!(message.payload(), b"unaffected");

    alice.transport.stop().await;
    bob.transport.stop().await;
}

#[tokio::test]
async fn test_frames_before_handshake_are_delivered_after_binding() {
    let mut bob = start_peer("bob").await;

    let mut client = TcpStream::connect(("127.0.0.1", bob.port)).await.unwrap();
    client
        .write_all(&WireMessage::text("early").serialize())
        .await
        .unwrap();
    client
        .write_all(&WireMessage::handshake("zoe", &[1u8; 32]).unwrap().serialize())
        .await
        .unwrap();

    assert_eq!(recv(&mut bob.connections).await, ("zoe".to_string(), true));

    let (from, early) = recv(&mut bob.messages).await;
    assert_eq!(from, "zoe");
    assert_eq!(early.kind(), MessageKind::Text);
    assert_eq!(early.payload(), b"early");

    let (_, handshake) = recv(&mut bob.messages).await;
    assert_eq!(handshake.kind(), MessageKind::Handshake);

    bob.transport.stop().await;
}

#[tokio::test]
async fn test_pending_overflow_closes_session() {
    let mut bob = start_peer("bob").await;

    let mut client = TcpStream::connect(("127.0.0.1", bob.port)).await.unwrap();
    for _ in 0..5 {
        client.write_all(&WireMessage::ping().serialize()).await.unwrap();
    }

    assert_closed(&mut client).await;
    wait_for(|| bob.transport.session_count() == 0).await;
    assert_quiet(&mut bob.connections).await;
    assert_quiet(&mut bob.messages).await;

    bob.transport.stop().await;
}

#[tokio::test]
async fn test_self_connection_rejected() {
    let mut bob = start_peer("bob").await;

    let mut client = raw_handshake(bob.port, "bob").await;

    assert_closed(&mut client).await;
    wait_for(|| bob.transport.session_count() == 0).await;
    assert!(bob.transport.connected_peers().is_empty());
    assert_quiet(&mut bob.connections).await;

    bob.transport.stop().await;
}

#[tokio::test]
async fn test_pending_bytes_limit_closes_session() {
    let mut bob = start_peer("bob").await;

    let mut client = TcpStream::connect(("127.0.0.1", bob.port)).await.unwrap();
    let bulky = "x".repeat(2000);
    client
        .write_all(&WireMessage::text(&bulky).serialize())
        .await
        .unwrap();

    assert_closed(&mut client).await;
    wait_for(|| bob.transport.session_count() == 0).await;
    assert_quiet(&mut bob.connections).await;
    assert_quiet(&mut bob.messages).await;

    bob.transport.stop().await;
}

#[tokio::test]
async fn test_malformed_handshake_closes_session() {
    let mut alice = start_peer("alice").await;
    let mut bob = start_peer("bob").await;

    alice.transport.connect_to_peer("127.0.0.1", bob.port).await.unwrap();
    assert_eq!(recv(&mut bob.connections).await, ("alice".to_string(), true));
    recv(&mut alice.connections).await;

    // id_len says 50, only 3 id bytes follow.
    let mut payload = 50u16.to_be_bytes().to_vec();
    payload.extend_from_slice(b"abc");
    let frame = WireMessage::new(MessageKind::Handshake, payload).serialize();

    let mut client = TcpStream::connect(("127.0.0.1", bob.port)).await.unwrap();
    client.write_all(&frame).await.unwrap();

    assert_closed(&mut client).await;
    wait_for(|| bob.transport.session_count() == 1).await;
    assert_quiet(&mut bob.connections).await;
    assert_eq!(bob.transport.connected_peers(), vec!["alice".to_string()]);

    alice
        .transport
        .send_message("bob", &WireMessage::text("unaffected"))
        .unwrap();
    let (from, message) = recv_kind(&mut bob.messages, MessageKind::Text).await;
    assert_eq!(from, "alice");
    assert_eq!(message.payload(), b"unaffected");

    alice.transport.stop().await;
    bob.transport.stop().await;
}

async fn assert_handshake_rejected(peer_id: &str) {
    let mut bob = start_peer("bob").await;

    let mut client = raw_handshake(bob.port, peer_id).await;

    assert_closed(&mut client).await;
    wait_for(|| bob.transport.session_count() == 0).await;
    assert!(bob.transport.connected_peers().is_empty());
    assert!(bob.directory.is_empty());
    assert_quiet(&mut bob.connections).await;

    bob.transport.stop().await;
}

#[tokio::test]
async fn test_empty_peer_id_rejected() {
    assert_handshake_rejected("").await;
}

#[tokio::test]
async fn test_peer_id_with_separator_rejected() {
    assert_handshake_rejected("x|y").await;
}

#[tokio::test]
async fn test_peer_id_with_newline_rejected() {
    assert_handshake_rejected("a\nforged|6.6.6.6|666|abcd\nb").await;
}

#[tokio::test]
async fn test_bind_port_in_use() {
    let alice = start_peer("alice").await;
    let other = Transport::new(PeerDirectory::new(), TransportConfig::default());

    assert_matches!(
        other.start(alice.port).await,
        Err(TransportError::Bind { port, .. }) if port == alice.port
    );

    alice.transport.stop().await;
}

#[tokio::test]
async fn test_connect_refused() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let alice = start_peer("alice").await;
    assert_matches!(
        alice.transport.connect_to_peer("127.0.0.1", port).await,
        Err(TransportError::Connect { .. })
    );
    assert_eq!(alice.transport.session_count(), 0);

    alice.transport.stop().await;
}

#[tokio::test]
async fn test_disconnect_notifies_both_sides() {
    let mut alice = start_peer("alice").await;
    let mut bob = start_peer("bob").await;

    alice.transport.connect_to_peer("127.0.0.1", bob.port).await.unwrap();
    recv(&mut alice.connections).await;
    recv(&mut bob.connections).await;

    assert!(alice.transport.disconnect_peer("bob"));
    assert_eq!(recv(&mut alice.connections).await, ("bob".to_string(), false));
    assert_eq!(recv(&mut bob.connections).await, ("alice".to_string(), false));

    assert!(!alice.directory.get("bob").unwrap().connected);
    assert!(alice.transport.connected_peers().is_empty());
    assert!(!alice.transport.disconnect_peer("bob"));
    assert_matches!(
        alice.transport.send_message("bob", &WireMessage::ping()),
        Err(TransportError::UnknownPeer(_))
    );

    alice.transport.stop().await;
    bob.transport.stop().await;
}

#[tokio::test]
async fn test_broadcast_skips_unbound_sessions() {
    let mut alice = start_peer("alice").await;
    let mut bob = start_peer("bob").await;

    alice.transport.connect_to_peer("127.0.0.1", bob.port).await.unwrap();
    recv(&mut bob.connections).await;

    let _lurker = TcpStream::connect(("127.0.0.1", bob.port)).await.unwrap();
    wait_for(|| bob.transport.session_count() == 2).await;

    assert_eq!(bob.transport.broadcast_message(&WireMessage::text("all")), 1);
    let (from, message) = recv_kind(&mut alice.messages, MessageKind::Text).await;
    assert_eq!(from, "bob");
    assert_eq!(message.payload(), b"all");

    alice.transport.stop().await;
    bob.transport.stop().await;
}

#[tokio::test]
async fn test_stop_reports_disconnects() {
    let mut alice = start_peer("alice").await;
    let mut bob = start_peer("bob").await;

    alice.transport.connect_to_peer("127.0.0.1", bob.port).await.unwrap();
    recv(&mut alice.connections).await;

    bob.transport.stop().await;
    assert_eq!(recv(&mut bob.connections).await, ("alice".to_string(), true));
    assert_eq!(recv(&mut bob.connections).await, ("alice".to_string(), false));
    assert_eq!(recv(&mut alice.connections).await, ("bob".to_string(), false));
    assert_eq!(bob.transport.session_count(), 0);
    assert!(bob.transport.local_addr().is_none());

    alice.transport.stop().await;
}
