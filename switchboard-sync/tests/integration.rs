//! End-to-end tests over real WebSocket connections.
//!
//! Each test binds a server to a free port and connects peers through
//! `SyncClient`, or through a raw socket when the wire itself is checked.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use switchboard_core::{Operation, ReplicantKey, ReplicantOptions, ReplicantStatus};
use switchboard_sync::client::{ClientConfig, ConnectionState, SyncClient};
use switchboard_sync::peer::PeerReplicant;
use switchboard_sync::protocol::{MessageType, SyncMessage};
use switchboard_sync::registry::REVISION_MISMATCH;
use switchboard_sync::server::SyncServer;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Start a server on a free port, return it and its URL.
async fn start_test_server() -> (SyncServer, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::with_defaults();
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

fn scores() -> ReplicantKey {
    ReplicantKey::new("scores", "game")
}

fn scores_schema() -> Value {
    json!({"type": "object", "properties": {"home": {"type": "number", "default": 0}}})
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (server, url) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");

    for _ in 0..400 {
        if server.stats().await.active_connections == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("connection was never counted");
}

type RawSocket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Next protocol message, skipping heartbeat frames.
async fn next_message(ws: &mut RawSocket) -> SyncMessage {
    while let Some(frame) = ws.next().await {
        if let Message::Binary(data) = frame.unwrap() {
            let bytes: Vec<u8> = data.into();
            return SyncMessage::decode(&bytes).unwrap();
        }
    }
    panic!("connection ended before a binary frame");
}

#[tokio::test]
async fn test_authority_write_is_broadcast_on_the_wire() {
    let (server, url) = start_test_server().await;
    let authority = server
        .registry()
        .declare(scores(), ReplicantOptions::default().with_schema(scores_schema()))
        .await
        .unwrap();
    assert_eq!(authority.value(), Some(json!({"home": 0})));
    assert_eq!(authority.revision(), 0);

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join = SyncMessage::join_room(Uuid::new_v4(), 1, &scores()).unwrap();
    ws.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();

    let ack = timeout(Duration::from_secs(2), next_message(&mut ws)).await.unwrap();
    assert_eq!(ack.msg_type, MessageType::Ack);
    assert_eq!(ack.request_id, 1);

    authority.root().unwrap().set("home", 3).unwrap();
    authority.flush_operations();
    assert_eq!(authority.revision(), 1);

    let pushed = timeout(Duration::from_secs(2), next_message(&mut ws)).await.unwrap();
    let body = pushed.operations_body().unwrap();
    assert_eq!(body.key, scores());
    assert_eq!(body.revision, 1);
    assert_eq!(body.operations, vec![Operation::update("/", "home", json!(3))]);
    assert_eq!(
        serde_json::to_value(&body.operations[0]).unwrap(),
        json!({"path": "/", "method": "update", "args": {"prop": "home", "newValue": 3}})
    );
}

#[tokio::test]
async fn test_late_peer_receives_current_state() {
    let (server, url) = start_test_server().await;
    let authority = server
        .registry()
        .declare(scores(), ReplicantOptions::default().with_schema(scores_schema()))
        .await
        .unwrap();
    authority.root().unwrap().set("home", 3).unwrap();
    authority.flush_operations();

    let client = SyncClient::connect(ClientConfig::for_testing(&url)).await.unwrap();
    assert_eq!(client.state().await, ConnectionState::Connected);

    let changes = Arc::new(Mutex::new(Vec::new()));
    let peer = PeerReplicant::new(&client, scores(), ReplicantOptions::default());
    let seen = changes.clone();
    peer.on_change(move |change| seen.lock().unwrap().push(change.operations.len()));
    peer.declare().await.unwrap();

    assert_eq!(peer.value(), Some(json!({"home": 3})));
    assert_eq!(peer.revision(), 1);
    assert!(peer.schema().is_some(), "schema travels with the declaration");
    // One overwrite with the authoritative value, no replay of history.
    assert_eq!(*changes.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn test_two_peers_converge() {
    let (server, url) = start_test_server().await;
    server
        .registry()
        .declare(
            ReplicantKey::new("lobby", "players"),
            ReplicantOptions::default().with_default(json!([])),
        )
        .await
        .unwrap();
    let key = ReplicantKey::new("lobby", "players");

    let alice = SyncClient::connect(ClientConfig::for_testing(&url)).await.unwrap();
    let bob = SyncClient::connect(ClientConfig::for_testing(&url)).await.unwrap();
    let a = PeerReplicant::declared(&alice, key.clone(), ReplicantOptions::default())
        .await
        .unwrap();
    let b = PeerReplicant::declared(&bob, key.clone(), ReplicantOptions::default())
        .await
        .unwrap();

    a.root().unwrap().push(json!("alice")).unwrap();
    eventually(|| b.revision() == 1).await;
    b.root().unwrap().push(json!("bob")).unwrap();
    eventually(|| a.revision() == 2 && b.revision() == 2).await;

    assert_eq!(a.value(), Some(json!(["alice", "bob"])));
    assert_eq!(b.value(), a.value());
    assert_eq!(server.registry().read(&key).await, a.value());
}

#[tokio::test]
async fn test_stale_proposal_is_rejected_with_authoritative_state() {
    let (server, url) = start_test_server().await;
    let authority = server
        .registry()
        .declare(scores(), ReplicantOptions::default().with_schema(scores_schema()))
        .await
        .unwrap();

    let client = SyncClient::connect(ClientConfig::for_testing(&url)).await.unwrap();
    let peer = PeerReplicant::new(&client, scores(), ReplicantOptions::default());
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let seen = reasons.clone();
    peer.on_operations_rejected(move |reason| seen.lock().unwrap().push(reason.to_string()));
    peer.declare().await.unwrap();

    // Peer proposes at revision 1 while the authority is at 2.
    authority.apply_operations(vec![Operation::update("/", "home", json!(1))]).unwrap();
    eventually(|| peer.revision() == 1).await;
    peer.root().unwrap().set("home", 10).unwrap();
    authority.apply_operations(vec![Operation::update("/", "home", json!(2))]).unwrap();
    peer.flush_operations();

    eventually(|| !reasons.lock().unwrap().is_empty()).await;
    assert_eq!(*reasons.lock().unwrap(), vec![REVISION_MISMATCH.to_string()]);

    eventually(|| peer.value() == authority.value() && peer.revision() == authority.revision()).await;
    // The rejected proposal was still committed by the authority.
    assert_eq!(authority.revision(), 3);
    assert_eq!(authority.value(), Some(json!({"home": 10})));
}

#[tokio::test]
async fn test_invalid_peer_write_never_leaves_the_peer() {
    let (server, url) = start_test_server().await;
    let authority = server
        .registry()
        .declare(scores(), ReplicantOptions::default().with_schema(scores_schema()))
        .await
        .unwrap();
    let client = SyncClient::connect(ClientConfig::for_testing(&url)).await.unwrap();
    let peer = PeerReplicant::declared(&client, scores(), ReplicantOptions::default())
        .await
        .unwrap();

    assert!(peer.root().unwrap().set("home", "three").is_err());
    peer.flush_operations();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(authority.revision(), 0);
    assert_eq!(peer.value(), Some(json!({"home": 0})));
}

#[tokio::test]
async fn test_writes_before_declaration_are_replayed() {
    let (server, url) = start_test_server().await;
    let authority = server
        .registry()
        .declare(scores(), ReplicantOptions::default().with_default(json!({"home": 0})))
        .await
        .unwrap();
    let client = SyncClient::connect(ClientConfig::for_testing(&url)).await.unwrap();
    let peer = PeerReplicant::new(
        &client,
        scores(),
        ReplicantOptions::default().with_default(json!({"home": 0})),
    );

    peer.set_value(json!({"home": 6})).unwrap();
    assert_eq!(authority.revision(), 0);
    peer.declare().await.unwrap();

    eventually(|| authority.revision() == 1).await;
    assert_eq!(authority.value(), Some(json!({"home": 6})));
    eventually(|| peer.value() == Some(json!({"home": 6}))).await;
}

#[tokio::test]
async fn test_client_disconnect_and_reconnect() {
    let (server, url) = start_test_server().await;
    server
        .registry()
        .declare(scores(), ReplicantOptions::default().with_default(json!({"home": 0})))
        .await
        .unwrap();
    let client = SyncClient::connect(ClientConfig::for_testing(&url)).await.unwrap();
    let peer = PeerReplicant::declared(&client, scores(), ReplicantOptions::default())
        .await
        .unwrap();
    assert_eq!(peer.status(), ReplicantStatus::Declared);

    client.disconnect().await;
    assert_eq!(client.state().await, ConnectionState::Disconnected);
    assert_eq!(peer.status(), ReplicantStatus::Undeclared);

    let fresh = SyncClient::connect(ClientConfig::for_testing(&url)).await.unwrap();
    let again = PeerReplicant::declared(&fresh, scores(), ReplicantOptions::default())
        .await
        .unwrap();
    assert_eq!(again.value(), Some(json!({"home": 0})));
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = SyncClient::connect(ClientConfig::for_testing(format!("ws://127.0.0.1:{port}"))).await;
    assert!(result.is_err());
}
