//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect raw WebSocket clients,
//! covering the handshake (token checks), the authorization phase
//! (`Forbidden` for users without access), and the joined phase
//! (sync, update fan-out, presence events).

use std::sync::Arc;

use cowrite::auth::{create_token, Role};
use cowrite::directory::{AccessLevel, MemoryDirectory};
use cowrite::protocol::{MessageKind, WireMessage};
use cowrite::server::{ServerConfig, SyncServer};
use cowrite::TextDoc;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const SECRET: &str = "integration-test-secret";

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Start a server with the given directory on a free port.
async fn start_test_server(directory: Arc<MemoryDirectory>) -> (u16, Arc<SyncServer>) {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        jwt_secret: SECRET.to_string(),
        storage_path: None,
        broadcast_capacity: 64,
        max_sessions_per_room: 10,
        flush_interval_secs: 1,
    };
    let server = Arc::new(SyncServer::new(config, directory).unwrap());
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let serve_handle = server.clone();
    tokio::spawn(async move {
        serve_handle.serve(listener).await.unwrap();
    });
    (port, server)
}

fn user_token(user_id: Uuid, username: &str) -> String {
    create_token(SECRET, user_id, username, Role::User, 3600).unwrap()
}

async fn connect(port: u16, doc_id: Uuid, token: &str) -> WsClient {
    let url = format!("ws://127.0.0.1:{port}/{doc_id}?token={token}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

/// Receive the next binary frame and decode it, with a timeout.
async fn next_message(ws: &mut WsClient) -> WireMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Binary(data) = frame {
            return WireMessage::decode(&data).unwrap();
        }
    }
}

/// Receive frames until one of the given kind arrives.
async fn wait_for(ws: &mut WsClient, kind: MessageKind) -> WireMessage {
    loop {
        let msg = next_message(ws).await;
        if msg.kind == kind {
            return msg;
        }
    }
}

#[tokio::test]
async fn test_missing_token_rejects_upgrade() {
    let directory = Arc::new(MemoryDirectory::new());
    let (port, _server) = start_test_server(directory).await;
    let doc_id = Uuid::new_v4();

    let url = format!("ws://127.0.0.1:{port}/{doc_id}");
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_err(), "handshake without a token must fail");
}

#[tokio::test]
async fn test_invalid_token_rejects_upgrade() {
    let directory = Arc::new(MemoryDirectory::new());
    let (port, _server) = start_test_server(directory).await;
    let doc_id = Uuid::new_v4();

    let url = format!("ws://127.0.0.1:{port}/{doc_id}?token=not-a-jwt");
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_err(), "handshake with a bad token must fail");
}

#[tokio::test]
async fn test_malformed_document_path_rejects_upgrade() {
    let directory = Arc::new(MemoryDirectory::new());
    let (port, _server) = start_test_server(directory).await;
    let token = user_token(Uuid::new_v4(), "alice");

    let url = format!("ws://127.0.0.1:{port}/not-a-uuid?token={token}");
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_stranger_receives_forbidden() {
    let directory = Arc::new(MemoryDirectory::new());
    let owner = Uuid::new_v4();
    let doc_id = directory.create_document(owner, "Private").await;
    let (port, _server) = start_test_server(directory).await;

    // Valid token, but no access grant: the upgrade succeeds and the
    // first frame is a Forbidden notice.
    let stranger = Uuid::new_v4();
    let mut ws = connect(port, doc_id, &user_token(stranger, "mallory")).await;

    let msg = next_message(&mut ws).await;
    assert_eq!(msg.kind, MessageKind::Forbidden);
    assert_eq!(msg.doc_id, doc_id);
}

#[tokio::test]
async fn test_soft_deleted_document_is_forbidden_even_for_owner() {
    let directory = Arc::new(MemoryDirectory::new());
    let owner = Uuid::new_v4();
    let doc_id = directory.create_document(owner, "Gone").await;
    directory.mark_deleted(doc_id).await;
    let (port, _server) = start_test_server(directory).await;

    let mut ws = connect(port, doc_id, &user_token(owner, "alice")).await;
    let msg = next_message(&mut ws).await;
    assert_eq!(msg.kind, MessageKind::Forbidden);
}

#[tokio::test]
async fn test_owner_receives_sync_and_roster() {
    let directory = Arc::new(MemoryDirectory::new());
    let owner = Uuid::new_v4();
    let doc_id = directory.create_document(owner, "Notes").await;
    let (port, _server) = start_test_server(directory).await;

    let mut ws = connect(port, doc_id, &user_token(owner, "alice")).await;

    let sync = next_message(&mut ws).await;
    assert_eq!(sync.kind, MessageKind::SyncResponse);
    assert_eq!(sync.doc_id, doc_id);

    // Snapshot decodes into an (empty) replica.
    let doc = TextDoc::load(1, Some(&sync.payload));
    assert_eq!(doc.text(), "");

    let roster = next_message(&mut ws).await;
    assert_eq!(roster.kind, MessageKind::Roster);
    let peers = roster.peers().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].user_id, owner);
    assert_eq!(peers[0].username, "alice");
}

#[tokio::test]
async fn test_admin_joins_without_grant() {
    let directory = Arc::new(MemoryDirectory::new());
    let owner = Uuid::new_v4();
    let doc_id = directory.create_document(owner, "Restricted").await;
    let (port, _server) = start_test_server(directory).await;

    let admin = Uuid::new_v4();
    let token = create_token(SECRET, admin, "root", Role::Admin, 3600).unwrap();
    let mut ws = connect(port, doc_id, &token).await;

    let msg = next_message(&mut ws).await;
    assert_eq!(msg.kind, MessageKind::SyncResponse);
}

#[tokio::test]
async fn test_admin_cannot_join_missing_document() {
    let directory = Arc::new(MemoryDirectory::new());
    let (port, _server) = start_test_server(directory).await;

    let admin = Uuid::new_v4();
    let token = create_token(SECRET, admin, "root", Role::Admin, 3600).unwrap();
    let mut ws = connect(port, Uuid::new_v4(), &token).await;

    let msg = next_message(&mut ws).await;
    assert_eq!(msg.kind, MessageKind::Forbidden);
}

#[tokio::test]
async fn test_updates_fan_out_and_converge() {
    let directory = Arc::new(MemoryDirectory::new());
    let owner = Uuid::new_v4();
    let collab = Uuid::new_v4();
    let doc_id = directory.create_document(owner, "Shared").await;
    directory.add_collaborator(doc_id, collab, AccessLevel::Write).await;
    let (port, _server) = start_test_server(directory).await;

    let mut alice = connect(port, doc_id, &user_token(owner, "alice")).await;
    let sync = next_message(&mut alice).await;
    let mut alice_doc = TextDoc::load(1, Some(&sync.payload));
    let _ = next_message(&mut alice).await; // roster

    let mut bob = connect(port, doc_id, &user_token(collab, "bob")).await;
    let sync = next_message(&mut bob).await;
    let mut bob_doc = TextDoc::load(2, Some(&sync.payload));
    let _ = next_message(&mut bob).await; // roster

    // Alice types; Bob receives the update and converges.
    let update = alice_doc.insert(0, "hello from alice").encode().unwrap();
    let frame = WireMessage::update(Uuid::new_v4(), doc_id, update)
        .encode()
        .unwrap();
    alice.send(Message::Binary(frame.into())).await.unwrap();

    let received = wait_for(&mut bob, MessageKind::Update).await;
    bob_doc.apply_update(&received.payload).unwrap();
    assert_eq!(bob_doc.text(), "hello from alice");
    assert_eq!(bob_doc.text(), alice_doc.text());
}

#[tokio::test]
async fn test_late_joiner_receives_merged_state() {
    let directory = Arc::new(MemoryDirectory::new());
    let owner = Uuid::new_v4();
    let collab = Uuid::new_v4();
    let doc_id = directory.create_document(owner, "Shared").await;
    directory.add_collaborator(doc_id, collab, AccessLevel::Write).await;
    let (port, _server) = start_test_server(directory).await;

    let mut alice = connect(port, doc_id, &user_token(owner, "alice")).await;
    let sync = next_message(&mut alice).await;
    let mut alice_doc = TextDoc::load(1, Some(&sync.payload));
    let _ = next_message(&mut alice).await;

    let update = alice_doc.insert(0, "early edit").encode().unwrap();
    let frame = WireMessage::update(Uuid::new_v4(), doc_id, update)
        .encode()
        .unwrap();
    alice.send(Message::Binary(frame.into())).await.unwrap();

    // Ask the server to echo state back so we know the edit landed
    // before the second client connects.
    let echo_request = WireMessage::sync_request(Uuid::new_v4(), doc_id)
        .encode()
        .unwrap();
    alice.send(Message::Binary(echo_request.into())).await.unwrap();
    let echoed = wait_for(&mut alice, MessageKind::SyncResponse).await;
    assert_eq!(
        TextDoc::load(9, Some(&echoed.payload)).text(),
        "early edit"
    );

    let mut bob = connect(port, doc_id, &user_token(collab, "bob")).await;
    let sync = next_message(&mut bob).await;
    let bob_doc = TextDoc::load(2, Some(&sync.payload));
    assert_eq!(bob_doc.text(), "early edit");
}

#[tokio::test]
async fn test_presence_events() {
    let directory = Arc::new(MemoryDirectory::new());
    let owner = Uuid::new_v4();
    let collab = Uuid::new_v4();
    let doc_id = directory.create_document(owner, "Shared").await;
    directory.add_collaborator(doc_id, collab, AccessLevel::Write).await;
    let (port, _server) = start_test_server(directory).await;

    let mut alice = connect(port, doc_id, &user_token(owner, "alice")).await;
    let _ = next_message(&mut alice).await; // sync
    let _ = next_message(&mut alice).await; // roster

    // Bob joins; Alice sees it.
    let mut bob = connect(port, doc_id, &user_token(collab, "bob")).await;
    let joined = wait_for(&mut alice, MessageKind::UserJoined).await;
    assert_eq!(joined.peer().unwrap().username, "bob");

    // Bob's roster includes both participants.
    let _ = next_message(&mut bob).await; // sync
    let roster = wait_for(&mut bob, MessageKind::Roster).await;
    let mut names: Vec<String> = roster
        .peers()
        .unwrap()
        .into_iter()
        .map(|p| p.username)
        .collect();
    names.sort();
    assert_eq!(names, vec!["alice", "bob"]);

    // Bob disconnects; Alice sees the departure.
    bob.close(None).await.unwrap();
    let left = wait_for(&mut alice, MessageKind::UserLeft).await;
    assert_eq!(left.peer().unwrap().username, "bob");
}

#[tokio::test]
async fn test_out_of_order_update_frames_reach_peers() {
    let directory = Arc::new(MemoryDirectory::new());
    let owner = Uuid::new_v4();
    let collab = Uuid::new_v4();
    let doc_id = directory.create_document(owner, "Shared").await;
    directory.add_collaborator(doc_id, collab, AccessLevel::Write).await;
    let (port, _server) = start_test_server(directory).await;

    let mut alice = connect(port, doc_id, &user_token(owner, "alice")).await;
    let _ = next_message(&mut alice).await; // sync
    let _ = next_message(&mut alice).await; // roster

    let mut bob = connect(port, doc_id, &user_token(collab, "bob")).await;
    let _ = next_message(&mut bob).await; // sync
    let _ = next_message(&mut bob).await; // roster

    // Two chained edits, delivered dependent-first. The server can
    // only buffer the first frame until its anchor arrives, but both
    // frames must still reach Bob.
    let alice_session = Uuid::new_v4();
    let mut src = TextDoc::new(5);
    let first = src.insert(0, "a").encode().unwrap();
    let second = src.insert(1, "b").encode().unwrap();

    for update in [second, first] {
        let frame = WireMessage::update(alice_session, doc_id, update)
            .encode()
            .unwrap();
        alice.send(Message::Binary(frame.into())).await.unwrap();
    }

    let mut bob_doc = TextDoc::new(2);
    let received = wait_for(&mut bob, MessageKind::Update).await;
    bob_doc.apply_update(&received.payload).unwrap();
    let received = wait_for(&mut bob, MessageKind::Update).await;
    bob_doc.apply_update(&received.payload).unwrap();
    assert_eq!(bob_doc.text(), "ab");

    // The server replica agrees.
    let echo_request = WireMessage::sync_request(alice_session, doc_id)
        .encode()
        .unwrap();
    alice.send(Message::Binary(echo_request.into())).await.unwrap();
    let echoed = wait_for(&mut alice, MessageKind::SyncResponse).await;
    assert_eq!(TextDoc::load(9, Some(&echoed.payload)).text(), "ab");
}

#[tokio::test]
async fn test_author_does_not_receive_own_update() {
    let directory = Arc::new(MemoryDirectory::new());
    let owner = Uuid::new_v4();
    let collab = Uuid::new_v4();
    let doc_id = directory.create_document(owner, "Shared").await;
    directory.add_collaborator(doc_id, collab, AccessLevel::Write).await;
    let (port, _server) = start_test_server(directory).await;

    let mut alice = connect(port, doc_id, &user_token(owner, "alice")).await;
    let _ = next_message(&mut alice).await; // sync
    let _ = next_message(&mut alice).await; // roster

    let mut bob = connect(port, doc_id, &user_token(collab, "bob")).await;
    let _ = next_message(&mut bob).await; // sync
    let _ = next_message(&mut bob).await; // roster
    let _ = wait_for(&mut alice, MessageKind::UserJoined).await;

    let alice_session = Uuid::new_v4();
    let update = TextDoc::new(5).insert(0, "hi").encode().unwrap();
    let frame = WireMessage::update(alice_session, doc_id, update)
        .encode()
        .unwrap();
    alice.send(Message::Binary(frame.into())).await.unwrap();

    // Bob gets the update; Alice must not get her own frame back.
    let _ = wait_for(&mut bob, MessageKind::Update).await;

    let ping = WireMessage::ping(alice_session).encode().unwrap();
    alice.send(Message::Binary(ping.into())).await.unwrap();
    loop {
        let msg = next_message(&mut alice).await;
        match msg.kind {
            MessageKind::Pong => break,
            MessageKind::Update => panic!("update echoed back to its author"),
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_abrupt_disconnect_detaches_session() {
    let directory = Arc::new(MemoryDirectory::new());
    let owner = Uuid::new_v4();
    let collab = Uuid::new_v4();
    let doc_id = directory.create_document(owner, "Shared").await;
    directory.add_collaborator(doc_id, collab, AccessLevel::Write).await;
    let (port, server) = start_test_server(directory).await;

    let mut alice = connect(port, doc_id, &user_token(owner, "alice")).await;
    let _ = next_message(&mut alice).await; // sync
    let _ = next_message(&mut alice).await; // roster

    let bob = connect(port, doc_id, &user_token(collab, "bob")).await;
    let _ = wait_for(&mut alice, MessageKind::UserJoined).await;

    // Bob's socket dies without a close frame. The departure must
    // still be announced and the roster slot released.
    drop(bob);
    let left = wait_for(&mut alice, MessageKind::UserLeft).await;
    assert_eq!(left.peer().unwrap().username, "bob");

    let room = server.registry().get(doc_id).await.expect("room still live");
    assert_eq!(room.session_count().await, 1);
}

#[tokio::test]
async fn test_ping_pong() {
    let directory = Arc::new(MemoryDirectory::new());
    let owner = Uuid::new_v4();
    let doc_id = directory.create_document(owner, "Notes").await;
    let (port, _server) = start_test_server(directory).await;

    let mut ws = connect(port, doc_id, &user_token(owner, "alice")).await;
    let _ = next_message(&mut ws).await; // sync
    let _ = next_message(&mut ws).await; // roster

    let ping = WireMessage::ping(Uuid::new_v4()).encode().unwrap();
    ws.send(Message::Binary(ping.into())).await.unwrap();

    let msg = wait_for(&mut ws, MessageKind::Pong).await;
    assert_eq!(msg.kind, MessageKind::Pong);
}
