//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use folio_collab::client::{ConnectionState, SyncClient, SyncEvent};
use folio_collab::document::RoomDocument;
use folio_collab::gateway::{GatewayError, PersistenceGateway, RemoteGateway};
use folio_collab::protocol::{
    JoinRequest, MessageType, ProtocolError, RoomRequest, RoomResponse, SyncMessage,
};
use folio_collab::registry::RoomRegistry;
use folio_collab::room::{RoomId, UserId, UserRole};
use folio_collab::server::{ServerConfig, SyncServer};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

struct TestServer {
    url: String,
    registry: Arc<RoomRegistry>,
}

/// Start a server on an OS-assigned port with a shared registry.
async fn start_test_server(config: ServerConfig) -> TestServer {
    let registry = Arc::new(RoomRegistry::in_memory());
    let server = Arc::new(SyncServer::with_registry(config, registry.clone()));
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    TestServer {
        url: format!("ws://127.0.0.1:{port}"),
        registry,
    }
}

/// A room created by alice, with bob as editor and carol as viewer.
async fn shared_room(server: &TestServer, id: &str) -> RoomId {
    let room = RoomId::from(id);
    let alice = UserId::from("alice");
    server.registry.create_room(id, "alice", "Untitled").await.unwrap();
    server
        .registry
        .update_access(&room, &alice, UserId::from("bob"), UserRole::Editor)
        .await
        .unwrap();
    server
        .registry
        .update_access(&room, &alice, UserId::from("carol"), UserRole::Viewer)
        .await
        .unwrap();
    room
}

async fn join(server: &TestServer, room: &RoomId, user: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(user, user, room.clone(), &server.url);
    let events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    (client, events)
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for<F>(events: &mut mpsc::Receiver<SyncEvent>, pred: F) -> SyncEvent
where
    F: Fn(&SyncEvent) -> bool,
{
    timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll until the server has applied `version` deltas to the room.
async fn wait_for_version(server: &TestServer, room: &RoomId, version: u64) {
    let handle = server.registry.room_handle(room).await.unwrap();
    timeout(Duration::from_secs(3), async {
        while handle.version().await < version {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server never reached version");
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let result = tokio_tungstenite::connect_async(&server.url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_joins_and_receives_state() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-join").await;

    let mut client = SyncClient::new("alice", "Alice", room.clone(), &server.url);
    let mut events = client.take_event_rx().unwrap();
    let welcome = client.connect().await.unwrap();

    assert_eq!(welcome.document.metadata.title, "Untitled");
    assert_eq!(welcome.identity.user_id, UserId::from("alice"));
    assert_eq!(welcome.identity.role, UserRole::Creator);
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    match wait_for(&mut events, |e| matches!(e, SyncEvent::Connected(_))).await {
        SyncEvent::Connected(w) => assert_eq!(w.identity, welcome.identity),
        other => panic!("Expected Connected event, got {other:?}"),
    }
    // Full state follows the welcome
    wait_for(&mut events, |e| matches!(e, SyncEvent::StateSynced { .. })).await;
}

#[tokio::test]
async fn test_stranger_is_denied() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-private").await;

    let mut client = SyncClient::new("mallory", "Mallory", room, &server.url);
    match client.connect().await {
        Err(ProtocolError::Denied(reason)) => assert!(reason.contains("mallory")),
        other => panic!("Expected denial, got {other:?}"),
    }
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unknown_room_is_denied() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let mut client = SyncClient::new("alice", "Alice", "missing", &server.url);
    assert!(matches!(client.connect().await, Err(ProtocolError::Denied(_))));
}

#[tokio::test]
async fn test_first_frame_must_be_join() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-raw").await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&server.url).await.unwrap();

    let ping = SyncMessage::ping(uuid::Uuid::new_v4(), room);
    ws.send(Message::Binary(ping.encode().unwrap().into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return SyncMessage::decode(&data).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("Expected a Denied frame, got {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reply.msg_type, MessageType::Denied);
    assert_eq!(reply.denied_notice().unwrap().rejected, MessageType::Ping);
}

#[tokio::test]
async fn test_peer_joined_and_left() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-peers").await;

    let (_alice, mut alice_events) = join(&server, &room, "alice").await;
    let (mut bob, _bob_events) = join(&server, &room, "bob").await;
    let bob_id = bob.identity().await.unwrap().connection_id;

    match wait_for(&mut alice_events, |e| matches!(e, SyncEvent::PeerJoined(_))).await {
        SyncEvent::PeerJoined(identity) => {
            assert_eq!(identity.user_id, UserId::from("bob"));
            assert_eq!(identity.connection_id, bob_id);
        }
        other => panic!("Expected PeerJoined, got {other:?}"),
    }

    bob.disconnect().await;
    match wait_for(&mut alice_events, |e| matches!(e, SyncEvent::PeerLeft(_))).await {
        SyncEvent::PeerLeft(id) => assert_eq!(id, bob_id),
        other => panic!("Expected PeerLeft, got {other:?}"),
    }
}

#[tokio::test]
async fn test_welcome_lists_existing_peers() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-welcome").await;

    let (_alice, _alice_events) = join(&server, &room, "alice").await;
    let mut bob = SyncClient::new("bob", "Bob", room.clone(), &server.url);
    let welcome = bob.connect().await.unwrap();
    assert_eq!(welcome.peers.len(), 1);
    assert_eq!(welcome.peers[0].user_id, UserId::from("alice"));
}

#[tokio::test]
async fn test_delta_broadcast_between_clients() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-delta").await;

    let (alice, _alice_events) = join(&server, &room, "alice").await;
    let (_bob, mut bob_events) = join(&server, &room, "bob").await;

    let local = RoomDocument::new();
    let update = local.insert(0, "Hello").unwrap();
    alice.send_delta(update).await.unwrap();

    let remote = RoomDocument::new();
    match wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteDelta { .. })).await {
        SyncEvent::RemoteDelta { version, update, .. } => {
            assert_eq!(version, 1);
            remote.apply_update(&update).unwrap();
        }
        other => panic!("Expected RemoteDelta, got {other:?}"),
    }
    assert_eq!(remote.content(), "Hello");

    let handle = server.registry.room_handle(&room).await.unwrap();
    assert_eq!(handle.content().await, "Hello");
}

#[tokio::test]
async fn test_viewer_delta_is_denied() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-viewer").await;

    let (carol, mut carol_events) = join(&server, &room, "carol").await;
    let update = RoomDocument::new().insert(0, "vandalism").unwrap();
    carol.send_delta(update).await.unwrap();

    match wait_for(&mut carol_events, |e| matches!(e, SyncEvent::Denied(_))).await {
        SyncEvent::Denied(notice) => assert_eq!(notice.rejected, MessageType::Delta),
        other => panic!("Expected Denied, got {other:?}"),
    }
    let handle = server.registry.room_handle(&room).await.unwrap();
    assert_eq!(handle.content().await, "");
    assert_eq!(handle.version().await, 0);
}

#[tokio::test]
async fn test_sync_step1_returns_missing_state() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-sync").await;

    let (alice, _alice_events) = join(&server, &room, "alice").await;
    alice
        .send_delta(RoomDocument::new().insert(0, "abc").unwrap())
        .await
        .unwrap();
    wait_for_version(&server, &room, 1).await;

    let (bob, mut bob_events) = join(&server, &room, "bob").await;
    // Drain the state sent on join
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::StateSynced { .. })).await;

    let local = RoomDocument::new();
    bob.send_sync_step1(local.state_vector()).await.unwrap();
    match wait_for(&mut bob_events, |e| matches!(e, SyncEvent::StateSynced { .. })).await {
        SyncEvent::StateSynced { version, state } => {
            assert!(version >= 1);
            local.apply_update(&state).unwrap();
        }
        other => panic!("Expected StateSynced, got {other:?}"),
    }
    assert_eq!(local.content(), "abc");
}

#[tokio::test]
async fn test_ping_pong() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-ping").await;
    let (client, mut events) = join(&server, &room, "bob").await;

    client.send_ping().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Pong)).await;
}

#[tokio::test]
async fn test_title_update_over_the_wire() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-title").await;

    let (bob, _bob_events) = join(&server, &room, "bob").await;
    let (_alice, mut alice_events) = join(&server, &room, "alice").await;

    let gateway = RemoteGateway::new(Arc::new(bob));
    let doc = gateway
        .update_document(&room, "Report Q3")
        .await
        .unwrap()
        .expect("document");
    assert_eq!(doc.metadata.title, "Report Q3");
    assert_eq!(doc.title_version, 1);

    match wait_for(&mut alice_events, |e| matches!(e, SyncEvent::MetadataChanged(_))).await {
        SyncEvent::MetadataChanged(changed) => assert_eq!(changed.metadata.title, "Report Q3"),
        other => panic!("Expected MetadataChanged, got {other:?}"),
    }
    let stored = server.registry.get_room(&room, &UserId::from("alice")).await.unwrap();
    assert_eq!(stored.metadata.title, "Report Q3");
}

#[tokio::test]
async fn test_viewer_title_update_is_denied() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-title-viewer").await;
    let (carol, _events) = join(&server, &room, "carol").await;

    let gateway = RemoteGateway::new(Arc::new(carol));
    let err = gateway.update_document(&room, "Mine now").await.unwrap_err();
    assert!(matches!(err, GatewayError::Denied(_)));

    let stored = server.registry.get_room(&room, &UserId::from("alice")).await.unwrap();
    assert_eq!(stored.metadata.title, "Untitled");
    assert_eq!(stored.title_version, 0);
}

#[tokio::test]
async fn test_share_and_delete_requests() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-share").await;

    let (bob, _bob_events) = join(&server, &room, "bob").await;
    let shared = bob
        .request(RoomRequest::UpdateAccess {
            user: UserId::from("dave"),
            role: UserRole::Viewer,
        })
        .await
        .unwrap();
    match shared {
        RoomResponse::Document(doc) => assert!(doc.collaborators.iter().any(|c| c.id == UserId::from("dave"))),
        other => panic!("Expected document, got {other:?}"),
    }

    // Editors may not delete
    assert!(matches!(
        bob.request(RoomRequest::DeleteRoom).await.unwrap(),
        RoomResponse::Failed(_)
    ));

    let (alice, _alice_events) = join(&server, &room, "alice").await;
    assert_eq!(alice.request(RoomRequest::DeleteRoom).await.unwrap(), RoomResponse::Deleted);
    assert!(server.registry.room_handle(&room).await.is_err());
}

#[tokio::test]
async fn test_room_full_rejects_join() {
    let config = ServerConfig {
        max_peers_per_room: 1,
        ..ServerConfig::for_testing()
    };
    let server = start_test_server(config).await;
    let room = shared_room(&server, "doc-full").await;

    let (_alice, _events) = join(&server, &room, "alice").await;
    let mut bob = SyncClient::new("bob", "Bob", room, &server.url);
    match bob.connect().await {
        Err(ProtocolError::Denied(reason)) => assert!(reason.contains("full")),
        other => panic!("Expected denial, got {other:?}"),
    }
}

#[tokio::test]
async fn test_second_join_is_denied() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-rejoin").await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&server.url).await.unwrap();

    let join = SyncMessage::join(
        room.clone(),
        &JoinRequest {
            user_id: UserId::from("bob"),
            name: "Bob".into(),
            resume_from: None,
        },
    )
    .unwrap();
    let bytes = join.encode().unwrap();
    ws.send(Message::Binary(bytes.clone().into())).await.unwrap();
    ws.send(Message::Binary(bytes.into())).await.unwrap();

    let denied = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(Ok(Message::Binary(data))) = ws.next().await {
                let msg = SyncMessage::decode(&data).unwrap();
                if msg.msg_type == MessageType::Denied {
                    return msg;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(denied.denied_notice().unwrap().rejected, MessageType::Join);
}

#[tokio::test]
async fn test_server_stats_track_connections() {
    let registry = Arc::new(RoomRegistry::in_memory());
    registry.create_room("doc-stats", "alice", "Stats").await.unwrap();
    let server = Arc::new(SyncServer::with_registry(ServerConfig::for_testing(), registry));
    let listener = server.bind().await.unwrap();
    let url = format!("ws://127.0.0.1:{}", listener.local_addr().unwrap().port());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    let mut alice = SyncClient::new("alice", "Alice", "doc-stats", &url);
    alice.connect().await.unwrap();
    let mut stranger = SyncClient::new("eve", "Eve", "doc-stats", &url);
    assert!(stranger.connect().await.is_err());

    // Let the server finish closing the rejected connection
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.rejected_joins, 1);
    assert_eq!(stats.active_rooms, 1);
}

#[tokio::test]
async fn test_removed_collaborator_stops_receiving() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-revoke").await;

    let (alice, _alice_events) = join(&server, &room, "alice").await;
    let (bob, mut bob_events) = join(&server, &room, "bob").await;
    let (_carol, mut carol_events) = join(&server, &room, "carol").await;

    let removed = alice
        .request(RoomRequest::RemoveCollaborator {
            user: UserId::from("bob"),
        })
        .await
        .unwrap();
    assert!(matches!(removed, RoomResponse::Document(_)));

    match wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Denied(_))).await {
        SyncEvent::Denied(notice) => assert!(notice.reason.contains("revoked")),
        other => panic!("Expected Denied, got {other:?}"),
    }
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Disconnected)).await;
    assert_eq!(bob.connection_state().await, ConnectionState::Disconnected);

    alice
        .send_delta(RoomDocument::new().insert(0, "secret").unwrap())
        .await
        .unwrap();
    wait_for(&mut carol_events, |e| matches!(e, SyncEvent::RemoteDelta { .. })).await;

    while let Ok(event) = bob_events.try_recv() {
        assert!(
            !matches!(event, SyncEvent::RemoteDelta { .. }),
            "removed collaborator received {event:?}"
        );
    }
}

#[tokio::test]
async fn test_deleted_room_disconnects_sessions() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-gone").await;

    let (alice, _alice_events) = join(&server, &room, "alice").await;
    let (_bob, mut bob_events) = join(&server, &room, "bob").await;

    assert_eq!(alice.request(RoomRequest::DeleteRoom).await.unwrap(), RoomResponse::Deleted);
    match wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Denied(_))).await {
        SyncEvent::Denied(notice) => assert!(notice.reason.contains("deleted")),
        other => panic!("Expected Denied, got {other:?}"),
    }
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Disconnected)).await;
}

#[tokio::test]
async fn test_reconnect_resumes_from_last_seen_version() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let room = shared_room(&server, "doc-resume").await;

    let (alice, _alice_events) = join(&server, &room, "alice").await;
    let writer = RoomDocument::new();
    alice.send_delta(writer.insert(0, "a").unwrap()).await.unwrap();
    wait_for_version(&server, &room, 1).await;

    let (mut bob, mut bob_events) = join(&server, &room, "bob").await;
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::StateSynced { .. })).await;
    assert_eq!(bob.seen_version(), 1);

    bob.disconnect().await;
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Disconnected)).await;

    alice.send_delta(writer.insert(1, "b").unwrap()).await.unwrap();
    alice.send_delta(writer.insert(2, "c").unwrap()).await.unwrap();
    wait_for_version(&server, &room, 3).await;

    bob.connect().await.unwrap();
    let mut resumed = Vec::new();
    while resumed.len() < 2 {
        match wait_for(&mut bob_events, |e| {
            matches!(e, SyncEvent::RemoteDelta { .. } | SyncEvent::StateSynced { .. })
        })
        .await
        {
            SyncEvent::RemoteDelta { version, .. } => resumed.push(version),
            other => panic!("Expected only missed deltas, got {other:?}"),
        }
    }
    assert_eq!(resumed, vec![2, 3]);
    assert_eq!(bob.seen_version(), 3);
}
