//! Integration tests for the WebSocket relay.
//!
//! These tests start a real relay and connect real clients, covering the
//! full path from session controls to a claim seen by every device.

use blindbox_core::{CatalogEntry, SessionPhase, Snapshot};
use blindbox_sync::client::{ConnectionState, RelayClient};
use blindbox_sync::protocol::ProtocolError;
use blindbox_sync::server::{RelayServer, RelayServerConfig};
use blindbox_sync::{
    AttachMode, ClaimArbiter, ClaimError, RelayTransport, SessionStore, StaticCatalog, StoreConfig,
    Transport,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay with `config`.
async fn spawn_relay(config: RelayServerConfig) -> Arc<RelayServer> {
    let server = Arc::new(RelayServer::new(config));
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    server
}

/// Start a relay on a free port, return it and its URL.
async fn start_test_relay_with(config: impl FnOnce(String) -> RelayServerConfig) -> (Arc<RelayServer>, String) {
    let port = free_port().await;
    let server = spawn_relay(config(format!("127.0.0.1:{port}"))).await;
    (server, format!("ws://127.0.0.1:{port}"))
}

async fn start_test_relay() -> (Arc<RelayServer>, String) {
    start_test_relay_with(RelayServerConfig::for_testing).await
}

fn client(url: &str, room: &str) -> RelayClient {
    RelayClient::new(url, room, Duration::from_secs(2))
}

fn catalog() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry::new("AAPL", "Apple", "Tech", "Phones"),
        CatalogEntry::new("GOOG", "Alphabet", "Tech", "Search"),
        CatalogEntry::new("TSLA", "Tesla", "Auto", "Cars"),
    ]
}

fn store(url: &str) -> SessionStore {
    SessionStore::new(
        Arc::new(RelayTransport::new(url, "defaultRoom", Duration::from_secs(2))),
        Arc::new(StaticCatalog::in_order(catalog())),
        StoreConfig::for_testing(),
    )
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..40 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, url) = start_test_relay().await;

    // Connect raw WebSocket
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to relay");
}

#[tokio::test]
async fn test_empty_room_then_push_pull() {
    let (server, url) = start_test_relay().await;
    let client = client(&url, "room-a");

    assert_eq!(client.pull().await.unwrap(), None);
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    let snap = Snapshot::started(catalog(), 10);
    client.push(&snap).await.unwrap();
    assert_eq!(client.pull().await.unwrap(), Some(snap.clone()));
    assert_eq!(server.room_snapshot("room-a").await, Some(snap));

    let stats = server.stats().await;
    assert_eq!(stats.pushes, 1);
    assert_eq!(stats.pulls, 2);
    assert_eq!(stats.active_rooms, 1);
}

#[tokio::test]
async fn test_push_fans_out_to_other_subscribers() {
    let (_server, url) = start_test_relay().await;
    let alice = client(&url, "defaultRoom");
    let bob = client(&url, "defaultRoom");

    let mut alice_updates = alice.updates();
    let mut bob_updates = bob.updates();
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    let snap = Snapshot::started(catalog(), 11);
    alice.push(&snap).await.unwrap();

    let received = timeout(Duration::from_secs(2), bob_updates.recv()).await;
    assert_eq!(received.unwrap().unwrap(), snap);

    // The writer does not get its own push back.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(alice_updates.try_recv().is_err());
}

#[tokio::test]
async fn test_late_subscriber_gets_current_snapshot() {
    let (_server, url) = start_test_relay().await;
    let teacher = client(&url, "defaultRoom");
    let snap = Snapshot::idle(catalog(), 12);
    teacher.push(&snap).await.unwrap();

    let student = client(&url, "defaultRoom");
    let mut updates = student.updates();
    student.connect().await.unwrap();

    let received = timeout(Duration::from_secs(2), updates.recv()).await;
    assert_eq!(received.unwrap().unwrap(), snap);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (server, url) = start_test_relay().await;
    let first = client(&url, "period-1");
    let second = client(&url, "period-2");

    first.push(&Snapshot::started(catalog(), 13)).await.unwrap();
    assert_eq!(second.pull().await.unwrap(), None);
    assert_eq!(server.room_count().await, 2);
}

#[tokio::test]
async fn test_clear_drops_room_snapshot() {
    let (server, url) = start_test_relay().await;
    let client = client(&url, "defaultRoom");
    client.push(&Snapshot::started(catalog(), 14)).await.unwrap();

    client.clear().await.unwrap();
    assert_eq!(client.pull().await.unwrap(), None);
    assert!(server.room_snapshot("defaultRoom").await.is_none());
    assert_eq!(server.stats().await.clears, 1);
}

#[tokio::test]
async fn test_ping() {
    let (_server, url) = start_test_relay().await;
    let client = client(&url, "defaultRoom");
    let rtt = client.ping().await.unwrap();
    assert!(rtt < Duration::from_secs(2));
}

#[tokio::test]
async fn test_full_room_refuses_subscriber() {
    let (_server, url) = start_test_relay_with(|addr| RelayServerConfig {
        max_subscribers_per_room: 1,
        ..RelayServerConfig::for_testing(addr)
    })
    .await;

    let first = client(&url, "tiny");
    first.connect().await.unwrap();

    let second = client(&url, "tiny");
    let err = second.connect().await.unwrap_err();
    assert_eq!(err, ProtocolError::Rejected("room full".to_string()));
    assert_eq!(second.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_reconnects_after_disconnect() {
    let (_server, url) = start_test_relay().await;
    let client = client(&url, "defaultRoom");
    client.push(&Snapshot::idle(catalog(), 15)).await.unwrap();

    client.disconnect().await;
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);

    assert!(client.pull().await.unwrap().is_some());
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_transport_degrades_when_relay_down() {
    let port = free_port().await;
    let transport = RelayTransport::new(
        format!("ws://127.0.0.1:{port}"),
        "defaultRoom",
        Duration::from_millis(300),
    );
    assert!(transport.pull().await.is_none());
    assert!(!transport.push(&Snapshot::default()).await);
    transport.clear().await;
}

#[tokio::test]
async fn test_classroom_session_over_relay() {
    let (server, url) = start_test_relay().await;

    let teacher = store(&url);
    let student = store(&url);
    let _teacher_attachment = teacher.attach().await;
    let student_attachment = student.attach().await;
    assert_eq!(student_attachment.mode(), AttachMode::Subscribed);

    teacher.start_session().await.unwrap();
    assert!(eventually(|| student.phase() == Some(SessionPhase::Running)).await);
    assert_eq!(student.catalog(), catalog());

    let arbiter = ClaimArbiter::new(student.clone());
    arbiter.claim("AAPL", "Alice").await.unwrap();
    assert!(eventually(|| {
        teacher
            .snapshot()
            .is_some_and(|s| s.assignee_of("AAPL") == Some("Alice"))
    })
    .await);

    let err = arbiter.claim("GOOG", "Alice").await.unwrap_err();
    assert!(matches!(err, ClaimError::Rejected(_)));

    teacher.end_session().await.unwrap();
    assert!(eventually(|| student.phase() == Some(SessionPhase::Ended)).await);

    let remote = server.room_snapshot("defaultRoom").await.unwrap();
    assert_eq!(remote.phase(), SessionPhase::Ended);
    assert_eq!(remote.progress(), (1, 3));
}

#[tokio::test]
async fn test_concurrent_pushes_settle_on_stored_snapshot() {
    let (server, url) = start_test_relay().await;
    let watcher = client(&url, "defaultRoom");
    let mut updates = watcher.updates();
    watcher.connect().await.unwrap();

    let writers: Vec<RelayClient> = (0..8).map(|_| client(&url, "defaultRoom")).collect();
    for writer in &writers {
        writer.connect().await.unwrap();
    }

    for round in 0..20u64 {
        let pushes = writers.iter().enumerate().map(|(i, writer)| {
            let snap = Snapshot::idle(catalog(), round * 100 + i as u64);
            async move { writer.push(&snap).await }
        });
        for pushed in futures_util::future::join_all(pushes).await {
            pushed.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut last = None;
        loop {
            match updates.try_recv() {
                Ok(snapshot) => last = Some(snapshot),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert_eq!(last, server.room_snapshot("defaultRoom").await, "round {round}");
    }
}

#[tokio::test]
async fn test_subscribed_store_recovers_after_relay_restart() {
    let port = free_port().await;
    let addr = format!("127.0.0.1:{port}");
    let url = format!("ws://{addr}");

    let first = spawn_relay(RelayServerConfig::for_testing(addr.as_str())).await;
    let watcher = store(&url);
    let attachment = watcher.attach().await;
    assert_eq!(attachment.mode(), AttachMode::Subscribed);

    first.shutdown();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(first.stats().await.active_connections, 0);

    let second = spawn_relay(RelayServerConfig::for_testing(addr.as_str())).await;
    let teacher = store(&url);
    teacher.start_session().await.unwrap();

    assert!(eventually(|| watcher.phase() == Some(SessionPhase::Running)).await);
    assert_eq!(second.room_subscribers("defaultRoom").await.len(), 2);
}

#[tokio::test]
async fn test_dropping_last_subscription_closes_connection() {
    let (server, url) = start_test_relay().await;
    let transport = RelayTransport::new(url.as_str(), "defaultRoom", Duration::from_secs(2));

    let first = transport.subscribe(Arc::new(|_: Snapshot| {})).await.unwrap();
    let second = transport.subscribe(Arc::new(|_: Snapshot| {})).await.unwrap();
    assert_eq!(server.room_subscribers("defaultRoom").await.len(), 1);
    assert_eq!(server.stats().await.active_connections, 1);

    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.stats().await.active_connections, 1);

    drop(second);
    let mut closed = false;
    for _ in 0..40 {
        if server.stats().await.active_connections == 0 {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(closed, "relay still holds the connection");
    assert!(server.room_subscribers("defaultRoom").await.is_empty());
    assert_eq!(
        transport.client().connection_state().await,
        ConnectionState::Disconnected
    );
}
