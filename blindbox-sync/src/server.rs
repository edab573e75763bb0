//! WebSocket relay backing the push-subscribe transport.
//!
//! Architecture:
//! ```text
//! Teacher ──┐
//!           ├── Room ("defaultRoom") ── snapshot (JSON) ── BroadcastGroup
//! Student ──┘                                                  │
//!                                              ┌───────────────┼───────────────┐
//!                                              ▼               ▼               ▼
//!                                           Teacher         Student A       Student B
//! ```
//!
//! Each room holds one snapshot. A `Push` replaces it wholesale under the room
//! lock, so concurrent writers are applied in arrival order and the last one
//! wins. There is no compare-and-set: the relay never looks inside a snapshot
//! beyond checking that it decodes.
//!
//! Room state lives for the life of the process; nothing is written to disk.
//! [`RelayServer::shutdown`] stops accepting and closes every open connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use blindbox_core::Snapshot;

use crate::broadcast::{BroadcastGroup, BroadcastStats, SubscriberInfo};
use crate::protocol::{MessageType, ProtocolError, RelayMessage};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum subscribers per room
    pub max_subscribers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_subscribers_per_room: 200,
            broadcast_capacity: 64,
        }
    }
}

impl RelayServerConfig {
    /// Small limits on an ephemeral port.
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_subscribers_per_room: 16,
            broadcast_capacity: 16,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub pushes: u64,
    pub pulls: u64,
    pub clears: u64,
}

/// One shared snapshot plus its subscribers.
struct RelayRoom {
    /// Current snapshot as received (JSON), `None` when cleared or never set
    snapshot: Option<Arc<Vec<u8>>>,
    broadcast: Arc<BroadcastGroup>,
}

impl RelayRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            snapshot: None,
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }
}

type Rooms = Arc<RwLock<HashMap<String, RelayRoom>>>;

/// Resolves to `true` once shutdown is requested, `false` if the server is gone.
async fn shutdown_requested(stop: &mut watch::Receiver<bool>) -> bool {
    stop.wait_for(|stopped| *stopped).await.is_ok()
}

/// The relay server.
pub struct RelayServer {
    config: RelayServerConfig,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: RelayServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            shutdown,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails or
    /// [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut stop = self.shutdown.subscribe();
        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                true = shutdown_requested(&mut stop) => {
                    log::info!("Relay shutting down");
                    return Ok(());
                }
            };
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let stop = self.shutdown.subscribe();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config, stop).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayServerConfig,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Set once the client subscribes.
        let mut client_id: Option<Uuid> = None;
        let mut joined_room: Option<String> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

        let outcome: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                let request = match RelayMessage::decode(&bytes) {
                                    Ok(request) => request,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };

                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }

                                match request.msg_type {
                                    MessageType::Subscribe => {
                                        if let Some(previous) = joined_room.take() {
                                            Self::leave_room(&rooms, &previous, request.client_id).await;
                                            broadcast_rx = None;
                                        }

                                        let joined = {
                                            let mut rooms_w = rooms.write().await;
                                            let room = rooms_w
                                                .entry(request.room.clone())
                                                .or_insert_with(|| RelayRoom::new(config.broadcast_capacity));
                                            if room.broadcast.subscriber_count().await >= config.max_subscribers_per_room {
                                                None
                                            } else {
                                                let info = SubscriberInfo::new(request.client_id, addr.to_string());
                                                let rx = room.broadcast.add_subscriber(info).await;
                                                Some((rx, room.snapshot.clone()))
                                            }
                                        };

                                        let reply = match joined {
                                            Some((rx, current)) => {
                                                client_id = Some(request.client_id);
                                                joined_room = Some(request.room.clone());
                                                broadcast_rx = Some(rx);
                                                log::info!("Client {} subscribed to room '{}'", request.client_id, request.room);
                                                RelayMessage::snapshot(Uuid::nil(), &request.room, request.seq, current.as_deref().map(Vec::as_slice))
                                            }
                                            None => {
                                                log::warn!("Room '{}' is full, refusing {}", request.room, request.client_id);
                                                RelayMessage::nack(&request.room, request.seq, "room full")
                                            }
                                        };
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;

                                        let room_count = rooms.read().await.len();
                                        stats.write().await.active_rooms = room_count;
                                    }

                                    MessageType::Pull => {
                                        let current = {
                                            let rooms_r = rooms.read().await;
                                            rooms_r.get(&request.room).and_then(|r| r.snapshot.clone())
                                        };
                                        stats.write().await.pulls += 1;
                                        let reply = RelayMessage::snapshot(Uuid::nil(), &request.room, request.seq, current.as_deref().map(Vec::as_slice));
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }

                                    MessageType::Push => {
                                        if let Err(e) = request.snapshot_payload().and_then(|s| s.ok_or(ProtocolError::InvalidMessageType)) {
                                            log::warn!("Rejecting push from {} to '{}': {e}", request.client_id, request.room);
                                            let reply = RelayMessage::nack(&request.room, request.seq, &e.to_string());
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                            continue;
                                        }

                                        let payload = Arc::new(request.payload);
                                        let fan_out = RelayMessage::snapshot(request.client_id, &request.room, 0, Some(payload.as_slice()));
                                        {
                                            let mut rooms_w = rooms.write().await;
                                            let room = rooms_w
                                                .entry(request.room.clone())
                                                .or_insert_with(|| RelayRoom::new(config.broadcast_capacity));
                                            room.snapshot = Some(payload.clone());
                                            // Still under the lock: fan-out order is store order.
                                            let _ = room.broadcast.broadcast(&fan_out);
                                        }

                                        stats.write().await.pushes += 1;
                                        let ack = RelayMessage::ack(&request.room, request.seq);
                                        ws_sender.send(Message::Binary(ack.encode()?.into())).await?;
                                        log::debug!("Client {} replaced snapshot of room '{}'", request.client_id, request.room);
                                    }

                                    MessageType::Clear => {
                                        if let Some(room) = rooms.write().await.get_mut(&request.room) {
                                            room.snapshot = None;
                                            let _ = room.broadcast.broadcast(&RelayMessage::cleared(request.client_id, &request.room));
                                        }
                                        stats.write().await.clears += 1;

                                        let ack = RelayMessage::ack(&request.room, request.seq);
                                        ws_sender.send(Message::Binary(ack.encode()?.into())).await?;
                                        log::info!("Client {} cleared room '{}'", request.client_id, request.room);
                                    }

                                    MessageType::Ping => {
                                        let pong = RelayMessage::pong(request.seq);
                                        ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                    }

                                    other => {
                                        log::debug!("Unhandled message type from {addr}: {other:?}");
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Fan-out from other clients in the joined room
                    frame = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match frame {
                            Ok(data) => {
                                if let Ok(msg) = RelayMessage::decode(&data) {
                                    if Some(msg.client_id) == client_id {
                                        continue; // own write
                                    }
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Client {client_id:?} lagged by {n} frames");
                                if let Some(room) = joined_room.as_ref() {
                                    if let Some(r) = rooms.read().await.get(room) {
                                        r.broadcast.record_lag(n);
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }

                    true = shutdown_requested(&mut stop) => {
                        log::info!("Closing connection from {addr} for shutdown");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup runs on every exit path, errors included.
        if let (Some(cid), Some(room)) = (client_id, joined_room.as_ref()) {
            Self::leave_room(&rooms, room, cid).await;
        }
        {
            let room_count = rooms.read().await.len();
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = room_count;
        }

        outcome
    }

    /// Drop a subscriber; forget the room once it is empty and holds nothing.
    async fn leave_room(rooms: &Rooms, room_name: &str, client_id: Uuid) {
        let mut rooms_w = rooms.write().await;
        let remove = match rooms_w.get(room_name) {
            Some(room) => {
                room.broadcast.remove_subscriber(&client_id).await;
                room.snapshot.is_none() && room.broadcast.subscriber_count().await == 0
            }
            None => false,
        };
        if remove {
            rooms_w.remove(room_name);
            log::info!("Room '{room_name}' removed (empty)");
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Fan-out counters of one room.
    pub async fn room_stats(&self, room: &str) -> Option<BroadcastStats> {
        let group = self.rooms.read().await.get(room)?.broadcast.clone();
        Some(group.stats().await)
    }

    pub async fn room_subscribers(&self, room: &str) -> Vec<SubscriberInfo> {
        let group = match self.rooms.read().await.get(room) {
            Some(r) => r.broadcast.clone(),
            None => return Vec::new(),
        };
        group.subscribers().await
    }

    /// Stop accepting and close every connection. Room state is kept.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Current snapshot held for `room`, decoded.
    pub async fn room_snapshot(&self, room: &str) -> Option<Snapshot> {
        let rooms = self.rooms.read().await;
        let bytes = rooms.get(room)?.snapshot.clone()?;
        Snapshot::from_json(&bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = RelayServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_subscribers_per_room, 200);
        assert_eq!(config.broadcast_capacity, 64);
    }

    #[test]
    fn test_server_creation() {
        let server = RelayServer::new(RelayServerConfig::for_testing("127.0.0.1:0"));
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.pushes, 0);
        assert_eq!(server.room_count().await, 0);
        assert!(server.room_snapshot("defaultRoom").await.is_none());
        assert!(server.room_stats("defaultRoom").await.is_none());
        assert!(server.room_subscribers("defaultRoom").await.is_empty());
    }

    #[tokio::test]
    async fn test_room_snapshot_decodes_stored_json() {
        let server = RelayServer::with_defaults();
        let mut room = RelayRoom::new(server.config.broadcast_capacity);
        room.snapshot = Some(Arc::new(b"{}".to_vec()));
        server.rooms.write().await.insert("a".to_string(), room);

        assert_eq!(server.room_count().await, 1);
        assert_eq!(server.room_snapshot("a").await, Some(Snapshot::default()));
        assert!(server.room_snapshot("b").await.is_none());
    }

    #[tokio::test]
    async fn test_leave_room_keeps_rooms_with_state() {
        let server = RelayServer::with_defaults();
        let client = Uuid::new_v4();
        let mut kept = RelayRoom::new(4);
        kept.snapshot = Some(Arc::new(b"{}".to_vec()));
        let _rx_kept = kept.broadcast.add_subscriber(SubscriberInfo::new(client, "x")).await;
        let dropped = RelayRoom::new(4);
        let _rx_dropped = dropped.broadcast.add_subscriber(SubscriberInfo::new(client, "x")).await;
        {
            let mut rooms = server.rooms.write().await;
            rooms.insert("kept".to_string(), kept);
            rooms.insert("dropped".to_string(), dropped);
        }

        RelayServer::leave_room(&server.rooms, "kept", client).await;
        RelayServer::leave_room(&server.rooms, "dropped", client).await;

        assert_eq!(server.room_count().await, 1);
        assert!(server.room_snapshot("kept").await.is_some());
        assert_eq!(server.room_stats("kept").await.unwrap().active_subscribers, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving() {
        let server = Arc::new(RelayServer::new(RelayServerConfig::for_testing("127.0.0.1:0")));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let running = server.clone();
        let task = tokio::spawn(async move { running.serve(listener).await });

        server.shutdown();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), task).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
