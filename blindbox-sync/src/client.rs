//! WebSocket client for the relay.
//!
//! Provides:
//! - Lazy connection: the first request connects and subscribes to the room
//! - Request/response correlation by sequence number, with a timeout
//! - Fan-out of snapshots pushed by other clients
//!
//! A dropped connection is noticed by the reader task and announced on
//! [`RelayClient::connection_losses`]; the next request reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use blindbox_core::Snapshot;

use crate::protocol::{MessageType, ProtocolError, RelayMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<RelayMessage>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The relay client.
///
/// One instance keeps one connection to one room. Requests may be issued
/// concurrently from several tasks.
pub struct RelayClient {
    client_id: Uuid,
    room: String,
    server_url: String,
    request_timeout: Duration,

    state: Arc<RwLock<ConnectionState>>,

    /// Last sequence number handed out. 0 is reserved for fan-out.
    seq: AtomicU64,

    /// Replies awaited by in-flight requests, keyed by seq
    pending: Pending,

    /// Channel to the writer task; the lock also serializes reconnects
    outgoing: tokio::sync::Mutex<Option<mpsc::Sender<Vec<u8>>>>,

    /// Snapshots pushed by other clients
    updates: broadcast::Sender<Snapshot>,

    /// Reader and writer tasks of the current connection
    tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Count of connections lost without `disconnect()`
    losses: Arc<watch::Sender<u64>>,
}

impl RelayClient {
    pub fn new(
        server_url: impl Into<String>,
        room: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        let (updates, _) = broadcast::channel(64);
        let (losses, _) = watch::channel(0);
        Self {
            client_id: Uuid::new_v4(),
            room: room.into(),
            server_url: server_url.into(),
            request_timeout,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            seq: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outgoing: tokio::sync::Mutex::new(None),
            updates,
            tasks: Mutex::new(Vec::new()),
            losses: Arc::new(losses),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Connect and subscribe if not already connected.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        self.ensure_connected().await.map(|_| ())
    }

    async fn ensure_connected(&self) -> Result<mpsc::Sender<Vec<u8>>, ProtocolError> {
        let mut outgoing = self.outgoing.lock().await;
        if *self.state.read().await == ConnectionState::Connected {
            if let Some(tx) = outgoing.as_ref() {
                return Ok(tx.clone());
            }
        }

        self.abort_tasks();
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::warn!("Relay {} unreachable: {e}", self.server_url);
                return Err(ProtocolError::ConnectionFailed(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route replies to their requests, fan out the rest
        let pending = self.pending.clone();
        let updates = self.updates.clone();
        let state = self.state.clone();
        let losses = self.losses.clone();
        let client_id = self.client_id;
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let relay_msg = match RelayMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Dropping undecodable relay frame: {e}");
                                continue;
                            }
                        };

                        if relay_msg.seq == 0 {
                            match relay_msg.msg_type {
                                MessageType::Snapshot => match relay_msg.snapshot_payload() {
                                    Ok(Some(snapshot)) => {
                                        let _ = updates.send(snapshot);
                                    }
                                    Ok(None) => {}
                                    Err(e) => log::warn!("Ignoring malformed snapshot from {}: {e}", relay_msg.client_id),
                                },
                                MessageType::Cleared => {
                                    log::info!("Room '{}' cleared by {}", relay_msg.room, relay_msg.client_id);
                                }
                                other => log::debug!("Client {client_id}: unexpected {other:?} fan-out"),
                            }
                            continue;
                        }

                        if let Some(tx) = lock(&pending).remove(&relay_msg.seq) {
                            let _ = tx.send(relay_msg);
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost; waiting requests see a closed channel
            *state.write().await = ConnectionState::Disconnected;
            lock(&pending).clear();
            losses.send_modify(|n| *n += 1);
            log::info!("Client {client_id} disconnected from relay");
        });

        {
            let mut tasks = lock(&self.tasks);
            tasks.push(writer);
            tasks.push(reader);
        }
        *outgoing = Some(out_tx.clone());
        *self.state.write().await = ConnectionState::Connected;

        let subscribe = RelayMessage::subscribe(self.client_id, self.room.as_str(), self.next_seq());
        let joined = match self.send_and_wait(&out_tx, subscribe).await {
            Ok(reply) => match reply.msg_type {
                MessageType::Snapshot => {
                    if let Ok(Some(snapshot)) = reply.snapshot_payload() {
                        let _ = self.updates.send(snapshot);
                    }
                    Ok(())
                }
                MessageType::Nack => Err(ProtocolError::Rejected(reply.reason())),
                _ => Err(ProtocolError::InvalidMessageType),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = joined {
            *outgoing = None;
            self.abort_tasks();
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(e);
        }

        log::info!("Client {} joined room '{}' at {}", self.client_id, self.room, self.server_url);
        Ok(out_tx)
    }

    /// Send one request on `tx` and wait for the reply carrying its seq.
    async fn send_and_wait(
        &self,
        tx: &mpsc::Sender<Vec<u8>>,
        msg: RelayMessage,
    ) -> Result<RelayMessage, ProtocolError> {
        let seq = msg.seq;
        let encoded = msg.encode()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(seq, reply_tx);

        if tx.send(encoded).await.is_err() {
            lock(&self.pending).remove(&seq);
            return Err(ProtocolError::ConnectionClosed);
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                lock(&self.pending).remove(&seq);
                Err(ProtocolError::Timeout)
            }
        }
    }

    async fn request(&self, build: impl FnOnce(u64) -> Result<RelayMessage, ProtocolError>) -> Result<RelayMessage, ProtocolError> {
        let tx = self.ensure_connected().await?;
        let msg = build(self.next_seq())?;
        self.send_and_wait(&tx, msg).await
    }

    /// Current snapshot of the room, `None` if the room holds none.
    pub async fn pull(&self) -> Result<Option<Snapshot>, ProtocolError> {
        let reply = self
            .request(|seq| Ok(RelayMessage::pull(self.client_id, self.room.as_str(), seq)))
            .await?;
        match reply.msg_type {
            MessageType::Snapshot => reply.snapshot_payload(),
            MessageType::Nack => Err(ProtocolError::Rejected(reply.reason())),
            _ => Err(ProtocolError::InvalidMessageType),
        }
    }

    /// Replace the room's snapshot.
    pub async fn push(&self, snapshot: &Snapshot) -> Result<(), ProtocolError> {
        let reply = self
            .request(|seq| RelayMessage::push(self.client_id, self.room.as_str(), seq, snapshot))
            .await?;
        Self::expect_ack(reply)
    }

    /// Drop the room's snapshot.
    pub async fn clear(&self) -> Result<(), ProtocolError> {
        let reply = self
            .request(|seq| Ok(RelayMessage::clear(self.client_id, self.room.as_str(), seq)))
            .await?;
        Self::expect_ack(reply)
    }

    /// Round-trip a ping.
    pub async fn ping(&self) -> Result<Duration, ProtocolError> {
        let started = Instant::now();
        let reply = self
            .request(|seq| Ok(RelayMessage::ping(self.client_id, seq)))
            .await?;
        match reply.msg_type {
            MessageType::Pong => Ok(started.elapsed()),
            _ => Err(ProtocolError::InvalidMessageType),
        }
    }

    fn expect_ack(reply: RelayMessage) -> Result<(), ProtocolError> {
        match reply.msg_type {
            MessageType::Ack => Ok(()),
            MessageType::Nack => Err(ProtocolError::Rejected(reply.reason())),
            _ => Err(ProtocolError::InvalidMessageType),
        }
    }

    /// Snapshots pushed by other clients of the room, plus the one
    /// received when (re)subscribing.
    pub fn updates(&self) -> broadcast::Receiver<Snapshot> {
        self.updates.subscribe()
    }

    /// Ticks each time an established connection drops on its own.
    /// [`disconnect`](Self::disconnect) does not tick it.
    pub fn connection_losses(&self) -> watch::Receiver<u64> {
        self.losses.subscribe()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Close the connection. The next request reconnects.
    pub async fn disconnect(&self) {
        let mut outgoing = self.outgoing.lock().await;
        *outgoing = None;
        self.abort_tasks();
        lock(&self.pending).clear();
        *self.state.write().await = ConnectionState::Disconnected;
    }

    fn abort_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
