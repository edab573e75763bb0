//! Per-room fan-out of encoded relay frames with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each subscriber gets an independent receiver that buffers up to
//! `capacity` frames; a subscriber that falls further behind skips ahead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use blindbox_core::{now_millis, Timestamp};

use crate::protocol::{ProtocolError, RelayMessage};

/// A connected room subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub client_id: Uuid,
    /// Remote address, for logs.
    pub addr: String,
    pub joined_at: Timestamp,
}

impl SubscriberInfo {
    pub fn new(client_id: Uuid, addr: impl Into<String>) -> Self {
        Self {
            client_id,
            addr: addr.into(),
            joined_at: now_millis(),
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters for the send path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }
}

/// Fan-out group for a single room.
///
/// Every frame sent reaches every receiver, the sender's own included;
/// connection handlers drop frames that originated from their client.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    subscribers: Arc<RwLock<HashMap<Uuid, SubscriberInfo>>>,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a slow subscriber may buffer before
    /// it starts skipping.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register a subscriber and hand back its receiver.
    pub async fn add_subscriber(&self, info: SubscriberInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(info.client_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_subscriber(&self, client_id: &Uuid) -> Option<SubscriberInfo> {
        self.subscribers.write().await.remove(client_id)
    }

    /// Encode once and send to every receiver. Returns the receiver count.
    pub fn broadcast(&self, msg: &RelayMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(encoded))
    }

    /// Send pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a receiver skipped `n` frames.
    pub fn record_lag(&self, n: u64) {
        self.atomic_stats.messages_lagged.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn subscribers(&self) -> Vec<SubscriberInfo> {
        self.subscribers.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let subscribers = self.subscribers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.atomic_stats.messages_lagged.load(Ordering::Relaxed),
            active_subscribers: subscribers.len(),
        }
    }
}
