use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;

use blindbox_core::Snapshot;

use super::{SnapshotListener, Subscription, Transport, TransportKind};
use crate::client::RelayClient;

const REJOIN_BACKOFF_START: Duration = Duration::from_millis(100);
const REJOIN_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Push-subscribe transport backed by a [`RelayClient`].
///
/// Subscriptions survive relay restarts: when the connection drops they
/// reconnect with backoff and re-subscribe. The connection is closed once
/// the last subscription is dropped; requests after that reconnect.
pub struct RelayTransport {
    client: Arc<RelayClient>,
    subscribers: Arc<AtomicUsize>,
}

impl RelayTransport {
    pub fn new(url: impl Into<String>, room: impl Into<String>, request_timeout: Duration) -> Self {
        Self::with_client(Arc::new(RelayClient::new(url, room, request_timeout)))
    }

    pub fn with_client(client: Arc<RelayClient>) -> Self {
        Self {
            client,
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn client(&self) -> &Arc<RelayClient> {
        &self.client
    }
}

/// Reconnect and re-subscribe until the relay answers.
async fn rejoin(client: &RelayClient) {
    let mut delay = REJOIN_BACKOFF_START;
    loop {
        match client.connect().await {
            Ok(()) => {
                log::info!("Rejoined room '{}' at {}", client.room(), client.server_url());
                return;
            }
            Err(e) => {
                log::debug!("Rejoining room '{}' failed: {e}; retry in {delay:?}", client.room());
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(REJOIN_BACKOFF_MAX);
            }
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn describe(&self) -> String {
        format!("relay {} room '{}'", self.client.server_url(), self.client.room())
    }

    async fn pull(&self) -> Option<Snapshot> {
        match self.client.pull().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Pull from {} failed: {e}", self.describe());
                None
            }
        }
    }

    async fn push(&self, snapshot: &Snapshot) -> bool {
        match self.client.push(snapshot).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Push to {} failed: {e}", self.describe());
                false
            }
        }
    }

    async fn clear(&self) {
        if let Err(e) = self.client.clear().await {
            log::error!("Clear of {} failed: {e}", self.describe());
        }
    }

    async fn subscribe(&self, listener: SnapshotListener) -> Option<Subscription> {
        // Receivers first, so the snapshot sent on subscribe is not missed.
        let mut rx = self.client.updates();
        let mut losses = self.client.connection_losses();
        self.subscribers.fetch_add(1, Ordering::AcqRel);

        let online = match self.client.connect().await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Subscribing to {} while offline: {e}", self.describe());
                false
            }
        };

        let client = self.client.clone();
        let task = tokio::spawn(async move {
            if !online {
                rejoin(&client).await;
            }
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(snapshot) => listener(snapshot),
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Relay subscription skipped {n} snapshots");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    lost = losses.changed() => {
                        if lost.is_err() {
                            break;
                        }
                        log::warn!("Lost relay {}; rejoining", client.server_url());
                        rejoin(&client).await;
                    }
                }
            }
        });

        let client = self.client.clone();
        let subscribers = self.subscribers.clone();
        Some(Subscription::from_task(task).with_teardown(move || {
            if subscribers.fetch_sub(1, Ordering::AcqRel) != 1 {
                return;
            }
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if subscribers.load(Ordering::Acquire) == 0 {
                        client.disconnect().await;
                        log::debug!("Closed relay connection of {}", client.client_id());
                    }
                });
            }
        }))
    }
}
