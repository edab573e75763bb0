use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::time::MissedTickBehavior;

use blindbox_core::Snapshot;

use super::{SnapshotListener, Subscription, Transport, TransportKind};

/// How often subscriptions on a file-backed domain re-read the file.
pub const FILE_WATCH_INTERVAL: Duration = Duration::from_millis(250);

struct DomainInner {
    current: RwLock<Option<Snapshot>>,
    changes: broadcast::Sender<Snapshot>,
    path: Option<PathBuf>,
}

/// A storage domain shared by every [`LocalTransport`] built from it.
///
/// Pushes reach the domain's subscribers immediately. A file-backed domain
/// also writes each snapshot to disk (temp file, then rename), and its
/// subscriptions re-read the file every [`FILE_WATCH_INTERVAL`], so writes
/// from other processes sharing the file are delivered too.
#[derive(Clone)]
pub struct LocalDomain {
    inner: Arc<DomainInner>,
}

impl LocalDomain {
    fn with_path(path: Option<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(DomainInner {
                current: RwLock::new(None),
                changes,
                path,
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::with_path(None)
    }

    pub fn file_backed(path: impl Into<PathBuf>) -> Self {
        Self::with_path(Some(path.into()))
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Another handle onto this domain.
    pub fn transport(&self) -> LocalTransport {
        LocalTransport::new(self.clone())
    }

    async fn read(&self) -> Option<Snapshot> {
        let Some(path) = self.inner.path.as_ref() else {
            return self.inner.current.read().await.clone();
        };
        match tokio::fs::read(path).await {
            Ok(bytes) => match Snapshot::from_json(&bytes) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    log::warn!("Ignoring unreadable snapshot file {}: {e}", path.display());
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!("Cannot read {}: {e}", path.display());
                self.inner.current.read().await.clone()
            }
        }
    }

    async fn write(&self, snapshot: &Snapshot) -> bool {
        let mut current = self.inner.current.write().await;

        if let Some(path) = self.inner.path.as_ref() {
            let bytes = match snapshot.to_json() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("Cannot encode snapshot: {e}");
                    return false;
                }
            };
            let tmp = path.with_extension("json.tmp");
            if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
                log::error!("Cannot write {}: {e}", tmp.display());
                return false;
            }
            if let Err(e) = tokio::fs::rename(&tmp, path).await {
                log::error!("Cannot replace {}: {e}", path.display());
                return false;
            }
        }

        *current = Some(snapshot.clone());
        let _ = self.inner.changes.send(snapshot.clone());
        true
    }

    async fn remove(&self) {
        let mut current = self.inner.current.write().await;
        *current = None;
        if let Some(path) = self.inner.path.as_ref() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::error!("Cannot remove {}: {e}", path.display()),
            }
        }
    }
}

/// Local-broadcast transport: a handle onto a [`LocalDomain`].
pub struct LocalTransport {
    domain: LocalDomain,
}

impl LocalTransport {
    pub fn new(domain: LocalDomain) -> Self {
        Self { domain }
    }

    pub fn domain(&self) -> &LocalDomain {
        &self.domain
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    fn describe(&self) -> String {
        match self.domain.path() {
            Some(path) => format!("local file {}", path.display()),
            None => "local memory".to_string(),
        }
    }

    async fn pull(&self) -> Option<Snapshot> {
        self.domain.read().await
    }

    async fn push(&self, snapshot: &Snapshot) -> bool {
        self.domain.write(snapshot).await
    }

    async fn clear(&self) {
        self.domain.remove().await;
    }

    async fn subscribe(&self, listener: SnapshotListener) -> Option<Subscription> {
        let mut rx = self.domain.inner.changes.subscribe();
        let domain = self.domain.clone();
        let watch_file = domain.path().is_some();
        // Only changes after subscribing are delivered.
        let mut last = if watch_file { domain.read().await } else { None };

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FILE_WATCH_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                let snapshot = tokio::select! {
                    received = rx.recv() => match received {
                        Ok(snapshot) => snapshot,
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Local subscription skipped {n} snapshots");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = ticker.tick(), if watch_file => match domain.read().await {
                        Some(snapshot) => snapshot,
                        None => continue,
                    },
                };
                if watch_file && last.as_ref() == Some(&snapshot) {
                    continue;
                }
                last = Some(snapshot.clone());
                listener(snapshot);
            }
        });
        Some(Subscription::from_task(task))
    }
}
