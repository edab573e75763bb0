//! Local copy of the shared session, plus the session controls.
//!
//! The store keeps the last snapshot it accepted, from a pull or a
//! subscription delivery, and republishes it to listeners. Session controls
//! (`start`, `end`, `reset`, `initialize`) are whole-snapshot
//! read-modify-writes checked against the phase state machine.
//!
//! Controls and claims issued through the same store are serialized by the
//! intent lock. Nothing serializes them against other processes: a claim in
//! flight elsewhere can be overwritten by a control push, and vice versa.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::MissedTickBehavior;

use blindbox_core::{
    now_millis, CatalogEntry, GameSession, InvalidTransition, PhaseAction, SessionPhase, Snapshot,
};

use crate::catalog::CatalogSource;
use crate::transport::{SnapshotListener, Subscription, Transport};

/// Poll period used when neither the store nor the transport names one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Overrides the transport's poll interval when attaching without a
    /// push channel.
    pub poll_interval: Option<Duration>,
    /// Pull once immediately on `attach`
    pub refresh_on_attach: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            poll_interval: None,
            refresh_on_attach: true,
        }
    }
}

impl StoreConfig {
    /// Fast polling for tests.
    pub fn for_testing() -> Self {
        Self {
            poll_interval: Some(Duration::from_millis(50)),
            refresh_on_attach: true,
        }
    }
}

/// Session control errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The action is not an edge from the current phase
    InvalidTransition(InvalidTransition),
    /// The transport refused or failed the push
    TransportUnavailable,
    /// There is no session to act on
    NoSnapshot,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTransition(t) => write!(f, "{t}"),
            Self::TransportUnavailable => write!(f, "Transport unavailable"),
            Self::NoSnapshot => write!(f, "No session has been created yet"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<InvalidTransition> for SessionError {
    fn from(t: InvalidTransition) -> Self {
        Self::InvalidTransition(t)
    }
}

/// How an [`Attachment`] receives remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    Subscribed,
    Polling(Duration),
}

/// Keeps a store receiving remote state. Delivery stops on drop.
#[derive(Debug)]
pub struct Attachment {
    mode: AttachMode,
    _delivery: Subscription,
}

impl Attachment {
    pub fn mode(&self) -> AttachMode {
        self.mode
    }
}

struct StoreInner {
    transport: Arc<dyn Transport>,
    catalog: Arc<dyn CatalogSource>,
    config: StoreConfig,
    /// Cache and change feed in one: the current value is the cache.
    current: watch::Sender<Option<Snapshot>>,
    intent: Mutex<()>,
}

/// Cheap to clone; clones share one cache.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    pub fn new(
        transport: Arc<dyn Transport>,
        catalog: Arc<dyn CatalogSource>,
        config: StoreConfig,
    ) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            inner: Arc::new(StoreInner {
                transport,
                catalog,
                config,
                current,
                intent: Mutex::new(()),
            }),
        }
    }

    pub fn with_defaults(transport: Arc<dyn Transport>, catalog: Arc<dyn CatalogSource>) -> Self {
        Self::new(transport, catalog, StoreConfig::default())
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Start receiving remote state: subscribe if the transport can push,
    /// otherwise pull on a fixed interval.
    pub async fn attach(&self) -> Attachment {
        let store = self.clone();
        let listener: SnapshotListener = Arc::new(move |snapshot| store.accept(snapshot));

        let attachment = match self.inner.transport.subscribe(listener).await {
            Some(subscription) => Attachment {
                mode: AttachMode::Subscribed,
                _delivery: subscription,
            },
            None => {
                let period = self
                    .inner
                    .config
                    .poll_interval
                    .or_else(|| self.inner.transport.poll_interval())
                    .unwrap_or(DEFAULT_POLL_INTERVAL);
                let store = self.clone();
                let task = tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        store.refresh().await;
                    }
                });
                Attachment {
                    mode: AttachMode::Polling(period),
                    _delivery: Subscription::from_task(task),
                }
            }
        };

        log::info!(
            "Attached to {} ({:?})",
            self.inner.transport.describe(),
            attachment.mode
        );
        if self.inner.config.refresh_on_attach {
            self.refresh().await;
        }
        attachment
    }

    /// Pull once. Whether a snapshot was received.
    pub async fn refresh(&self) -> bool {
        match self.inner.transport.pull().await {
            Some(snapshot) => {
                self.accept(snapshot);
                true
            }
            None => false,
        }
    }

    /// Replace the cache with a remote delivery and notify listeners.
    ///
    /// The backend is authoritative: inconsistent or older snapshots are
    /// logged but still accepted.
    pub fn accept(&self, snapshot: Snapshot) {
        for violation in snapshot.check_invariants() {
            log::warn!("Accepted snapshot breaks an invariant: {violation}");
        }

        self.inner.current.send_if_modified(|current| {
            if let Some(cached) = current.as_ref() {
                if *cached == snapshot {
                    return false;
                }
                if snapshot.updated_at < cached.updated_at {
                    log::debug!(
                        "Accepting older snapshot ({} < {})",
                        snapshot.updated_at,
                        cached.updated_at
                    );
                }
            }
            *current = Some(snapshot);
            true
        });
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.inner.current.borrow().clone()
    }

    pub fn session(&self) -> Option<GameSession> {
        self.inner.current.borrow().as_ref().map(|s| s.session.clone())
    }

    pub fn catalog(&self) -> Vec<CatalogEntry> {
        self.inner
            .current
            .borrow()
            .as_ref()
            .map(|s| s.catalog.clone())
            .unwrap_or_default()
    }

    pub fn phase(&self) -> Option<SessionPhase> {
        self.inner.current.borrow().as_ref().map(Snapshot::phase)
    }

    /// Change feed. The receiver starts with the current value marked seen.
    pub fn watch(&self) -> watch::Receiver<Option<Snapshot>> {
        self.inner.current.subscribe()
    }

    /// Call `listener` with every later snapshot until the guard is dropped.
    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let mut rx = self.watch();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let current = rx.borrow_and_update().clone();
                if let Some(snapshot) = current {
                    listener(&snapshot);
                }
            }
        });
        Subscription::from_task(task)
    }

    /// Serialize a read-modify-write against this process's other intents.
    pub async fn lock_intent(&self) -> MutexGuard<'_, ()> {
        self.inner.intent.lock().await
    }

    /// Freshest snapshot available: a pull, else the cache.
    pub async fn fresh_snapshot(&self) -> Option<Snapshot> {
        match self.inner.transport.pull().await {
            Some(snapshot) => {
                self.accept(snapshot.clone());
                Some(snapshot)
            }
            None => self.snapshot(),
        }
    }

    /// Seed a backend that has no session yet: idle, with a fresh catalog.
    pub async fn initialize(&self) -> Result<(), SessionError> {
        let _intent = self.lock_intent().await;
        if let Some(current) = self.fresh_snapshot().await {
            current.phase().after(PhaseAction::Initialize)?;
        }
        let catalog = self.inner.catalog.fetch().await;
        self.commit(Snapshot::idle(catalog, now_millis())).await
    }

    /// Open a running session over a freshly fetched catalog.
    pub async fn start_session(&self) -> Result<(), SessionError> {
        let _intent = self.lock_intent().await;
        let phase = self
            .fresh_snapshot()
            .await
            .map(|s| s.phase())
            .unwrap_or_default();
        phase.after(PhaseAction::Start)?;

        let catalog = self.inner.catalog.fetch().await;
        if catalog.is_empty() {
            log::warn!("Starting a session with an empty catalog");
        }
        self.commit(Snapshot::started(catalog, now_millis())).await
    }

    /// Close the running session. Assignments are kept.
    pub async fn end_session(&self) -> Result<(), SessionError> {
        let _intent = self.lock_intent().await;
        let current = self.fresh_snapshot().await.ok_or(SessionError::NoSnapshot)?;
        current.phase().after(PhaseAction::End)?;
        self.commit(current.ended(now_millis())).await
    }

    /// Back to idle with no assignments. The catalog is cleared unless
    /// `refetch_catalog` asks for a new one.
    pub async fn reset_session(&self, refetch_catalog: bool) -> Result<(), SessionError> {
        let _intent = self.lock_intent().await;
        let phase = self
            .fresh_snapshot()
            .await
            .map(|s| s.phase())
            .unwrap_or_default();
        phase.after(PhaseAction::Reset)?;

        let catalog = if refetch_catalog {
            self.inner.catalog.fetch().await
        } else {
            Vec::new()
        };
        self.commit(Snapshot::idle(catalog, now_millis())).await
    }

    /// Best-effort removal of the remote snapshot; the cache is emptied too.
    pub async fn clear_remote(&self) {
        let _intent = self.lock_intent().await;
        self.inner.transport.clear().await;
        self.inner.current.send_replace(None);
    }

    /// Push `next` and adopt it locally once accepted.
    ///
    /// Callers must hold the intent lock.
    pub(crate) async fn commit(&self, next: Snapshot) -> Result<(), SessionError> {
        if !self.inner.transport.push(&next).await {
            log::warn!(
                "Push of {} session to {} failed",
                next.phase(),
                self.inner.transport.describe()
            );
            return Err(SessionError::TransportUnavailable);
        }
        log::info!("Session is now {}", next.phase());
        self.accept(next);
        Ok(())
    }
}
