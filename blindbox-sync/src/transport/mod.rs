//! The backend a session is shared through.
//!
//! Three variants with different consistency:
//! - [`RelayTransport`]: push-subscribe over the WebSocket relay. Near-immediate
//!   propagation; concurrent pushes interleave and the last one wins.
//! - [`PollTransport`]: HTTP key/value store. Clients see remote state only at
//!   their next scheduled pull.
//! - [`LocalTransport`]: an in-process (optionally file-backed) domain. Immediate
//!   among handles sharing the domain, invisible elsewhere.
//!
//! Failures never cross this boundary as errors: they are logged and turned
//! into `None`/`false`.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use blindbox_core::Snapshot;

mod local;
mod poll;
mod relay;

pub use local::{LocalDomain, LocalTransport, FILE_WATCH_INTERVAL};
pub use poll::PollTransport;
pub use relay::RelayTransport;

/// Callback receiving each snapshot delivered by a subscription.
pub type SnapshotListener = Arc<dyn Fn(Snapshot) + Send + Sync>;

/// Which backend a transport talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Relay,
    Poll,
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay => write!(f, "relay"),
            Self::Poll => write!(f, "poll"),
            Self::Local => write!(f, "local"),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Current remote snapshot. `None` when absent or unreachable.
    async fn pull(&self) -> Option<Snapshot>;

    /// Replace the remote snapshot wholesale. Whether it was accepted.
    async fn push(&self, snapshot: &Snapshot) -> bool;

    /// Best-effort removal of the remote snapshot.
    async fn clear(&self);

    /// Deliver every later remote change to `listener` until the returned
    /// guard is dropped. `None` means the backend cannot push.
    async fn subscribe(&self, _listener: SnapshotListener) -> Option<Subscription> {
        None
    }

    /// How often a store should pull when it cannot subscribe.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }
}

type Teardown = Box<dyn FnOnce() + Send + Sync>;

/// Live subscription. Delivery stops when this is dropped, and whatever the
/// backend held for it is released.
pub struct Subscription {
    task: Option<JoinHandle<()>>,
    teardown: Option<Teardown>,
}

impl Subscription {
    /// Wrap the task that forwards snapshots to a listener.
    pub fn from_task(task: JoinHandle<()>) -> Self {
        Self {
            task: Some(task),
            teardown: None,
        }
    }

    /// Run `teardown` once, after the forwarding task is stopped.
    pub fn with_teardown(mut self, teardown: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.teardown = Some(Box::new(teardown));
        self
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

fn default_room() -> String {
    "defaultRoom".to_string()
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

/// Selects and parameterizes the transport at start-up.
///
/// ```json
/// { "kind": "relay", "url": "ws://127.0.0.1:9090", "room": "period-3" }
/// { "kind": "poll", "url": "http://kv.local/blindbox", "poll_interval_ms": 3000 }
/// { "kind": "local", "path": "/tmp/blindbox.json" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Relay {
        url: String,
        #[serde(default = "default_room")]
        room: String,
        #[serde(default = "default_request_timeout_ms")]
        request_timeout_ms: u64,
    },
    Poll {
        url: String,
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
        #[serde(default = "default_request_timeout_ms")]
        request_timeout_ms: u64,
    },
    Local {
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

impl TransportConfig {
    pub fn relay(url: impl Into<String>) -> Self {
        Self::Relay {
            url: url.into(),
            room: default_room(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }

    pub fn poll(url: impl Into<String>) -> Self {
        Self::Poll {
            url: url.into(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Relay { .. } => TransportKind::Relay,
            Self::Poll { .. } => TransportKind::Poll,
            Self::Local { .. } => TransportKind::Local,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Build the transport. Network variants connect lazily, so this
    /// never fails.
    pub fn connect(&self) -> Arc<dyn Transport> {
        match self {
            Self::Relay {
                url,
                room,
                request_timeout_ms,
            } => Arc::new(RelayTransport::new(
                url.as_str(),
                room.as_str(),
                Duration::from_millis(*request_timeout_ms),
            )),
            Self::Poll {
                url,
                poll_interval_ms,
                request_timeout_ms,
            } => Arc::new(PollTransport::new(
                url.as_str(),
                Duration::from_millis(*poll_interval_ms),
                Duration::from_millis(*request_timeout_ms),
            )),
            Self::Local { path } => {
                let domain = match path {
                    Some(path) => LocalDomain::file_backed(path.clone()),
                    None => LocalDomain::in_memory(),
                };
                Arc::new(LocalTransport::new(domain))
            }
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Local { path: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_relay_defaults() {
        let config =
            TransportConfig::from_json(r#"{"kind":"relay","url":"ws://127.0.0.1:9090"}"#).unwrap();
        assert_eq!(config, TransportConfig::relay("ws://127.0.0.1:9090"));
        if let TransportConfig::Relay {
            room,
            request_timeout_ms,
            ..
        } = config
        {
            assert_eq!(room, "defaultRoom");
            assert_eq!(request_timeout_ms, 5_000);
        }
    }

    #[test]
    fn test_config_poll_overrides() {
        let config = TransportConfig::from_json(
            r#"{"kind":"poll","url":"http://kv/x","poll_interval_ms":500}"#,
        )
        .unwrap();
        assert_eq!(config.kind(), TransportKind::Poll);
        assert_eq!(
            config,
            TransportConfig::Poll {
                url: "http://kv/x".to_string(),
                poll_interval_ms: 500,
                request_timeout_ms: 5_000,
            }
        );
    }

    #[test]
    fn test_config_local_without_path() {
        let config = TransportConfig::from_json(r#"{"kind":"local"}"#).unwrap();
        assert_eq!(config, TransportConfig::default());
    }

    #[test]
    fn test_config_unknown_kind() {
        assert!(TransportConfig::from_json(r#"{"kind":"carrier-pigeon"}"#).is_err());
    }

    #[tokio::test]
    async fn test_connect_builds_matching_kind() {
        for config in [
            TransportConfig::relay("ws://127.0.0.1:1"),
            TransportConfig::poll("http://127.0.0.1:1/x"),
            TransportConfig::default(),
        ] {
            let transport = config.connect();
            assert_eq!(transport.kind(), config.kind());
        }
    }

    #[tokio::test]
    async fn test_subscription_aborts_on_drop() {
        let task = tokio::spawn(std::future::pending::<()>());
        let sub = Subscription::from_task(task);
        assert!(sub.is_active());
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn test_teardown_runs_once_after_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = Subscription::from_task(tokio::spawn(std::future::pending::<()>()))
            .with_teardown(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(TransportKind::Relay.to_string(), "relay");
        assert_eq!(TransportKind::Local.to_string(), "local");
    }
}
