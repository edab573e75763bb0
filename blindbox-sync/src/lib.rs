//! # blindbox-sync: Sharing a blind-box session between classroom devices
//!
//! Moves whole [`Snapshot`](blindbox_core::Snapshot)s between clients through a
//! pluggable transport, keeps a local copy per client, and arbitrates claims.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   start/end/reset   ┌──────────────┐
//! │ CatalogSource│ ──────────────────► │ SessionStore │ ◄── watch / on_change
//! └──────────────┘                     └──────┬───────┘
//!                                             │  pull / push / subscribe
//! ┌──────────────┐   read-verify-write ┌──────┴───────┐
//! │ ClaimArbiter │ ──────────────────► │  Transport   │
//! └──────────────┘                     └──────┬───────┘
//!                          ┌──────────────────┼──────────────────┐
//!                          ▼                  ▼                  ▼
//!                   RelayTransport      PollTransport     LocalTransport
//!                   (WebSocket)         (HTTP GET/POST)   (LocalDomain)
//!                          │
//!                   ┌──────┴──────┐
//!                   │ RelayServer │ rooms → snapshot + BroadcastGroup
//!                   └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary relay envelope (bincode-encoded RelayMessage)
//! - [`broadcast`]: Per-room fan-out with backpressure
//! - [`server`]: WebSocket relay
//! - [`client`]: WebSocket relay client with request correlation
//! - [`transport`]: The Transport trait and its three variants
//! - [`catalog`]: Catalog sources
//! - [`store`]: Local session cache and session controls
//! - [`arbiter`]: The claim protocol

pub mod protocol;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod transport;
pub mod catalog;
pub mod store;
pub mod arbiter;

// Re-exports for convenience
pub use protocol::{MessageType, ProtocolError, RelayMessage};
pub use broadcast::{BroadcastGroup, BroadcastStats, SubscriberInfo};
pub use server::{RelayServer, RelayServerConfig, RelayStats};
pub use client::{ConnectionState, RelayClient};
pub use transport::{
    LocalDomain, LocalTransport, PollTransport, RelayTransport, SnapshotListener, Subscription,
    Transport, TransportConfig, TransportKind,
};
pub use catalog::{CatalogSource, FileCatalogSource, HttpCatalogSource, StaticCatalog};
pub use store::{AttachMode, Attachment, SessionError, SessionStore, StoreConfig};
pub use arbiter::{ClaimArbiter, ClaimError};
