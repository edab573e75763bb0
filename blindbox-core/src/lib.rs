//! # blindbox-core: Session model for the blind-box classroom game
//!
//! Everything here is plain data and pure functions. Networking, caching and
//! the claim protocol live in `blindbox-sync`.
//!
//! ## Data
//!
//! ```text
//! Snapshot
//! ├── session: GameSession
//! │     ├── phase        Idle | Running | Ended
//! │     ├── startedAt    ms | null
//! │     ├── endedAt      ms | null
//! │     └── assignments  entryId → claimant
//! ├── catalog: [CatalogEntry]
//! └── updatedAt: ms
//! ```
//!
//! ## Modules
//!
//! - [`model`]: snapshot types, JSON wire shape, invariant checks
//! - [`phase`]: session phase state machine
//! - [`claim`]: claim validation on an explicit snapshot
//! - [`catalog`]: catalog CSV parsing and shuffling
//! - [`export`]: results CSV with BOM

pub mod model;
pub mod phase;
pub mod claim;
pub mod catalog;
pub mod export;

pub use model::{
    now_millis, CatalogEntry, CodecError, GameSession, InvariantViolation, Snapshot, Timestamp,
};
pub use phase::{InvalidTransition, PhaseAction, SessionPhase};
pub use claim::{apply_claim, validate_claim, ClaimRejection};
pub use catalog::{parse_catalog_csv, shuffled, shuffled_with};
pub use export::{export_csv, export_file_name, ExportOptions, BOM};
