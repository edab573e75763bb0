//! Session data model and its JSON wire shape.
//!
//! Wire format (one snapshot, always replaced wholesale):
//! ```text
//! {
//!   "session":   { "phase", "startedAt", "endedAt", "assignments": { entryId: claimant } },
//!   "catalog":   [ { "id", "name", "category", "hint" } ],
//!   "updatedAt": <ms since epoch>
//! }
//! ```
//!
//! Decoding is lenient: a backend that dropped an empty object or wrote `null`
//! still yields a well-formed value (missing assignments are empty, a missing
//! session is idle).

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::SystemTime;

use crate::phase::SessionPhase;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

/// Treat an explicit `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One claimable box. `id` doubles as the display symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub hint: String,
}

impl CatalogEntry {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category: category.into(),
            hint: hint.into(),
        }
    }

    /// The symbol shown to players and written to exports.
    pub fn symbol(&self) -> &str {
        &self.id
    }
}

/// The mutable part of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSession {
    #[serde(default, deserialize_with = "null_as_default")]
    pub phase: SessionPhase,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    #[serde(default)]
    pub ended_at: Option<Timestamp>,
    /// entry id → claimant name
    #[serde(default, deserialize_with = "null_as_default")]
    pub assignments: BTreeMap<String, String>,
}

impl GameSession {
    /// Fresh idle session: no timestamps, no assignments.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Fresh running session started at `now`.
    pub fn running(now: Timestamp) -> Self {
        Self {
            phase: SessionPhase::Running,
            started_at: Some(now),
            ended_at: None,
            assignments: BTreeMap::new(),
        }
    }

    /// This session closed at `now`. Assignments are kept as-is.
    pub fn ended(&self, now: Timestamp) -> Self {
        Self {
            phase: SessionPhase::Ended,
            ended_at: Some(now),
            ..self.clone()
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == SessionPhase::Running
    }
}

/// The unit exchanged across the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default, deserialize_with = "null_as_default")]
    pub session: GameSession,
    #[serde(default, deserialize_with = "null_as_default")]
    pub catalog: Vec<CatalogEntry>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub updated_at: Timestamp,
}

impl Snapshot {
    pub fn new(session: GameSession, catalog: Vec<CatalogEntry>, updated_at: Timestamp) -> Self {
        Self {
            session,
            catalog,
            updated_at,
        }
    }

    /// Idle snapshot over the given catalog.
    pub fn idle(catalog: Vec<CatalogEntry>, now: Timestamp) -> Self {
        Self::new(GameSession::idle(), catalog, now)
    }

    /// Running snapshot over a freshly fetched catalog.
    pub fn started(catalog: Vec<CatalogEntry>, now: Timestamp) -> Self {
        Self::new(GameSession::running(now), catalog, now)
    }

    /// Same catalog, session moved to `Ended`.
    pub fn ended(&self, now: Timestamp) -> Self {
        Self::new(self.session.ended(now), self.catalog.clone(), now)
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase
    }

    pub fn entry(&self, entry_id: &str) -> Option<&CatalogEntry> {
        self.catalog.iter().find(|e| e.id == entry_id)
    }

    pub fn contains_entry(&self, entry_id: &str) -> bool {
        self.entry(entry_id).is_some()
    }

    /// Who holds `entry_id`, if anyone.
    pub fn assignee_of(&self, entry_id: &str) -> Option<&str> {
        self.session.assignments.get(entry_id).map(String::as_str)
    }

    /// Which entry `claimant` holds, if any. Exact string match.
    pub fn entry_of(&self, claimant: &str) -> Option<&str> {
        self.session
            .assignments
            .iter()
            .find(|(_, owner)| owner.as_str() == claimant)
            .map(|(entry, _)| entry.as_str())
    }

    /// (claimed, total) boxes.
    pub fn progress(&self) -> (usize, usize) {
        (self.session.assignments.len(), self.catalog.len())
    }

    /// Encode to the JSON wire payload.
    pub fn to_json(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decode from the JSON wire payload.
    pub fn from_json(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    /// Every invariant this snapshot breaks. Empty means consistent.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        let session = &self.session;

        let ids: HashSet<&str> = self.catalog.iter().map(|e| e.id.as_str()).collect();
        for entry_id in session.assignments.keys() {
            if !ids.contains(entry_id.as_str()) {
                violations.push(InvariantViolation::UnknownEntry(entry_id.clone()));
            }
        }

        let mut seen = HashSet::new();
        for claimant in session.assignments.values() {
            if !seen.insert(claimant.as_str()) {
                violations.push(InvariantViolation::DuplicateClaimant(claimant.clone()));
            }
        }

        match session.phase {
            SessionPhase::Idle => {
                if !session.assignments.is_empty() {
                    violations.push(InvariantViolation::AssignmentsWhileIdle);
                }
                if session.started_at.is_some() {
                    violations.push(InvariantViolation::StartedAtMismatch);
                }
                if session.ended_at.is_some() {
                    violations.push(InvariantViolation::EndedAtMismatch);
                }
            }
            SessionPhase::Running => {
                if session.started_at.is_none() {
                    violations.push(InvariantViolation::StartedAtMismatch);
                }
                if session.ended_at.is_some() {
                    violations.push(InvariantViolation::EndedAtMismatch);
                }
            }
            SessionPhase::Ended => {
                if session.started_at.is_none() {
                    violations.push(InvariantViolation::StartedAtMismatch);
                }
                if session.ended_at.is_none() {
                    violations.push(InvariantViolation::EndedAtMismatch);
                }
            }
        }

        violations
    }
}

/// A broken snapshot invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Assignment key not present in the catalog.
    UnknownEntry(String),
    /// Claimant holds more than one entry.
    DuplicateClaimant(String),
    AssignmentsWhileIdle,
    StartedAtMismatch,
    EndedAtMismatch,
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEntry(id) => write!(f, "assignment for unknown entry '{id}'"),
            Self::DuplicateClaimant(name) => write!(f, "claimant '{name}' holds several entries"),
            Self::AssignmentsWhileIdle => write!(f, "assignments present while idle"),
            Self::StartedAtMismatch => write!(f, "startedAt inconsistent with phase"),
            Self::EndedAtMismatch => write!(f, "endedAt inconsistent with phase"),
        }
    }
}

/// Snapshot JSON errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Snapshot encode error: {e}"),
            Self::Decode(e) => write!(f, "Snapshot decode error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}
