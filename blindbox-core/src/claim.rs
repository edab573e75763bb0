//! Claim validation against an explicitly supplied snapshot.
//!
//! The checks run in a fixed order and stop at the first failure:
//!
//! 1. `NotRunning`:     the session is not accepting claims
//! 2. `AlreadyTaken`:   the entry has an owner
//! 3. `AlreadyClaimed`: the claimant owns another entry
//! 4. `UnknownEntry`:   the entry is not in the current catalog
//! 5. `BlankClaimant`:  the name is empty after trimming
//!
//! Nothing here reads shared state; callers pass the freshest snapshot they have.

use crate::model::{Snapshot, Timestamp};
use crate::phase::SessionPhase;

/// Why a claim was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimRejection {
    NotRunning { phase: SessionPhase },
    AlreadyTaken { entry_id: String, owner: String },
    AlreadyClaimed { claimant: String, entry_id: String },
    UnknownEntry { entry_id: String },
    BlankClaimant,
}

impl std::fmt::Display for ClaimRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning { phase } => write!(f, "session is {phase}, not running"),
            Self::AlreadyTaken { entry_id, owner } => {
                write!(f, "{entry_id} is already taken by {owner}")
            }
            Self::AlreadyClaimed { claimant, entry_id } => {
                write!(f, "{claimant} already holds {entry_id}")
            }
            Self::UnknownEntry { entry_id } => write!(f, "{entry_id} is not in the catalog"),
            Self::BlankClaimant => write!(f, "claimant name is blank"),
        }
    }
}

impl std::error::Error for ClaimRejection {}

/// Check whether `claimant` may take `entry_id` in `snapshot`.
pub fn validate_claim(
    snapshot: &Snapshot,
    entry_id: &str,
    claimant: &str,
) -> Result<(), ClaimRejection> {
    let session = &snapshot.session;

    if session.phase != SessionPhase::Running {
        return Err(ClaimRejection::NotRunning {
            phase: session.phase,
        });
    }

    if let Some(owner) = session.assignments.get(entry_id) {
        return Err(ClaimRejection::AlreadyTaken {
            entry_id: entry_id.to_string(),
            owner: owner.clone(),
        });
    }

    if let Some(held) = snapshot.entry_of(claimant) {
        return Err(ClaimRejection::AlreadyClaimed {
            claimant: claimant.to_string(),
            entry_id: held.to_string(),
        });
    }

    if !snapshot.contains_entry(entry_id) {
        return Err(ClaimRejection::UnknownEntry {
            entry_id: entry_id.to_string(),
        });
    }

    if claimant.trim().is_empty() {
        return Err(ClaimRejection::BlankClaimant);
    }

    Ok(())
}

/// Build the snapshot that records the claim. Phase, timestamps and catalog
/// are carried over; only `assignments` grows and `updatedAt` moves to `now`.
pub fn apply_claim(
    snapshot: &Snapshot,
    entry_id: &str,
    claimant: &str,
    now: Timestamp,
) -> Result<Snapshot, ClaimRejection> {
    validate_claim(snapshot, entry_id, claimant)?;

    let mut next = snapshot.clone();
    next.session
        .assignments
        .insert(entry_id.to_string(), claimant.to_string());
    next.updated_at = now;
    Ok(next)
}
