//! Claiming a box: optimistic read-verify-write through the transport.
//!
//! 1. Pull the remote snapshot, bypassing the cache (fall back to the cache
//!    if the pull yields nothing).
//! 2. Validate against that snapshot. A refusal ends the claim, no retry.
//! 3. Push the snapshot with the new assignment added.
//!
//! This is not a lock. Two clients that both pass step 2 against the same
//! snapshot will both push, and the later push wins. The loser's caller has
//! already been told it succeeded; no read-back check is made.

use blindbox_core::{apply_claim, now_millis, ClaimRejection};

use crate::store::SessionStore;

/// Claim failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    /// Refused by validation; nothing was written
    Rejected(ClaimRejection),
    /// The push was not accepted
    TransportUnavailable,
    /// Nothing could be pulled and nothing is cached
    NoSnapshot,
}

impl ClaimError {
    /// Refused for a domain reason rather than a delivery failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn rejection(&self) -> Option<&ClaimRejection> {
        match self {
            Self::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClaimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(r) => write!(f, "Claim rejected: {r}"),
            Self::TransportUnavailable => write!(f, "Transport unavailable"),
            Self::NoSnapshot => write!(f, "No session available"),
        }
    }
}

impl std::error::Error for ClaimError {}

impl From<ClaimRejection> for ClaimError {
    fn from(r: ClaimRejection) -> Self {
        Self::Rejected(r)
    }
}

/// Assigns boxes to claimants through a [`SessionStore`].
#[derive(Clone)]
pub struct ClaimArbiter {
    store: SessionStore,
}

impl ClaimArbiter {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Give `entry_id` to `claimant`.
    pub async fn claim(&self, entry_id: &str, claimant: &str) -> Result<(), ClaimError> {
        let _intent = self.store.lock_intent().await;

        let current = self
            .store
            .fresh_snapshot()
            .await
            .ok_or(ClaimError::NoSnapshot)?;

        let next = match apply_claim(&current, entry_id, claimant, now_millis()) {
            Ok(next) => next,
            Err(rejection) => {
                log::debug!("Claim of {entry_id} by {claimant:?} refused: {rejection}");
                return Err(rejection.into());
            }
        };

        if !self.store.transport().push(&next).await {
            log::warn!(
                "Claim of {entry_id} by {claimant:?} not delivered to {}",
                self.store.transport().describe()
            );
            return Err(ClaimError::TransportUnavailable);
        }

        let (claimed, total) = next.progress();
        self.store.accept(next);
        log::info!("{claimant:?} claimed {entry_id} ({claimed}/{total} opened)");
        Ok(())
    }
}
