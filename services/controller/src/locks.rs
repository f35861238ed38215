//! Named resource locks.
//!
//! A task holds every target its payload touches for its whole run. Targets
//! are always acquired in canonical (sorted, deduplicated) order and all at
//! once, so two reservations can never deadlock on each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vnet_id::{ReservationId, TaskId};

use crate::db::DbError;

/// A lockable resource name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockTarget(String);

impl LockTarget {
    pub fn vpc(region: &str, vpc_id: &str) -> Self {
        Self(format!("vpc:{region}:{vpc_id}"))
    }

    /// Serialises all writes to the IPAM container tree.
    pub fn ipcontrol_write() -> Self {
        Self("ipcontrol-write".to_string())
    }

    pub fn task(id: &TaskId) -> Self {
        Self(format!("task:{id}"))
    }

    /// Wraps a stored target name.
    pub fn from_stored(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sorted, deduplicated targets.
pub fn canonical(targets: impl IntoIterator<Item = LockTarget>) -> Vec<LockTarget> {
    let mut targets: Vec<_> = targets.into_iter().collect();
    targets.sort();
    targets.dedup();
    targets
}

/// Locks acquired together by one holder.
///
/// Clones share the release flag, so releasing through any clone releases
/// them all exactly once.
#[derive(Debug, Clone)]
pub struct LockSet {
    holder: ReservationId,
    targets: Vec<LockTarget>,
    released: Arc<AtomicBool>,
}

impl LockSet {
    pub fn new(holder: ReservationId, targets: impl IntoIterator<Item = LockTarget>) -> Self {
        Self {
            holder,
            targets: canonical(targets),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn holder(&self) -> &ReservationId {
        &self.holder
    }

    pub fn targets(&self) -> &[LockTarget] {
        &self.targets
    }

    pub fn contains(&self, target: &LockTarget) -> bool {
        self.targets.binary_search(target).is_ok()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Flags the set as released. Call only once the lock rows are gone.
    /// Returns `true` for the first caller.
    pub fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{target} is already locked")]
    AlreadyLocked { target: LockTarget },

    #[error("lock storage failed: {0}")]
    Database(#[from] DbError),
}

/// Storage for named locks.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire every target or none of them.
    async fn acquire_all(
        &self,
        holder: &ReservationId,
        targets: &[LockTarget],
    ) -> Result<LockSet, LockError>;

    /// Release the set. Calling this more than once is a no-op.
    async fn release_all(&self, locks: &LockSet) -> Result<(), LockError>;

    /// Whether `target` is still held by this set's holder.
    async fn holds(&self, locks: &LockSet, target: &LockTarget) -> Result<bool, LockError>;
}
