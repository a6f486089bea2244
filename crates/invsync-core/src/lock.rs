//! The system-wide concurrency lock record.

use serde::{Deserialize, Serialize};

use crate::types::{RunId, Timestamp};

/// The singleton lock row. At most one exists at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLock {
    pub holder: RunId,
    pub acquired_at: Timestamp,
    pub heartbeat_at: Timestamp,
}

impl ConcurrencyLock {
    /// A fresh lock for `holder`.
    pub fn new(holder: RunId, now: Timestamp) -> Self {
        Self {
            holder,
            acquired_at: now,
            heartbeat_at: now,
        }
    }

    /// Whether the heartbeat is older than `stale_after_ms`.
    pub fn is_stale(&self, now: Timestamp, stale_after_ms: i64) -> bool {
        now.saturating_sub(self.heartbeat_at) > stale_after_ms
    }
}

/// Result of an atomic lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquisition {
    /// The lock was free and is now held by the caller.
    Acquired,
    /// A stale lock was taken over. `previous` is the abandoned lock.
    Reclaimed { previous: ConcurrencyLock },
    /// A live lock is held by another run.
    Contended { holder: ConcurrencyLock },
}

impl LockAcquisition {
    /// Whether the caller now holds the lock.
    pub fn is_held(&self) -> bool {
        !matches!(self, LockAcquisition::Contended { .. })
    }
}
