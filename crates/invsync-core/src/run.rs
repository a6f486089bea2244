//! The run model: one execution of the engine, as recorded in the sync log.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::strategy::{SyncStrategy, SyncTier};
use crate::types::{NaturalKey, RecordKind, RunId, Timestamp};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    /// Completed, but some batches or listing pages failed.
    PartialFailure,
    /// A run-level error ended the run.
    Failed,
    /// Stopped by an auth error, cancellation, deadline or a lost lock.
    Aborted,
    /// Abandoned; its lock was reclaimed by a later run.
    Stuck,
    /// Declined to start because another run held the lock.
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartialFailure => "partial_failure",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
            RunStatus::Stuck => "stuck",
            RunStatus::Skipped => "skipped",
        }
    }

    /// Terminal runs are immutable.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// Whether this status counts against health.
    pub fn is_failure(&self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Aborted | RunStatus::Stuck)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "partial_failure" => Ok(RunStatus::PartialFailure),
            "failed" => Ok(RunStatus::Failed),
            "aborted" => Ok(RunStatus::Aborted),
            "stuck" => Ok(RunStatus::Stuck),
            "skipped" => Ok(RunStatus::Skipped),
            _ => Err(CoreError::UnknownStatus(s.to_string())),
        }
    }
}

/// Classification of a failure, shared by the client, batch processor and log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transport,
    RateLimited,
    Auth,
    Malformed,
    WriteConflict,
    Store,
    Cancelled,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transport => "transport",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Auth => "auth",
            ErrorClass::Malformed => "malformed",
            ErrorClass::WriteConflict => "write_conflict",
            ErrorClass::Store => "store",
            ErrorClass::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Records read from the remote source.
    pub fetched: u64,
    /// Records whose fingerprint differed from the stored one.
    pub changed: u64,
    /// Records actually written (zero on a dry run).
    pub written: u64,
    /// Records in batches that exhausted their retries.
    pub failed: u64,
    /// Malformed records skipped during decoding.
    pub malformed: u64,
    /// Entities soft-deleted because a full listing no longer reported them.
    pub deactivated: u64,
}

/// A record whose batch exhausted its retries. Kept for re-drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub kind: RecordKind,
    pub key: NaturalKey,
    pub class: ErrorClass,
    pub attempts: u32,
    pub message: String,
}

/// A listing page or report that could not be read.
///
/// A listing with a failure is incomplete: absent keys may simply not have
/// been seen, so deactivation is skipped for that kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFailure {
    pub kind: RecordKind,
    pub cursor: Option<String>,
    pub class: ErrorClass,
    pub attempts: u32,
    pub message: String,
}

/// The durable record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: RunId,
    /// The strategy the caller requested. `None` for re-drives.
    pub strategy: Option<SyncStrategy>,
    /// The run whose failures this run re-drives.
    pub redrive_of: Option<RunId>,
    /// The tier actually executed, once resolved.
    pub tier: Option<SyncTier>,
    pub dry_run: bool,
    pub status: RunStatus,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
    pub counts: RunCounts,
    pub failures: Vec<BatchFailure>,
    pub listing_failures: Vec<ListingFailure>,
    /// Run-level error message, if any.
    pub error: Option<String>,
}

impl SyncRun {
    /// A new pending run.
    pub fn new(id: RunId, strategy: Option<SyncStrategy>, dry_run: bool, now: Timestamp) -> Self {
        Self {
            id,
            strategy,
            redrive_of: None,
            tier: None,
            dry_run,
            status: RunStatus::Pending,
            started_at: now,
            finished_at: None,
            counts: RunCounts::default(),
            failures: Vec::new(),
            listing_failures: Vec::new(),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a terminal status.
    pub fn finish(&mut self, status: RunStatus, now: Timestamp, error: Option<String>) {
        self.status = status;
        self.finished_at = Some(now);
        if error.is_some() {
            self.error = error;
        }
    }

    /// Status of a run that reached the end of its scope.
    pub fn completion_status(&self) -> RunStatus {
        if self.failures.is_empty() && self.listing_failures.is_empty() {
            RunStatus::Succeeded
        } else {
            RunStatus::PartialFailure
        }
    }

    /// Keys of failed batches, grouped by kind.
    pub fn failed_keys(&self) -> BTreeMap<RecordKind, BTreeSet<NaturalKey>> {
        let mut keys: BTreeMap<RecordKind, BTreeSet<NaturalKey>> = BTreeMap::new();
        for failure in &self.failures {
            keys.entry(failure.kind).or_default().insert(failure.key.clone());
        }
        keys
    }

    /// Duration in milliseconds, once finished.
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(kind: RecordKind, key: &str) -> BatchFailure {
        BatchFailure {
            kind,
            key: NaturalKey::new(key).unwrap(),
            class: ErrorClass::Transport,
            attempts: 3,
            message: "connection reset".into(),
        }
    }

    #[test]
    fn test_status_roundtrip_and_terminal() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::PartialFailure,
            RunStatus::Failed,
            RunStatus::Aborted,
            RunStatus::Stuck,
            RunStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Skipped.is_terminal());
        assert!(RunStatus::Stuck.is_failure());
        assert!(!RunStatus::PartialFailure.is_failure());
    }

    #[test]
    fn test_completion_status() {
        let mut run = SyncRun::new(RunId::generate(), Some(SyncStrategy::Full), false, 0);
        assert_eq!(run.completion_status(), RunStatus::Succeeded);

        run.failures.push(failure(RecordKind::Item, "B7"));
        assert_eq!(run.completion_status(), RunStatus::PartialFailure);
    }

    #[test]
    fn test_failed_keys_grouped_and_deduped() {
        let mut run = SyncRun::new(RunId::generate(), None, false, 0);
        run.failures.push(failure(RecordKind::Item, "B7"));
        run.failures.push(failure(RecordKind::Item, "B7"));
        run.failures.push(failure(RecordKind::Vendor, "V2"));

        let keys = run.failed_keys();
        assert_eq!(keys[&RecordKind::Item].len(), 1);
        assert_eq!(keys[&RecordKind::Vendor].len(), 1);
    }

    #[test]
    fn test_finish_keeps_existing_error() {
        let mut run = SyncRun::new(RunId::generate(), None, false, 100);
        run.error = Some("auth rejected".into());
        run.finish(RunStatus::Aborted, 250, None);
        assert_eq!(run.error.as_deref(), Some("auth rejected"));
        assert_eq!(run.duration_ms(), Some(150));
    }

    #[test]
    fn test_run_serde_roundtrip() {
        let mut run = SyncRun::new(RunId::generate(), Some(SyncStrategy::Smart), true, 1);
        run.tier = Some(SyncTier::CriticalOnly);
        run.failures.push(failure(RecordKind::Item, "B7"));
        let json = serde_json::to_string(&run).unwrap();
        let back: SyncRun = serde_json::from_str(&json).unwrap();
        assert_eq!(run, back);
    }
}
