//! The sync log: durable history of runs, and the health view derived from it.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use invsync_core::{RunId, RunStatus, SyncRun, Timestamp};
use invsync_store::Store;

use crate::error::Result;

/// How many recent runs `health` looks at.
const HEALTH_WINDOW: usize = 500;

/// Summary of recent run outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Health {
    /// Start time of the newest `Succeeded` run.
    pub last_success: Option<Timestamp>,
    pub last_success_run: Option<RunId>,
    /// `Failed`, `Aborted` and `Stuck` runs since the last run that completed
    /// its scope (`Succeeded` or `PartialFailure`).
    pub consecutive_failures: u32,
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures == 0
    }
}

/// Reads and writes run records.
#[derive(Clone)]
pub struct SyncLog {
    store: Arc<dyn Store>,
}

impl SyncLog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Record a new run.
    pub async fn start(&self, run: &SyncRun) -> Result<()> {
        self.store.insert_run(run).await?;
        debug!(run_id = %run.id, status = %run.status, "run logged");
        Ok(())
    }

    /// Persist progress of a non-terminal run.
    pub async fn update(&self, run: &SyncRun) -> Result<()> {
        Ok(self.store.update_run(run).await?)
    }

    /// Persist the terminal state of a run. The store rejects any later write.
    pub async fn finish(&self, run: &SyncRun) -> Result<()> {
        debug_assert!(run.is_terminal());
        self.store.update_run(run).await?;
        debug!(run_id = %run.id, status = %run.status, "run finalized");
        Ok(())
    }

    pub async fn get(&self, id: RunId) -> Result<Option<SyncRun>> {
        Ok(self.store.get_run(id).await?)
    }

    /// Most recent runs, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<SyncRun>> {
        Ok(self.store.list_runs(limit).await?)
    }

    pub async fn health(&self) -> Result<Health> {
        let runs = self.store.list_runs(HEALTH_WINDOW).await?;
        Ok(health_of(&runs))
    }
}

/// Health over runs ordered newest first.
///
/// Skipped and still-running runs are ignored. The failure streak ends at the
/// first run that reached the end of its scope.
pub fn health_of(runs: &[SyncRun]) -> Health {
    let mut health = Health::default();
    let mut streak_open = true;

    for run in runs {
        match run.status {
            RunStatus::Succeeded => {
                streak_open = false;
                if health.last_success.is_none() {
                    health.last_success = Some(run.started_at);
                    health.last_success_run = Some(run.id);
                }
            }
            RunStatus::PartialFailure => streak_open = false,
            status if status.is_failure() && streak_open => health.consecutive_failures += 1,
            _ => {}
        }
        if !streak_open && health.last_success.is_some() {
            break;
        }
    }
    health
}

#[cfg(test)]
mod tests {
    use super::*;
    use invsync_store::MemoryStore;

    fn run(status: RunStatus, started_at: Timestamp) -> SyncRun {
        let mut run = SyncRun::new(RunId::generate(), None, false, started_at);
        run.status = status;
        run
    }

    #[test]
    fn test_health_counts_failures_since_completion() {
        // Newest first.
        let runs = vec![
            run(RunStatus::Aborted, 900),
            run(RunStatus::Skipped, 800),
            run(RunStatus::Failed, 700),
            run(RunStatus::Stuck, 600),
            run(RunStatus::PartialFailure, 500),
            run(RunStatus::Failed, 400),
            run(RunStatus::Succeeded, 300),
            run(RunStatus::Succeeded, 200),
        ];
        let health = health_of(&runs);
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(health.last_success, Some(300));
        assert_eq!(health.last_success_run, Some(runs[6].id));
        assert!(!health.is_healthy());
    }

    #[test]
    fn test_health_of_empty_log() {
        let health = health_of(&[]);
        assert_eq!(health, Health::default());
        assert!(health.is_healthy());
    }

    #[test]
    fn test_running_runs_are_ignored() {
        let runs = vec![run(RunStatus::Running, 900), run(RunStatus::Succeeded, 100)];
        let health = health_of(&runs);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.last_success, Some(100));
    }

    #[tokio::test]
    async fn test_log_roundtrip_and_finality() {
        let log = SyncLog::new(Arc::new(MemoryStore::new()));
        let mut entry = SyncRun::new(RunId::generate(), None, false, 1_000);
        log.start(&entry).await.unwrap();

        entry.status = RunStatus::Running;
        entry.counts.fetched = 4;
        log.update(&entry).await.unwrap();

        entry.finish(RunStatus::Succeeded, 2_000, None);
        log.finish(&entry).await.unwrap();

        let stored = log.get(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert_eq!(stored.counts.fetched, 4);

        // Terminal runs are immutable.
        entry.counts.fetched = 99;
        assert!(log.update(&entry).await.is_err());

        let health = log.health().await.unwrap();
        assert_eq!(health.last_success, Some(1_000));
        assert_eq!(log.history(10).await.unwrap().len(), 1);
    }
}
