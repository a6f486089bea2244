//! Periodic trigger.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use invsync_core::SyncStrategy;

use crate::orchestrator::{RunOptions, SyncEngine};

/// Runs a strategy on a fixed interval until cancelled.
///
/// Ticks that fall due while a run is still in progress are skipped, so runs
/// from one scheduler never overlap. Runs from other processes are kept out
/// by the concurrency guard.
pub struct Scheduler {
    engine: SyncEngine,
    interval: Duration,
    strategy: SyncStrategy,
}

impl Scheduler {
    /// A scheduler using the engine's `schedule` configuration.
    pub fn new(engine: SyncEngine) -> Self {
        let schedule = engine.config().schedule;
        Self {
            engine,
            interval: schedule.interval,
            strategy: schedule.strategy,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Run until `cancel` fires. Returns the number of runs started.
    ///
    /// The first run starts immediately. Cancellation also aborts the run in
    /// progress.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = self.interval.as_millis() as u64, strategy = %self.strategy, "scheduler started");

        let mut runs = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let options = RunOptions::default().with_cancel(cancel.clone());
            let run = self.engine.run_sync(self.strategy, options).await;
            runs += 1;
            info!(run_id = %run.id, status = %run.status, "scheduled run finished");
        }

        info!(runs, "scheduler stopped");
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use invsync_core::RunStatus;
    use invsync_remote::MemorySource;
    use invsync_store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_runs_until_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(store, Arc::new(MemorySource::new()), EngineConfig::default()).unwrap();
        let scheduler = Scheduler::new(engine.clone())
            .with_interval(Duration::from_secs(60))
            .with_strategy(SyncStrategy::Full);

        let cancel = CancellationToken::new();
        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                // Ticks at 0s, 60s and 120s.
                tokio::time::sleep(Duration::from_secs(150)).await;
                cancel.cancel();
            })
        };

        assert_eq!(scheduler.run(cancel).await, 3);
        stopper.await.unwrap();

        let history = engine.history(10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|r| r.status == RunStatus::Succeeded));
    }
}
