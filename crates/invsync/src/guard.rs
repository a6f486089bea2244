//! The concurrency guard: at most one run at a time, across processes.
//!
//! The lock lives in the store as a singleton row and is taken with a single
//! atomic check-and-set. A holder keeps it alive with heartbeats; a lock
//! whose heartbeat is older than `stale_after` may be reclaimed by the next
//! run, which also marks the abandoned run `Stuck`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use invsync_core::{LockAcquisition, RunId};
use invsync_store::Store;

use crate::clock::Clock;
use crate::config::{ContentionMode, GuardConfig};
use crate::error::{EngineError, Result};

/// Guards the singleton sync lock.
#[derive(Clone)]
pub struct ConcurrencyGuard {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: GuardConfig,
}

impl ConcurrencyGuard {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: GuardConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// One atomic acquisition attempt.
    pub async fn try_acquire(&self, run_id: RunId) -> Result<LockAcquisition> {
        let now = self.clock.now_millis();
        let acquisition = self
            .store
            .try_acquire_lock(run_id, now, self.config.stale_after_ms())
            .await?;
        match &acquisition {
            LockAcquisition::Acquired => debug!(run_id = %run_id, "lock acquired"),
            LockAcquisition::Reclaimed { previous } => warn!(
                run_id = %run_id,
                previous = %previous.holder,
                "reclaimed stale lock; previous run marked stuck"
            ),
            LockAcquisition::Contended { holder } => {
                debug!(run_id = %run_id, holder = %holder.holder, "lock contended")
            }
        }
        Ok(acquisition)
    }

    /// Acquire according to the configured contention mode.
    ///
    /// In `Skip` mode this is a single attempt. In `Wait` mode contention is
    /// retried every `poll_interval` until `max_wait` has elapsed; the last
    /// `Contended` result is returned if the lock never frees up.
    pub async fn acquire(&self, run_id: RunId, cancel: &CancellationToken) -> Result<LockAcquisition> {
        let (poll_interval, max_wait) = match self.config.contention {
            ContentionMode::Skip => return self.try_acquire(run_id).await,
            ContentionMode::Wait {
                poll_interval,
                max_wait,
            } => (poll_interval, max_wait),
        };

        let deadline = Instant::now() + max_wait;
        loop {
            let acquisition = self.try_acquire(run_id).await?;
            if acquisition.is_held() || Instant::now() + poll_interval > deadline {
                return Ok(acquisition);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Extend the lock. `false` means another run has reclaimed it.
    pub async fn heartbeat(&self, run_id: RunId) -> Result<bool> {
        Ok(self.store.heartbeat_lock(run_id, self.clock.now_millis()).await?)
    }

    /// Release the lock if `run_id` holds it.
    pub async fn release(&self, run_id: RunId) -> Result<bool> {
        let released = self.store.release_lock(run_id).await?;
        if !released {
            warn!(run_id = %run_id, "lock was not held at release");
        }
        Ok(released)
    }

    /// Renew the lock every `heartbeat_interval` until stopped.
    ///
    /// If the lock is lost, `on_lost` is cancelled so the run winds down.
    pub fn spawn_heartbeat(&self, run_id: RunId, on_lost: CancellationToken) -> Heartbeat {
        let guard = self.clone();
        let stop = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));
        let interval = self.config.heartbeat_interval;

        let task = {
            let stop = stop.clone();
            let lost = lost.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    match guard.heartbeat(run_id).await {
                        Ok(true) => debug!(run_id = %run_id, "heartbeat"),
                        Ok(false) => {
                            warn!(run_id = %run_id, "lock lost; cancelling run");
                            lost.store(true, Ordering::Release);
                            on_lost.cancel();
                            break;
                        }
                        // A missed heartbeat is not fatal; the lock only goes
                        // stale after several.
                        Err(e) => warn!(run_id = %run_id, error = %e, "heartbeat failed"),
                    }
                }
            })
        };

        Heartbeat { stop, lost, task }
    }
}

/// Handle to a running heartbeat task.
pub struct Heartbeat {
    stop: CancellationToken,
    lost: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Whether the lock was observed lost.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Stop the task and wait for it. Returns whether the lock was lost.
    pub async fn stop(self) -> bool {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "heartbeat task failed");
        }
        let lost = self.lost.load(Ordering::Acquire);
        if lost {
            info!("run ended after losing its lock");
        }
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use invsync_core::{RunStatus, SyncRun};
    use invsync_store::MemoryStore;
    use std::sync::atomic::AtomicI64;
    use std::time::Duration;

    struct FixedClock(AtomicI64);

    impl Clock for FixedClock {
        fn now_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn guard_with(store: Arc<MemoryStore>, clock: Arc<dyn Clock>, config: GuardConfig) -> ConcurrencyGuard {
        ConcurrencyGuard::new(store, clock, config)
    }

    #[tokio::test]
    async fn test_skip_mode_is_single_attempt() {
        let store = Arc::new(MemoryStore::new());
        let guard = guard_with(store, Arc::new(SystemClock), GuardConfig::default());
        let cancel = CancellationToken::new();

        let a = RunId::generate();
        let b = RunId::generate();
        assert!(guard.acquire(a, &cancel).await.unwrap().is_held());
        match guard.acquire(b, &cancel).await.unwrap() {
            LockAcquisition::Contended { holder } => assert_eq!(holder.holder, a),
            other => panic!("unexpected {:?}", other),
        }

        assert!(!guard.release(b).await.unwrap());
        assert!(guard.release(a).await.unwrap());
        assert!(guard.acquire(b, &cancel).await.unwrap().is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_mode_acquires_after_release() {
        let store = Arc::new(MemoryStore::new());
        let config = GuardConfig {
            contention: ContentionMode::Wait {
                poll_interval: Duration::from_millis(100),
                max_wait: Duration::from_secs(5),
            },
            ..GuardConfig::default()
        };
        let guard = guard_with(store, Arc::new(SystemClock), config);
        let a = RunId::generate();
        let b = RunId::generate();
        assert!(guard.try_acquire(a).await.unwrap().is_held());

        let releaser = {
            let guard = guard.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(350)).await;
                guard.release(a).await.unwrap();
            })
        };

        let acquired = guard.acquire(b, &CancellationToken::new()).await.unwrap();
        assert_eq!(acquired, LockAcquisition::Acquired);
        releaser.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_mode_gives_up() {
        let store = Arc::new(MemoryStore::new());
        let config = GuardConfig {
            contention: ContentionMode::Wait {
                poll_interval: Duration::from_millis(100),
                max_wait: Duration::from_millis(500),
            },
            ..GuardConfig::default()
        };
        let guard = guard_with(store, Arc::new(SystemClock), config);
        let a = RunId::generate();
        guard.try_acquire(a).await.unwrap();

        let start = Instant::now();
        let result = guard.acquire(RunId::generate(), &CancellationToken::new()).await.unwrap();
        assert!(matches!(result, LockAcquisition::Contended { holder } if holder.holder == a));
        assert!(start.elapsed() <= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock(AtomicI64::new(1_000)));
        let guard = guard_with(
            store.clone(),
            clock.clone(),
            GuardConfig::default(),
        );

        let abandoned = RunId::generate();
        let mut run = SyncRun::new(abandoned, None, false, 1_000);
        run.status = RunStatus::Running;
        store.insert_run(&run).await.unwrap();
        guard.try_acquire(abandoned).await.unwrap();

        clock.0.store(1_000 + guard.config().stale_after_ms() + 1, Ordering::SeqCst);
        let next = RunId::generate();
        match guard.try_acquire(next).await.unwrap() {
            LockAcquisition::Reclaimed { previous } => assert_eq!(previous.holder, abandoned),
            other => panic!("unexpected {:?}", other),
        }
        let stuck = store.get_run(abandoned).await.unwrap().unwrap();
        assert_eq!(stuck.status, RunStatus::Stuck);

        // The abandoned run can no longer heartbeat or release.
        assert!(!guard.heartbeat(abandoned).await.unwrap());
        assert!(!guard.release(abandoned).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_detects_lost_lock() {
        let store = Arc::new(MemoryStore::new());
        let config = GuardConfig {
            heartbeat_interval: Duration::from_millis(100),
            ..GuardConfig::default()
        };
        let guard = guard_with(store.clone(), Arc::new(SystemClock), config);
        let run_id = RunId::generate();
        guard.try_acquire(run_id).await.unwrap();

        let on_lost = CancellationToken::new();
        let heartbeat = guard.spawn_heartbeat(run_id, on_lost.clone());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!heartbeat.is_lost());

        store.release_lock(run_id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), on_lost.cancelled())
            .await
            .unwrap();
        assert!(heartbeat.stop().await);
    }
}
