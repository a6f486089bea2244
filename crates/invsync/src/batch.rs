//! Bounded, retrying batch execution.
//!
//! [`BatchProcessor::run`] splits work into batches of at most
//! [`MAX_BATCH_SIZE`](crate::config::MAX_BATCH_SIZE) items and executes them
//! through a bounded pool. Each batch is retried according to its error class:
//!
//! | Class | Policy |
//! |-------|--------|
//! | `Transport`, `Store` | retried up to `max_attempts` with backoff |
//! | `RateLimited` | waits the server hint, not counted as an attempt |
//! | `WriteConflict` | retried once |
//! | `Malformed` | not retried |
//! | `Auth` | fatal: no retry, no new batches |
//! | `Cancelled` | no retry, no new batches |
//!
//! A batch that exhausts its attempts is reported in
//! [`BatchOutcome::failed`] and the remaining batches still run.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use invsync_core::ErrorClass;

use crate::config::{duration_ms, MAX_BATCH_SIZE};
use crate::error::Classify;

/// Rate-limit waits absorbed per batch before it is failed as `RateLimited`.
const MAX_RATE_LIMIT_WAITS: u32 = 8;

/// Retry and backoff settings, shared by batches and listing page fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first.
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Relative jitter applied to each delay, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before the retry that follows `attempt` failed attempts.
    ///
    /// `base * 2^(attempt - 1)`, scaled by a random factor within
    /// `1 ± jitter`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let nominal = self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            nominal.mul_f64(factor.max(0.0))
        } else {
            nominal
        };
        jittered.min(self.max_delay)
    }

    /// Maximum attempts allowed for an error class, or `None` if the class
    /// never retries.
    fn attempts_for(&self, class: ErrorClass) -> Option<u32> {
        match class {
            ErrorClass::Transport | ErrorClass::Store => Some(self.max_attempts),
            ErrorClass::WriteConflict => Some(self.max_attempts.min(2)),
            ErrorClass::RateLimited => Some(u32::MAX),
            ErrorClass::Malformed | ErrorClass::Auth | ErrorClass::Cancelled => None,
        }
    }
}

/// An operation that failed after all the attempts its class allows.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub error: E,
    /// Counted attempts. Rate-limit waits are not counted.
    pub attempts: u32,
}

/// A batch that failed.
#[derive(Debug)]
pub struct FailedBatch<I> {
    pub items: Vec<I>,
    pub class: ErrorClass,
    pub attempts: u32,
    pub message: String,
}

/// Result of [`BatchProcessor::run`].
#[derive(Debug)]
pub struct BatchOutcome<I, T, E> {
    /// Results of successful batches, in completion order.
    pub completed: Vec<T>,
    /// Batches that exhausted their attempts.
    pub failed: Vec<FailedBatch<I>>,
    /// Items of batches that never started because the run stopped.
    pub not_started: Vec<I>,
    /// The error that stopped the run, if any (e.g. `Auth`).
    pub fatal: Option<E>,
    /// Whether cancellation stopped new batches.
    pub cancelled: bool,
}

impl<I, T, E> BatchOutcome<I, T, E> {
    /// Whether any batch failed or was skipped.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.not_started.is_empty() && self.fatal.is_none()
    }
}

enum BatchResult<I, T, E> {
    Done(T),
    Failed(FailedBatch<I>),
    Fatal(Vec<I>, E),
    NotStarted(Vec<I>),
}

/// Executes batches through a bounded pool with per-class retries.
#[derive(Debug, Clone)]
pub struct BatchProcessor {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl BatchProcessor {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds or its error class allows no further attempt.
    ///
    /// Cancellation is checked between attempts; an operation already in
    /// flight is never interrupted here.
    pub async fn with_retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, Exhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let mut attempts = 0u32;
        let mut rate_waits = 0u32;
        loop {
            attempts += 1;
            let error = match op().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let class = error.class();
            let delay = match (class, self.policy.attempts_for(class)) {
                (ErrorClass::RateLimited, _) => {
                    attempts -= 1;
                    rate_waits += 1;
                    if rate_waits > MAX_RATE_LIMIT_WAITS {
                        return Err(Exhausted { error, attempts: attempts.max(1) });
                    }
                    error
                        .retry_after()
                        .unwrap_or_else(|| self.policy.delay_for(rate_waits))
                }
                (_, Some(max)) if attempts < max => self.policy.delay_for(attempts),
                _ => return Err(Exhausted { error, attempts }),
            };

            if self.cancel.is_cancelled() {
                return Err(Exhausted { error, attempts: attempts.max(1) });
            }
            warn!(
                class = %class,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after error"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(Exhausted { error, attempts: attempts.max(1) });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Partition `items` into batches of at most `batch_size` and run `op` on
    /// each, with at most `max_concurrency` batches in flight.
    pub async fn run<I, T, E, F, Fut>(
        &self,
        items: Vec<I>,
        batch_size: usize,
        max_concurrency: usize,
        op: F,
    ) -> BatchOutcome<I, T, E>
    where
        I: Clone,
        F: Fn(Vec<I>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        let batches = chunk(items, batch_size);
        let halted = AtomicBool::new(false);

        let results: Vec<BatchResult<I, T, E>> = stream::iter(batches)
            .map(|batch| {
                let op = &op;
                let halted = &halted;
                async move {
                    if halted.load(Ordering::Acquire) || self.cancel.is_cancelled() {
                        return BatchResult::NotStarted(batch);
                    }
                    match self.with_retry(|| op(batch.clone())).await {
                        Ok(value) => BatchResult::Done(value),
                        Err(Exhausted { error, attempts }) => {
                            let class = error.class();
                            if matches!(class, ErrorClass::Auth | ErrorClass::Cancelled) {
                                halted.store(true, Ordering::Release);
                            }
                            if class == ErrorClass::Auth {
                                return BatchResult::Fatal(batch, error);
                            }
                            warn!(
                                class = %class,
                                attempts,
                                items = batch.len(),
                                error = %error,
                                "batch failed"
                            );
                            BatchResult::Failed(FailedBatch {
                                items: batch,
                                class,
                                attempts,
                                message: error.to_string(),
                            })
                        }
                    }
                }
            })
            .buffer_unordered(max_concurrency.max(1))
            .collect()
            .await;

        let mut outcome = BatchOutcome {
            completed: Vec::new(),
            failed: Vec::new(),
            not_started: Vec::new(),
            fatal: None,
            cancelled: self.cancel.is_cancelled(),
        };
        for result in results {
            match result {
                BatchResult::Done(value) => outcome.completed.push(value),
                BatchResult::Failed(failed) => outcome.failed.push(failed),
                BatchResult::NotStarted(items) => outcome.not_started.extend(items),
                BatchResult::Fatal(items, error) => {
                    outcome.not_started.extend(items);
                    if outcome.fatal.is_none() {
                        outcome.fatal = Some(error);
                    }
                }
            }
        }
        outcome
    }
}

fn chunk<I>(items: Vec<I>, size: usize) -> Vec<Vec<I>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
