//! Rolling-window rate limiter for outbound remote calls.
//!
//! At most `max_requests` admissions happen within any window of length
//! `per`. Waiters queue on a fair `tokio::sync::Mutex`, so they are admitted
//! in arrival order. Nothing is dropped silently: a caller either gets
//! admitted or observes its own cancellation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{RemoteError, Result};

/// Rate limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Admissions allowed per window.
    pub max_requests: usize,
    /// Window length.
    pub per: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 2,
            per: Duration::from_secs(1),
        }
    }
}

/// FIFO rolling-window rate limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Admission times inside the current window. The mutex is the queue:
    /// the holder is the next caller to be admitted.
    window: Mutex<VecDeque<Instant>>,
    /// Global pause set from server hints. Checked by the queue head.
    paused_until: StdMutex<Option<Instant>>,
    admitted: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter. A zero `max_requests` is treated as one.
    pub fn new(config: RateLimitConfig) -> Self {
        let config = RateLimitConfig {
            max_requests: config.max_requests.max(1),
            per: config.per,
        };
        Self {
            window: Mutex::new(VecDeque::with_capacity(config.max_requests)),
            config,
            paused_until: StdMutex::new(None),
            admitted: AtomicU64::new(0),
        }
    }

    /// The limiter's configuration.
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Wait until an admission is available.
    pub async fn acquire(&self) {
        let mut window = self.window.lock().await;
        loop {
            let now = Instant::now();

            if let Some(until) = self.pause_deadline(now) {
                sleep_until(until).await;
                continue;
            }

            while let Some(front) = window.front() {
                if now.duration_since(*front) >= self.config.per {
                    window.pop_front();
                } else {
                    break;
                }
            }

            if window.len() < self.config.max_requests {
                window.push_back(now);
                self.admitted.fetch_add(1, Ordering::Relaxed);
                return;
            }

            // Full window: wait for the oldest admission to expire.
            if let Some(front) = window.front() {
                let until = *front + self.config.per;
                debug!(
                    wait_ms = until.saturating_duration_since(now).as_millis() as u64,
                    "rate limiter full"
                );
                sleep_until(until).await;
            }
        }
    }

    /// Wait for an admission, or fail with `Cancelled` if the token fires first.
    pub async fn acquire_cancellable(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(RemoteError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RemoteError::Cancelled),
            _ = self.acquire() => Ok(()),
        }
    }

    /// Block all admissions for `duration` (e.g. a server `Retry-After`).
    ///
    /// Overlapping pauses extend to the latest deadline.
    pub fn pause_for(&self, duration: Duration) {
        let until = Instant::now() + duration;
        if let Ok(mut paused) = self.paused_until.lock() {
            *paused = Some(match *paused {
                Some(existing) if existing > until => existing,
                _ => until,
            });
        }
    }

    /// Total number of admissions so far.
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    fn pause_deadline(&self, now: Instant) -> Option<Instant> {
        let mut paused = self.paused_until.lock().ok()?;
        match *paused {
            Some(until) if until > now => Some(until),
            Some(_) => {
                *paused = None;
                None
            }
            None => None,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
