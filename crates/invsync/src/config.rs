//! Engine configuration.
//!
//! Loaded from TOML. Every section has defaults, so an empty file is a valid
//! configuration. Durations are written in milliseconds.
//!
//! ```toml
//! full_via_report = true
//!
//! [rate_limit]
//! max_requests = 2
//! per = 1000
//!
//! [batch]
//! batch_size = 100
//! max_concurrency = 4
//!
//! [batch.retry]
//! max_attempts = 3
//! base_delay = 200
//!
//! [guard.contention]
//! mode = "wait"
//! poll_interval = 1000
//! max_wait = 60000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use invsync_core::{SmartThresholds, SyncStrategy, DEFAULT_PROJECTION_VERSION};
use invsync_remote::{ClientConfig, HttpConfig, KeyFields, RateLimitConfig};

use crate::batch::RetryPolicy;
use crate::error::ConfigError;

/// Upper bound on batch size, independent of configuration.
pub const MAX_BATCH_SIZE: usize = 500;

/// Serde helper: `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rate_limit: RateLimitSection,
    pub client: ClientSection,
    pub http: HttpConfig,
    pub batch: BatchConfig,
    pub guard: GuardConfig,
    pub smart: SmartSection,
    pub schedule: ScheduleConfig,
    /// Run full syncs through the bulk report export instead of paging.
    pub full_via_report: bool,
    /// Material field projection version. Bumping it rewrites every entity once.
    pub projection_version: ProjectionVersion,
}

/// Newtype so the default is the current projection version rather than zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectionVersion(pub u16);

impl Default for ProjectionVersion {
    fn default() -> Self {
        Self(DEFAULT_PROJECTION_VERSION)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub max_requests: usize,
    #[serde(with = "duration_ms")]
    pub per: Duration,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        let defaults = RateLimitConfig::default();
        Self {
            max_requests: defaults.max_requests,
            per: defaults.per,
        }
    }
}

impl RateLimitSection {
    pub fn to_limiter_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.max_requests,
            per: self.per,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub page_size: usize,
    pub max_rate_limit_waits: u32,
    #[serde(with = "duration_ms")]
    pub rate_limit_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_rate_limit_backoff: Duration,
    pub item_key_field: String,
    pub vendor_key_field: String,
}

impl Default for ClientSection {
    fn default() -> Self {
        let defaults = ClientConfig::default();
        Self {
            page_size: defaults.page_size,
            max_rate_limit_waits: defaults.max_rate_limit_waits,
            rate_limit_backoff: defaults.rate_limit_backoff,
            max_rate_limit_backoff: defaults.max_rate_limit_backoff,
            item_key_field: defaults.key_fields.item,
            vendor_key_field: defaults.key_fields.vendor,
        }
    }
}

impl ClientSection {
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            page_size: self.page_size,
            max_rate_limit_waits: self.max_rate_limit_waits,
            rate_limit_backoff: self.rate_limit_backoff,
            max_rate_limit_backoff: self.max_rate_limit_backoff,
            key_fields: KeyFields {
                item: self.item_key_field.clone(),
                vendor: self.vendor_key_field.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Items per batch, at most [`MAX_BATCH_SIZE`].
    pub batch_size: usize,
    /// Batches in flight at once.
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// What a run does when another run holds the lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ContentionMode {
    /// Decline to start; the run is reported as `Skipped`.
    #[default]
    Skip,
    /// Poll until the lock frees up, for at most `max_wait`.
    Wait {
        #[serde(with = "duration_ms")]
        poll_interval: Duration,
        #[serde(with = "duration_ms")]
        max_wait: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// A lock whose heartbeat is older than this may be reclaimed.
    #[serde(with = "duration_ms")]
    pub stale_after: Duration,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    pub contention: ContentionMode,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(10 * 60),
            heartbeat_interval: Duration::from_secs(30),
            contention: ContentionMode::Skip,
        }
    }
}

impl GuardConfig {
    pub fn stale_after_ms(&self) -> i64 {
        i64::try_from(self.stale_after.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Staleness budgets for the smart strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartSection {
    #[serde(with = "duration_ms")]
    pub critical_only: Duration,
    #[serde(with = "duration_ms")]
    pub inventory_only: Duration,
    #[serde(with = "duration_ms")]
    pub incremental: Duration,
    #[serde(with = "duration_ms")]
    pub full: Duration,
}

impl Default for SmartSection {
    fn default() -> Self {
        let t = SmartThresholds::default();
        Self {
            critical_only: t.critical_only,
            inventory_only: t.inventory_only,
            incremental: t.incremental,
            full: t.full,
        }
    }
}

impl SmartSection {
    pub fn thresholds(&self) -> SmartThresholds {
        SmartThresholds {
            critical_only: self.critical_only,
            inventory_only: self.inventory_only,
            incremental: self.incremental,
            full: self.full,
        }
    }
}

/// Periodic trigger settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    pub strategy: SyncStrategy,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            strategy: SyncStrategy::Smart,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.into()))
        }

        if self.rate_limit.max_requests == 0 {
            return invalid("rate_limit.max_requests must be at least 1");
        }
        if self.rate_limit.per.is_zero() {
            return invalid("rate_limit.per must be positive");
        }
        if self.client.page_size == 0 {
            return invalid("client.page_size must be at least 1");
        }
        if self.client.item_key_field.trim().is_empty() || self.client.vendor_key_field.trim().is_empty() {
            return invalid("client key fields must not be empty");
        }
        if self.batch.batch_size == 0 || self.batch.batch_size > MAX_BATCH_SIZE {
            return invalid(format!("batch.batch_size must be in 1..={}", MAX_BATCH_SIZE));
        }
        if self.batch.max_concurrency == 0 {
            return invalid("batch.max_concurrency must be at least 1");
        }
        if self.batch.retry.max_attempts == 0 {
            return invalid("batch.retry.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.batch.retry.jitter) {
            return invalid("batch.retry.jitter must be within 0.0..=1.0");
        }
        if self.guard.heartbeat_interval.is_zero() {
            return invalid("guard.heartbeat_interval must be positive");
        }
        if self.guard.heartbeat_interval >= self.guard.stale_after {
            return invalid("guard.heartbeat_interval must be shorter than guard.stale_after");
        }
        if let ContentionMode::Wait { poll_interval, .. } = self.guard.contention {
            if poll_interval.is_zero() {
                return invalid("guard.contention.poll_interval must be positive");
            }
        }
        if self.projection_version.0 == 0 {
            return invalid("projection_version must be at least 1");
        }
        if self.schedule.interval.is_zero() {
            return invalid("schedule.interval must be positive");
        }
        Ok(())
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch.batch_size = batch_size;
        self
    }

    /// Set the number of concurrent batches.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.batch.max_concurrency = max_concurrency;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.batch.retry = retry;
        self
    }

    /// Set the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.client.page_size = page_size;
        self
    }

    /// Set the remote rate limit.
    pub fn with_rate_limit(mut self, max_requests: usize, per: Duration) -> Self {
        self.rate_limit = RateLimitSection { max_requests, per };
        self
    }

    /// Set the lock staleness threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.guard.stale_after = stale_after;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.guard.heartbeat_interval = interval;
        self
    }

    /// Set the contention mode.
    pub fn with_contention(mut self, contention: ContentionMode) -> Self {
        self.guard.contention = contention;
        self
    }

    /// Set the smart strategy budgets.
    pub fn with_smart(mut self, thresholds: SmartThresholds) -> Self {
        self.smart = SmartSection {
            critical_only: thresholds.critical_only,
            inventory_only: thresholds.inventory_only,
            incremental: thresholds.incremental,
            full: thresholds.full,
        };
        self
    }

    /// Route full syncs through the bulk report export.
    pub fn with_full_via_report(mut self, enabled: bool) -> Self {
        self.full_via_report = enabled;
        self
    }

    /// Set the material projection version.
    pub fn with_projection_version(mut self, version: u16) -> Self {
        self.projection_version = ProjectionVersion(version);
        self
    }
}
