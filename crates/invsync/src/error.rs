//! Error types for the engine.

use std::time::Duration;

use invsync_core::{ErrorClass, RunId};
use invsync_remote::RemoteError;
use invsync_store::StoreError;
use thiserror::Error;

/// Errors that can occur during engine operations.
///
/// Inside a run these are recovered per batch where possible; the
/// [`SyncEngine`](crate::SyncEngine) converts whatever remains into the
/// terminal status of the run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Remote source error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Snapshot cache error. Never fails a batch.
    #[error("cache error: {0}")]
    Cache(String),

    /// The run was cancelled or its deadline passed.
    #[error("cancelled")]
    Cancelled,

    /// Another process reclaimed the run's lock.
    #[error("lock lost by run {0}")]
    LockLost(RunId),

    /// Run not found in the sync log.
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// Re-drive requested for a run without failed keys.
    #[error("run {0} has no failed keys to re-drive")]
    NothingToRedrive(RunId),
}

impl EngineError {
    /// Whether this error must stop the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Remote(e) if e.is_fatal())
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Maps an error onto the retry taxonomy used by the batch processor.
pub trait Classify {
    fn class(&self) -> ErrorClass;

    /// Server wait hint for rate-limited errors.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Classify for RemoteError {
    fn class(&self) -> ErrorClass {
        RemoteError::class(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        RemoteError::retry_after(self)
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        if self.is_conflict() {
            ErrorClass::WriteConflict
        } else {
            ErrorClass::Store
        }
    }
}

impl Classify for EngineError {
    fn class(&self) -> ErrorClass {
        match self {
            EngineError::Store(e) => e.class(),
            EngineError::Remote(e) => e.class(),
            EngineError::Cancelled | EngineError::LockLost(_) => ErrorClass::Cancelled,
            EngineError::Config(_)
            | EngineError::Cache(_)
            | EngineError::RunNotFound(_)
            | EngineError::NothingToRedrive(_) => ErrorClass::Store,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::Remote(e) => e.retry_after(),
            _ => None,
        }
    }
}
