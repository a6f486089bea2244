//! Error types for invsync core.

use thiserror::Error;

/// Core errors that can occur while building or interpreting records.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid natural key: {0}")]
    InvalidKey(String),

    #[error("unknown record kind: {0}")]
    UnknownKind(String),

    #[error("unknown run status: {0}")]
    UnknownStatus(String),

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("invalid run id: {0}")]
    InvalidRunId(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
