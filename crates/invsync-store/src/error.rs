//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Field or run serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A write violated a store constraint.
    #[error("write conflict on {kind}/{key}: {reason}")]
    Conflict {
        kind: String,
        key: String,
        reason: String,
    },

    /// Attempted to update a run that already reached a terminal status.
    #[error("run {0} is already finalized")]
    RunFinalized(String),

    /// Run not found.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),
}

impl StoreError {
    /// Whether this error is a write conflict that an idempotent retry may clear.
    pub fn is_conflict(&self) -> bool {
        match self {
            StoreError::Conflict { .. } => true,
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::ConstraintViolation
                    | rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub(crate) fn poisoned(detail: impl std::fmt::Display) -> Self {
        StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_INTERNAL),
            Some(format!("mutex poisoned: {}", detail)),
        ))
    }

    pub(crate) fn join(detail: impl std::fmt::Display) -> Self {
        StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("spawn_blocking failed: {}", detail)),
        ))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        let conflict = StoreError::Conflict {
            kind: "item".into(),
            key: "A1".into(),
            reason: "unique".into(),
        };
        assert!(conflict.is_conflict());

        let constraint = StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        ));
        assert!(constraint.is_conflict());

        assert!(!StoreError::InvalidData("x".into()).is_conflict());
        assert!(!StoreError::poisoned("boom").is_conflict());
    }
}
