//! Error types for the remote module.

use std::time::Duration;

use invsync_core::ErrorClass;
use thiserror::Error;

/// Errors surfaced by the remote client.
///
/// Every error maps to exactly one [`ErrorClass`], which decides how the
/// batch processor treats it.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Network failure, timeout, 408 or 5xx. Retryable.
    #[error("transport error: {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// 429 persisted past the configured number of waits.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// 401/403. Fatal: no retry, the run stops.
    #[error("authentication rejected (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    /// Unexpected content type or shape. Carries a bounded raw snippet.
    #[error("malformed response: {message}")]
    Malformed { message: String, snippet: String },

    /// The caller cancelled while waiting.
    #[error("cancelled")]
    Cancelled,
}

impl RemoteError {
    pub fn transport(message: impl Into<String>) -> Self {
        RemoteError::Transport {
            status: None,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>, snippet: impl Into<String>) -> Self {
        RemoteError::Malformed {
            message: message.into(),
            snippet: snippet.into(),
        }
    }

    /// The classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Transport { .. } => ErrorClass::Transport,
            RemoteError::RateLimited { .. } => ErrorClass::RateLimited,
            RemoteError::Auth { .. } => ErrorClass::Auth,
            RemoteError::Malformed { .. } => ErrorClass::Malformed,
            RemoteError::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Whether a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Transport { .. } | RemoteError::RateLimited { .. }
        )
    }

    /// Whether the run must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RemoteError::Auth { .. })
    }

    /// The message plus any captured raw text, for run logs.
    pub fn detail(&self) -> String {
        match self {
            RemoteError::Malformed { snippet, .. } if !snippet.is_empty() => {
                format!("{} (raw: {})", self, snippet)
            }
            _ => self.to_string(),
        }
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Result type for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let transport = RemoteError::transport("reset");
        assert_eq!(transport.class(), ErrorClass::Transport);
        assert!(transport.is_retryable());
        assert!(!transport.is_fatal());

        let auth = RemoteError::Auth {
            status: 401,
            message: "bad token".into(),
        };
        assert!(auth.is_fatal());
        assert!(!auth.is_retryable());

        let malformed = RemoteError::malformed("not json", "<html>");
        assert_eq!(malformed.class(), ErrorClass::Malformed);
        assert!(malformed.detail().contains("(raw: "));
        assert!(!malformed.is_retryable());

        let limited = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(RemoteError::Cancelled.class(), ErrorClass::Cancelled);
    }
}
