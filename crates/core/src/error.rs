//! Error taxonomy of the sync subsystem.

use thiserror::Error;

/// Result type used across the sync subsystem.
pub type SyncResult<T> = Result<T, SyncError>;

/// Caller-visible error.
///
/// Transient network failures are normally absorbed by the sync engine (the
/// write falls back to the local queue); the variants that reach callers are
/// the ones that need explicit handling, e.g. a user notification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network/timeout failure talking to the remote store. Retryable.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The remote store rejected the write (validation, auth). Not retried.
    #[error("remote store rejected the write: {0}")]
    PermanentRemote(String),

    /// The local durable store is exhausted; offline writes can no longer be
    /// guaranteed.
    #[error("local storage is full: {0}")]
    StorageFull(String),

    /// Local data could not be read back or parsed.
    #[error("local storage is corrupt: {0}")]
    StorageCorruption(String),

    /// A referenced mutation or record does not exist locally.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other local storage failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientNetwork(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::PermanentRemote(msg.into())
    }

    pub fn storage_full(msg: impl Into<String>) -> Self {
        Self::StorageFull(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::StorageCorruption(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}

/// Failure reported by the remote store client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network error, timeout or overloaded backend; eligible for retry.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Validation or authorization rejection; never retried automatically.
    #[error("permanent remote failure{}: {message}", status_suffix(.status))]
    Permanent {
        status: Option<u16>,
        message: String,
    },
}

impl RemoteError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::Permanent {
            status,
            message: msg.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an HTTP status returned by the backend.
    ///
    /// Timeouts, rate limiting and server errors are transient; every other
    /// non-success status is a permanent rejection. Returns `None` for success.
    pub fn from_status(status: u16, body: impl Into<String>) -> Option<Self> {
        match status {
            200..=299 => None,
            408 | 425 | 429 | 500..=599 => {
                Some(Self::Transient(format!("HTTP {status}: {}", body.into())))
            }
            _ => Some(Self::permanent(Some(status), body)),
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match &err {
            RemoteError::Transient(msg) => SyncError::TransientNetwork(msg.clone()),
            RemoteError::Permanent { .. } => SyncError::PermanentRemote(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(RemoteError::from_status(201, ""), None);
        assert!(RemoteError::from_status(503, "down").unwrap().is_transient());
        assert!(RemoteError::from_status(429, "slow down").unwrap().is_transient());
        assert!(RemoteError::from_status(408, "").unwrap().is_transient());

        let rejected = RemoteError::from_status(422, "total must be positive").unwrap();
        assert_eq!(
            rejected,
            RemoteError::permanent(Some(422), "total must be positive")
        );
        assert!(!rejected.is_transient());
    }

    #[test]
    fn permanent_display_includes_status() {
        let err = RemoteError::permanent(Some(401), "token expired");
        assert_eq!(err.to_string(), "permanent remote failure (401): token expired");
        let err = RemoteError::permanent(None, "bad payload");
        assert_eq!(err.to_string(), "permanent remote failure: bad payload");
    }

    #[test]
    fn only_transient_sync_errors_are_retryable() {
        assert!(SyncError::from(RemoteError::transient("reset")).is_retryable());
        assert!(!SyncError::from(RemoteError::permanent(Some(400), "no")).is_retryable());
        assert!(!SyncError::storage_full("disk").is_retryable());
    }
}
