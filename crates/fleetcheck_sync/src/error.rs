//! Error types for the sync layer.

use fleetcheck_codec::CodecError;
use fleetcheck_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("remote store unreachable")]
    NotConnected,

    /// The bearer credential was rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Remote path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Remote path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Another pass holds the sync guard.
    #[error("a sync pass is already in progress")]
    AlreadyInProgress,

    /// The secret authority failed or returned an unusable secret.
    #[error("secret authority error: {0}")]
    Authority(String),

    /// Malformed remote response or queued payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Payload codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Local storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::NotConnected => true,
            _ => false,
        }
    }

    /// Returns true for a rejected credential.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SyncError::Unauthorized(_))
    }

    /// Returns true if the remote path does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }

    /// Returns true if the remote store could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            SyncError::Transport { .. } | SyncError::Timeout | SyncError::NotConnected
        )
    }
}
