//! Error types for ferry-core.

use thiserror::Error;

/// Main error type for ferry operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Path does not exist on the filesystem.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// Operation rejected by the filesystem's permission checks.
    #[error("permission denied: {path}")]
    PermissionDenied { path: String },

    /// Destination filesystem is out of space or over quota.
    #[error("quota exceeded: {path}")]
    QuotaExceeded { path: String },

    /// Destination filesystem is mounted read-only.
    #[error("read-only filesystem: {path}")]
    ReadOnlyFilesystem { path: String },

    /// Destination parent directory does not exist and cannot be created.
    #[error("path unavailable: {path}: {message}")]
    PathUnavailable { path: String, message: String },

    /// Transient failure; retrying may succeed.
    #[error("transient error: {message}")]
    Transient { message: String },

    /// A single I/O call exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The channel to the remote host was lost mid-operation.
    #[error("channel closed")]
    ChannelClosed,

    /// The filesystem capability does not support the requested operation.
    #[error("unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// Operator-initiated cancellation; not a failure.
    #[error("cancelled")]
    Cancelled,

    /// Persisted resume state could not be read or did not verify.
    #[error("corrupt resume state: {message}")]
    CorruptState { message: String },

    /// Undo was already performed for this batch.
    #[error("batch already undone")]
    AlreadyUndone,

    /// Invalid task or batch state transition.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

impl Error {
    /// Returns true if this error is transient and a bounded retry with
    /// backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transient { .. } | Error::Timeout | Error::Io(_)
        )
    }

    /// Returns true if this error indicates the remote channel was lost.
    ///
    /// Channel loss parks an in-progress task in `Paused` with its resume
    /// offset checkpointed instead of failing it; the transfer continues
    /// once the operator resumes it over a fresh channel.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Error::ChannelClosed)
    }

    /// Returns true if this error is fatal for the task and retrying
    /// cannot help.
    ///
    /// Fatal errors fail the task immediately and are reported per-task;
    /// sibling tasks in the batch keep running.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::PermissionDenied { .. }
                | Error::QuotaExceeded { .. }
                | Error::ReadOnlyFilesystem { .. }
                | Error::PathUnavailable { .. }
                | Error::Unsupported { .. }
        )
    }
}

/// Convenience result type for ferry operations.
pub type Result<T> = std::result::Result<T, Error>;
