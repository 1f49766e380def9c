//! Error types for bounded stream operations
//!
//! Cancellation is kept distinct from application failures: a closed
//! semaphore or pool surfaces as [`StreamError::Cancelled`] /
//! [`PoolError::Closed`], never as a transform error.

use std::time::Duration;

/// Boxed error returned by pool factories and close callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for stream operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    /// The permit source was closed while the operation waited on it
    #[error("Operation cancelled")]
    Cancelled,
    /// A per-operation deadline elapsed first
    #[error("Operation timed out")]
    Timeout,
    /// A spawned transform task panicked
    #[error("Task panicked: {0}")]
    TaskPanicked(String),
    /// The object pool backing the operation failed
    #[error("Pool error: {0}")]
    Pool(String),
    /// Custom error with message
    #[error("Stream error: {0}")]
    Custom(String),
}

impl StreamError {
    /// Whether this error is a cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }
}

impl From<tokio::time::error::Elapsed> for StreamError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StreamError::Timeout
    }
}

impl From<PoolError> for StreamError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Closed => StreamError::Cancelled,
            other => StreamError::Pool(other.to_string()),
        }
    }
}

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Object pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Pool is closed")]
    Closed,
    #[error("Failed to create pooled object: {0}")]
    Factory(#[source] BoxError),
    #[error("{} pooled object(s) failed to close", .0.len())]
    CloseFailed(Vec<BoxError>),
}

impl PoolError {
    pub fn is_closed(&self) -> bool {
        matches!(self, PoolError::Closed)
    }
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Invalid configuration values
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("min_parallelism ({min}) exceeds max_parallelism ({max})")]
    ParallelismRange { min: usize, max: usize },
    #[error("a chunk policy needs a size bound, a time bound, or both")]
    UnboundedChunk,
    #[error("{field} must be a non-zero duration, got {value:?}")]
    ZeroDuration { field: &'static str, value: Duration },
}
