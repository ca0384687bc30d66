//! Error types for blobcask
//!
//! This module defines the common error types used throughout the engine.

use thiserror::Error;

/// Common result type for blobcask operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for blobcask
#[derive(Debug, Error)]
pub enum Error {
    // Caller errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("handle not found: {0}")]
    HandleNotFound(String),

    #[error("content not found: {0}")]
    ContentNotFound(String),

    #[error("chunk not found: {0}")]
    ChunkNotFound(u64),

    #[error("content already removed: {0}")]
    AlreadyRemoved(String),

    // Chunk lifecycle errors
    #[error("chunk {0} already open")]
    AlreadyOpen(u64),

    #[error("chunk {0} not open")]
    NotOpen(u64),

    #[error("chunk {0} is closed")]
    Closed(u64),

    // Admission control
    #[error("chunk {0} I/O queue is full")]
    QueueFull(u64),

    // Capacity errors
    #[error("capacity exceeded: requested {requested} bytes, allocated {allocated} bytes")]
    CapacityExceeded { requested: u64, allocated: u64 },

    // Storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata: {0}")]
    Corrupt(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a corrupt metadata error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Create a repository error
    pub fn repository(msg: impl Into<String>) -> Self {
        Self::Repository(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::HandleNotFound(_) | Self::ContentNotFound(_) | Self::ChunkNotFound(_)
        )
    }

    /// Check if the caller may retry the operation as-is
    ///
    /// Only admission-control rejections qualify; I/O errors are not
    /// retried internally and should not be blindly retried by callers.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull(_))
    }
}
