//! Outbox error types.

use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// IO error from a storage backend
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client construction error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Storage backend refused the write
    #[error("Storage quota exceeded: {needed} bytes requested, {limit} bytes available")]
    QuotaExceeded { needed: usize, limit: usize },

    /// Storage key cannot be mapped onto the backend
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// Coordinator task is no longer running
    #[error("Coordinator for destination {0} has shut down")]
    CoordinatorClosed(String),

    /// Destination not registered with the manager
    #[error("Destination not found: {0}")]
    DestinationNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
