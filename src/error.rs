//! Error types for cache operations
//!
//! This module defines the error type shared by every cache component. Errors are
//! `Clone` so a single computation failure can be handed verbatim to every caller
//! waiting on the same key.

use std::sync::Arc;
use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Structurally invalid key input (e.g. a non-finite relationship weight)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Backend could not be reached
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend was reached but the operation failed
    #[error("Backend error: {0}")]
    BackendError(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The external computation failed
    #[error("Compute failed: {0}")]
    ComputeFailed(Arc<anyhow::Error>),

    /// A shared computation ended without publishing an outcome
    #[error("Coordination error: {0}")]
    Coordination(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

impl CacheError {
    /// Whether the error came from the storage layer (and can be degraded around)
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            CacheError::BackendUnavailable(_) | CacheError::BackendError(_)
        )
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
            CacheError::BackendUnavailable(e.to_string())
        } else {
            CacheError::BackendError(e.to_string())
        }
    }
}

#[cfg(feature = "sqlite-backend")]
impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                CacheError::BackendUnavailable(e.to_string())
            }
            other => CacheError::BackendError(other.to_string()),
        }
    }
}
