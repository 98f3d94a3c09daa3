//! Cache error types

use redis::RedisError;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The key contains one of the reserved characters `{}()/\@:`.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    /// A raw store could not be reached or initialized.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Pool composition or pool spec misuse.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CacheError>;
