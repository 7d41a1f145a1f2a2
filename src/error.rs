//! Store Error Types
//!
//! Structured errors for every tier of the engine.
//! Transport failures map onto a small taxonomy so that retry decisions are
//! made from the error kind, never from message text.

/// Errors surfaced by the asset store and its tiers
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Rate limited, try again after backoff")]
    RateLimited,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid asset: {0}")]
    InvalidAsset(String),

    #[error("Asset {0} is immutable and was stored with different content")]
    ImmutableViolation(String),

    #[error("Local cache I/O error: {0}")]
    CacheIo(String),

    #[error("Commit queue is full")]
    QueueFull,

    #[error("Asset store is shutting down")]
    ShuttingDown,

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
}

impl StoreError {
    /// Whether the commit queue may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Connectivity(_)
                | StoreError::Timeout
                | StoreError::RateLimited
                | StoreError::Server(_, _)
        )
    }

    /// Whether this error is a plain miss rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Create a StoreError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => StoreError::Forbidden(body.to_string()),
            404 => StoreError::NotFound(body.to_string()),
            408 => StoreError::Timeout,
            412 => StoreError::AlreadyExists(body.to_string()),
            429 => StoreError::RateLimited,
            500..=599 => StoreError::Server(status, body.to_string()),
            _ => StoreError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => StoreError::Timeout,
            _ => StoreError::CacheIo(e.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
