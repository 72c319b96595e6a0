//! Error types used across the strata layered store.

use thiserror::Error;

/// Result type for strata operations.
pub type StrataResult<T> = Result<T, StrataError>;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("permission error: {0}")]
    Permission(String),

    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("filesystem driver error: {0}")]
    DriverFailure(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for StrataError {
    fn from(err: std::io::Error) -> Self {
        StrataError::Internal(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Internal(format!("JSON error: {}", err))
    }
}

impl From<String> for StrataError {
    fn from(err: String) -> Self {
        StrataError::Internal(err)
    }
}

impl From<&str> for StrataError {
    fn from(err: &str) -> Self {
        StrataError::Internal(err.to_string())
    }
}
