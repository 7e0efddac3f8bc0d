//! Error types for Mnema

use thiserror::Error;

/// Result type alias for Mnema operations
pub type Result<T> = std::result::Result<T, MnemaError>;

/// Main error type for Mnema
#[derive(Error, Debug)]
pub enum MnemaError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Memory not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Version conflict on {id}: expected {expected}, found {found}")]
    Conflict {
        id: String,
        expected: i64,
        found: i64,
    },

    #[error("Provider unavailable: {message}")]
    Unavailable { message: String, retryable: bool },

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task aborted: {0}")]
    Aborted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MnemaError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, MnemaError::Unavailable { retryable: true, .. })
    }

    /// Stable error code consumed by external surfaces
    pub fn code(&self) -> &'static str {
        match self {
            MnemaError::NotFound(_) => "not_found",
            MnemaError::Forbidden(_) => "forbidden",
            MnemaError::InvalidInput(_) => "invalid",
            MnemaError::Conflict { .. } => "conflict",
            MnemaError::Unavailable { .. } => "unavailable",
            MnemaError::Embedding(_) => "unavailable",
            MnemaError::Aborted(_) => "aborted",
            _ => "internal",
        }
    }
}
