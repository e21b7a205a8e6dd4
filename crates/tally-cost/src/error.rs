//! Error types for ingestion and cost tracking.

use thiserror::Error;

/// Cost tracking errors.
#[derive(Error, Debug)]
pub enum CostError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (file reading)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON line that looked like a usage entry but could not be read
    #[error("invalid log line format: {0}")]
    InvalidLogFormat(String),

    /// Stored timestamp could not be parsed
    #[error("invalid timestamp: {0}")]
    TimeParse(#[from] chrono::ParseError),

    /// The connection mutex was poisoned by a panicking holder
    #[error("token database lock poisoned")]
    LockPoisoned,
}

/// Result type for cost tracking operations.
pub type Result<T> = std::result::Result<T, CostError>;
