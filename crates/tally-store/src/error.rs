//! Error types for the stores.

use thiserror::Error;

/// Store errors.
///
/// These never reach the orchestrator: the public store operations log
/// them and degrade to a no-op write or an empty read.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored timestamp could not be parsed
    #[error("time parse error: {0}")]
    TimeParse(#[from] chrono::ParseError),

    /// Connection mutex was poisoned by a panicking writer
    #[error("database lock poisoned")]
    LockPoisoned,

    /// Parent directory for the database file could not be created
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
