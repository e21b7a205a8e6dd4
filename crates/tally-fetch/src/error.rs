//! Error types for fetching remote usage.

use thiserror::Error;

/// Failure of one remote usage read. Never fatal; the caller keeps the
/// last displayed values and waits for the next tick.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network or TLS failure
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The page reported an explicit `__error`
    #[error("remote error: {0}")]
    Remote(String),

    /// Response body did not contain a usable reading
    #[error("unexpected usage payload: {0}")]
    Parse(String),

    /// Signed in, but the account has no organization to read usage for
    #[error("no organization found for this session")]
    MissingOrganization,

    /// No session cookie to authenticate with
    #[error("no session credential")]
    NotSignedIn,

    /// Credential backup file error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Credential backup JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FetchError {
    /// Whether this failure means the session is no longer authorized.
    pub fn is_auth_error(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status == 401 || *status == 403,
            FetchError::MissingOrganization => true,
            FetchError::Remote(message) => is_auth_message(message),
            FetchError::Transport(_)
            | FetchError::Parse(_)
            | FetchError::NotSignedIn
            | FetchError::Io(_)
            | FetchError::Json(_) => false,
        }
    }
}

/// Classify a failure message as an authorization problem.
///
/// Applied to `__error` messages only. Matches a missing organization and
/// HTTP 401/403 however the page phrased them.
pub fn is_auth_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("organization") || lower.contains("401") || lower.contains("403")
}

/// Result type for fetch operations.
pub type Result<T> = std::result::Result<T, FetchError>;
