//! Error types shared across tally.
//!
//! [`TallyError`] covers the failures that can happen outside the stores:
//! configuration loading, filesystem setup and logging initialization.
//! Storage, ingestion and fetch failures have their own error types in the
//! crates that own them.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`TallyError`].
pub type Result<T> = std::result::Result<T, TallyError>;

/// Error type for configuration, filesystem and setup failures.
#[derive(Debug, Error)]
pub enum TallyError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file not found
    #[error("Configuration not found at {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration file is invalid YAML
    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory creation failed
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No home directory could be determined for default paths
    #[error("Home directory not available")]
    HomeDirUnavailable,
}

impl TallyError {
    /// Create an I/O error
    pub fn io(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. } | Self::ConfigInvalid { .. } | Self::ConfigValidation { .. }
        )
    }

    /// Returns true if tally cannot run without fixing this.
    ///
    /// A missing writable data directory is the only unrecoverable condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DirectoryCreation { .. } | Self::HomeDirUnavailable)
    }

    /// Returns actionable guidance for the user
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::ConfigNotFound { .. } => {
                Some("Create ~/.tally/config.yaml or run without --config to use defaults")
            }
            Self::ConfigInvalid { .. } => Some("Check YAML syntax in the configuration file"),
            Self::DirectoryCreation { .. } => {
                Some("Check that the data directory is writable or set data_dir in the config")
            }
            Self::HomeDirUnavailable => Some("Set HOME or configure data_dir explicitly"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_not_found_error() {
        let err = TallyError::ConfigNotFound {
            path: "/home/user/.tally/config.yaml".into(),
            source: None,
        };
        assert!(err.to_string().contains("Configuration not found"));
        assert!(err.is_config_error());
        assert!(!err.is_fatal());
        assert!(err.guidance().is_some());
    }

    #[test]
    fn test_directory_creation_is_fatal() {
        let err = TallyError::DirectoryCreation {
            path: "/readonly/.tally".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.is_fatal());
        assert!(!err.is_config_error());
        assert!(err.guidance().unwrap().contains("writable"));
    }

    #[test]
    fn test_validation_has_no_guidance() {
        let err = TallyError::validation("refresh_interval_secs must be > 0");
        assert!(err.is_config_error());
        assert!(!err.is_fatal());
        assert!(err.guidance().is_none());
    }
}
