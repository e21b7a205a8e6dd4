//! Logging infrastructure for tally.
//!
//! Structured logging using the `tracing` ecosystem.
//!
//! ## Features
//!
//! - JSON lines format for machine parsing
//! - File output to `~/.tally/logs/tally.log` (rotated daily)
//! - Console output with configurable verbosity
//!
//! ## Example
//!
//! ```no_run
//! use tally_core::logging;
//!
//! let _guard = logging::init_logging(None, false).expect("logging init");
//!
//! tracing::info!("tally started");
//! tracing::debug!(window = "7d", percent = 42.0, "reading recorded");
//! ```

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{Result, TallyError};

/// Guard that must be held to ensure log flushing on shutdown.
///
/// Keep this guard alive for the lifetime of the application.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the tally logging system.
///
/// This sets up:
/// - File logging to `<log_dir>/tally.log` (JSON lines format)
/// - Console logging to stderr (human-readable format)
///
/// `log_dir` defaults to `~/.tally/logs/`; `verbose` raises the default
/// level from INFO to DEBUG. `RUST_LOG` overrides both.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    let log_dir = match log_dir {
        Some(dir) => dir,
        None => default_log_dir()?,
    };

    std::fs::create_dir_all(&log_dir).map_err(|e| TallyError::DirectoryCreation {
        path: log_dir.clone(),
        source: e,
    })?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "tally.log");
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tally={default_level}")));

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_span_list(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    tracing::debug!(log_dir = %log_dir.display(), verbose, "logging initialized");

    Ok(LogGuard {
        _file_guard: Some(file_guard),
    })
}

/// Initialize minimal console-only logging for testing.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Root of all tally state: `~/.tally/`.
pub fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(TallyError::HomeDirUnavailable)?;
    Ok(home.join(".tally"))
}

/// Get the default log directory path (`~/.tally/logs/`).
pub fn default_log_dir() -> Result<PathBuf> {
    Ok(default_data_dir()?.join("logs"))
}

/// Convenience macro for logging a rate-limit reading.
///
/// ```ignore
/// log_reading!(five_hour = Some(12.0), seven_day = Some(40.5));
/// ```
#[macro_export]
macro_rules! log_reading {
    ($($field:tt)*) => {
        tracing::info!(
            target: "tally::reading",
            $($field)*,
            "usage reading"
        )
    };
}

/// Convenience macro for logging cost events.
///
/// ```ignore
/// log_cost_event!(window_hours = 5, cost_usd = 1.25, records = 40);
/// ```
#[macro_export]
macro_rules! log_cost_event {
    ($($field:tt)*) => {
        tracing::info!(
            target: "tally::cost",
            $($field)*,
            "cost event"
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_default_log_dir() {
        // SAFETY: serialized with every other test that touches HOME
        unsafe { std::env::set_var("HOME", "/tmp/test-home") };
        let dir = default_log_dir().unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/test-home/.tally/logs"));
    }

    #[test]
    #[serial]
    fn test_default_data_dir() {
        // SAFETY: serialized with every other test that touches HOME
        unsafe { std::env::set_var("HOME", "/tmp/test-home") };
        assert_eq!(default_data_dir().unwrap(), PathBuf::from("/tmp/test-home/.tally"));
    }

    #[test]
    fn test_init_test_logging() {
        init_test_logging();
        init_test_logging();
    }
}
