//! # tally-core
//!
//! Core types, errors, and utilities shared by the tally crates.
//!
//! This crate provides:
//! - [`TallyError`] - Error type for configuration, filesystem and logging setup
//! - [`logging`] - Tracing setup and log management utilities
//! - [`types`] - Usage readings and the session normalization rule
//! - [`config`] - The process-wide [`TallyConfig`]
//!
//! ## Example
//!
//! ```no_run
//! use tally_core::{TallyConfig, logging};
//!
//! fn main() -> tally_core::Result<()> {
//!     let _guard = logging::init_logging(None, false)?;
//!     let config = TallyConfig::load_or_default(None)?;
//!     tracing::info!(data_dir = %config.data_dir.display(), "tally configured");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Re-export main types for convenience
pub use config::{AlertConfig, DailyMode, TallyConfig};
pub use error::{Result, TallyError};
pub use logging::{LogGuard, init_logging};
pub use types::{SessionKey, UsageReading, UsageWindow, normalize_reset_epoch};
