//! # tally-cost
//!
//! Token accounting from local event logs.
//!
//! This crate provides:
//! - [`parser`] - Extract per-request token usage from JSON Lines event logs
//! - [`TokenDatabase`] - SQLite storage keyed by request id
//! - [`Ingester`] - Incremental, mtime-gated directory sync
//! - [`pricing`] - Model tiers, per-record cost and window estimates
//!
//! ## Example
//!
//! ```no_run
//! use tally_cost::{Ingester, TokenDatabase};
//!
//! fn main() -> anyhow::Result<()> {
//!     let db = TokenDatabase::open("/tmp/tally/tokens.db")?;
//!     let ingester = Ingester::new(db);
//!     let report = ingester.sync(&tally_core::config::default_log_dirs())?;
//!     println!("{} records upserted", report.records_upserted);
//!
//!     let five_hour = ingester.window_cost(5, chrono::Utc::now())?;
//!     println!("last 5h: ${:.2}", five_hour.total_cost_usd);
//!     Ok(())
//! }
//! ```

pub mod db;
pub mod error;
pub mod ingest;
pub mod models;
pub mod parser;
pub mod pricing;

// Re-export main types
pub use db::TokenDatabase;
pub use error::{CostError, Result};
pub use ingest::Ingester;
pub use models::{CostEstimate, FileMarker, SyncReport, TokenRecord};
pub use pricing::{ModelPricing, ModelTier, cost, estimate, project_window_cost};
