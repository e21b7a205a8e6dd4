//! # tally-store
//!
//! Persistence for rate-limit readings.
//!
//! This crate provides two deliberately independent SQLite stores:
//! - [`UsageStore`] - the time series written by the polling process, with
//!   reset instants normalized into hourly/weekly sessions
//! - [`SnapshotStore`] - a singleton current-state row plus an append-only
//!   history, shared with read-only consumer processes
//!
//! Both degrade on storage failure: writes become logged no-ops and reads
//! come back empty, so callers treat "no data yet" and "read failed" alike.
//!
//! ## Example
//!
//! ```no_run
//! use chrono::{Duration, Utc};
//! use tally_core::UsageReading;
//! use tally_store::UsageStore;
//!
//! let store = UsageStore::open("/tmp/usage.db").expect("open store");
//! let reading = UsageReading::new(Utc::now()).with_seven_day(42.0, None);
//! store.record(&reading);
//! let last_day = store.history(Duration::hours(24));
//! println!("{} readings in the last day", last_day.len());
//! ```

pub mod error;
mod helpers;
pub mod snapshot;
pub mod timeseries;

pub use error::{Result, StoreError};
pub use snapshot::{SnapshotHistoryPoint, SnapshotState, SnapshotStore, SnapshotView};
pub use timeseries::{SessionCounts, UsageLogEntry, UsageStore};
