//! # tally-alert
//!
//! Threshold alerts over rate-limit readings.
//!
//! - [`AlertEngine`] - Weekly, five hour and daily alert state machines
//! - [`Notifier`] - Delivery seam; [`LogNotifier`] writes to the tracing log

pub mod engine;
pub mod notifier;

pub use engine::{AlertEngine, DailyUsage};
pub use notifier::{Alert, AlertKind, LogNotifier, Notifier};
