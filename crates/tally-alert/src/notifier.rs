//! Alert kinds and delivery.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// The three independent alert state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    /// Seven day window nearly exhausted
    Weekly,
    /// Five hour window nearly exhausted
    Hourly,
    /// Usage within the current day crossed the daily threshold
    Daily,
}

impl AlertKind {
    /// Fixed delivery identifier; a new alert with the same id replaces
    /// a pending one instead of stacking.
    pub fn id(&self) -> &'static str {
        match self {
            AlertKind::Weekly => "tally.alert.weekly",
            AlertKind::Hourly => "tally.alert.hourly",
            AlertKind::Daily => "tally.alert.daily",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            AlertKind::Weekly => "Weekly limit running low",
            AlertKind::Hourly => "Five hour limit running low",
            AlertKind::Daily => "High usage today",
        }
    }
}

/// A fired alert.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

impl Alert {
    pub fn id(&self) -> &'static str {
        self.kind.id()
    }
}

/// Delivers alerts. Implementations must not block the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: &Alert);
}

/// Writes alerts to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, alert: &Alert) {
        warn!(
            target: "tally::alert",
            id = alert.id(),
            title = alert.kind.title(),
            message = %alert.message,
            "usage alert"
        );
    }
}
