//! State published to the UI.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tally_core::UsageReading;
use tally_cost::CostEstimate;
use tally_store::UsageLogEntry;

/// Whether a fetch is in flight while logged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchState {
    Idle,
    Fetching,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    SignedOut,
    AwaitingSession,
    LoggedIn(FetchState),
}

impl Phase {
    pub fn is_logged_in(&self) -> bool {
        matches!(self, Phase::LoggedIn(_))
    }
}

/// Everything the UI renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayState {
    pub phase: Phase,

    /// Latest successful reading
    pub reading: Option<UsageReading>,

    pub five_hour_history: Vec<UsageLogEntry>,
    pub seven_day_history: Vec<UsageLogEntry>,

    pub five_hour_cost: Option<CostEstimate>,
    pub seven_day_cost: Option<CostEstimate>,

    /// Last fetch failed authorization; auto-refresh is paused
    pub auth_degraded: bool,

    pub last_error: Option<String>,
    pub last_fetch_at: Option<DateTime<Utc>>,
}

impl Default for DisplayState {
    fn default() -> Self {
        Self {
            phase: Phase::SignedOut,
            reading: None,
            five_hour_history: Vec::new(),
            seven_day_history: Vec::new(),
            five_hour_cost: None,
            seven_day_cost: None,
            auth_degraded: false,
            last_error: None,
            last_fetch_at: None,
        }
    }
}

impl DisplayState {
    /// Drop every user-specific value, keeping only the phase.
    pub fn clear_values(&mut self) {
        *self = Self {
            phase: self.phase,
            ..Self::default()
        };
    }
}
