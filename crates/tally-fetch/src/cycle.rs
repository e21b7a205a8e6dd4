//! The persistence half of a fetch cycle.
//!
//! Runs on a blocking thread once a reading has arrived. Steps are strictly
//! ordered: time series write, history reload, event log sync and cost
//! estimate, snapshot write, alerts.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_alert::{AlertEngine, AlertKind};
use tally_core::{UsageReading, UsageWindow};
use tally_cost::{CostEstimate, Ingester, project_window_cost};
use tally_store::{SnapshotStore, UsageLogEntry, UsageStore};
use tracing::{debug, warn};

const FIVE_HOUR_WINDOW_HOURS: i64 = 5;
const SEVEN_DAY_WINDOW_HOURS: i64 = 7 * 24;

/// Storage handles a cycle writes through.
#[derive(Clone)]
pub struct Persistence {
    pub usage: UsageStore,
    pub snapshot: SnapshotStore,
    pub ingester: Ingester,
    pub alerts: Arc<AlertEngine>,

    /// Event log directories scanned for token usage
    pub log_dirs: Vec<PathBuf>,
}

/// Values a finished cycle hands back to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub reading: UsageReading,
    pub five_hour_history: Vec<UsageLogEntry>,
    pub seven_day_history: Vec<UsageLogEntry>,
    pub five_hour_cost: Option<CostEstimate>,
    pub seven_day_cost: Option<CostEstimate>,
    pub alerts: Vec<AlertKind>,
}

/// Values loaded at startup before any fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Seed {
    pub reading: Option<UsageReading>,
    pub five_hour_history: Vec<UsageLogEntry>,
    pub seven_day_history: Vec<UsageLogEntry>,
}

impl Persistence {
    /// Persist a fresh reading and recompute everything derived from it.
    pub fn apply(&self, reading: UsageReading, now: DateTime<Utc>) -> CycleOutcome {
        self.usage.record(&reading);

        let (five_hour_history, seven_day_history) = self.histories(now);

        if let Err(e) = self.ingester.sync(&self.log_dirs) {
            warn!(error = %e, "Event log sync failed; estimating from stored records");
        }
        let five_hour_cost = self.estimate(FIVE_HOUR_WINDOW_HOURS, now);
        let seven_day_cost = self.estimate(SEVEN_DAY_WINDOW_HOURS, now);

        self.snapshot.apply_fetch(&reading, true);
        let predicted = |cost: &Option<CostEstimate>, window| {
            let cost = cost.as_ref()?;
            project_window_cost(cost.total_cost_usd, reading.percent(window)?)
        };
        self.snapshot.apply_predicted_cost(
            predicted(&five_hour_cost, UsageWindow::FiveHour),
            predicted(&seven_day_cost, UsageWindow::SevenDay),
        );

        let alerts = self.alerts.evaluate(&reading, &self.usage, now);
        debug!(alerts = alerts.len(), "Fetch cycle persisted");

        CycleOutcome {
            reading,
            five_hour_history,
            seven_day_history,
            five_hour_cost,
            seven_day_cost,
            alerts,
        }
    }

    /// Startup housekeeping plus the values to show before the first fetch.
    pub fn seed(&self, now: DateTime<Utc>, retention: chrono::Duration) -> Seed {
        self.snapshot.prune_history(now - retention);
        let (five_hour_history, seven_day_history) = self.histories(now);
        Seed {
            reading: self.usage.latest().map(|entry| entry.reading),
            five_hour_history,
            seven_day_history,
        }
    }

    /// Clear the snapshot for a signed-out consumer view.
    pub fn sign_out(&self) {
        self.snapshot.clear_for_sign_out();
        self.alerts.reset();
    }

    fn histories(&self, now: DateTime<Utc>) -> (Vec<UsageLogEntry>, Vec<UsageLogEntry>) {
        (
            self.usage
                .history_since(now - UsageWindow::FiveHour.duration()),
            self.usage
                .history_since(now - UsageWindow::SevenDay.duration()),
        )
    }

    fn estimate(&self, window_hours: i64, now: DateTime<Utc>) -> Option<CostEstimate> {
        match self.ingester.window_cost(window_hours, now) {
            Ok(estimate) => Some(estimate),
            Err(e) => {
                warn!(window_hours, error = %e, "Cost estimate failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::AlertConfig;
    use tally_cost::{TokenDatabase, TokenRecord};

    fn persistence() -> Persistence {
        Persistence {
            usage: UsageStore::open_in_memory().unwrap(),
            snapshot: SnapshotStore::open_in_memory().unwrap(),
            ingester: Ingester::new(TokenDatabase::open_in_memory().unwrap()),
            alerts: Arc::new(AlertEngine::with_log_notifier(AlertConfig::default())),
            log_dirs: Vec::new(),
        }
    }

    #[test]
    fn test_cycle_writes_both_stores_and_predicts_cost() {
        let p = persistence();
        let now = Utc::now();
        p.ingester
            .database()
            .upsert_records(&[TokenRecord::new(
                "r1",
                now - chrono::Duration::hours(1),
                "claude-sonnet-4-5",
                1_000_000,
                0,
            )])
            .unwrap();

        let reading = UsageReading::new(now)
            .with_five_hour(25.0, Some(now + chrono::Duration::hours(2)))
            .with_seven_day(50.0, Some(now + chrono::Duration::days(3)));
        let outcome = p.apply(reading.clone(), now);

        assert_eq!(outcome.reading, reading);
        assert_eq!(outcome.five_hour_history.len(), 1);
        assert_eq!(outcome.five_hour_cost.as_ref().unwrap().record_count, 1);
        assert!(outcome.alerts.is_empty());

        let view = p.snapshot.read().unwrap();
        assert!(view.state.logged_in);
        assert_eq!(view.state.five_hour_percent, Some(25.0));
        let predicted = view.state.predicted_five_hour_cost.unwrap();
        assert!((predicted - 12.0).abs() < 1e-9);
        let predicted_week = view.state.predicted_seven_day_cost.unwrap();
        assert!((predicted_week - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_percent_has_no_prediction() {
        let p = persistence();
        let now = Utc::now();
        p.apply(UsageReading::new(now).with_seven_day(10.0, None), now);

        let state = p.snapshot.read().unwrap().state;
        assert_eq!(state.predicted_five_hour_cost, None);
        // Zero recorded cost still projects to zero for a consumed window
        assert_eq!(state.predicted_seven_day_cost, Some(0.0));
    }

    #[test]
    fn test_seed_uses_latest_reading() {
        let p = persistence();
        let now = Utc::now();
        p.usage
            .record(&UsageReading::new(now - chrono::Duration::days(2)).with_seven_day(40.0, None));

        let seed = p.seed(now, chrono::Duration::days(30));
        assert_eq!(seed.reading.unwrap().seven_day_percent, Some(40.0));
        assert!(seed.five_hour_history.is_empty());
        assert_eq!(seed.seven_day_history.len(), 1);
    }
}
