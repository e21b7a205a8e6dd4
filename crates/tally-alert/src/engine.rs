//! Threshold alert engine.
//!
//! Each kind fires at most once per period. Weekly and five hour alerts
//! are keyed by the normalized session of the reading; the daily alert is
//! keyed by the local calendar date or by the weekly session, depending on
//! [`DailyMode`]. Memory is in-process only, so a restart may re-notify
//! once for the current period.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Local, TimeZone, Timelike, Utc};
use tally_core::{AlertConfig, DailyMode, SessionKey, UsageReading, UsageWindow};
use tally_store::UsageStore;
use tracing::debug;

use crate::notifier::{Alert, AlertKind, LogNotifier, Notifier};

/// Source of the daily high-water mark.
pub trait DailyUsage {
    /// Highest seven day percent observed at or after `since`.
    fn daily_usage(&self, since: DateTime<Utc>) -> Option<f64>;
}

impl DailyUsage for UsageStore {
    fn daily_usage(&self, since: DateTime<Utc>) -> Option<f64> {
        UsageStore::daily_usage(self, since)
    }
}

#[derive(Debug, Default)]
struct AlertMemory {
    weekly: Option<SessionKey>,
    hourly: Option<SessionKey>,
    daily: Option<String>,
}

/// One engine per process, shared as `Arc<AlertEngine>`.
pub struct AlertEngine {
    config: AlertConfig,
    notifier: Arc<dyn Notifier>,
    memory: Mutex<AlertMemory>,
}

impl AlertEngine {
    pub fn new(config: AlertConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            notifier,
            memory: Mutex::new(AlertMemory::default()),
        }
    }

    /// Engine that delivers through [`LogNotifier`].
    pub fn with_log_notifier(config: AlertConfig) -> Self {
        Self::new(config, Arc::new(LogNotifier))
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    fn memory(&self) -> MutexGuard<'_, AlertMemory> {
        // Memory holds plain keys; a poisoned lock still has usable state.
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget every fired period, e.g. after the account signs out.
    pub fn reset(&self) {
        *self.memory() = AlertMemory::default();
        debug!("Alert memory cleared");
    }

    /// Evaluate all enabled kinds against a fresh reading.
    ///
    /// Returns the kinds that fired, in weekly, hourly, daily order.
    pub fn evaluate(
        &self,
        reading: &UsageReading,
        usage: &dyn DailyUsage,
        now: DateTime<Utc>,
    ) -> Vec<AlertKind> {
        let mut fired = Vec::new();

        if self.config.weekly_enabled
            && let Some(alert) = self.check_window(
                reading,
                UsageWindow::SevenDay,
                self.config.weekly_remaining_threshold,
            )
        {
            fired.push(self.dispatch(alert));
        }

        if self.config.hourly_enabled
            && let Some(alert) = self.check_window(
                reading,
                UsageWindow::FiveHour,
                self.config.hourly_remaining_threshold,
            )
        {
            fired.push(self.dispatch(alert));
        }

        if self.config.daily_enabled
            && let Some(alert) = self.check_daily(reading, usage, now)
        {
            fired.push(self.dispatch(alert));
        }

        fired
    }

    fn dispatch(&self, alert: Alert) -> AlertKind {
        debug!(id = alert.id(), message = %alert.message, "Dispatching alert");
        self.notifier.notify(&alert);
        alert.kind
    }

    fn check_window(
        &self,
        reading: &UsageReading,
        window: UsageWindow,
        threshold: f64,
    ) -> Option<Alert> {
        let percent = reading.percent(window)?;
        let session = reading.session(window)?;
        let remaining = 100.0 - percent;
        if remaining > threshold {
            return None;
        }

        let kind = match window {
            UsageWindow::SevenDay => AlertKind::Weekly,
            UsageWindow::FiveHour => AlertKind::Hourly,
        };

        let mut memory = self.memory();
        let last = match kind {
            AlertKind::Weekly => &mut memory.weekly,
            _ => &mut memory.hourly,
        };
        if *last == Some(session) {
            return None;
        }
        *last = Some(session);

        Some(Alert {
            kind,
            message: format!(
                "{remaining:.0}% of the {window} limit remaining (resets {})",
                session.reset_at().with_timezone(&Local).format("%a %H:%M")
            ),
        })
    }

    fn check_daily(
        &self,
        reading: &UsageReading,
        usage: &dyn DailyUsage,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let (key, start) = match self.config.daily_mode {
            DailyMode::Calendar => calendar_period(now, &Local),
            DailyMode::Session => {
                let session = reading.session(UsageWindow::SevenDay)?;
                (
                    session.epoch().to_string(),
                    session.reset_at() - UsageWindow::SevenDay.duration(),
                )
            }
        };

        let mut memory = self.memory();
        if memory.daily.as_deref() == Some(key.as_str()) {
            return None;
        }

        let used = usage.daily_usage(start)?;
        if used < self.config.daily_usage_threshold {
            return None;
        }

        memory.daily = Some(key);
        Some(Alert {
            kind: AlertKind::Daily,
            message: format!("{used:.0}% of the weekly limit used in this period"),
        })
    }
}

/// Calendar date key and the instant of local midnight for `now`.
fn calendar_period<Tz: TimeZone>(now: DateTime<Utc>, tz: &Tz) -> (String, DateTime<Utc>) {
    let local = now.with_timezone(tz);
    let date = local.date_naive();
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
        .map(|start| start.with_timezone(&Utc))
        // Midnight skipped by a DST jump; count back the wall-clock time instead.
        .unwrap_or_else(|| now - Duration::seconds(local.num_seconds_from_midnight() as i64));
    (date.to_string(), midnight)
}
