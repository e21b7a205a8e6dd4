//! Integration tests for alert dedup against a real usage store.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tally_alert::{Alert, AlertEngine, AlertKind, Notifier};
use tally_core::{AlertConfig, DailyMode, UsageReading};
use tally_store::UsageStore;

#[derive(Default)]
struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    fn ids(&self) -> Vec<&'static str> {
        self.alerts.lock().unwrap().iter().map(|a| a.id()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, alert: &Alert) {
        self.alerts.lock().unwrap().push(alert.clone());
    }
}

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn engine(config: AlertConfig) -> (AlertEngine, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    (AlertEngine::new(config, notifier.clone()), notifier)
}

fn weekly_only() -> AlertConfig {
    AlertConfig {
        hourly_enabled: false,
        daily_enabled: false,
        ..AlertConfig::default()
    }
}

#[test]
fn test_weekly_fires_once_per_session() {
    let store = UsageStore::open_in_memory().unwrap();
    let (engine, notifier) = engine(weekly_only());
    let now = at("2026-03-02T12:00:00Z");

    let first = UsageReading::new(now).with_seven_day(85.0, Some(at("2026-03-09T13:59:59.940Z")));
    let second = UsageReading::new(now).with_seven_day(90.0, Some(at("2026-03-09T14:00:00.080Z")));
    let next_week =
        UsageReading::new(now).with_seven_day(90.0, Some(at("2026-03-16T14:00:03Z")));

    assert_eq!(engine.evaluate(&first, &store, now), vec![AlertKind::Weekly]);
    assert!(engine.evaluate(&second, &store, now).is_empty());
    assert_eq!(engine.evaluate(&next_week, &store, now), vec![AlertKind::Weekly]);
    assert_eq!(notifier.ids(), vec!["tally.alert.weekly", "tally.alert.weekly"]);
}

#[test]
fn test_weekly_below_threshold_does_not_consume_session() {
    let store = UsageStore::open_in_memory().unwrap();
    let (engine, _) = engine(weekly_only());
    let now = Utc::now();
    let reset = Some(at("2026-03-09T14:00:00Z"));

    // 79% used leaves 21% remaining, just above the threshold of 20
    assert!(engine.evaluate(&UsageReading::new(now).with_seven_day(79.0, reset), &store, now).is_empty());
    assert_eq!(
        engine.evaluate(&UsageReading::new(now).with_seven_day(80.0, reset), &store, now),
        vec![AlertKind::Weekly]
    );
}

#[test]
fn test_hourly_mirrors_weekly() {
    let store = UsageStore::open_in_memory().unwrap();
    let config = AlertConfig {
        weekly_enabled: false,
        daily_enabled: false,
        ..AlertConfig::default()
    };
    let (engine, notifier) = engine(config);
    let now = Utc::now();
    let reading = |percent, reset| UsageReading::new(now).with_five_hour(percent, Some(at(reset)));

    assert_eq!(engine.evaluate(&reading(95.0, "2026-03-02T14:00:10Z"), &store, now), vec![AlertKind::Hourly]);
    assert!(engine.evaluate(&reading(99.0, "2026-03-02T13:59:50Z"), &store, now).is_empty());
    assert_eq!(engine.evaluate(&reading(92.0, "2026-03-02T19:00:00Z"), &store, now), vec![AlertKind::Hourly]);
    assert_eq!(notifier.ids(), vec!["tally.alert.hourly"; 2]);
}

#[test]
fn test_disabled_kinds_never_fire() {
    let store = UsageStore::open_in_memory().unwrap();
    let config = AlertConfig {
        weekly_enabled: false,
        hourly_enabled: false,
        daily_enabled: false,
        ..AlertConfig::default()
    };
    let (engine, notifier) = engine(config);
    let now = Utc::now();
    let reading = UsageReading::new(now)
        .with_five_hour(100.0, Some(now + Duration::hours(1)))
        .with_seven_day(100.0, Some(now + Duration::days(1)));
    store.record(&reading);

    assert!(engine.evaluate(&reading, &store, now).is_empty());
    assert!(notifier.ids().is_empty());
}

#[test]
fn test_reset_allows_refire() {
    let store = UsageStore::open_in_memory().unwrap();
    let (engine, _) = engine(weekly_only());
    let now = Utc::now();
    let reading = UsageReading::new(now).with_seven_day(95.0, Some(at("2026-03-09T14:00:00Z")));

    assert_eq!(engine.evaluate(&reading, &store, now).len(), 1);
    assert!(engine.evaluate(&reading, &store, now).is_empty());
    engine.reset();
    assert_eq!(engine.evaluate(&reading, &store, now).len(), 1);
}

#[test]
fn test_daily_calendar_fires_once_when_threshold_reached() {
    let store = UsageStore::open_in_memory().unwrap();
    let config = AlertConfig {
        weekly_enabled: false,
        hourly_enabled: false,
        daily_mode: DailyMode::Calendar,
        ..AlertConfig::default()
    };
    let (engine, notifier) = engine(config);
    let now = Utc::now();

    let low = UsageReading::new(now).with_seven_day(50.0, None);
    store.record(&low);
    assert!(engine.evaluate(&low, &store, now).is_empty());

    let high = UsageReading::new(now).with_seven_day(81.0, None);
    store.record(&high);
    assert_eq!(engine.evaluate(&high, &store, now), vec![AlertKind::Daily]);

    let higher = UsageReading::new(now).with_seven_day(95.0, None);
    store.record(&higher);
    assert!(engine.evaluate(&higher, &store, now).is_empty());
    assert_eq!(notifier.ids(), vec!["tally.alert.daily"]);
}

#[test]
fn test_daily_with_no_rows_does_not_fire() {
    let store = UsageStore::open_in_memory().unwrap();
    let config = AlertConfig {
        weekly_enabled: false,
        hourly_enabled: false,
        ..AlertConfig::default()
    };
    let (engine, _) = engine(config);
    let now = Utc::now();
    let reading = UsageReading::new(now).with_seven_day(99.0, None);

    // Not recorded: the store has nothing for today
    assert!(engine.evaluate(&reading, &store, now).is_empty());
}

#[test]
fn test_daily_session_mode_keys_on_weekly_session() {
    let store = UsageStore::open_in_memory().unwrap();
    let config = AlertConfig {
        weekly_enabled: false,
        hourly_enabled: false,
        daily_mode: DailyMode::Session,
        ..AlertConfig::default()
    };
    let (engine, _) = engine(config);
    let reset = at("2026-03-09T14:00:00Z");
    let session_start = reset - Duration::days(7);

    // Before this session started; must not count
    store.record(&UsageReading::new(session_start - Duration::hours(1)).with_seven_day(99.0, None));

    let now = session_start + Duration::days(2);
    let reading = UsageReading::new(now).with_seven_day(60.0, Some(reset));
    store.record(&reading);
    assert!(engine.evaluate(&reading, &store, now).is_empty());

    let reading = UsageReading::new(now + Duration::hours(1)).with_seven_day(85.0, Some(reset));
    store.record(&reading);
    assert_eq!(engine.evaluate(&reading, &store, now), vec![AlertKind::Daily]);
    assert!(engine.evaluate(&reading, &store, now).is_empty());

    let next_reset = reset + Duration::days(7);
    let reading = UsageReading::new(reset + Duration::hours(1)).with_seven_day(85.0, Some(next_reset));
    store.record(&reading);
    assert_eq!(engine.evaluate(&reading, &store, now), vec![AlertKind::Daily]);
}
