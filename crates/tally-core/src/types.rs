//! Shared type definitions used across tally crates.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Seconds in one hour; session keys are aligned to this grid.
const HOUR_SECS: i64 = 3600;

/// Round a reset instant (epoch seconds) to the nearest hour.
///
/// Reset times reported for one window jitter by tens of seconds between
/// polls; every reading of the same window must land on the same key.
/// Uses floor division so instants before the epoch round the same way.
pub fn normalize_reset_epoch(epoch_secs: i64) -> i64 {
    (epoch_secs + HOUR_SECS / 2).div_euclid(HOUR_SECS) * HOUR_SECS
}

/// The two rate-limit windows reported by the usage endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageWindow {
    /// Rolling five hour window ("hourly" sessions)
    FiveHour,
    /// Rolling seven day window ("weekly" sessions)
    SevenDay,
}

impl UsageWindow {
    /// Length of the window.
    pub fn duration(&self) -> chrono::Duration {
        match self {
            Self::FiveHour => chrono::Duration::hours(5),
            Self::SevenDay => chrono::Duration::days(7),
        }
    }
}

impl std::fmt::Display for UsageWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FiveHour => write!(f, "5h"),
            Self::SevenDay => write!(f, "7d"),
        }
    }
}

/// Normalized identity of one rate-limit window instance.
///
/// Wraps the reset instant rounded to the nearest hour, in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey(pub i64);

impl SessionKey {
    /// Build the key for a raw reset instant.
    pub fn from_reset(reset_at: DateTime<Utc>) -> Self {
        Self(normalize_reset_epoch(reset_at.timestamp()))
    }

    /// Normalized epoch seconds.
    pub fn epoch(&self) -> i64 {
        self.0
    }

    /// Normalized reset instant.
    pub fn reset_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.0, 0).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One polling result from the usage endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReading {
    /// Percent of the five hour window consumed
    pub five_hour_percent: Option<f64>,

    /// Percent of the seven day window consumed
    pub seven_day_percent: Option<f64>,

    /// When the five hour window resets
    pub five_hour_resets_at: Option<DateTime<Utc>>,

    /// When the seven day window resets
    pub seven_day_resets_at: Option<DateTime<Utc>>,

    /// When the reading was taken
    pub captured_at: DateTime<Utc>,
}

impl UsageReading {
    /// Create an empty reading captured at the given time.
    pub fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            five_hour_percent: None,
            seven_day_percent: None,
            five_hour_resets_at: None,
            seven_day_resets_at: None,
            captured_at,
        }
    }

    /// Set the five hour window values.
    pub fn with_five_hour(mut self, percent: f64, resets_at: Option<DateTime<Utc>>) -> Self {
        self.five_hour_percent = Some(percent);
        self.five_hour_resets_at = resets_at;
        self
    }

    /// Set the seven day window values.
    pub fn with_seven_day(mut self, percent: f64, resets_at: Option<DateTime<Utc>>) -> Self {
        self.seven_day_percent = Some(percent);
        self.seven_day_resets_at = resets_at;
        self
    }

    /// A reading is storable only if at least one percent is present.
    pub fn has_percent(&self) -> bool {
        self.five_hour_percent.is_some() || self.seven_day_percent.is_some()
    }

    /// Percent consumed for a window.
    pub fn percent(&self, window: UsageWindow) -> Option<f64> {
        match window {
            UsageWindow::FiveHour => self.five_hour_percent,
            UsageWindow::SevenDay => self.seven_day_percent,
        }
    }

    /// Raw reset instant for a window.
    pub fn resets_at(&self, window: UsageWindow) -> Option<DateTime<Utc>> {
        match window {
            UsageWindow::FiveHour => self.five_hour_resets_at,
            UsageWindow::SevenDay => self.seven_day_resets_at,
        }
    }

    /// Normalized session for a window, if its reset instant is known.
    pub fn session(&self, window: UsageWindow) -> Option<SessionKey> {
        self.resets_at(window).map(SessionKey::from_reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_jittered_resets_share_a_key() {
        let before = at("2026-03-02T13:59:59.940Z");
        let after = at("2026-03-02T14:00:00.080Z");
        let expected = at("2026-03-02T14:00:00Z").timestamp();

        assert_eq!(SessionKey::from_reset(before).epoch(), expected);
        assert_eq!(SessionKey::from_reset(after).epoch(), expected);
    }

    #[test]
    fn test_within_half_hour_of_boundary() {
        let boundary = at("2026-03-02T14:00:00Z");
        let key = SessionKey::from_reset(boundary);

        for offset in [-1799, -600, -1, 0, 1, 600, 1799] {
            let instant = boundary + Duration::seconds(offset);
            assert_eq!(SessionKey::from_reset(instant), key, "offset {offset}");
        }
    }

    #[test]
    fn test_straddling_more_than_half_hour_differs() {
        let boundary = at("2026-03-02T14:00:00Z");
        let early = boundary - Duration::seconds(1801);
        let late = boundary + Duration::seconds(1800);

        assert_ne!(SessionKey::from_reset(early), SessionKey::from_reset(boundary));
        assert_ne!(SessionKey::from_reset(late), SessionKey::from_reset(boundary));
    }

    #[test]
    fn test_normalize_matches_integer_rule() {
        let epoch = 1_772_460_000 + 1234;
        assert_eq!(normalize_reset_epoch(epoch), ((epoch + 1800) / 3600) * 3600);
    }

    #[test]
    fn test_reading_accessors() {
        let reset = at("2026-03-09T00:00:00Z");
        let reading = UsageReading::new(Utc::now()).with_seven_day(85.0, Some(reset));

        assert!(reading.has_percent());
        assert_eq!(reading.percent(UsageWindow::SevenDay), Some(85.0));
        assert_eq!(reading.percent(UsageWindow::FiveHour), None);
        assert_eq!(reading.session(UsageWindow::SevenDay), Some(SessionKey::from_reset(reset)));
        assert!(reading.session(UsageWindow::FiveHour).is_none());
        assert!(!UsageReading::new(Utc::now()).has_percent());
    }
}
