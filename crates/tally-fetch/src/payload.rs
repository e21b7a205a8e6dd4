//! Parsing of the remote usage payload.
//!
//! Two shapes are accepted:
//!
//! ```text
//! {"five_hour": {...}, "seven_day": {...}}
//! {"windows": {"5h": {...}, "7d": {...}}}
//! ```
//!
//! A window carries either a direct percentage or a `limit`/`remaining`
//! pair, and an optional reset instant as unix seconds or ISO-8601.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{FetchError, Result};
use tally_core::{UsageReading, UsageWindow};

const PERCENT_KEYS: [&str; 4] = ["utilization", "percent", "used_percent", "percentage"];
const RESET_KEYS: [&str; 3] = ["resets_at", "reset_at", "reset"];

/// Build a reading from a usage payload captured at `captured_at`.
pub fn parse_usage(value: &Value, captured_at: DateTime<Utc>) -> Result<UsageReading> {
    if let Some(error) = value.get("__error") {
        let message = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(FetchError::Remote(message));
    }

    let mut reading = UsageReading::new(captured_at);
    for window in [UsageWindow::FiveHour, UsageWindow::SevenDay] {
        let Some(raw) = window_value(value, window) else {
            continue;
        };
        let Some(percent) = window_percent(raw) else {
            continue;
        };
        let reset = window_reset(raw);
        reading = match window {
            UsageWindow::FiveHour => reading.with_five_hour(percent, reset),
            UsageWindow::SevenDay => reading.with_seven_day(percent, reset),
        };
    }

    if !reading.has_percent() {
        return Err(FetchError::Parse("no usage windows in payload".to_string()));
    }
    Ok(reading)
}

fn window_value(value: &Value, window: UsageWindow) -> Option<&Value> {
    let (flat, nested) = match window {
        UsageWindow::FiveHour => ("five_hour", "5h"),
        UsageWindow::SevenDay => ("seven_day", "7d"),
    };
    value
        .get(flat)
        .or_else(|| value.get("windows").and_then(|w| w.get(nested)))
        .filter(|v| v.is_object())
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn window_percent(window: &Value) -> Option<f64> {
    if let Some(percent) = PERCENT_KEYS
        .iter()
        .find_map(|key| window.get(*key).and_then(number))
    {
        return Some(percent);
    }

    let limit = window.get("limit").and_then(number)?;
    let remaining = window.get("remaining").and_then(number)?;
    (limit > 0.0).then(|| (limit - remaining) / limit * 100.0)
}

fn window_reset(window: &Value) -> Option<DateTime<Utc>> {
    RESET_KEYS
        .iter()
        .find_map(|key| window.get(*key).and_then(parse_reset))
}

fn parse_reset(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let millis = (secs * 1000.0).round() as i64;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => parse_iso_reset(s),
        _ => None,
    }
}

/// Parse an ISO-8601 instant, truncating fractional seconds to milliseconds.
pub fn parse_iso_reset(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }

    let truncated = truncate_fraction(raw);
    DateTime::parse_from_rfc3339(&truncated)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn truncate_fraction(raw: &str) -> String {
    let Some(dot) = raw.find('.') else {
        return raw.to_string();
    };
    let digits = raw[dot + 1..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits <= 3 {
        return raw.to_string();
    }
    format!("{}{}", &raw[..dot + 4], &raw[dot + 1 + digits..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_flat_shape() {
        let payload = json!({
            "five_hour": {"utilization": 42.0, "resets_at": "2026-03-02T14:00:00.123456+00:00"},
            "seven_day": {"utilization": 17, "resets_at": null}
        });
        let reading = parse_usage(&payload, Utc::now()).unwrap();
        assert_eq!(reading.five_hour_percent, Some(42.0));
        assert_eq!(reading.five_hour_resets_at, Some(at("2026-03-02T14:00:00.123Z")));
        assert_eq!(reading.seven_day_percent, Some(17.0));
        assert_eq!(reading.seven_day_resets_at, None);
    }

    #[test]
    fn test_nested_shape_with_limit_pair() {
        let payload = json!({
            "windows": {
                "5h": {"limit": 200, "remaining": 50, "reset": 1772460000},
                "7d": {"used_percent": "12.5", "reset_at": "2026-03-09T08:00:00Z"}
            }
        });
        let reading = parse_usage(&payload, Utc::now()).unwrap();
        assert_eq!(reading.five_hour_percent, Some(75.0));
        assert_eq!(
            reading.five_hour_resets_at,
            Utc.timestamp_opt(1772460000, 0).single()
        );
        assert_eq!(reading.seven_day_percent, Some(12.5));
        assert_eq!(reading.seven_day_resets_at, Some(at("2026-03-09T08:00:00Z")));
    }

    #[test]
    fn test_single_window_is_enough() {
        let payload = json!({"seven_day": {"percentage": 3}, "five_hour": null});
        let reading = parse_usage(&payload, Utc::now()).unwrap();
        assert_eq!(reading.five_hour_percent, None);
        assert_eq!(reading.seven_day_percent, Some(3.0));
    }

    #[test]
    fn test_error_payload() {
        let err = parse_usage(&json!({"__error": "HTTP 403"}), Utc::now()).unwrap_err();
        assert!(matches!(err, FetchError::Remote(ref m) if m == "HTTP 403"));
        assert!(err.is_auth_error());
    }

    #[test]
    fn test_empty_payload_is_parse_error() {
        let err = parse_usage(&json!({"five_hour": {"limit": 0, "remaining": 0}}), Utc::now())
            .unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[test]
    fn test_truncate_fraction() {
        assert_eq!(
            truncate_fraction("2026-03-02T13:59:59.940123Z"),
            "2026-03-02T13:59:59.940Z"
        );
        assert_eq!(truncate_fraction("2026-03-02T13:59:59.9Z"), "2026-03-02T13:59:59.9Z");
        assert_eq!(truncate_fraction("2026-03-02T13:59:59Z"), "2026-03-02T13:59:59Z");
        assert_eq!(
            parse_iso_reset("2026-03-02T13:59:59.9401234567890+00:00"),
            Some(at("2026-03-02T13:59:59.940Z"))
        );
        assert_eq!(parse_iso_reset("soon"), None);
    }
}
