//! Event log parser for extracting per-request token usage.
//!
//! Event logs are JSON Lines. Only `assistant` entries that carry a
//! `requestId`, a `message.model` and all four `message.usage` counters
//! become [`TokenRecord`]s; every other line is ignored.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::trace;

use crate::error::{CostError, Result};
use crate::models::TokenRecord;

/// Records read from one file plus the number of malformed lines.
#[derive(Debug, Default)]
pub struct ParsedFile {
    pub records: Vec<TokenRecord>,
    pub skipped_lines: usize,
}

/// Parse a whole event log file.
///
/// Fails only when the file itself cannot be read; bad lines are counted
/// and skipped.
pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<ParsedFile> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let mut parsed = ParsedFile::default();

    for (index, chunk) in reader.split(b'\n').enumerate() {
        let bytes = chunk?;
        let Ok(line) = std::str::from_utf8(&bytes) else {
            trace!(line = index + 1, "Skipping non UTF-8 line");
            parsed.skipped_lines += 1;
            continue;
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_line(line) {
            Ok(Some(record)) => parsed.records.push(record),
            Ok(None) => {}
            Err(e) => {
                trace!(line = index + 1, error = %e, "Failed to parse line");
                parsed.skipped_lines += 1;
            }
        }
    }

    Ok(parsed)
}

/// Parse a single JSON line.
///
/// `Ok(None)` means the line is valid but carries no request usage.
pub fn parse_line(line: &str) -> Result<Option<TokenRecord>> {
    let value: Value = serde_json::from_str(line)?;

    if value.get("type").and_then(Value::as_str) != Some("assistant") {
        return Ok(None);
    }

    let Some(request_id) = value.get("requestId").and_then(Value::as_str) else {
        return Ok(None);
    };
    let Some(message) = value.get("message") else {
        return Ok(None);
    };
    let Some(model) = message.get("model").and_then(Value::as_str) else {
        return Ok(None);
    };
    let Some(usage) = message.get("usage") else {
        return Ok(None);
    };

    let counter = |name: &str| usage.get(name).and_then(Value::as_i64);
    let (Some(input), Some(output), Some(cache_read), Some(cache_write)) = (
        counter("input_tokens"),
        counter("output_tokens"),
        counter("cache_read_input_tokens"),
        counter("cache_creation_input_tokens"),
    ) else {
        return Ok(None);
    };

    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_str)
        .ok_or_else(|| CostError::InvalidLogFormat(format!("{request_id}: missing timestamp")))?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp)?.with_timezone(&Utc);

    Ok(Some(
        TokenRecord::new(request_id, timestamp, model, input, output)
            .with_cache(cache_read, cache_write),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ASSISTANT: &str = r#"{"type":"assistant","requestId":"req_01","timestamp":"2026-03-02T09:15:30.123Z","message":{"model":"claude-opus-4-6","usage":{"input_tokens":12,"output_tokens":340,"cache_read_input_tokens":20000,"cache_creation_input_tokens":1500}}}"#;

    #[test]
    fn test_parse_assistant_line() {
        let record = parse_line(ASSISTANT).unwrap().unwrap();
        assert_eq!(record.request_id, "req_01");
        assert_eq!(record.model, "claude-opus-4-6");
        assert_eq!(record.input_tokens, 12);
        assert_eq!(record.output_tokens, 340);
        assert_eq!(record.cache_read_tokens, 20000);
        assert_eq!(record.cache_write_tokens, 1500);
        assert_eq!(record.timestamp.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn test_non_candidates_are_ignored() {
        let user = r#"{"type":"user","requestId":"r","message":{"content":"hi"}}"#;
        assert!(parse_line(user).unwrap().is_none());

        let no_request = ASSISTANT.replace(r#""requestId":"req_01","#, "");
        assert!(parse_line(&no_request).unwrap().is_none());

        let no_cache = r#"{"type":"assistant","requestId":"r","timestamp":"2026-03-02T09:15:30Z","message":{"model":"m","usage":{"input_tokens":1,"output_tokens":2}}}"#;
        assert!(parse_line(no_cache).unwrap().is_none());

        let no_model = r#"{"type":"assistant","requestId":"r","timestamp":"2026-03-02T09:15:30Z","message":{"usage":{"input_tokens":1,"output_tokens":2,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}}}"#;
        assert!(parse_line(no_model).unwrap().is_none());
    }

    #[test]
    fn test_bad_json_and_bad_timestamp_are_errors() {
        assert!(parse_line("{not json").is_err());
        let bad_ts = ASSISTANT.replace("2026-03-02T09:15:30.123Z", "yesterday");
        assert!(parse_line(&bad_ts).is_err());
    }

    #[test]
    fn test_parse_file_counts_skipped_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{ASSISTANT}").unwrap();
        writeln!(file, "garbage").unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"type":"summary"}}"#).unwrap();
        file.write_all(b"\xff\xfe\n").unwrap();
        write!(file, "{}", ASSISTANT.replace("req_01", "req_02")).unwrap();
        file.flush().unwrap();

        let parsed = parse_file(file.path()).unwrap();
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.skipped_lines, 2);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(parse_file("/nonexistent/tally/session.jsonl").is_err());
    }
}
