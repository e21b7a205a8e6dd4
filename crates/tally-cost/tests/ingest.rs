//! Integration tests for event log ingestion and window costs.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tally_cost::{Ingester, TokenDatabase, TokenRecord, cost};
use tempfile::tempdir;

fn line(request_id: &str, timestamp: &str, model: &str, output: i64) -> String {
    format!(
        r#"{{"type":"assistant","requestId":"{request_id}","timestamp":"{timestamp}","message":{{"model":"{model}","usage":{{"input_tokens":100,"output_tokens":{output},"cache_read_input_tokens":1000,"cache_creation_input_tokens":0}}}}}}"#
    )
}

fn write_log(path: &Path, lines: &[String]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut file = File::create(path).unwrap();
    for l in lines {
        writeln!(file, "{l}").unwrap();
    }
}

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

#[test]
fn test_streaming_duplicates_resolve_to_final_record() {
    let dir = tempdir().unwrap();
    let projects = dir.path().join("projects");
    // Same request seen twice while streaming: partial then final
    write_log(
        &projects.join("alpha").join("s1.jsonl"),
        &[line("r1", "2026-03-02T09:00:00Z", "claude-sonnet-4-5", 10)],
    );
    write_log(
        &projects.join("beta").join("s2.jsonl"),
        &[
            line("r1", "2026-03-02T09:00:01Z", "claude-sonnet-4-5", 50),
            line("r2", "2026-03-02T09:05:00Z", "claude-haiku-4-5", 20),
        ],
    );

    let ingester = Ingester::new(TokenDatabase::open_in_memory().unwrap());
    let report = ingester.sync(&[&projects]).unwrap();
    assert_eq!(report.files_seen, 2);
    assert_eq!(report.files_parsed, 2);
    assert_eq!(report.files_failed, 0);

    let db = ingester.database();
    assert_eq!(db.record_count().unwrap(), 2);
    let r1 = db.record("r1").unwrap().unwrap();
    assert_eq!(r1.output_tokens, 50);
    assert_eq!(r1.timestamp, at("2026-03-02T09:00:01Z"));

    let now = at("2026-03-02T10:00:00Z");
    let estimate = ingester.window_cost(5, now).unwrap();
    let expected = cost(&r1) + cost(&db.record("r2").unwrap().unwrap());
    assert_eq!(estimate.record_count, 2);
    assert!((estimate.total_cost_usd - expected).abs() < 1e-12);
}

#[test]
fn test_same_file_partial_after_final_keeps_final() {
    let dir = tempdir().unwrap();
    write_log(
        &dir.path().join("s.jsonl"),
        &[
            line("r1", "2026-03-02T09:00:01Z", "claude-opus-4-6", 50),
            line("r1", "2026-03-02T09:00:00Z", "claude-opus-4-6", 10),
        ],
    );

    let ingester = Ingester::new(TokenDatabase::open_in_memory().unwrap());
    ingester.sync(&[dir.path()]).unwrap();
    assert_eq!(ingester.database().record("r1").unwrap().unwrap().output_tokens, 50);
}

#[test]
fn test_unchanged_files_are_skipped() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("s.jsonl");
    write_log(&log, &[line("r1", "2026-03-02T09:00:00Z", "m", 10)]);
    fs::write(dir.path().join("notes.txt"), "not an event log").unwrap();

    let ingester = Ingester::new(TokenDatabase::open_in_memory().unwrap());
    let first = ingester.sync(&[dir.path()]).unwrap();
    assert_eq!(first.files_seen, 1);
    assert_eq!(first.records_upserted, 1);

    let second = ingester.sync(&[dir.path()]).unwrap();
    assert_eq!(second.files_seen, 1);
    assert_eq!(second.files_skipped, 1);
    assert_eq!(second.files_parsed, 0);
    assert_eq!(second.records_upserted, 0);

    let mut file = OpenOptions::new().append(true).open(&log).unwrap();
    writeln!(file, "{}", line("r2", "2026-03-02T09:10:00Z", "m", 5)).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60)).unwrap();
    drop(file);

    let third = ingester.sync(&[dir.path()]).unwrap();
    assert_eq!(third.files_parsed, 1);
    assert_eq!(third.records_upserted, 1);
    assert_eq!(ingester.database().record_count().unwrap(), 2);
}

#[test]
fn test_malformed_lines_do_not_abort_pass() {
    let dir = tempdir().unwrap();
    write_log(
        &dir.path().join("a.jsonl"),
        &[
            "{truncated".to_string(),
            line("r1", "2026-03-02T09:00:00Z", "m", 10),
            r#"{"type":"user","message":{"content":"hello"}}"#.to_string(),
        ],
    );
    write_log(
        &dir.path().join("b.jsonl"),
        &[line("r2", "not-a-time", "m", 10), line("r3", "2026-03-02T09:00:00Z", "m", 1)],
    );

    let ingester = Ingester::new(TokenDatabase::open_in_memory().unwrap());
    let report = ingester.sync(&[dir.path()]).unwrap();
    assert_eq!(report.files_parsed, 2);
    assert_eq!(report.lines_skipped, 2);
    assert_eq!(report.records_upserted, 2);
}

#[test]
fn test_window_cost_boundary() {
    let db = TokenDatabase::open_in_memory().unwrap();
    let now = at("2026-03-02T14:00:00Z");
    db.upsert_records(&[
        TokenRecord::new("edge", at("2026-03-02T09:00:00Z"), "claude-sonnet-4-5", 1_000_000, 0),
        TokenRecord::new("outside", at("2026-03-02T08:59:59Z"), "claude-sonnet-4-5", 1_000_000, 0),
    ])
    .unwrap();

    let ingester = Ingester::new(db);
    let estimate = ingester.window_cost(5, now).unwrap();
    assert_eq!(estimate.record_count, 1);
    assert!((estimate.total_cost_usd - 3.0).abs() < 1e-9);
    assert_eq!(estimate.oldest, Some(at("2026-03-02T09:00:00Z")));

    let empty = ingester.window_cost(1, now).unwrap();
    assert_eq!(empty.record_count, 0);
    assert_eq!(empty.total_cost_usd, 0.0);
    assert!(empty.newest.is_none());
}

#[test]
fn test_failed_pass_writes_nothing_and_is_retried_whole() {
    let dir = tempdir().unwrap();
    let projects = dir.path().join("projects");
    let first = projects.join("alpha").join("s1.jsonl");
    let second = projects.join("beta").join("s2.jsonl");
    write_log(&first, &[line("r1", "2026-03-02T09:00:00Z", "claude-sonnet-4-5", 10)]);
    write_log(&second, &[line("r2", "2026-03-02T09:05:00Z", "claude-opus-4-1", 20)]);

    let db_path = dir.path().join("tokens.db");
    let ingester = Ingester::new(TokenDatabase::open(&db_path).unwrap());

    // Another writer holds the write lock for the whole pass
    let blocker = rusqlite::Connection::open(&db_path).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

    assert!(ingester.sync(&[&projects]).is_err());
    let db = ingester.database();
    assert_eq!(db.record_count().unwrap(), 0);
    for path in [&first, &second] {
        assert!(db.file_marker(&path.to_string_lossy()).unwrap().is_none());
    }

    blocker.execute_batch("ROLLBACK").unwrap();

    let report = ingester.sync(&[&projects]).unwrap();
    assert_eq!(report.files_parsed, 2);
    assert_eq!(report.files_skipped, 0);
    assert_eq!(db.record_count().unwrap(), 2);
}
