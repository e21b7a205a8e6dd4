//! Incremental ingestion of event log directories.
//!
//! Each pass walks the configured directories for `.jsonl` files, reparses
//! the ones whose mtime differs from their stored marker, and writes every
//! record and marker of the pass in a single transaction.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::db::TokenDatabase;
use crate::error::Result;
use crate::models::{CostEstimate, FileMarker, SyncReport, TokenRecord};
use crate::parser::parse_file;
use crate::pricing::estimate;

fn is_event_log(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("jsonl")
}

fn mtime_of(path: &Path) -> std::io::Result<String> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(DateTime::<Utc>::from(modified).to_rfc3339_opts(SecondsFormat::Nanos, true))
}

/// Keeps a [`TokenDatabase`] in step with event log directories.
#[derive(Clone)]
pub struct Ingester {
    db: TokenDatabase,
}

impl Ingester {
    pub fn new(db: TokenDatabase) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &TokenDatabase {
        &self.db
    }

    /// Run one ingestion pass over `dirs`.
    ///
    /// Missing directories are ignored. Unreadable files are counted as
    /// failed and retried next pass; only a database failure is an error,
    /// and then nothing from the pass is written.
    pub fn sync<P: AsRef<Path>>(&self, dirs: &[P]) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut records: Vec<TokenRecord> = Vec::new();
        let mut markers = Vec::new();

        for path in discover(dirs) {
            report.files_seen += 1;
            let key = path.to_string_lossy().to_string();

            let mtime = match mtime_of(&path) {
                Ok(mtime) => mtime,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Failed to stat event log");
                    report.files_failed += 1;
                    continue;
                }
            };

            if self
                .db
                .file_marker(&key)?
                .is_some_and(|marker| marker.mtime == mtime)
            {
                report.files_skipped += 1;
                continue;
            }

            match parse_file(&path) {
                Ok(parsed) => {
                    debug!(
                        file = %path.display(),
                        records = parsed.records.len(),
                        skipped = parsed.skipped_lines,
                        "Parsed event log"
                    );
                    report.files_parsed += 1;
                    report.lines_skipped += parsed.skipped_lines;
                    markers.push(FileMarker {
                        path: key,
                        mtime,
                        record_count: parsed.records.len() as i64,
                    });
                    records.extend(parsed.records);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Failed to read event log");
                    report.files_failed += 1;
                }
            }
        }

        report.records_upserted = self.db.apply_sync(&records, &markers)?;

        if report.files_parsed > 0 || report.files_failed > 0 {
            info!(
                files_seen = report.files_seen,
                files_parsed = report.files_parsed,
                files_failed = report.files_failed,
                records_upserted = report.records_upserted,
                lines_skipped = report.lines_skipped,
                "Event log sync complete"
            );
        }

        Ok(report)
    }

    /// Estimate cost over the trailing `window_hours` from stored records.
    pub fn window_cost(&self, window_hours: i64, now: DateTime<Utc>) -> Result<CostEstimate> {
        let since = now - chrono::Duration::hours(window_hours);
        let records = self.db.records_since(since)?;
        let estimate = estimate(&records, window_hours, now);
        tally_core::log_cost_event!(
            window_hours,
            cost_usd = estimate.total_cost_usd,
            records = estimate.record_count
        );
        Ok(estimate)
    }
}

/// Every `.jsonl` file under `dirs`, in walk order.
fn discover<P: AsRef<Path>>(dirs: &[P]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for dir in dirs {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "Event log directory not present");
            continue;
        }

        for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Failed to walk event log directory");
                    continue;
                }
            };
            if entry.file_type().is_file() && is_event_log(entry.path()) {
                found.push(entry.into_path());
            }
        }
    }
    found
}
