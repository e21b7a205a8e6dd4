//! SQLite storage for token records and ingestion markers.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::{debug, info};

use crate::error::{CostError, Result};
use crate::models::{FileMarker, TokenRecord};

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite database of per-request token usage.
#[derive(Clone)]
pub struct TokenDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl TokenDatabase {
    /// Open or create a token database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CostError::LockPoisoned)
    }

    /// Run database migrations.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            info!(
                current = current_version,
                target = SCHEMA_VERSION,
                "Running token database migrations"
            );
        }
        if current_version < 1 {
            migration_v1(&conn)?;
        }

        Ok(())
    }

    // ============ Token records ============

    /// Upsert records in one transaction; returns rows inserted or replaced.
    pub fn upsert_records(&self, records: &[TokenRecord]) -> Result<usize> {
        self.apply_sync(records, &[])
    }

    /// Upsert records and write file markers in one transaction.
    ///
    /// A record replaces the stored one with the same request id only when
    /// it has strictly more output tokens, and then replaces it whole.
    pub fn apply_sync(&self, records: &[TokenRecord], markers: &[FileMarker]) -> Result<usize> {
        if records.is_empty() && markers.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let changed = upsert_in_tx(&tx, records)?;
        for marker in markers {
            tx.execute(
                "INSERT INTO ingested_files (path, mtime, record_count)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(path) DO UPDATE SET
                    mtime = excluded.mtime,
                    record_count = excluded.record_count",
                params![marker.path, marker.mtime, marker.record_count],
            )?;
        }
        tx.commit()?;

        debug!(changed, markers = markers.len(), "Applied token sync");
        Ok(changed)
    }

    /// Stored record for a request id.
    pub fn record(&self, request_id: &str) -> Result<Option<TokenRecord>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT request_id, timestamp, model, input_tokens, output_tokens,
                        cache_read_tokens, cache_write_tokens
                 FROM token_records WHERE request_id = ?1",
                params![request_id],
                raw_record,
            )
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// All records timestamped at or after `since`, oldest first.
    pub fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<TokenRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT request_id, timestamp, model, input_tokens, output_tokens,
                    cache_read_tokens, cache_write_tokens
             FROM token_records
             WHERE timestamp >= ?1
             ORDER BY timestamp ASC",
        )?;

        let rows = stmt
            .query_map(params![format_ts(since)], raw_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(RawRecord::into_record).collect()
    }

    pub fn record_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM token_records", [], |row| row.get(0))?)
    }

    // ============ File markers ============

    pub fn file_marker(&self, path: &str) -> Result<Option<FileMarker>> {
        let conn = self.lock()?;
        let marker = conn
            .query_row(
                "SELECT path, mtime, record_count FROM ingested_files WHERE path = ?1",
                params![path],
                |row| {
                    Ok(FileMarker {
                        path: row.get(0)?,
                        mtime: row.get(1)?,
                        record_count: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(marker)
    }
}

fn migration_v1(conn: &Connection) -> Result<()> {
    debug!("Running migration v1: token records and file markers");
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS token_records (
            request_id TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            model TEXT NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            cache_read_tokens INTEGER NOT NULL,
            cache_write_tokens INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_token_records_timestamp
         ON token_records(timestamp);

        CREATE TABLE IF NOT EXISTS ingested_files (
            path TEXT PRIMARY KEY,
            mtime TEXT NOT NULL,
            record_count INTEGER NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (1);",
    )?;
    Ok(())
}

fn upsert_in_tx(tx: &Transaction, records: &[TokenRecord]) -> Result<usize> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO token_records
         (request_id, timestamp, model, input_tokens, output_tokens,
          cache_read_tokens, cache_write_tokens)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(request_id) DO UPDATE SET
            timestamp = excluded.timestamp,
            model = excluded.model,
            input_tokens = excluded.input_tokens,
            output_tokens = excluded.output_tokens,
            cache_read_tokens = excluded.cache_read_tokens,
            cache_write_tokens = excluded.cache_write_tokens
         WHERE excluded.output_tokens > token_records.output_tokens",
    )?;

    let mut changed = 0;
    for record in records {
        changed += stmt.execute(params![
            record.request_id,
            format_ts(record.timestamp),
            record.model,
            record.input_tokens,
            record.output_tokens,
            record.cache_read_tokens,
            record.cache_write_tokens,
        ])?;
    }
    Ok(changed)
}

/// Fixed-width millisecond timestamps keep text order equal to time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

struct RawRecord {
    request_id: String,
    timestamp: String,
    model: String,
    input_tokens: i64,
    output_tokens: i64,
    cache_read_tokens: i64,
    cache_write_tokens: i64,
}

impl RawRecord {
    fn into_record(self) -> Result<TokenRecord> {
        Ok(TokenRecord {
            request_id: self.request_id,
            timestamp: DateTime::parse_from_rfc3339(&self.timestamp)?.with_timezone(&Utc),
            model: self.model,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_read_tokens: self.cache_read_tokens,
            cache_write_tokens: self.cache_write_tokens,
        })
    }
}

fn raw_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        request_id: row.get(0)?,
        timestamp: row.get(1)?,
        model: row.get(2)?,
        input_tokens: row.get(3)?,
        output_tokens: row.get(4)?,
        cache_read_tokens: row.get(5)?,
        cache_write_tokens: row.get(6)?,
    })
}
