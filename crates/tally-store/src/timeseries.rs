//! Rate-limit time series.
//!
//! Every successful poll appends one row to `usage_log`. Reset instants are
//! normalized to the nearest hour and mapped to rows in `hourly_sessions`
//! (five hour window) and `weekly_sessions` (seven day window), created on
//! first sight and never updated.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use tally_core::{SessionKey, UsageReading, UsageWindow};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::helpers::{format_ts, open_writable, parse_opt_ts, parse_ts, schema_version};

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// One stored reading joined to its sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLogEntry {
    /// Row id in `usage_log`
    pub id: i64,

    /// The reading as stored
    pub reading: UsageReading,

    /// Normalized five hour session, if the reading carried a reset instant
    pub hourly_session: Option<SessionKey>,

    /// Normalized seven day session, if the reading carried a reset instant
    pub weekly_session: Option<SessionKey>,
}

/// Row counts of the session tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionCounts {
    pub hourly: i64,
    pub weekly: i64,
}

/// SQLite-backed time series of usage readings.
///
/// Cloning shares the underlying connection; there is exactly one writer
/// process per database file.
#[derive(Clone)]
pub struct UsageStore {
    conn: Arc<Mutex<Connection>>,
}

impl UsageStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = open_writable(path.as_ref())?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        let current = schema_version(&conn)?;
        if current < SCHEMA_VERSION {
            info!(current, target = SCHEMA_VERSION, "Running usage store migrations");
        }
        if current < 1 {
            Self::migration_v1(&conn)?;
        }
        Ok(())
    }

    /// Migration to version 1: sessions and the reading log.
    fn migration_v1(conn: &Connection) -> Result<()> {
        debug!("Running migration v1: usage log schema");

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hourly_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                reset_epoch INTEGER NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS weekly_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                reset_epoch INTEGER NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS usage_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                captured_at TEXT NOT NULL,
                five_hour_percent REAL,
                seven_day_percent REAL,
                five_hour_resets_at TEXT,
                seven_day_resets_at TEXT,
                hourly_session_id INTEGER REFERENCES hourly_sessions(id),
                weekly_session_id INTEGER REFERENCES weekly_sessions(id),
                CHECK (five_hour_percent IS NOT NULL OR seven_day_percent IS NOT NULL)
            );

            CREATE INDEX IF NOT EXISTS idx_usage_log_captured_at
             ON usage_log(captured_at);

            INSERT INTO schema_version (version) VALUES (1);",
        )?;

        info!("Migration v1 completed");
        Ok(())
    }

    // ============ Writes ============

    /// Persist a reading, creating or reusing its sessions.
    ///
    /// Returns the new row id. A reading without any percent is skipped and
    /// a storage failure is logged; both return `None`.
    pub fn record(&self, reading: &UsageReading) -> Option<i64> {
        if !reading.has_percent() {
            warn!(captured_at = %reading.captured_at, "Skipping reading without any percent");
            return None;
        }

        match self.try_record(reading) {
            Ok(id) => {
                tally_core::log_reading!(
                    id,
                    five_hour = ?reading.five_hour_percent,
                    seven_day = ?reading.seven_day_percent
                );
                Some(id)
            }
            Err(e) => {
                warn!(error = %e, "Failed to record usage reading");
                None
            }
        }
    }

    fn try_record(&self, reading: &UsageReading) -> Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let hourly_id = reading
            .session(UsageWindow::FiveHour)
            .map(|key| session_id_in_tx(&tx, "hourly_sessions", key))
            .transpose()?;
        let weekly_id = reading
            .session(UsageWindow::SevenDay)
            .map(|key| session_id_in_tx(&tx, "weekly_sessions", key))
            .transpose()?;

        tx.execute(
            "INSERT INTO usage_log
             (captured_at, five_hour_percent, seven_day_percent,
              five_hour_resets_at, seven_day_resets_at,
              hourly_session_id, weekly_session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                format_ts(reading.captured_at),
                reading.five_hour_percent,
                reading.seven_day_percent,
                reading.five_hour_resets_at.map(format_ts),
                reading.seven_day_resets_at.map(format_ts),
                hourly_id,
                weekly_id,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    // ============ Reads ============

    /// Entries captured within the last `window`, oldest first.
    pub fn history(&self, window: Duration) -> Vec<UsageLogEntry> {
        self.history_since(Utc::now() - window)
    }

    /// Entries captured at or after `since`, oldest first.
    pub fn history_since(&self, since: DateTime<Utc>) -> Vec<UsageLogEntry> {
        self.query_entries("WHERE l.captured_at >= ?1", Some(format_ts(since)))
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to load usage history");
                Vec::new()
            })
    }

    /// Every stored entry, oldest first.
    pub fn full_history(&self) -> Vec<UsageLogEntry> {
        self.query_entries("", None).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load full usage history");
            Vec::new()
        })
    }

    /// Most recent entry.
    pub fn latest(&self) -> Option<UsageLogEntry> {
        match self.query_latest() {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Failed to load latest reading");
                None
            }
        }
    }

    /// Highest seven day percent observed at or after `since`.
    ///
    /// `None` when nothing was recorded in range (or the read failed).
    pub fn daily_usage(&self, since: DateTime<Utc>) -> Option<f64> {
        let result = self.lock().and_then(|conn| {
            conn.query_row(
                "SELECT MAX(seven_day_percent) FROM usage_log WHERE captured_at >= ?1",
                params![format_ts(since)],
                |row| row.get::<_, Option<f64>>(0),
            )
            .map_err(StoreError::from)
        });

        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to compute daily usage");
                None
            }
        }
    }

    /// Number of distinct sessions seen so far.
    pub fn session_counts(&self) -> SessionCounts {
        let result = self.lock().and_then(|conn| {
            let hourly = conn.query_row("SELECT COUNT(*) FROM hourly_sessions", [], |row| {
                row.get(0)
            })?;
            let weekly = conn.query_row("SELECT COUNT(*) FROM weekly_sessions", [], |row| {
                row.get(0)
            })?;
            Ok(SessionCounts { hourly, weekly })
        });

        result.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to count sessions");
            SessionCounts::default()
        })
    }

    fn query_latest(&self) -> Result<Option<UsageLogEntry>> {
        let conn = self.lock()?;
        let sql = format!("{ENTRY_SELECT} ORDER BY l.captured_at DESC, l.id DESC LIMIT 1");
        let raw = conn.query_row(&sql, [], RawEntry::from_row).optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    fn query_entries(&self, filter: &str, since: Option<String>) -> Result<Vec<UsageLogEntry>> {
        let conn = self.lock()?;
        let sql = format!("{ENTRY_SELECT} {filter} ORDER BY l.captured_at ASC, l.id ASC");
        let mut stmt = conn.prepare(&sql)?;

        let rows = match since {
            Some(since) => stmt
                .query_map(params![since], RawEntry::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], RawEntry::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };

        rows.into_iter().map(RawEntry::into_entry).collect()
    }
}

const ENTRY_SELECT: &str = "SELECT l.id, l.captured_at, l.five_hour_percent, l.seven_day_percent,
            l.five_hour_resets_at, l.seven_day_resets_at,
            h.reset_epoch, w.reset_epoch
     FROM usage_log l
     LEFT JOIN hourly_sessions h ON l.hourly_session_id = h.id
     LEFT JOIN weekly_sessions w ON l.weekly_session_id = w.id";

/// Get-or-create a session row; the key's row is never updated.
fn session_id_in_tx(tx: &Transaction, table: &str, key: SessionKey) -> Result<i64> {
    tx.execute(
        &format!("INSERT INTO {table} (reset_epoch) VALUES (?1) ON CONFLICT(reset_epoch) DO NOTHING"),
        params![key.epoch()],
    )?;
    let id = tx.query_row(
        &format!("SELECT id FROM {table} WHERE reset_epoch = ?1"),
        params![key.epoch()],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Row as read from SQLite, before timestamp parsing.
struct RawEntry {
    id: i64,
    captured_at: String,
    five_hour_percent: Option<f64>,
    seven_day_percent: Option<f64>,
    five_hour_resets_at: Option<String>,
    seven_day_resets_at: Option<String>,
    hourly_epoch: Option<i64>,
    weekly_epoch: Option<i64>,
}

impl RawEntry {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            captured_at: row.get(1)?,
            five_hour_percent: row.get(2)?,
            seven_day_percent: row.get(3)?,
            five_hour_resets_at: row.get(4)?,
            seven_day_resets_at: row.get(5)?,
            hourly_epoch: row.get(6)?,
            weekly_epoch: row.get(7)?,
        })
    }

    fn into_entry(self) -> Result<UsageLogEntry> {
        Ok(UsageLogEntry {
            id: self.id,
            reading: UsageReading {
                five_hour_percent: self.five_hour_percent,
                seven_day_percent: self.seven_day_percent,
                five_hour_resets_at: parse_opt_ts(self.five_hour_resets_at)?,
                seven_day_resets_at: parse_opt_ts(self.seven_day_resets_at)?,
                captured_at: parse_ts(&self.captured_at)?,
            },
            hourly_session: self.hourly_epoch.map(SessionKey),
            weekly_session: self.weekly_epoch.map(SessionKey),
        })
    }
}
