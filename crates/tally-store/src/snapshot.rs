//! Current-state snapshot shared with read-only consumers.
//!
//! The writer keeps one row (`id = 1`) in `snapshot_state` plus an
//! append-only `snapshot_history`. Consumer processes open the same file
//! with [`SnapshotStore::open_read_only`] and never fetch anything
//! themselves. They have no lock to coordinate with, so every mutation
//! below is a single statement (or a single transaction when a history
//! point is appended alongside); nothing is read back and rewritten from
//! Rust.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tally_core::{UsageReading, UsageWindow};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::helpers::{
    format_ts, open_read_only, open_writable, parse_opt_ts, parse_ts, schema_version,
};

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// Sentinel id of the singleton state row.
const STATE_ID: i64 = 1;

/// The singleton current-state row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub five_hour_percent: Option<f64>,
    pub seven_day_percent: Option<f64>,
    pub five_hour_resets_at: Option<DateTime<Utc>>,
    pub seven_day_resets_at: Option<DateTime<Utc>>,
    pub logged_in: bool,

    /// Projected cost of the full five hour window
    pub predicted_five_hour_cost: Option<f64>,

    /// Projected cost of the full seven day window
    pub predicted_seven_day_cost: Option<f64>,

    /// When the row was last written by a fetch or sign-out
    pub updated_at: DateTime<Utc>,
}

/// One appended history point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHistoryPoint {
    pub recorded_at: DateTime<Utc>,
    pub five_hour_percent: Option<f64>,
    pub seven_day_percent: Option<f64>,
}

/// What a consumer sees: the state plus recent history for each window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotView {
    pub state: SnapshotState,

    /// History points from the last five hours
    pub five_hour_history: Vec<SnapshotHistoryPoint>,

    /// History points from the last seven days
    pub seven_day_history: Vec<SnapshotHistoryPoint>,
}

/// SQLite snapshot store; one writer, any number of read-only handles.
#[derive(Clone)]
pub struct SnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SnapshotStore {
    /// Open or create the store as its writer.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = open_writable(path.as_ref())?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an existing store for reading only.
    ///
    /// Mutating calls on this handle fail inside SQLite and degrade to
    /// logged no-ops like any other storage failure.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = open_read_only(path.as_ref())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
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
            info!(current, target = SCHEMA_VERSION, "Running snapshot store migrations");
        }
        if current < 1 {
            debug!("Running migration v1: snapshot schema");
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS snapshot_state (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    five_hour_percent REAL,
                    seven_day_percent REAL,
                    five_hour_resets_at TEXT,
                    seven_day_resets_at TEXT,
                    logged_in INTEGER NOT NULL DEFAULT 0,
                    predicted_five_hour_cost REAL,
                    predicted_seven_day_cost REAL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS snapshot_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    recorded_at TEXT NOT NULL,
                    five_hour_percent REAL,
                    seven_day_percent REAL
                );

                CREATE INDEX IF NOT EXISTS idx_snapshot_history_recorded_at
                 ON snapshot_history(recorded_at);

                INSERT INTO schema_version (version) VALUES (1);",
            )?;
        }
        Ok(())
    }

    // ============ Writes ============

    /// Merge a fetched reading into the state row and append a history point.
    ///
    /// Absent percents keep the stored value; reset instants and the login
    /// flag always overwrite; cost fields are left alone.
    pub fn apply_fetch(&self, reading: &UsageReading, logged_in: bool) -> bool {
        self.log_failure("apply fetch", self.try_apply_fetch(reading, logged_in))
    }

    fn try_apply_fetch(&self, reading: &UsageReading, logged_in: bool) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO snapshot_state
             (id, five_hour_percent, seven_day_percent, five_hour_resets_at,
              seven_day_resets_at, logged_in, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                five_hour_percent = COALESCE(excluded.five_hour_percent, snapshot_state.five_hour_percent),
                seven_day_percent = COALESCE(excluded.seven_day_percent, snapshot_state.seven_day_percent),
                five_hour_resets_at = excluded.five_hour_resets_at,
                seven_day_resets_at = excluded.seven_day_resets_at,
                logged_in = excluded.logged_in,
                updated_at = excluded.updated_at",
            params![
                STATE_ID,
                reading.five_hour_percent,
                reading.seven_day_percent,
                reading.five_hour_resets_at.map(format_ts),
                reading.seven_day_resets_at.map(format_ts),
                logged_in,
                format_ts(reading.captured_at),
            ],
        )?;

        tx.execute(
            "INSERT INTO snapshot_history (recorded_at, five_hour_percent, seven_day_percent)
             VALUES (?1, ?2, ?3)",
            params![
                format_ts(reading.captured_at),
                reading.five_hour_percent,
                reading.seven_day_percent,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Overwrite only the predicted-cost fields; no-op before the first fetch.
    pub fn apply_predicted_cost(&self, five_hour: Option<f64>, seven_day: Option<f64>) -> bool {
        let result = self.lock().and_then(|conn| {
            conn.execute(
                "UPDATE snapshot_state
                 SET predicted_five_hour_cost = ?2, predicted_seven_day_cost = ?3
                 WHERE id = ?1",
                params![STATE_ID, five_hour, seven_day],
            )
            .map(|_| ())
            .map_err(StoreError::from)
        });
        self.log_failure("apply predicted cost", result)
    }

    /// Null everything user-specific and mark signed out. History is kept.
    pub fn clear_for_sign_out(&self) -> bool {
        let result = self.lock().and_then(|conn| {
            conn.execute(
                "UPDATE snapshot_state
                 SET five_hour_percent = NULL,
                     seven_day_percent = NULL,
                     five_hour_resets_at = NULL,
                     seven_day_resets_at = NULL,
                     predicted_five_hour_cost = NULL,
                     predicted_seven_day_cost = NULL,
                     logged_in = 0,
                     updated_at = ?2
                 WHERE id = ?1",
                params![STATE_ID, format_ts(Utc::now())],
            )
            .map(|_| ())
            .map_err(StoreError::from)
        });
        self.log_failure("clear for sign-out", result)
    }

    /// Delete history points recorded before `before`.
    pub fn prune_history(&self, before: DateTime<Utc>) -> usize {
        let result = self.lock().and_then(|conn| {
            conn.execute(
                "DELETE FROM snapshot_history WHERE recorded_at < ?1",
                params![format_ts(before)],
            )
            .map_err(StoreError::from)
        });

        match result {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "Pruned snapshot history");
                }
                removed
            }
            Err(e) => {
                warn!(error = %e, "Failed to prune snapshot history");
                0
            }
        }
    }

    fn log_failure(&self, operation: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(operation, error = %e, "Snapshot write failed");
                false
            }
        }
    }

    // ============ Reads ============

    /// State plus windowed history as of now; `None` if never fetched.
    pub fn read(&self) -> Option<SnapshotView> {
        self.read_at(Utc::now())
    }

    /// State plus history windows ending at `now`.
    pub fn read_at(&self, now: DateTime<Utc>) -> Option<SnapshotView> {
        match self.try_read(now) {
            Ok(view) => view,
            Err(e) => {
                warn!(error = %e, "Failed to read snapshot");
                None
            }
        }
    }

    fn try_read(&self, now: DateTime<Utc>) -> Result<Option<SnapshotView>> {
        let conn = self.lock()?;

        let Some(state) = read_state(&conn)? else {
            return Ok(None);
        };

        let five_hour_history =
            history_since(&conn, now - UsageWindow::FiveHour.duration())?;
        let seven_day_history =
            history_since(&conn, now - UsageWindow::SevenDay.duration())?;

        Ok(Some(SnapshotView {
            state,
            five_hour_history,
            seven_day_history,
        }))
    }

    /// History points within the last `window`, oldest first.
    pub fn history(&self, window: Duration) -> Vec<SnapshotHistoryPoint> {
        let result = self
            .lock()
            .and_then(|conn| history_since(&conn, Utc::now() - window));
        result.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read snapshot history");
            Vec::new()
        })
    }
}

fn read_state(conn: &Connection) -> Result<Option<SnapshotState>> {
    let raw = conn
        .query_row(
            "SELECT five_hour_percent, seven_day_percent, five_hour_resets_at,
                    seven_day_resets_at, logged_in, predicted_five_hour_cost,
                    predicted_seven_day_cost, updated_at
             FROM snapshot_state WHERE id = ?1",
            params![STATE_ID],
            |row| {
                Ok((
                    row.get::<_, Option<f64>>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            },
        )
        .optional()?;

    let Some((five, seven, five_reset, seven_reset, logged_in, cost5, cost7, updated)) = raw
    else {
        return Ok(None);
    };

    Ok(Some(SnapshotState {
        five_hour_percent: five,
        seven_day_percent: seven,
        five_hour_resets_at: parse_opt_ts(five_reset)?,
        seven_day_resets_at: parse_opt_ts(seven_reset)?,
        logged_in,
        predicted_five_hour_cost: cost5,
        predicted_seven_day_cost: cost7,
        updated_at: parse_ts(&updated)?,
    }))
}

fn history_since(conn: &Connection, since: DateTime<Utc>) -> Result<Vec<SnapshotHistoryPoint>> {
    let mut stmt = conn.prepare_cached(
        "SELECT recorded_at, five_hour_percent, seven_day_percent
         FROM snapshot_history
         WHERE recorded_at >= ?1
         ORDER BY recorded_at ASC, id ASC",
    )?;

    let rows = stmt
        .query_map(params![format_ts(since)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<f64>>(1)?,
                row.get::<_, Option<f64>>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(recorded_at, five, seven)| {
            Ok(SnapshotHistoryPoint {
                recorded_at: parse_ts(&recorded_at)?,
                five_hour_percent: five,
                seven_day_percent: seven,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_before_first_fetch_is_none() {
        let store = SnapshotStore::open_in_memory().unwrap();
        assert!(store.read().is_none());
    }

    #[test]
    fn test_predicted_cost_without_state_is_noop() {
        let store = SnapshotStore::open_in_memory().unwrap();
        assert!(store.apply_predicted_cost(Some(1.0), Some(2.0)));
        assert!(store.read().is_none());
    }

    #[test]
    fn test_singleton_sentinel_enforced() {
        let store = SnapshotStore::open_in_memory().unwrap();
        let conn = store.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO snapshot_state (id, logged_in, updated_at) VALUES (2, 1, 'x')",
            [],
        );
        assert!(result.is_err());
    }
}
