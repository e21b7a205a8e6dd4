//! Data models for token accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token usage of one API request, keyed by its request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Request identifier from the event log (natural key)
    pub request_id: String,

    /// When the request was logged
    pub timestamp: DateTime<Utc>,

    /// Model identifier (e.g., "claude-opus-4-6")
    pub model: String,

    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
}

impl TokenRecord {
    /// Create a record with no cache usage.
    pub fn new(
        request_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        model: impl Into<String>,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp,
            model: model.into(),
            input_tokens,
            output_tokens,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        }
    }

    /// Set cache tokens.
    pub fn with_cache(mut self, read: i64, write: i64) -> Self {
        self.cache_read_tokens = read;
        self.cache_write_tokens = write;
        self
    }
}

/// Summed cost over a trailing window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub total_cost_usd: f64,
    pub record_count: usize,

    /// Oldest record in the window (None when empty)
    pub oldest: Option<DateTime<Utc>>,

    /// Newest record in the window (None when empty)
    pub newest: Option<DateTime<Utc>>,
}

/// Per-file ingestion cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMarker {
    pub path: String,

    /// Modification time as observed at last ingest
    pub mtime: String,

    pub record_count: i64,
}

/// Summary returned by one ingestion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// `.jsonl` files discovered
    pub files_seen: usize,

    /// Files whose mtime matched their marker
    pub files_skipped: usize,

    pub files_parsed: usize,

    /// Files that could not be read; retried next pass
    pub files_failed: usize,

    /// Rows inserted or replaced in the token table
    pub records_upserted: usize,

    /// Malformed lines skipped across all parsed files
    pub lines_skipped: usize,
}
