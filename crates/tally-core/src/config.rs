//! Process-wide configuration.
//!
//! One [`TallyConfig`] is loaded at startup and handed to whichever
//! component needs it; nothing reads settings from ambient global state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TallyError};
use crate::logging::default_data_dir;

/// Top-level configuration (`~/.tally/config.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    /// Directory holding the databases and the credential backup
    pub data_dir: PathBuf,

    /// Directories scanned for JSONL event logs
    pub log_dirs: Vec<PathBuf>,

    /// Auto-refresh interval in seconds
    pub refresh_interval_secs: u64,

    /// Login poll interval in seconds while waiting for a session
    pub login_poll_interval_secs: u64,

    /// Minimum seconds between two redirects to the usage page
    pub redirect_cooldown_secs: u64,

    /// Delay before re-checking the session after an external login closes
    pub session_recheck_delay_ms: u64,

    /// Snapshot history retention in days
    pub snapshot_retention_days: u32,

    /// Page the login surface starts on
    pub origin_url: String,

    /// Page the usage is read from once logged in
    pub usage_page_url: String,

    /// Base URL for the usage API
    pub api_base_url: String,

    /// Notification thresholds
    pub alerts: AlertConfig,
}

impl Default for TallyConfig {
    fn default() -> Self {
        let data_dir = default_data_dir().unwrap_or_else(|_| PathBuf::from(".tally"));
        Self {
            data_dir,
            log_dirs: default_log_dirs(),
            refresh_interval_secs: 300,
            login_poll_interval_secs: 2,
            redirect_cooldown_secs: 10,
            session_recheck_delay_ms: 1500,
            snapshot_retention_days: 30,
            origin_url: "https://claude.ai/login".to_string(),
            usage_page_url: "https://claude.ai/settings/usage".to_string(),
            api_base_url: "https://claude.ai".to_string(),
            alerts: AlertConfig::default(),
        }
    }
}

/// How the daily alert period is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DailyMode {
    /// Period is the local calendar day
    #[default]
    Calendar,
    /// Period is the current weekly session
    Session,
}

/// Alert thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Fire the weekly alert when remaining percent drops to this or below
    pub weekly_remaining_threshold: f64,

    /// Fire the five hour alert when remaining percent drops to this or below
    pub hourly_remaining_threshold: f64,

    /// Fire the daily alert when usage since period start reaches this
    pub daily_usage_threshold: f64,

    /// Daily period definition
    pub daily_mode: DailyMode,

    pub weekly_enabled: bool,
    pub hourly_enabled: bool,
    pub daily_enabled: bool,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            weekly_remaining_threshold: 20.0,
            hourly_remaining_threshold: 10.0,
            daily_usage_threshold: 80.0,
            daily_mode: DailyMode::Calendar,
            weekly_enabled: true,
            hourly_enabled: true,
            daily_enabled: true,
        }
    }
}

impl TallyConfig {
    /// Default config file location (`~/.tally/config.yaml`).
    pub fn default_path() -> Result<PathBuf> {
        Ok(default_data_dir()?.join("config.yaml"))
    }

    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TallyError::ConfigNotFound {
                    path: path.to_path_buf(),
                    source: Some(e),
                }
            } else {
                TallyError::io("reading config", path, e)
            }
        })?;

        let config: TallyConfig =
            serde_yaml::from_str(&content).map_err(|e| TallyError::ConfigInvalid {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        config.validate()?;

        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from an explicit path, or fall back to defaults when the
    /// default file does not exist. An explicit path must exist.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        let path = Self::default_path()?;
        if path.exists() {
            Self::load(&path)
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Reject values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval_secs == 0 {
            return Err(TallyError::validation("refresh_interval_secs must be > 0"));
        }
        if self.login_poll_interval_secs == 0 {
            return Err(TallyError::validation("login_poll_interval_secs must be > 0"));
        }

        let thresholds = [
            ("weekly_remaining_threshold", self.alerts.weekly_remaining_threshold),
            ("hourly_remaining_threshold", self.alerts.hourly_remaining_threshold),
            ("daily_usage_threshold", self.alerts.daily_usage_threshold),
        ];
        for (name, value) in thresholds {
            if !(0.0..=100.0).contains(&value) {
                return Err(TallyError::validation(format!(
                    "{name} must be between 0 and 100, got {value}"
                )));
            }
        }

        Ok(())
    }

    /// Time-series database path.
    pub fn usage_db_path(&self) -> PathBuf {
        self.data_dir.join("usage.db")
    }

    /// Snapshot database path (shared with read-only consumers).
    pub fn snapshot_db_path(&self) -> PathBuf {
        self.data_dir.join("snapshot.db")
    }

    /// Token accounting database path.
    pub fn token_db_path(&self) -> PathBuf {
        self.data_dir.join("tokens.db")
    }

    /// Credential backup path.
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn login_poll_interval(&self) -> Duration {
        Duration::from_secs(self.login_poll_interval_secs)
    }

    pub fn redirect_cooldown(&self) -> Duration {
        Duration::from_secs(self.redirect_cooldown_secs)
    }

    pub fn session_recheck_delay(&self) -> Duration {
        Duration::from_millis(self.session_recheck_delay_ms)
    }

    /// Create the data directory if it does not exist.
    pub fn ensure_data_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).map_err(|e| TallyError::DirectoryCreation {
            path: self.data_dir.clone(),
            source: e,
        })
    }
}

/// Event log directories written by the Claude CLI.
pub fn default_log_dirs() -> Vec<PathBuf> {
    let mut dirs_found = Vec::new();
    if let Some(home) = dirs::home_dir() {
        dirs_found.push(home.join(".claude").join("projects"));
        dirs_found.push(home.join(".config").join("claude").join("projects"));
    }
    dirs_found
}
