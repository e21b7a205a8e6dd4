//! tally - rate-limit usage tracker
//!
//! Command line front end over the tally stores. The long-running fetch
//! loop is driven by an embedding application through `tally-fetch`; these
//! commands cover the offline pieces.
//!
//! ## Usage
//!
//! ```bash
//! # Ingest event logs and print window costs
//! tally sync
//!
//! # Print the shared snapshot (read-only)
//! tally status
//!
//! # Print the last 24 hours of readings
//! tally history --hours 24
//!
//! # Persist a captured usage payload as one fetch cycle
//! tally record payload.json
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tally_alert::AlertEngine;
use tally_core::{LogGuard, TallyConfig, TallyError, init_logging};
use tally_cost::{Ingester, TokenDatabase};
use tally_fetch::{Persistence, payload::parse_usage};
use tally_store::{SnapshotStore, UsageStore};
use tracing::{error, info};

/// Rate-limit usage tracker
///
/// Records usage readings, ingests local event logs for cost estimates,
/// and exposes the shared snapshot.
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging (increases log level)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory for log files (defaults to ~/.tally/logs/)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Config file (defaults to ~/.tally/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest event logs and print the five hour and seven day cost
    Sync,

    /// Print the snapshot as a read-only consumer sees it
    Status,

    /// Print recorded readings
    History {
        /// How far back to look
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Persist a usage payload (JSON file) as one fetch cycle
    Record {
        /// Path to the payload
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match setup_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return exit_code(Some(&e));
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let cause = e.chain().find_map(|c| c.downcast_ref::<TallyError>());
            error!(
                config = cause.is_some_and(TallyError::is_config_error),
                "tally error: {:#}", e
            );
            eprintln!("Error: {:#}", e);
            exit_code(cause)
        }
    }
}

/// Print guidance for setup errors; exit 2 when tally cannot run at all.
fn exit_code(cause: Option<&TallyError>) -> ExitCode {
    let Some(cause) = cause else {
        return ExitCode::from(1);
    };
    if let Some(hint) = cause.guidance() {
        eprintln!("Hint: {}", hint);
    }
    if cause.is_fatal() {
        ExitCode::from(2)
    } else {
        ExitCode::from(1)
    }
}

/// Set up logging based on CLI arguments.
fn setup_logging(cli: &Cli) -> tally_core::Result<LogGuard> {
    init_logging(cli.log_dir.clone(), cli.verbose > 0)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = TallyConfig::load_or_default(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Command::Sync => sync(&config),
        Command::Status => status(&config),
        Command::History { hours } => history(&config, hours),
        Command::Record { file } => record(&config, &file),
    }
}

fn sync(config: &TallyConfig) -> anyhow::Result<()> {
    config.ensure_data_dir()?;
    let db = TokenDatabase::open(config.token_db_path()).context("failed to open token store")?;
    let ingester = Ingester::new(db);

    let report = ingester
        .sync(&config.log_dirs)
        .context("event log sync failed")?;
    info!(
        files = report.files_parsed,
        records = report.records_upserted,
        "Sync finished"
    );

    let now = Utc::now();
    let five_hour = ingester.window_cost(5, now)?;
    let seven_day = ingester.window_cost(7 * 24, now)?;

    print_json(&serde_json::json!({
        "sync": report,
        "five_hour": five_hour,
        "seven_day": seven_day,
    }))
}

fn status(config: &TallyConfig) -> anyhow::Result<()> {
    let path = config.snapshot_db_path();
    let store = SnapshotStore::open_read_only(&path)
        .with_context(|| format!("failed to open snapshot at {}", path.display()))?;
    let view = store.read().context("snapshot has no state row yet")?;
    print_json(&view)
}

fn history(config: &TallyConfig, hours: i64) -> anyhow::Result<()> {
    anyhow::ensure!(hours > 0, "--hours must be positive");
    config.ensure_data_dir()?;
    let store = UsageStore::open(config.usage_db_path()).context("failed to open usage store")?;
    print_json(&serde_json::json!({
        "sessions": store.session_counts(),
        "latest": store.latest(),
        "entries": store.history(chrono::Duration::hours(hours)),
    }))
}

fn record(config: &TallyConfig, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let payload: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;

    let now = Utc::now();
    let reading = parse_usage(&payload, now).context("unrecognized usage payload")?;

    config.ensure_data_dir()?;
    let persistence = Persistence {
        usage: UsageStore::open(config.usage_db_path())?,
        snapshot: SnapshotStore::open(config.snapshot_db_path())?,
        ingester: Ingester::new(TokenDatabase::open(config.token_db_path())?),
        alerts: Arc::new(AlertEngine::with_log_notifier(config.alerts.clone())),
        log_dirs: config.log_dirs.clone(),
    };

    let outcome = persistence.apply(reading, now);
    info!(alerts = outcome.alerts.len(), "Reading recorded");

    print_json(&serde_json::json!({
        "reading": outcome.reading,
        "five_hour_cost": outcome.five_hour_cost,
        "seven_day_cost": outcome.seven_day_cost,
        "alerts": outcome.alerts,
    }))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
