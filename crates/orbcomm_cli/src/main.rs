use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

use orbcomm_core::error::AppError;
use orbcomm_core::ingest::ParserConfig;
use orbcomm_core::store::{MemoryStore, SqliteStore};
use orbcomm_core::{backfill, backup, db, metrics, reconcile, repo, sync};

mod input;

/// Tracks ORBCOMM service notifications: pairs Open and Resolved emails per incident and
/// reports how long incidents lasted and how long resolution took to be announced.
#[derive(clap::Parser, Debug)]
#[clap(name = "orbcomm", version)]
struct Args {
    /// Log filter, e.g. `info` or `orbcomm_core=debug`.
    #[clap(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log: String,
    /// Emit logs as JSON lines.
    #[clap(long, global = true)]
    log_json: bool,
    /// Directory holding the tracker database. Defaults to `~/.orbcomm`.
    #[clap(long, global = true, env = "ORBCOMM_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Tracker database file. Defaults to `<data-dir>/tracker.db`.
    #[clap(long, global = true, env = "DATABASE_PATH")]
    database_path: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Parse, store and pair emails from a JSON export file.
    Ingest(IngestArgs),
    /// Recompute every pair from stored records.
    Relink,
    /// Re-parse stored Resolved notifications and refresh incident durations.
    Backfill {
        #[clap(long)]
        subject_marker: Option<String>,
    },
    /// Print aggregate statistics.
    Stats {
        #[clap(long)]
        include_archived: bool,
    },
    /// List pairs, or show one pair with its records.
    Pairs {
        reference_number: Option<String>,
    },
    /// Archive records received more than `--days` ago.
    Archive {
        #[clap(long, env = "EMAIL_ARCHIVE_DAYS", default_value = "180")]
        days: i64,
    },
    /// Save a statistics snapshot.
    Snapshot,
    /// Write a consistent copy of the database plus a manifest into `--dest`.
    Backup {
        #[clap(long)]
        dest: PathBuf,
    },
    /// Show database location, schema and the last successful sync.
    Status {
        #[clap(long, default_value = DEFAULT_MAILBOX)]
        mailbox: String,
    },
}

const DEFAULT_MAILBOX: &str = "default";

#[derive(clap::Args, Debug)]
struct IngestArgs {
    /// JSON array of `{message_id, subject, body, received_at, source_mailbox?}`.
    file: PathBuf,
    #[clap(long, default_value = DEFAULT_MAILBOX)]
    mailbox: String,
    #[clap(long, env = "EMAIL_BATCH_SIZE", default_value = "100")]
    batch_size: usize,
    /// Ignore the last successful sync and consider every email in the file.
    #[clap(long)]
    full: bool,
    /// Parse and pair in memory without touching the database.
    #[clap(long)]
    dry_run: bool,
    #[clap(long)]
    subject_marker: Option<String>,
}

fn init_logging(args: &Args) {
    let builder = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log))
        .with_target(false);
    if args.log_json {
        builder.json().flatten_event(true).init();
    } else {
        builder.init();
    }
}

fn data_dir(args: &Args) -> Result<PathBuf, AppError> {
    if let Some(dir) = &args.data_dir {
        return Ok(dir.clone());
    }
    let home = std::env::var_os("HOME").ok_or_else(|| {
        AppError::new("DB_PATH_FAILED", "Cannot resolve data directory")
            .with_details("set ORBCOMM_DATA_DIR, DATABASE_PATH or HOME")
    })?;
    Ok(PathBuf::from(home).join(".orbcomm"))
}

fn database_path(args: &Args) -> Result<PathBuf, AppError> {
    if let Some(path) = &args.database_path {
        return Ok(path.clone());
    }
    let dir = data_dir(args)?;
    fs::create_dir_all(&dir).map_err(|e| {
        AppError::new("DB_PATH_FAILED", "Failed to create data directory")
            .with_details(format!("path={}: {}", dir.display(), e))
    })?;
    Ok(dir.join("tracker.db"))
}

fn now_rfc3339_utc() -> Result<String, AppError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| AppError::new("TIME_FORMAT_FAILED", "Failed to format time").with_details(e.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| {
        AppError::new("OUTPUT_SERIALIZE_FAILED", "Failed to serialize output").with_details(e.to_string())
    })?;
    println!("{text}");
    Ok(())
}

fn parser_config(subject_marker: Option<String>) -> ParserConfig {
    match subject_marker {
        Some(subject_marker) => ParserConfig { subject_marker },
        None => ParserConfig::default(),
    }
}

#[derive(Serialize)]
struct IngestOutput {
    rejected: Vec<sync::EmailFailure>,
    #[serde(flatten)]
    result: IngestResult,
}

#[derive(Serialize)]
#[serde(untagged)]
enum IngestResult {
    Sync(sync::SyncReport),
    DryRun {
        summary: sync::BatchSummary,
        pairs: Vec<orbcomm_core::domain::NotificationPair>,
    },
}

fn ingest(db_path: &Path, args: IngestArgs) -> Result<(), AppError> {
    let text = fs::read_to_string(&args.file).map_err(|e| {
        AppError::new("INGEST_READ_FAILED", "Failed to read email export")
            .with_details(format!("path={}: {}", args.file.display(), e))
    })?;
    let loaded = input::load_emails(&text, &args.mailbox)?;
    let config = parser_config(args.subject_marker);

    let result = if args.dry_run {
        let mut store = MemoryStore::new();
        let summary = sync::process_batch(&mut store, &loaded.emails, &config);
        IngestResult::DryRun {
            summary,
            pairs: store.pairs().cloned().collect(),
        }
    } else {
        let mut conn = db::open_and_migrate(db_path)?;
        let since = if args.full {
            None
        } else {
            sync::last_successful_sync(&conn, &args.mailbox)?
        };
        let request = sync::SyncRequest {
            source_mailbox: args.mailbox,
            since,
            batch_size: args.batch_size,
            parser: config,
        };
        IngestResult::Sync(sync::run_sync(&mut conn, &request, &loaded.emails)?)
    };

    print_json(&IngestOutput {
        rejected: loaded.rejected,
        result,
    })
}

fn relink(db_path: &Path) -> Result<(), AppError> {
    let mut conn = db::open_and_migrate(db_path)?;
    let tx = conn.transaction().map_err(|e| {
        AppError::storage("DB_TX_FAILED", "Failed to start relink transaction", e)
    })?;
    let summary = {
        let mut store = SqliteStore::new(&tx);
        reconcile::relink_all(&mut store)?
    };
    tx.commit()
        .map_err(|e| AppError::storage("DB_TX_FAILED", "Failed to commit relink", e))?;
    print_json(&summary)
}

#[derive(Serialize)]
struct StatusOutput {
    database_path: String,
    schema_migrations: Vec<String>,
    notifications: i64,
    pairs: usize,
    mailbox: String,
    last_successful_sync: Option<String>,
}

fn status(db_path: &Path, mailbox: String) -> Result<(), AppError> {
    let conn = db::open_and_migrate(db_path)?;
    let last = sync::last_successful_sync(&conn, &mailbox)?
        .map(|c| c.received_at.format(&Rfc3339))
        .transpose()
        .map_err(|e| AppError::new("TIME_FORMAT_FAILED", "Failed to format time").with_details(e.to_string()))?;
    print_json(&StatusOutput {
        database_path: db_path.to_string_lossy().to_string(),
        schema_migrations: db::list_migration_names(&conn)?,
        notifications: repo::count_records(&conn)?,
        pairs: repo::list_pairs(&conn)?.len(),
        mailbox,
        last_successful_sync: last,
    })
}

fn run(args: Args) -> Result<(), AppError> {
    let db_path = database_path(&args)?;
    tracing::debug!(database = %db_path.display(), command = ?args.command, "starting");

    match args.command {
        Command::Ingest(ingest_args) => ingest(&db_path, ingest_args),
        Command::Relink => relink(&db_path),
        Command::Backfill { subject_marker } => {
            let mut conn = db::open_and_migrate(&db_path)?;
            print_json(&backfill::reprocess_resolved(&mut conn, &parser_config(subject_marker))?)
        }
        Command::Stats { include_archived } => {
            let conn = db::open_and_migrate(&db_path)?;
            print_json(&metrics::compute_stats(&conn, include_archived)?)
        }
        Command::Pairs { reference_number } => {
            let conn = db::open_and_migrate(&db_path)?;
            match reference_number {
                Some(r) => print_json(&repo::get_pair_detail(&conn, &r)?),
                None => print_json(&repo::list_pairs(&conn)?),
            }
        }
        Command::Archive { days } => {
            let conn = db::open_and_migrate(&db_path)?;
            let cutoff = OffsetDateTime::now_utc() - Duration::days(days);
            let archived = repo::archive_older_than(&conn, cutoff)?;
            print_json(&serde_json::json!({ "archived": archived, "days": days }))
        }
        Command::Snapshot => {
            let conn = db::open_and_migrate(&db_path)?;
            print_json(&metrics::save_stats_snapshot(&conn)?)
        }
        Command::Backup { dest } => {
            let conn = db::open_and_migrate(&db_path)?;
            let result = backup::create_backup(
                &conn,
                &dest,
                &now_rfc3339_utc()?,
                env!("CARGO_PKG_VERSION"),
            )?;
            print_json(&result)
        }
        Command::Status { mailbox } => status(&db_path, mailbox),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(code = %err.code, retryable = err.retryable, "{err}");
            match serde_json::to_string(&err) {
                Ok(json) => eprintln!("{json}"),
                Err(_) => eprintln!("{err}"),
            }
            ExitCode::FAILURE
        }
    }
}
