use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, DatabaseName};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::list_migration_names;
use crate::error::AppError;

const DB_FILENAME: &str = "tracker.db";
const MANIFEST_FILENAME: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;
const DIR_PREFIX: &str = "OrbcommTrackerBackup_";

/// Row counts per tracker table at the time of the snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableCounts {
    pub notifications: i64,
    pub notification_pairs: i64,
    pub sync_history: i64,
    pub stats_snapshots: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotFile {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupManifest {
    pub manifest_version: u32,
    pub app_version: String,
    pub export_time: String,
    pub schema_migrations: Vec<String>,
    pub counts: TableCounts,
    pub db: SnapshotFile,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub backup_dir: String,
    pub manifest: BackupManifest,
}

fn digest(path: &Path) -> Result<SnapshotFile, AppError> {
    let hash_failed = |e: io::Error| {
        AppError::new("DB_BACKUP_HASH_FAILED", "Could not hash snapshot file")
            .with_details(format!("{}: {e}", path.display()))
    };
    let mut file = fs::File::open(path).map_err(hash_failed)?;
    let mut hasher = Sha256::new();
    let bytes = io::copy(&mut file, &mut hasher).map_err(hash_failed)?;
    Ok(SnapshotFile {
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        sha256: hex::encode(hasher.finalize()),
        bytes,
    })
}

fn table_counts(conn: &Connection) -> Result<TableCounts, AppError> {
    let count = |table: &str| -> Result<i64, AppError> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .map_err(|e| AppError::storage("DB_BACKUP_COUNTS_FAILED", format!("Could not count {table}"), e))
    };
    Ok(TableCounts {
        notifications: count("notifications")?,
        notification_pairs: count("notification_pairs")?,
        sync_history: count("sync_history")?,
        stats_snapshots: count("stats_snapshots")?,
    })
}

/// `2026-02-10T01:00:00Z` becomes `OrbcommTrackerBackup_2026_02_10T01_00_00Z`.
fn backup_dir_name(export_time: &str) -> String {
    let stamp: String = export_time
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' => c,
            _ => '_',
        })
        .collect();
    format!("{DIR_PREFIX}{stamp}")
}

fn fresh_backup_dir(destination_dir: &Path, export_time: &str) -> Result<PathBuf, AppError> {
    if !destination_dir.is_dir() {
        return Err(
            AppError::new("DB_BACKUP_DEST_NOT_DIR", "Backup target is not a directory")
                .with_details(destination_dir.display().to_string()),
        );
    }
    let dir = destination_dir.join(backup_dir_name(export_time));
    if dir.exists() {
        return Err(
            AppError::new("DB_BACKUP_DEST_EXISTS", "A backup for this export time already exists")
                .with_details(dir.display().to_string()),
        );
    }
    fs::create_dir(&dir).map_err(|e| {
        AppError::new("DB_BACKUP_MKDIR_FAILED", "Could not create backup folder")
            .with_details(format!("{}: {e}", dir.display()))
    })?;
    Ok(dir)
}

/// Snapshot the tracker database into `destination_dir/OrbcommTrackerBackup_<time>/`.
///
/// The copy uses SQLite's online backup, so it is consistent while `conn` stays open.
/// The folder also gets a `manifest.json` with the copy's checksum and row counts.
pub fn create_backup(
    conn: &Connection,
    destination_dir: &Path,
    export_time: &str,
    app_version: &str,
) -> Result<BackupOutcome, AppError> {
    let dir = fresh_backup_dir(destination_dir, export_time)?;
    let db_path = dir.join(DB_FILENAME);

    conn.backup(DatabaseName::Main, &db_path, None)
        .map_err(|e| AppError::storage("DB_BACKUP_DB_SNAPSHOT_FAILED", "SQLite backup failed", e))?;

    let manifest = BackupManifest {
        manifest_version: MANIFEST_VERSION,
        app_version: app_version.to_owned(),
        export_time: export_time.to_owned(),
        schema_migrations: list_migration_names(conn)?,
        counts: table_counts(conn)?,
        db: digest(&db_path)?,
    };
    write_manifest(&dir, &manifest)?;

    tracing::info!(
        backup_dir = %dir.display(),
        notifications = manifest.counts.notifications,
        pairs = manifest.counts.notification_pairs,
        "backup created"
    );
    Ok(BackupOutcome {
        backup_dir: dir.display().to_string(),
        manifest,
    })
}

fn write_manifest(dir: &Path, manifest: &BackupManifest) -> Result<(), AppError> {
    let json = serde_json::to_vec_pretty(manifest).map_err(|e| {
        AppError::new("DB_BACKUP_MANIFEST_SERIALIZE_FAILED", "Could not encode manifest")
            .with_details(e.to_string())
    })?;
    fs::write(dir.join(MANIFEST_FILENAME), json).map_err(|e| {
        AppError::new("DB_BACKUP_MANIFEST_WRITE_FAILED", "Could not write manifest")
            .with_details(e.to_string())
    })
}

pub fn read_manifest(backup_dir: &Path) -> Result<BackupManifest, AppError> {
    let path = backup_dir.join(MANIFEST_FILENAME);
    let bytes = fs::read(&path).map_err(|e| {
        AppError::new("DB_BACKUP_MANIFEST_READ_FAILED", "Could not read manifest")
            .with_details(format!("{}: {e}", path.display()))
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        AppError::new("DB_BACKUP_MANIFEST_INVALID", "Manifest is not valid JSON")
            .with_details(e.to_string())
    })
}

/// Re-hash the copied database and compare it with its manifest.
pub fn verify_backup(backup_dir: &Path) -> Result<BackupManifest, AppError> {
    let manifest = read_manifest(backup_dir)?;
    let actual = digest(&backup_dir.join(&manifest.db.filename))?;
    if actual != manifest.db {
        return Err(
            AppError::new("DB_BACKUP_CHECKSUM_MISMATCH", "Backup database does not match its manifest")
                .with_details(format!(
                    "expected {} ({} bytes), found {} ({} bytes)",
                    manifest.db.sha256, manifest.db.bytes, actual.sha256, actual.bytes
                )),
        );
    }
    Ok(manifest)
}
