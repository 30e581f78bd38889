use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::Connection;

use crate::error::AppError;

/// A schema step, applied once and recorded by name in `_migrations`.
struct Migration {
    name: &'static str,
    sql: &'static str,
}

macro_rules! migration {
    ($name:literal) => {
        Migration {
            name: $name,
            sql: include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../../migrations/", $name)),
        }
    };
}

/// Applied in this order; names sort the same way.
const MIGRATIONS: [Migration; 3] = [
    migration!("0001_init.sql"),
    migration!("0002_add_incident_times.sql"),
    migration!("0003_sync_watermark.sql"),
];

pub fn open(path: &Path) -> Result<Connection, AppError> {
    Connection::open(path).map_err(|e| {
        AppError::storage(
            "DB_OPEN_FAILED",
            "Failed to open tracker database",
            format!("path={}: {}", path.display(), e),
        )
    })
}

pub fn open_in_memory() -> Result<Connection, AppError> {
    Connection::open_in_memory().map_err(|e| {
        AppError::new("DB_OPEN_FAILED", "Failed to open in-memory tracker database")
            .with_details(e.to_string())
    })
}

/// Open the tracker database at `path` and bring its schema up to date.
pub fn open_and_migrate(path: &Path) -> Result<Connection, AppError> {
    let mut conn = open(path)?;
    migrate(&mut conn)?;
    Ok(conn)
}

fn apply(conn: &mut Connection, m: &Migration) -> Result<(), AppError> {
    let failed = |what: &str, e: rusqlite::Error| {
        AppError::new("DB_MIGRATION_FAILED", format!("{what} {}", m.name)).with_details(e.to_string())
    };

    let tx = conn
        .transaction()
        .map_err(|e| failed("Could not start transaction for", e))?;
    tx.execute_batch(m.sql).map_err(|e| failed("Failed to apply", e))?;
    tx.execute(
        "INSERT INTO _migrations(name, applied_at) VALUES (?1, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        [m.name],
    )
    .map_err(|e| failed("Failed to record", e))?;
    tx.commit().map_err(|e| failed("Failed to commit", e))
}

/// Apply pending migrations. Safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<(), AppError> {
    conn.execute_batch(
        r#"
      PRAGMA foreign_keys = ON;
      CREATE TABLE IF NOT EXISTS _migrations (
        name TEXT PRIMARY KEY NOT NULL,
        applied_at TEXT NOT NULL
      );
    "#,
    )
    .map_err(|e| {
        AppError::new("DB_MIGRATIONS_TABLE_FAILED", "Failed to prepare migrations table")
            .with_details(e.to_string())
    })?;

    let applied = applied_migrations(conn)?;
    for m in MIGRATIONS.iter().filter(|m| !applied.contains(m.name)) {
        apply(conn, m)?;
        tracing::info!(migration = m.name, "applied schema migration");
    }
    Ok(())
}

fn applied_migrations(conn: &Connection) -> Result<BTreeSet<String>, AppError> {
    let query_failed = |e: rusqlite::Error| {
        AppError::new("DB_MIGRATIONS_QUERY_FAILED", "Failed to read applied migrations")
            .with_details(e.to_string())
    };
    let mut stmt = conn
        .prepare("SELECT name FROM _migrations")
        .map_err(query_failed)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(query_failed)?
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(query_failed)?;
    Ok(names)
}

/// Names of applied migrations, sorted.
pub fn list_migration_names(conn: &Connection) -> Result<Vec<String>, AppError> {
    Ok(applied_migrations(conn)?.into_iter().collect())
}
