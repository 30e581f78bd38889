use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::{NotificationPair, NotificationRecord, Status};
use crate::error::AppError;
use crate::normalize::timestamps::canonicalize_rfc3339_utc;
use crate::store::sqlite::{pair_from_row, record_from_row, PAIR_COLUMNS, RECORD_COLUMNS};

/// A pair with the records it links, for presentation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairDetail {
    pub pair: NotificationPair,
    pub open: Option<NotificationRecord>,
    pub resolved: Option<NotificationRecord>,
}

fn collect_records(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<NotificationRecord>, AppError> {
    let mut stmt = conn.prepare(sql).map_err(|e| {
        AppError::new("DB_QUERY_FAILED", "Failed to prepare notifications query")
            .with_details(e.to_string())
    })?;
    let rows = stmt.query_map(params, record_from_row).map_err(|e| {
        AppError::new("DB_QUERY_FAILED", "Failed to query notifications").with_details(e.to_string())
    })?;

    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to decode notification row")
                .with_details(e.to_string())
        })?);
    }
    Ok(out)
}

/// Newest first. Archived records are hidden unless `include_archived`.
pub fn list_records(
    conn: &Connection,
    include_archived: bool,
) -> Result<Vec<NotificationRecord>, AppError> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM notifications
         WHERE (?1 OR is_archived = 0)
         ORDER BY received_at DESC, id DESC"
    );
    collect_records(conn, &sql, [include_archived])
}

pub fn list_records_by_status(
    conn: &Connection,
    status: Status,
    include_archived: bool,
) -> Result<Vec<NotificationRecord>, AppError> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM notifications
         WHERE status = ?1 AND (?2 OR is_archived = 0)
         ORDER BY received_at DESC, id DESC"
    );
    collect_records(conn, &sql, rusqlite::params![status.as_str(), include_archived])
}

/// Every record filed under one reference number, oldest first.
pub fn list_records_for_reference(
    conn: &Connection,
    reference_number: &str,
) -> Result<Vec<NotificationRecord>, AppError> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM notifications
         WHERE reference_number = ?1
         ORDER BY received_at ASC, id ASC"
    );
    collect_records(conn, &sql, [reference_number])
}

pub fn count_records(conn: &Connection) -> Result<i64, AppError> {
    conn.query_row("SELECT COUNT(*) FROM notifications", [], |row| row.get(0))
        .map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to count notifications")
                .with_details(e.to_string())
        })
}

pub fn get_record(conn: &Connection, id: i64) -> Result<NotificationRecord, AppError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM notifications WHERE id = ?1");
    conn.query_row(&sql, [id], record_from_row)
        .optional()
        .map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to query notification")
                .with_details(e.to_string())
        })?
        .ok_or_else(|| {
            AppError::new("DB_NOT_FOUND", "Notification not found").with_details(format!("id={id}"))
        })
}

/// Pairs ordered by reference number.
pub fn list_pairs(conn: &Connection) -> Result<Vec<NotificationPair>, AppError> {
    let sql = format!("SELECT {PAIR_COLUMNS} FROM notification_pairs ORDER BY reference_number");
    let mut stmt = conn.prepare(&sql).map_err(|e| {
        AppError::new("DB_QUERY_FAILED", "Failed to prepare pairs query").with_details(e.to_string())
    })?;
    let rows = stmt.query_map([], pair_from_row).map_err(|e| {
        AppError::new("DB_QUERY_FAILED", "Failed to query pairs").with_details(e.to_string())
    })?;

    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to decode pair row").with_details(e.to_string())
        })?);
    }
    Ok(out)
}

pub fn get_pair_detail(conn: &Connection, reference_number: &str) -> Result<PairDetail, AppError> {
    let sql = format!("SELECT {PAIR_COLUMNS} FROM notification_pairs WHERE reference_number = ?1");
    let pair = conn
        .query_row(&sql, [reference_number], pair_from_row)
        .optional()
        .map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to query pair").with_details(e.to_string())
        })?
        .ok_or_else(|| {
            AppError::new("DB_NOT_FOUND", "Pair not found")
                .with_details(format!("reference_number={reference_number}"))
        })?;

    let open = pair.open_notification_id.map(|id| get_record(conn, id)).transpose()?;
    let resolved = pair
        .resolved_notification_id
        .map(|id| get_record(conn, id))
        .transpose()?;

    Ok(PairDetail {
        pair,
        open,
        resolved,
    })
}

/// Flag every unarchived record received before `cutoff`. Returns the number flagged.
///
/// Archiving only hides records from default listings and statistics; pairing still sees them.
pub fn archive_older_than(conn: &Connection, cutoff: OffsetDateTime) -> Result<usize, AppError> {
    let cutoff = canonicalize_rfc3339_utc(cutoff).ok_or_else(|| {
        AppError::new("ARCHIVE_CUTOFF_INVALID", "Archive cutoff cannot be represented")
            .with_details(format!("cutoff={cutoff}"))
    })?;
    let n = conn
        .execute(
            r#"
      UPDATE notifications
      SET is_archived = 1, last_updated = strftime('%Y-%m-%dT%H:%M:%SZ','now')
      WHERE received_at < ?1 AND is_archived = 0
      "#,
            [&cutoff],
        )
        .map_err(|e| AppError::storage("DB_ARCHIVE_FAILED", "Failed to archive notifications", e))?;
    tracing::info!(archived = n, cutoff = %cutoff, "archived notifications");
    Ok(n)
}

/// Human-readable minutes: `45m`, `1.5h`, `2.3d`. `None` is "duration unknown", never zero.
pub fn format_duration_minutes(minutes: Option<i64>) -> String {
    let Some(m) = minutes else {
        return "duration unknown".to_string();
    };
    let hours = m as f64 / 60.0;
    if m < 60 {
        format!("{m}m")
    } else if hours < 24.0 {
        format!("{hours:.1}h")
    } else {
        format!("{:.1}d", hours / 24.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_duration_is_never_zero() {
        assert_eq!(format_duration_minutes(None), "duration unknown");
        assert_eq!(format_duration_minutes(Some(0)), "0m");
        assert_eq!(format_duration_minutes(Some(45)), "45m");
        assert_eq!(format_duration_minutes(Some(90)), "1.5h");
        assert_eq!(format_duration_minutes(Some(60 * 36)), "1.5d");
    }
}
