use std::collections::BTreeMap;

use rusqlite::{Connection, Params};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformIncidentStats {
    pub count: i64,
    pub avg_duration_minutes: f64,
    pub total_duration_minutes: i64,
}

/// Aggregate view of the tracker.
///
/// Averages are `None` when nothing contributes to them; a missing value is never reported
/// as zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationStats {
    pub total_notifications: i64,
    /// Distinct references with Open or Continuing records and no Resolved record.
    pub open_count: i64,
    pub resolved_count: i64,
    pub continuing_count: i64,
    pub platform_breakdown: BTreeMap<String, i64>,
    pub event_type_breakdown: BTreeMap<String, i64>,
    /// Mean notification delay over complete pairs.
    pub avg_time_to_resolve_minutes: Option<f64>,
    /// Mean stated outage length over Resolved records.
    pub avg_incident_duration_minutes: Option<f64>,
    pub platform_incident_stats: BTreeMap<String, PlatformIncidentStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    pub id: i64,
    pub snapshot_at: String,
    pub stats: NotificationStats,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn query_err(what: &str, e: rusqlite::Error) -> AppError {
    AppError::new("DB_QUERY_FAILED", format!("Failed to compute {what}")).with_details(e.to_string())
}

fn scalar<T: rusqlite::types::FromSql>(
    conn: &Connection,
    what: &str,
    sql: &str,
    params: impl Params,
) -> Result<T, AppError> {
    conn.query_row(sql, params, |row| row.get(0))
        .map_err(|e| query_err(what, e))
}

fn breakdown(
    conn: &Connection,
    column: &str,
    include_archived: bool,
) -> Result<BTreeMap<String, i64>, AppError> {
    let sql = format!(
        "SELECT {column}, COUNT(*) FROM notifications
         WHERE (?1 OR is_archived = 0)
         GROUP BY {column}"
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| query_err(column, e))?;
    let rows = stmt
        .query_map([include_archived], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(|e| query_err(column, e))?;

    let mut out = BTreeMap::new();
    for r in rows {
        let (k, v) = r.map_err(|e| query_err(column, e))?;
        out.insert(k, v);
    }
    Ok(out)
}

fn platform_incident_stats(
    conn: &Connection,
    include_archived: bool,
) -> Result<BTreeMap<String, PlatformIncidentStats>, AppError> {
    let mut stmt = conn
        .prepare(
            r#"
      SELECT platform, COUNT(*), AVG(incident_duration_minutes), SUM(incident_duration_minutes)
      FROM notifications
      WHERE status = 'Resolved' AND incident_duration_minutes IS NOT NULL
        AND (?1 OR is_archived = 0)
      GROUP BY platform
      "#,
        )
        .map_err(|e| query_err("platform incident stats", e))?;
    let rows = stmt
        .query_map([include_archived], |row| {
            Ok((
                row.get::<_, String>(0)?,
                PlatformIncidentStats {
                    count: row.get(1)?,
                    avg_duration_minutes: round2(row.get(2)?),
                    total_duration_minutes: row.get(3)?,
                },
            ))
        })
        .map_err(|e| query_err("platform incident stats", e))?;

    let mut out = BTreeMap::new();
    for r in rows {
        let (k, v) = r.map_err(|e| query_err("platform incident stats", e))?;
        out.insert(k, v);
    }
    Ok(out)
}

pub fn compute_stats(conn: &Connection, include_archived: bool) -> Result<NotificationStats, AppError> {
    let total_notifications: i64 = scalar(
        conn,
        "total",
        "SELECT COUNT(*) FROM notifications WHERE (?1 OR is_archived = 0)",
        [include_archived],
    )?;

    let status_breakdown = breakdown(conn, "status", include_archived)?;

    // A Resolved record anywhere, archived or not, closes the reference.
    let open_count: i64 = scalar(
        conn,
        "open count",
        r#"
      SELECT COUNT(DISTINCT reference_number) FROM notifications
      WHERE status IN ('Open', 'Continuing')
        AND (?1 OR is_archived = 0)
        AND reference_number NOT IN (
          SELECT reference_number FROM notifications WHERE status = 'Resolved'
        )
      "#,
        [include_archived],
    )?;

    let avg_time_to_resolve: Option<f64> = scalar(
        conn,
        "average time to resolve",
        r#"
      SELECT AVG(p.time_to_resolve_minutes)
      FROM notification_pairs p
      JOIN notifications r ON r.id = p.resolved_notification_id
      WHERE p.time_to_resolve_minutes IS NOT NULL
        AND (?1 OR r.is_archived = 0)
      "#,
        [include_archived],
    )?;

    let avg_incident_duration: Option<f64> = scalar(
        conn,
        "average incident duration",
        r#"
      SELECT AVG(incident_duration_minutes) FROM notifications
      WHERE status = 'Resolved' AND incident_duration_minutes IS NOT NULL
        AND (?1 OR is_archived = 0)
      "#,
        [include_archived],
    )?;

    Ok(NotificationStats {
        total_notifications,
        open_count,
        resolved_count: status_breakdown.get("Resolved").copied().unwrap_or(0),
        continuing_count: status_breakdown.get("Continuing").copied().unwrap_or(0),
        platform_breakdown: breakdown(conn, "platform", include_archived)?,
        event_type_breakdown: breakdown(conn, "event_type", include_archived)?,
        avg_time_to_resolve_minutes: avg_time_to_resolve.map(round2),
        avg_incident_duration_minutes: avg_incident_duration.map(round2),
        platform_incident_stats: platform_incident_stats(conn, include_archived)?,
    })
}

/// Persist the current (unarchived) statistics as a snapshot row.
pub fn save_stats_snapshot(conn: &Connection) -> Result<StatsSnapshot, AppError> {
    let stats = compute_stats(conn, false)?;
    let to_json = |v: &BTreeMap<String, i64>| {
        serde_json::to_string(v).map_err(|e| {
            AppError::new("STATS_SNAPSHOT_SERIALIZE_FAILED", "Failed to serialize breakdown")
                .with_details(e.to_string())
        })
    };

    conn.execute(
        r#"
      INSERT INTO stats_snapshots(
        snapshot_at, total_notifications, open_count, resolved_count, continuing_count,
        avg_time_to_resolve_minutes, avg_incident_duration_minutes,
        platform_breakdown_json, event_type_breakdown_json
      ) VALUES (strftime('%Y-%m-%dT%H:%M:%SZ','now'), ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
      "#,
        rusqlite::params![
            stats.total_notifications,
            stats.open_count,
            stats.resolved_count,
            stats.continuing_count,
            stats.avg_time_to_resolve_minutes,
            stats.avg_incident_duration_minutes,
            to_json(&stats.platform_breakdown)?,
            to_json(&stats.event_type_breakdown)?,
        ],
    )
    .map_err(|e| AppError::storage("STATS_SNAPSHOT_FAILED", "Failed to save stats snapshot", e))?;

    let id = conn.last_insert_rowid();
    let snapshot_at: String = scalar(
        conn,
        "snapshot time",
        "SELECT snapshot_at FROM stats_snapshots WHERE id = ?1",
        [id],
    )?;
    tracing::info!(id, total = stats.total_notifications, open = stats.open_count, "stats snapshot saved");

    Ok(StatsSnapshot {
        id,
        snapshot_at,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn empty_tracker_reports_unknown_averages() {
        let mut conn = db::open_in_memory().unwrap();
        db::migrate(&mut conn).unwrap();

        let stats = compute_stats(&conn, false).unwrap();
        assert_eq!(stats.total_notifications, 0);
        assert_eq!(stats.open_count, 0);
        assert_eq!(stats.avg_time_to_resolve_minutes, None);
        assert_eq!(stats.avg_incident_duration_minutes, None);
        assert!(stats.platform_incident_stats.is_empty());

        let snap = save_stats_snapshot(&conn).unwrap();
        assert_eq!(snap.stats, stats);
        assert!(snap.snapshot_at.ends_with('Z'));
    }
}
