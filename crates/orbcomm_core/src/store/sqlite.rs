use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};

use crate::domain::{NotificationPair, NotificationRecord, PairLinks, ParsedNotification};
use crate::error::AppError;
use crate::store::{NotificationStore, RecordWrite};

pub(crate) const RECORD_COLUMNS: &str = r#"
        id, message_id, source_mailbox, reference_number,
        received_at, date_received, time_received,
        platform, event_type, status, priority,
        scheduled_date, scheduled_time, duration,
        incident_start_time, incident_end_time, incident_time_zone, incident_duration_minutes,
        affected_services, summary, raw_subject, raw_body,
        is_archived
"#;

pub(crate) const PAIR_COLUMNS: &str = r#"
        id, reference_number, open_notification_id, resolved_notification_id,
        time_to_resolve_minutes, incident_duration_minutes
"#;

const SERVICES_SEPARATOR: &str = "; ";

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn record_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationRecord> {
    let services: String = row.get(18)?;
    Ok(NotificationRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        source_mailbox: row.get(2)?,
        reference_number: row.get(3)?,
        received_at: row.get(4)?,
        date_received: row.get(5)?,
        time_received: row.get(6)?,
        platform: parse_column(row, 7)?,
        event_type: row.get(8)?,
        status: parse_column(row, 9)?,
        priority: parse_column(row, 10)?,
        scheduled_date: row.get(11)?,
        scheduled_time: row.get(12)?,
        duration: row.get(13)?,
        incident_start_time: row.get(14)?,
        incident_end_time: row.get(15)?,
        incident_time_zone: row.get(16)?,
        incident_duration_minutes: row.get(17)?,
        affected_services: services
            .split(SERVICES_SEPARATOR)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        summary: row.get(19)?,
        raw_subject: row.get(20)?,
        raw_body: row.get(21)?,
        is_archived: row.get(22)?,
    })
}

pub(crate) fn pair_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationPair> {
    Ok(NotificationPair {
        id: row.get(0)?,
        reference_number: row.get(1)?,
        open_notification_id: row.get(2)?,
        resolved_notification_id: row.get(3)?,
        time_to_resolve_minutes: row.get(4)?,
        incident_duration_minutes: row.get(5)?,
    })
}

/// [`NotificationStore`] over a tracker database connection (or an open transaction).
pub struct SqliteStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn first_with_status(
        &self,
        reference_number: &str,
        status: &str,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM notifications
             WHERE reference_number = ?1 AND status = ?2
             ORDER BY received_at ASC, id ASC
             LIMIT 1"
        );
        self.conn
            .query_row(&sql, [reference_number, status], record_from_row)
            .optional()
            .map_err(|e| {
                AppError::storage(
                    "DB_QUERY_FAILED",
                    format!("Failed to query {status} record for {reference_number}"),
                    e,
                )
            })
    }
}

impl NotificationStore for SqliteStore<'_> {
    fn get_record_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM notifications WHERE message_id = ?1");
        self.conn
            .query_row(&sql, [message_id], record_from_row)
            .optional()
            .map_err(|e| {
                AppError::storage("DB_QUERY_FAILED", "Failed to query record by message id", e)
            })
    }

    fn get_open_record(
        &self,
        reference_number: &str,
    ) -> Result<Option<NotificationRecord>, AppError> {
        self.first_with_status(reference_number, "Open")
    }

    fn get_resolved_record(
        &self,
        reference_number: &str,
    ) -> Result<Option<NotificationRecord>, AppError> {
        self.first_with_status(reference_number, "Resolved")
    }

    fn upsert_record(
        &mut self,
        message_id: &str,
        parsed: &ParsedNotification,
    ) -> Result<RecordWrite, AppError> {
        let previous: Option<String> = self
            .conn
            .query_row(
                "SELECT reference_number FROM notifications WHERE message_id = ?1",
                [message_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| {
                AppError::storage("DB_QUERY_FAILED", "Failed to check existing record", e)
            })?;

        self.conn
            .execute(
                r#"
          INSERT INTO notifications(
            message_id, source_mailbox, reference_number,
            received_at, date_received, time_received,
            platform, event_type, status, priority,
            scheduled_date, scheduled_time, duration,
            incident_start_time, incident_end_time, incident_time_zone, incident_duration_minutes,
            affected_services, summary, raw_subject, raw_body,
            parsed_at, last_updated
          ) VALUES (
            ?1, ?2, ?3,
            ?4, ?5, ?6,
            ?7, ?8, ?9, ?10,
            ?11, ?12, ?13,
            ?14, ?15, ?16, ?17,
            ?18, ?19, ?20, ?21,
            strftime('%Y-%m-%dT%H:%M:%SZ','now'), strftime('%Y-%m-%dT%H:%M:%SZ','now')
          )
          ON CONFLICT(message_id) DO UPDATE SET
            source_mailbox = excluded.source_mailbox,
            reference_number = excluded.reference_number,
            received_at = excluded.received_at,
            date_received = excluded.date_received,
            time_received = excluded.time_received,
            platform = excluded.platform,
            event_type = excluded.event_type,
            status = excluded.status,
            priority = excluded.priority,
            scheduled_date = excluded.scheduled_date,
            scheduled_time = excluded.scheduled_time,
            duration = excluded.duration,
            incident_start_time = excluded.incident_start_time,
            incident_end_time = excluded.incident_end_time,
            incident_time_zone = excluded.incident_time_zone,
            incident_duration_minutes = excluded.incident_duration_minutes,
            affected_services = excluded.affected_services,
            summary = excluded.summary,
            raw_subject = excluded.raw_subject,
            raw_body = excluded.raw_body,
            last_updated = excluded.last_updated
          "#,
                rusqlite::params![
                    message_id,
                    parsed.source_mailbox,
                    parsed.reference_number,
                    parsed.received_at,
                    parsed.date_received,
                    parsed.time_received,
                    parsed.platform.as_str(),
                    parsed.event_type,
                    parsed.status.as_str(),
                    parsed.priority.as_str(),
                    parsed.scheduled_date,
                    parsed.scheduled_time,
                    parsed.duration,
                    parsed.incident_start_time,
                    parsed.incident_end_time,
                    parsed.incident_time_zone,
                    parsed.incident_duration_minutes,
                    parsed.affected_services.join(SERVICES_SEPARATOR),
                    parsed.summary,
                    parsed.raw_subject,
                    parsed.raw_body,
                ],
            )
            .map_err(|e| {
                AppError::storage(
                    "DB_UPSERT_RECORD_FAILED",
                    format!("Failed to store notification {}", parsed.reference_number),
                    format!("message_id={message_id}; err={e}"),
                )
            })?;

        let record = self.get_record_by_message_id(message_id)?.ok_or_else(|| {
            AppError::new("DB_UPSERT_RECORD_FAILED", "Stored record not readable")
                .with_details(format!("message_id={message_id}"))
                .with_retryable(true)
        })?;

        Ok(RecordWrite {
            created: previous.is_none(),
            previous_reference: previous.filter(|r| *r != record.reference_number),
            record,
        })
    }

    fn get_pair(&self, reference_number: &str) -> Result<Option<NotificationPair>, AppError> {
        let sql =
            format!("SELECT {PAIR_COLUMNS} FROM notification_pairs WHERE reference_number = ?1");
        self.conn
            .query_row(&sql, [reference_number], pair_from_row)
            .optional()
            .map_err(|e| AppError::storage("DB_QUERY_FAILED", "Failed to query pair", e))
    }

    fn upsert_pair(&mut self, links: &PairLinks) -> Result<NotificationPair, AppError> {
        self.conn
            .execute(
                r#"
          INSERT INTO notification_pairs(
            reference_number, open_notification_id, resolved_notification_id,
            time_to_resolve_minutes, incident_duration_minutes, updated_at
          ) VALUES (?1, ?2, ?3, ?4, ?5, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
          ON CONFLICT(reference_number) DO UPDATE SET
            open_notification_id = excluded.open_notification_id,
            resolved_notification_id = excluded.resolved_notification_id,
            time_to_resolve_minutes = excluded.time_to_resolve_minutes,
            incident_duration_minutes = excluded.incident_duration_minutes,
            updated_at = excluded.updated_at
          "#,
                rusqlite::params![
                    links.reference_number,
                    links.open_notification_id,
                    links.resolved_notification_id,
                    links.time_to_resolve_minutes,
                    links.incident_duration_minutes,
                ],
            )
            .map_err(|e| {
                AppError::storage(
                    "DB_UPSERT_PAIR_FAILED",
                    format!("Failed to store pair {}", links.reference_number),
                    e,
                )
            })?;

        self.get_pair(&links.reference_number)?.ok_or_else(|| {
            AppError::new("DB_UPSERT_PAIR_FAILED", "Stored pair not readable")
                .with_details(format!("reference_number={}", links.reference_number))
                .with_retryable(true)
        })
    }

    fn delete_pair(&mut self, reference_number: &str) -> Result<bool, AppError> {
        let n = self
            .conn
            .execute(
                "DELETE FROM notification_pairs WHERE reference_number = ?1",
                [reference_number],
            )
            .map_err(|e| AppError::storage("DB_DELETE_PAIR_FAILED", "Failed to delete pair", e))?;
        Ok(n > 0)
    }

    fn list_reference_numbers(&self) -> Result<Vec<String>, AppError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT reference_number FROM notifications ORDER BY reference_number")
            .map_err(|e| {
                AppError::storage("DB_QUERY_FAILED", "Failed to prepare reference query", e)
            })?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| AppError::storage("DB_QUERY_FAILED", "Failed to query references", e))?;

        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(|e| {
                AppError::storage("DB_QUERY_FAILED", "Failed to decode reference row", e)
            })?);
        }
        Ok(out)
    }
}
