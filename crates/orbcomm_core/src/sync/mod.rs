//! Batch orchestration: parse, store and relink a set of fetched emails.
//!
//! Each email is independent. A failure aborts only that email (its SQLite transaction is
//! rolled back) and is reported in [`BatchSummary::failures`]; the rest of the batch carries on.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::domain::RawEmail;
use crate::error::AppError;
use crate::ingest::{parse_with_config, ParseFailure, ParserConfig};
use crate::normalize::timestamps::parse_received_at;
use crate::reconcile::{self, RecordUpsert};
use crate::store::{NotificationStore, SqliteStore};

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailFailure {
    pub message_id: String,
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl EmailFailure {
    pub(crate) fn from_parse(message_id: &str, failure: &ParseFailure) -> Self {
        Self {
            message_id: message_id.to_string(),
            code: failure.code().to_string(),
            message: failure.to_string(),
            retryable: false,
        }
    }

    pub(crate) fn from_app(message_id: &str, err: &AppError) -> Self {
        Self {
            message_id: message_id.to_string(),
            code: err.code.clone(),
            message: err.to_string(),
            retryable: err.retryable,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EmailOutcome {
    Stored(RecordUpsert),
    /// Subject lacks the notification marker; filtered, not failed.
    NotMatched,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSummary {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub not_matched: usize,
    pub failures: Vec<EmailFailure>,
    /// Distinct reference numbers left with both an Open and a Resolved record.
    pub pairs_linked: usize,
}

impl BatchSummary {
    pub fn stored(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Default)]
struct Tally {
    summary: BatchSummary,
    linked: BTreeSet<String>,
}

impl Tally {
    fn record(&mut self, message_id: &str, result: Result<EmailOutcome, EmailFailure>) {
        self.summary.fetched += 1;
        match result {
            Ok(EmailOutcome::Stored(out)) => {
                if out.created {
                    self.summary.inserted += 1;
                } else {
                    self.summary.updated += 1;
                }
                if let Some(pair) = &out.pair {
                    if pair.open_notification_id.is_some() && pair.resolved_notification_id.is_some() {
                        self.linked.insert(pair.reference_number.clone());
                    }
                }
            }
            Ok(EmailOutcome::NotMatched) => self.summary.not_matched += 1,
            Err(failure) => {
                tracing::warn!(
                    message_id,
                    code = %failure.code,
                    retryable = failure.retryable,
                    "email skipped"
                );
                self.summary.failures.push(failure);
            }
        }
    }

    fn finish(mut self) -> BatchSummary {
        self.summary.pairs_linked = self.linked.len();
        self.summary
    }
}

/// Parse one email and, when it is a notification, store and relink it.
pub fn process_email<S: NotificationStore + ?Sized>(
    store: &mut S,
    email: &RawEmail,
    config: &ParserConfig,
) -> Result<EmailOutcome, EmailFailure> {
    let parsed = match parse_with_config(email, config) {
        Ok(p) => p,
        Err(ParseFailure::NotMatched { subject }) => {
            tracing::debug!(message_id = %email.message_id, subject = %subject, "not a service notification");
            return Ok(EmailOutcome::NotMatched);
        }
        Err(e) => return Err(EmailFailure::from_parse(&email.message_id, &e)),
    };

    for w in &parsed.warnings {
        tracing::warn!(
            message_id = %email.message_id,
            reference = %parsed.reference_number,
            code = %w.code,
            details = ?w.details,
            "{}",
            w.message
        );
    }

    reconcile::upsert(store, &parsed, &email.message_id)
        .map(EmailOutcome::Stored)
        .map_err(|e| {
            tracing::error!(message_id = %email.message_id, err = %e, "failed to store notification");
            EmailFailure::from_app(&email.message_id, &e)
        })
}

/// Process `emails` in order against one store.
pub fn process_batch<S: NotificationStore + ?Sized>(
    store: &mut S,
    emails: &[RawEmail],
    config: &ParserConfig,
) -> BatchSummary {
    let mut tally = Tally::default();
    for email in emails {
        let result = process_email(store, email, config);
        tally.record(&email.message_id, result);
    }
    tally.finish()
}

/// Position in the `(received_at, message_id)` order a sync walks its emails in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    pub received_at: OffsetDateTime,
    /// Last message handled at `received_at`. `None` covers the whole instant.
    pub message_id: Option<String>,
}

impl SyncCursor {
    pub fn at(received_at: OffsetDateTime) -> Self {
        Self {
            received_at,
            message_id: None,
        }
    }

    fn after(email: &RawEmail) -> Self {
        Self {
            received_at: email.received_at,
            message_id: Some(email.message_id.clone()),
        }
    }

    /// Whether an earlier run already handled `email`.
    pub fn covers(&self, email: &RawEmail) -> bool {
        match email.received_at.cmp(&self.received_at) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self
                .message_id
                .as_deref()
                .map_or(true, |id| email.message_id.as_str() <= id),
        }
    }
}

/// Nanosecond RFC3339 in UTC; fixed width keeps stored watermarks in time order as text.
fn watermark_text(at: OffsetDateTime) -> Result<String, AppError> {
    at.to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
        ))
        .map_err(|e| {
            AppError::new("SYNC_HISTORY_FAILED", "Failed to format sync watermark")
                .with_details(e.to_string())
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub source_mailbox: String,
    /// Emails this cursor covers were handled by an earlier run.
    pub since: Option<SyncCursor>,
    pub batch_size: usize,
    pub parser: ParserConfig,
}

impl SyncRequest {
    pub fn new(source_mailbox: impl Into<String>) -> Self {
        Self {
            source_mailbox: source_mailbox.into(),
            since: None,
            batch_size: DEFAULT_BATCH_SIZE,
            parser: ParserConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
        }
    }

    fn of(summary: &BatchSummary) -> Self {
        match (summary.failures.is_empty(), summary.stored()) {
            (true, _) => SyncStatus::Success,
            (false, 0) if summary.not_matched == 0 => SyncStatus::Failed,
            (false, _) => SyncStatus::Partial,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncReport {
    pub sync_id: i64,
    pub status: SyncStatus,
    pub summary: BatchSummary,
    /// Emails covered by `since`.
    pub skipped_already_synced: usize,
    /// Emails beyond the batch size, left for the next run.
    pub deferred: usize,
    /// Received time of the last email handled, when the run succeeded.
    pub watermark: Option<String>,
}

fn start_history(conn: &Connection, mailbox: &str) -> Result<i64, AppError> {
    conn.execute(
        "INSERT INTO sync_history(source_mailbox, sync_start) VALUES (?1, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        [mailbox],
    )
    .map_err(|e| AppError::storage("SYNC_HISTORY_FAILED", "Failed to record sync start", e))?;
    Ok(conn.last_insert_rowid())
}

fn finish_history(
    conn: &Connection,
    sync_id: i64,
    status: SyncStatus,
    summary: &BatchSummary,
    watermark: Option<&SyncCursor>,
) -> Result<(), AppError> {
    let (watermark, watermark_message_id) = match watermark {
        Some(c) => (Some(watermark_text(c.received_at)?), c.message_id.as_deref()),
        None => (None, None),
    };
    let error_log = if summary.failures.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&summary.failures).map_err(|e| {
            AppError::new("SYNC_HISTORY_FAILED", "Failed to serialize sync failures")
                .with_details(e.to_string())
        })?)
    };
    conn.execute(
        r#"
      UPDATE sync_history SET
        sync_end = strftime('%Y-%m-%dT%H:%M:%SZ','now'),
        emails_fetched = ?2,
        emails_stored = ?3,
        errors_count = ?4,
        status = ?5,
        error_log = ?6,
        watermark = ?7,
        watermark_message_id = ?8
      WHERE id = ?1
      "#,
        rusqlite::params![
            sync_id,
            summary.fetched as i64,
            summary.stored() as i64,
            summary.failures.len() as i64,
            status.as_str(),
            error_log,
            watermark,
            watermark_message_id,
        ],
    )
    .map_err(|e| AppError::storage("SYNC_HISTORY_FAILED", "Failed to record sync end", e))?;
    Ok(())
}

pub(crate) fn process_in_transaction(
    conn: &mut Connection,
    email: &RawEmail,
    config: &ParserConfig,
) -> Result<EmailOutcome, EmailFailure> {
    let tx = conn.transaction().map_err(|e| {
        EmailFailure::from_app(
            &email.message_id,
            &AppError::storage("DB_TX_FAILED", "Failed to start email transaction", e),
        )
    })?;

    let outcome = {
        let mut store = SqliteStore::new(&tx);
        process_email(&mut store, email, config)
    };

    match outcome {
        Ok(o) => {
            tx.commit().map_err(|e| {
                EmailFailure::from_app(
                    &email.message_id,
                    &AppError::storage("DB_TX_FAILED", "Failed to commit email transaction", e),
                )
            })?;
            Ok(o)
        }
        // Dropping the transaction rolls it back.
        Err(f) => Err(f),
    }
}

/// Run one sync over `emails` fetched from `request.source_mailbox`.
///
/// Emails are handled oldest first. At most `batch_size` are processed; the rest are
/// reported as deferred. A `sync_history` row brackets the run.
pub fn run_sync(
    conn: &mut Connection,
    request: &SyncRequest,
    emails: &[RawEmail],
) -> Result<SyncReport, AppError> {
    let sync_id = start_history(conn, &request.source_mailbox)?;
    tracing::info!(sync_id, mailbox = %request.source_mailbox, candidates = emails.len(), "sync started");

    let mut pending: Vec<&RawEmail> = emails
        .iter()
        .filter(|e| !request.since.as_ref().map_or(false, |since| since.covers(e)))
        .collect();
    let skipped_already_synced = emails.len() - pending.len();
    pending.sort_by(|a, b| {
        a.received_at
            .cmp(&b.received_at)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });
    let deferred = pending.len().saturating_sub(request.batch_size);
    pending.truncate(request.batch_size);
    // Deferred emails sort after this one, so the next run picks them up.
    let last_handled = pending.last().map(|e| SyncCursor::after(e));

    let mut tally = Tally::default();
    for email in pending {
        let result = process_in_transaction(conn, email, &request.parser);
        tally.record(&email.message_id, result);
    }
    let summary = tally.finish();
    let status = SyncStatus::of(&summary);
    let cursor = match status {
        SyncStatus::Success => last_handled,
        SyncStatus::Partial | SyncStatus::Failed => None,
    };
    let watermark = cursor.as_ref().map(|c| watermark_text(c.received_at)).transpose()?;

    finish_history(conn, sync_id, status, &summary, cursor.as_ref())?;
    tracing::info!(
        sync_id,
        status = status.as_str(),
        fetched = summary.fetched,
        inserted = summary.inserted,
        updated = summary.updated,
        not_matched = summary.not_matched,
        failures = summary.failures.len(),
        pairs_linked = summary.pairs_linked,
        deferred,
        watermark = ?watermark,
        "sync finished"
    );

    Ok(SyncReport {
        sync_id,
        status,
        summary,
        skipped_already_synced,
        deferred,
        watermark,
    })
}

/// The furthest email handled by a fully successful sync for `mailbox`.
///
/// Partial and failed runs do not advance the watermark, so their failed emails are
/// offered again; replays update in place. Emails deferred by the batch size sort
/// after the watermark and are offered to the next run.
pub fn last_successful_sync(
    conn: &Connection,
    mailbox: &str,
) -> Result<Option<SyncCursor>, AppError> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            r#"
      SELECT watermark, watermark_message_id FROM sync_history
      WHERE source_mailbox = ?1 AND status = 'success' AND watermark IS NOT NULL
      ORDER BY watermark DESC, watermark_message_id DESC
      LIMIT 1
      "#,
            [mailbox],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| AppError::storage("DB_QUERY_FAILED", "Failed to query sync history", e))?;

    let Some((raw, message_id)) = row else {
        return Ok(None);
    };
    let received_at = parse_received_at(&raw).ok_or_else(|| {
        AppError::new("SYNC_HISTORY_CORRUPT", "Stored sync watermark is not a timestamp")
            .with_details(format!("watermark={raw}"))
    })?;
    Ok(Some(SyncCursor {
        received_at,
        message_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::store::MemoryStore;
    use time::macros::datetime;

    fn email(id: &str, subject: &str, at: OffsetDateTime) -> RawEmail {
        RawEmail {
            message_id: id.to_string(),
            subject: subject.to_string(),
            body: "Platform: OGx".to_string(),
            received_at: at,
            source_mailbox: "noc@example.com".to_string(),
        }
    }

    #[test]
    fn batch_counts_each_outcome() {
        let mut store = MemoryStore::new();
        let emails = vec![
            email("1", "ORBCOMM Service Notification: A-000001 Open", datetime!(2025-03-01 08:00 UTC)),
            email("2", "Weekly newsletter", datetime!(2025-03-01 08:05 UTC)),
            email("3", "ORBCOMM Service Notification: no reference", datetime!(2025-03-01 08:10 UTC)),
            email("4", "ORBCOMM Service Notification: A-000001 Resolved", datetime!(2025-03-01 09:00 UTC)),
            email("1", "ORBCOMM Service Notification: A-000001 Open", datetime!(2025-03-01 08:00 UTC)),
        ];

        let summary = process_batch(&mut store, &emails, &ParserConfig::default());
        assert_eq!(summary.fetched, 5);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.not_matched, 1);
        assert_eq!(summary.pairs_linked, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].message_id, "3");
        assert_eq!(summary.failures[0].code, "PARSE_MISSING_REFERENCE");
        assert!(!summary.failures[0].retryable);
    }

    #[test]
    fn sync_honours_since_and_batch_size() {
        let mut conn = db::open_in_memory().unwrap();
        db::migrate(&mut conn).unwrap();

        let emails = vec![
            email("old", "ORBCOMM Service Notification: B-000001 Open", datetime!(2025-03-01 07:00 UTC)),
            email("c", "ORBCOMM Service Notification: B-000003 Open", datetime!(2025-03-01 10:00 UTC)),
            email("a", "ORBCOMM Service Notification: B-000002 Open", datetime!(2025-03-01 08:30 UTC)),
            email("b", "ORBCOMM Service Notification: B-000002 Resolved", datetime!(2025-03-01 09:00 UTC)),
        ];
        let mut request = SyncRequest::new("noc@example.com");
        request.since = Some(SyncCursor::at(datetime!(2025-03-01 08:00 UTC)));
        request.batch_size = 2;

        let report = run_sync(&mut conn, &request, &emails).unwrap();
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.skipped_already_synced, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.summary.inserted, 2);
        assert_eq!(report.summary.pairs_linked, 1);

        let (status, fetched, stored): (String, i64, i64) = conn
            .query_row(
                "SELECT status, emails_fetched, emails_stored FROM sync_history WHERE id = ?1",
                [report.sync_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(status, "success");
        assert_eq!(fetched, 2);
        assert_eq!(stored, 2);
        assert_eq!(report.watermark.as_deref(), Some("2025-03-01T09:00:00.000000000Z"));
        assert_eq!(
            last_successful_sync(&conn, "noc@example.com").unwrap(),
            Some(SyncCursor {
                received_at: datetime!(2025-03-01 09:00 UTC),
                message_id: Some("b".to_string()),
            })
        );
        assert_eq!(last_successful_sync(&conn, "other@example.com").unwrap(), None);
    }

    #[test]
    fn all_failed_sync_is_marked_failed() {
        let mut conn = db::open_in_memory().unwrap();
        db::migrate(&mut conn).unwrap();
        let emails = vec![email(
            "x",
            "ORBCOMM Service Notification: reference missing",
            datetime!(2025-03-01 07:00 UTC),
        )];

        let report = run_sync(&mut conn, &SyncRequest::new("noc@example.com"), &emails).unwrap();
        assert_eq!(report.status, SyncStatus::Failed);
        assert_eq!(report.watermark, None);
        assert_eq!(last_successful_sync(&conn, "noc@example.com").unwrap(), None);
    }
}
