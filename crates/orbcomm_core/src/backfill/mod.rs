use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::domain::{NotificationRecord, RawEmail, Status};
use crate::error::AppError;
use crate::ingest::{ParseFailure, ParserConfig};
use crate::normalize::timestamps::parse_received_at;
use crate::repo::list_records_by_status;
use crate::sync::{process_in_transaction, EmailFailure, EmailOutcome};

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackfillSummary {
    pub processed: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Re-parsed successfully but the body still states no usable incident window.
    pub without_incident_times: usize,
    pub failures: Vec<EmailFailure>,
}

fn as_raw_email(record: &NotificationRecord) -> Result<RawEmail, EmailFailure> {
    let received_at = parse_received_at(&record.received_at).ok_or_else(|| {
        EmailFailure::from_parse(
            &record.message_id,
            &ParseFailure::ReceivedAtOutOfRange {
                details: format!("stored received_at={}", record.received_at),
            },
        )
    })?;
    Ok(RawEmail {
        message_id: record.message_id.clone(),
        subject: record.raw_subject.clone(),
        body: record.raw_body.clone(),
        received_at,
        source_mailbox: record.source_mailbox.clone(),
    })
}

/// Re-parse every stored Resolved notification from its raw subject and body.
///
/// Records are rewritten under their own message id, so ids and archive flags survive and
/// pairs are relinked with the refreshed incident durations. Used after extraction rules
/// improve.
pub fn reprocess_resolved(
    conn: &mut Connection,
    config: &ParserConfig,
) -> Result<BackfillSummary, AppError> {
    let records = list_records_by_status(conn, Status::Resolved, true)?;
    tracing::info!(count = records.len(), "reprocessing resolved notifications");

    let mut summary = BackfillSummary::default();
    for before in records {
        summary.processed += 1;
        let outcome = as_raw_email(&before)
            .and_then(|email| process_in_transaction(conn, &email, config));

        match outcome {
            Ok(EmailOutcome::Stored(out)) => {
                if out.record.incident_duration_minutes.is_none() {
                    tracing::warn!(reference = %out.record.reference_number, "no incident times found in body");
                    summary.without_incident_times += 1;
                }
                if out.record == before {
                    summary.unchanged += 1;
                } else {
                    tracing::info!(
                        reference = %out.record.reference_number,
                        incident_duration_minutes = ?out.record.incident_duration_minutes,
                        "resolved notification updated"
                    );
                    summary.updated += 1;
                }
            }
            Ok(EmailOutcome::NotMatched) => {
                summary.failures.push(EmailFailure::from_parse(
                    &before.message_id,
                    &ParseFailure::NotMatched {
                        subject: before.raw_subject.clone(),
                    },
                ));
            }
            Err(failure) => {
                tracing::warn!(message_id = %before.message_id, code = %failure.code, "backfill skipped record");
                summary.failures.push(failure);
            }
        }
    }

    tracing::info!(
        processed = summary.processed,
        updated = summary.updated,
        unchanged = summary.unchanged,
        failed = summary.failures.len(),
        "backfill complete"
    );
    Ok(summary)
}
