use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::domain::{NotificationPair, NotificationRecord, PairLinks, ParsedNotification};
use crate::error::AppError;
use crate::normalize::timestamps::minutes_between;
use crate::store::NotificationStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordUpsert {
    pub record: NotificationRecord,
    /// `false` when the message id was already stored and its row was updated in place.
    pub created: bool,
    /// Pair for the record's reference number after relinking.
    pub pair: Option<NotificationPair>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelinkSummary {
    pub references: usize,
    /// Pairs holding both an Open and a Resolved record.
    pub complete_pairs: usize,
    /// Pairs holding only one side so far.
    pub partial_pairs: usize,
}

/// Store `parsed` under `message_id` and relink its incident.
///
/// Replaying the same message id updates the same row and the same pair. If re-processing
/// moved the record to a different reference number, the old reference is relinked too.
pub fn upsert<S: NotificationStore + ?Sized>(
    store: &mut S,
    parsed: &ParsedNotification,
    message_id: &str,
) -> Result<RecordUpsert, AppError> {
    if parsed.reference_number.trim().is_empty() {
        return Err(AppError::new(
            "RECONCILE_MISSING_REFERENCE",
            "Refusing to store a notification without a reference number",
        )
        .with_details(format!("message_id={message_id}")));
    }
    if message_id.trim().is_empty() {
        return Err(AppError::new(
            "RECONCILE_MISSING_MESSAGE_ID",
            "Refusing to store a notification without a message id",
        )
        .with_details(format!("reference_number={}", parsed.reference_number)));
    }

    let write = store.upsert_record(message_id, parsed)?;
    tracing::info!(
        reference = %write.record.reference_number,
        id = write.record.id,
        status = %write.record.status,
        created = write.created,
        "stored notification"
    );

    if let Some(previous) = &write.previous_reference {
        tracing::info!(
            message_id,
            from = %previous,
            to = %write.record.reference_number,
            "record moved to a different reference number"
        );
        relink(store, previous)?;
    }

    let pair = relink(store, &write.record.reference_number)?;

    Ok(RecordUpsert {
        record: write.record,
        created: write.created,
        pair,
    })
}

fn parse_received(record: &NotificationRecord) -> Option<OffsetDateTime> {
    match OffsetDateTime::parse(&record.received_at, &Rfc3339) {
        Ok(dt) => Some(dt),
        Err(e) => {
            tracing::warn!(
                id = record.id,
                received_at = %record.received_at,
                err = %e,
                "stored received_at is not RFC3339"
            );
            None
        }
    }
}

/// Notification delay: Resolved email received minus Open email received, floored minutes.
fn time_to_resolve_minutes(
    open: &NotificationRecord,
    resolved: &NotificationRecord,
) -> Option<i64> {
    let minutes = minutes_between(parse_received(open)?, parse_received(resolved)?);
    if minutes < 0 {
        tracing::warn!(
            reference = %resolved.reference_number,
            open_received = %open.received_at,
            resolved_received = %resolved.received_at,
            "resolved notification received before open notification"
        );
        return None;
    }
    Some(minutes)
}

/// Recompute the pair for `reference_number` from stored records.
///
/// The earliest-received Open and earliest-received Resolved records are authoritative;
/// Continuing records never take part. A missing counterpart is the normal state of an
/// incident that is still open, not an error.
pub fn relink<S: NotificationStore + ?Sized>(
    store: &mut S,
    reference_number: &str,
) -> Result<Option<NotificationPair>, AppError> {
    let open = store.get_open_record(reference_number)?;
    let resolved = store.get_resolved_record(reference_number)?;

    let links = match (&open, &resolved) {
        (None, None) => {
            if store.delete_pair(reference_number)? {
                tracing::info!(reference = reference_number, "removed pair with no remaining records");
            }
            return Ok(None);
        }
        (Some(o), Some(r)) => PairLinks {
            reference_number: reference_number.to_string(),
            open_notification_id: Some(o.id),
            resolved_notification_id: Some(r.id),
            time_to_resolve_minutes: time_to_resolve_minutes(o, r),
            incident_duration_minutes: r.incident_duration_minutes,
        },
        (o, r) => PairLinks {
            reference_number: reference_number.to_string(),
            open_notification_id: o.as_ref().map(|o| o.id),
            resolved_notification_id: r.as_ref().map(|r| r.id),
            time_to_resolve_minutes: None,
            incident_duration_minutes: None,
        },
    };

    let pair = store.upsert_pair(&links)?;
    match (pair.open_notification_id, pair.resolved_notification_id) {
        (Some(_), Some(_)) => tracing::info!(
            reference = reference_number,
            time_to_resolve_minutes = ?pair.time_to_resolve_minutes,
            incident_duration_minutes = ?pair.incident_duration_minutes,
            "linked pair"
        ),
        _ => tracing::debug!(reference = reference_number, "pair awaiting counterpart"),
    }
    Ok(Some(pair))
}

/// Relink every reference number the store knows about.
pub fn relink_all<S: NotificationStore + ?Sized>(store: &mut S) -> Result<RelinkSummary, AppError> {
    let mut summary = RelinkSummary::default();
    for reference in store.list_reference_numbers()? {
        summary.references += 1;
        match relink(store, &reference)? {
            Some(p) if p.open_notification_id.is_some() && p.resolved_notification_id.is_some() => {
                summary.complete_pairs += 1
            }
            Some(_) => summary.partial_pairs += 1,
            None => {}
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RawEmail;
    use crate::ingest::parse;
    use crate::store::MemoryStore;
    use time::macros::datetime;

    fn parsed(subject: &str, body: &str, received_at: OffsetDateTime) -> ParsedNotification {
        parse(&RawEmail {
            message_id: String::new(),
            subject: subject.to_string(),
            body: body.to_string(),
            received_at,
            source_mailbox: "inbox1".to_string(),
        })
        .expect("parse")
    }

    #[test]
    fn continuing_records_do_not_open_a_pair() {
        let mut store = MemoryStore::new();
        let n = parsed(
            "ORBCOMM Service Notification: M-000010 Continuing",
            "Platform: IDP",
            datetime!(2025-01-01 10:00 UTC),
        );
        let out = upsert(&mut store, &n, "c-1").expect("upsert");
        assert!(out.created);
        assert_eq!(out.pair, None);
        assert_eq!(store.pairs().count(), 0);
    }

    #[test]
    fn earliest_resolved_is_authoritative() {
        let mut store = MemoryStore::new();
        let open = parsed(
            "ORBCOMM Service Notification: M-000011 Open",
            "",
            datetime!(2025-01-01 10:00 UTC),
        );
        let later = parsed(
            "ORBCOMM Service Notification: M-000011 Resolved",
            "Start Time: 2025-01-01 09:00 GMT\nEnd Time: 2025-01-01 12:00 GMT",
            datetime!(2025-01-01 14:00 UTC),
        );
        let earlier = parsed(
            "ORBCOMM Service Notification: M-000011 Resolved",
            "Start Time: 2025-01-01 09:00 GMT\nEnd Time: 2025-01-01 11:00 GMT",
            datetime!(2025-01-01 12:30 UTC),
        );

        upsert(&mut store, &open, "o").unwrap();
        let first = upsert(&mut store, &later, "r-late").unwrap();
        let second = upsert(&mut store, &earlier, "r-early").unwrap();

        let pair = second.pair.expect("pair");
        assert_eq!(pair.id, first.pair.unwrap().id);
        assert_eq!(pair.resolved_notification_id, Some(second.record.id));
        assert_eq!(pair.time_to_resolve_minutes, Some(150));
        assert_eq!(pair.incident_duration_minutes, Some(120));
        assert_eq!(store.records().count(), 3);
    }

    #[test]
    fn resolved_before_open_yields_unknown_delay() {
        let mut store = MemoryStore::new();
        let resolved = parsed(
            "ORBCOMM Service Notification: M-000012 Resolved",
            "",
            datetime!(2025-01-01 09:00 UTC),
        );
        let open = parsed(
            "ORBCOMM Service Notification: M-000012 Open",
            "",
            datetime!(2025-01-01 10:00 UTC),
        );
        upsert(&mut store, &resolved, "r").unwrap();
        let pair = upsert(&mut store, &open, "o").unwrap().pair.expect("pair");
        assert!(pair.open_notification_id.is_some());
        assert!(pair.resolved_notification_id.is_some());
        assert_eq!(pair.time_to_resolve_minutes, None);
    }

    #[test]
    fn moving_a_record_relinks_its_old_reference() {
        let mut store = MemoryStore::new();
        let first = parsed(
            "ORBCOMM Service Notification: M-000013 Open",
            "",
            datetime!(2025-01-01 10:00 UTC),
        );
        let corrected = parsed(
            "ORBCOMM Service Notification: M-000014 Open",
            "",
            datetime!(2025-01-01 10:00 UTC),
        );
        upsert(&mut store, &first, "m").unwrap();
        assert!(store.get_pair("M-000013").unwrap().is_some());

        upsert(&mut store, &corrected, "m").unwrap();
        assert!(store.get_pair("M-000013").unwrap().is_none());
        assert!(store.get_pair("M-000014").unwrap().is_some());
        assert_eq!(store.records().count(), 1);
    }

    #[test]
    fn relink_all_counts_pairs() {
        let mut store = MemoryStore::new();
        for (id, subject, at) in [
            ("a", "ORBCOMM Service Notification: M-000020 Open", datetime!(2025-01-01 10:00 UTC)),
            ("b", "ORBCOMM Service Notification: M-000020 Resolved", datetime!(2025-01-01 11:00 UTC)),
            ("c", "ORBCOMM Service Notification: M-000021 Open", datetime!(2025-01-01 10:00 UTC)),
            ("d", "ORBCOMM Service Notification: M-000022 Continuing", datetime!(2025-01-01 10:00 UTC)),
        ] {
            upsert(&mut store, &parsed(subject, "", at), id).unwrap();
        }

        let summary = relink_all(&mut store).unwrap();
        assert_eq!(
            summary,
            RelinkSummary {
                references: 3,
                complete_pairs: 1,
                partial_pairs: 1,
            }
        );
    }
}
