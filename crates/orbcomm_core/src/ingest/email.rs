use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{ParsedNotification, RawEmail, Status, ValidationWarning};
use crate::ingest::extract;
use crate::normalize::markup::body_to_text;
use crate::normalize::timestamps::{
    parse_zoned_wall_clock, received_fields, wall_clock_minutes, ZonedWallClock,
};

pub const DEFAULT_SUBJECT_MARKER: &str = "ORBCOMM Service Notification";

pub const WARN_INCIDENT_TIME_INCOMPLETE: &str = "PARSE_INCIDENT_TIME_INCOMPLETE";
pub const WARN_INCIDENT_TIME_MALFORMED: &str = "PARSE_INCIDENT_TIME_MALFORMED";
pub const WARN_INCIDENT_TZ_ASSUMED_UTC: &str = "PARSE_INCIDENT_TZ_ASSUMED_UTC";
pub const WARN_INCIDENT_DURATION_NON_POSITIVE: &str = "PARSE_INCIDENT_DURATION_NON_POSITIVE";

lazy_static! {
    static ref START_TIME_RE: Regex =
        Regex::new(r"(?i)\bstart\s*time\s*:[ \t]*([^\n]*)").expect("start time regex must parse");
    static ref END_TIME_RE: Regex =
        Regex::new(r"(?i)\bend\s*time\s*:[ \t]*([^\n]*)").expect("end time regex must parse");
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParserConfig {
    /// Case-insensitive substring every vendor notification subject carries.
    pub subject_marker: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            subject_marker: DEFAULT_SUBJECT_MARKER.to_string(),
        }
    }
}

/// Why an email did not yield a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ParseFailure {
    /// Not a vendor notification. A filter outcome, not an error.
    #[error("subject {subject:?} is not a service notification")]
    NotMatched { subject: String },
    /// No reference number anywhere in the email; the record cannot be paired or stored.
    #[error("no reference number found in subject {subject:?} or body")]
    MissingReference { subject: String },
    #[error("received timestamp cannot be represented: {details}")]
    ReceivedAtOutOfRange { details: String },
}

impl ParseFailure {
    pub fn code(&self) -> &'static str {
        match self {
            ParseFailure::NotMatched { .. } => "PARSE_NOT_MATCHED",
            ParseFailure::MissingReference { .. } => "PARSE_MISSING_REFERENCE",
            ParseFailure::ReceivedAtOutOfRange { .. } => "PARSE_RECEIVED_AT_OUT_OF_RANGE",
        }
    }
}

pub fn is_notification_subject(subject: &str, config: &ParserConfig) -> bool {
    subject
        .to_lowercase()
        .contains(&config.subject_marker.to_lowercase())
}

/// Parse one email with the default configuration.
pub fn parse(email: &RawEmail) -> Result<ParsedNotification, ParseFailure> {
    parse_with_config(email, &ParserConfig::default())
}

/// Parse one email into a notification.
///
/// Only the reference number is mandatory. Every other field is extracted independently and
/// degrades to a default; incident-time problems are reported through `warnings`.
pub fn parse_with_config(
    email: &RawEmail,
    config: &ParserConfig,
) -> Result<ParsedNotification, ParseFailure> {
    if !is_notification_subject(&email.subject, config) {
        return Err(ParseFailure::NotMatched {
            subject: email.subject.clone(),
        });
    }

    let text = body_to_text(&email.body);

    let reference_number = extract::find_reference(&email.subject)
        .or_else(|| extract::find_reference(&text))
        .or_else(|| extract::find_reference(&email.body))
        .ok_or_else(|| ParseFailure::MissingReference {
            subject: email.subject.clone(),
        })?;

    let received =
        received_fields(email.received_at).ok_or_else(|| ParseFailure::ReceivedAtOutOfRange {
            details: format!("message_id={}; received_at={}", email.message_id, email.received_at),
        })?;

    let platform = extract::platform(&email.subject, &text);
    let status = extract::status(&email.subject, &text);
    let event_type = extract::event_type(&email.subject, &text);
    let summary = extract::summary(&text);
    let priority = extract::infer_priority(&event_type, &summary);

    let mut warnings = Vec::new();
    let window = if status == Status::Resolved {
        extract_incident_window(&reference_number, &text, &mut warnings)
    } else {
        IncidentWindow::default()
    };

    let blank_to_none = |v: Option<String>| v.filter(|s| !s.is_empty());

    Ok(ParsedNotification {
        reference_number,
        platform,
        event_type,
        status,
        priority,
        received_at: received.received_at,
        date_received: received.date_received,
        time_received: received.time_received,
        scheduled_date: blank_to_none(extract::scheduled_date(&summary)),
        scheduled_time: blank_to_none(extract::scheduled_time(&summary)),
        duration: blank_to_none(extract::stated_duration(&summary)),
        incident_start_time: window.start,
        incident_end_time: window.end,
        incident_time_zone: window.zone,
        incident_duration_minutes: window.duration_minutes,
        affected_services: extract::affected_services(&summary),
        summary,
        raw_subject: email.subject.clone(),
        raw_body: email.body.clone(),
        source_mailbox: email.source_mailbox.clone(),
        warnings,
    })
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct IncidentWindow {
    start: Option<String>,
    end: Option<String>,
    zone: Option<String>,
    duration_minutes: Option<i64>,
}

fn labelled_value(text: &str, re: &Regex) -> Option<String> {
    let caps = re.captures(text)?;
    let whole = caps.get(0)?;
    let value = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
    if !value.is_empty() {
        return Some(value.to_string());
    }
    // Value pushed onto its own line by the markup, e.g. `<p>Start Time:</p><p>...</p>`.
    text[whole.end()..]
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

fn parse_endpoint(
    reference: &str,
    field: &str,
    raw: &str,
    warnings: &mut Vec<ValidationWarning>,
) -> Option<ZonedWallClock> {
    match parse_zoned_wall_clock(raw) {
        Ok(mut ts) => {
            if ts.zone.is_none() {
                warnings.push(
                    ValidationWarning::new(
                        WARN_INCIDENT_TZ_ASSUMED_UTC,
                        format!("Assumed UTC timezone for {field}"),
                    )
                    .with_details(format!("value={raw}")),
                );
                ts.zone = Some("UTC".to_string());
                ts.offset = Some(time::UtcOffset::UTC);
            }
            Some(ts)
        }
        Err(reason) => {
            tracing::warn!(reference, field, %reason, "unparseable incident time");
            warnings.push(
                ValidationWarning::new(
                    WARN_INCIDENT_TIME_MALFORMED,
                    format!("Unparseable {field}; incident window left unknown"),
                )
                .with_details(reason),
            );
            None
        }
    }
}

/// Re-express both endpoints in UTC when they were stated in different known zones.
fn align_zones(start: ZonedWallClock, end: ZonedWallClock) -> Option<(ZonedWallClock, ZonedWallClock)> {
    if start.zone == end.zone {
        return Some((start, end));
    }
    let to_utc = |ts: ZonedWallClock| -> Option<ZonedWallClock> {
        let utc = ts.naive.assume_offset(ts.offset?).to_offset(time::UtcOffset::UTC);
        Some(ZonedWallClock {
            naive: time::PrimitiveDateTime::new(utc.date(), utc.time()),
            zone: Some("UTC".to_string()),
            offset: Some(time::UtcOffset::UTC),
        })
    };
    Some((to_utc(start)?, to_utc(end)?))
}

/// Outage window stated in a Resolved body.
///
/// Both endpoints or neither: a duration from one endpoint is worse than none.
fn extract_incident_window(
    reference: &str,
    text: &str,
    warnings: &mut Vec<ValidationWarning>,
) -> IncidentWindow {
    let start_raw = labelled_value(text, &START_TIME_RE);
    let end_raw = labelled_value(text, &END_TIME_RE);

    let (start_raw, end_raw) = match (start_raw, end_raw) {
        (Some(s), Some(e)) => (s, e),
        (None, None) => {
            tracing::debug!(reference, "no incident times in resolved notification (older format)");
            return IncidentWindow::default();
        }
        (s, e) => {
            tracing::warn!(reference, start = ?s, end = ?e, "incomplete incident times");
            warnings.push(
                ValidationWarning::new(
                    WARN_INCIDENT_TIME_INCOMPLETE,
                    "Only one of Start Time / End Time present; incident window left unknown",
                )
                .with_details(format!("start={s:?}; end={e:?}")),
            );
            return IncidentWindow::default();
        }
    };

    let start = parse_endpoint(reference, "Start Time", &start_raw, warnings);
    let end = parse_endpoint(reference, "End Time", &end_raw, warnings);
    let (Some(start), Some(end)) = (start, end) else {
        return IncidentWindow::default();
    };

    let Some((start, end)) = align_zones(start, end) else {
        tracing::warn!(reference, %start_raw, %end_raw, "incident times in incomparable zones");
        warnings.push(
            ValidationWarning::new(
                WARN_INCIDENT_TIME_MALFORMED,
                "Start Time and End Time use different, unknown zones; incident window left unknown",
            )
            .with_details(format!("start={start_raw}; end={end_raw}")),
        );
        return IncidentWindow::default();
    };

    let duration_minutes = match wall_clock_minutes(&start, &end) {
        Some(m) if m > 0 => {
            tracing::debug!(reference, minutes = m, "computed incident duration");
            Some(m)
        }
        other => {
            tracing::warn!(
                reference,
                minutes = ?other,
                %start_raw,
                %end_raw,
                "non-positive incident duration discarded"
            );
            warnings.push(
                ValidationWarning::new(
                    WARN_INCIDENT_DURATION_NON_POSITIVE,
                    "End Time does not follow Start Time; incident duration left unknown",
                )
                .with_details(format!("start={start_raw}; end={end_raw}")),
            );
            None
        }
    };

    IncidentWindow {
        start: start.naive_string(),
        end: end.naive_string(),
        zone: start.zone.clone(),
        duration_minutes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn email(subject: &str, body: &str) -> RawEmail {
        RawEmail {
            message_id: "msg-1".to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            received_at: datetime!(2025-10-23 01:10:00 UTC),
            source_mailbox: "inbox2".to_string(),
        }
    }

    #[test]
    fn unrelated_subject_is_not_matched() {
        let err = parse(&email("Lunch on Friday", "M-003147")).unwrap_err();
        assert_eq!(err.code(), "PARSE_NOT_MATCHED");
    }

    #[test]
    fn reference_may_come_from_body() {
        let n = parse(&email(
            "ORBCOMM Service Notification",
            "<p>Reference: <b>M-003150</b></p>",
        ))
        .expect("parse");
        assert_eq!(n.reference_number, "M-003150");
    }

    #[test]
    fn label_on_following_line_is_accepted() {
        let n = parse(&email(
            "ORBCOMM Service Notification: S-000001 Resolved",
            "<p>Start Time:</p><p>2025-10-20 10:00 GMT</p><p>End Time:</p><p>2025-10-20 10:45 GMT</p>",
        ))
        .expect("parse");
        assert_eq!(n.incident_duration_minutes, Some(45));
    }

    #[test]
    fn missing_zone_assumes_utc_with_warning() {
        let n = parse(&email(
            "ORBCOMM Service Notification: S-000002 Resolved",
            "Start Time: 2025-10-20 10:00\nEnd Time: 2025-10-20 11:00",
        ))
        .expect("parse");
        assert_eq!(n.incident_duration_minutes, Some(60));
        assert_eq!(n.incident_time_zone.as_deref(), Some("UTC"));
        assert!(n.warnings.iter().any(|w| w.code == WARN_INCIDENT_TZ_ASSUMED_UTC));
    }

    #[test]
    fn mixed_known_zones_are_normalized_to_utc() {
        let n = parse(&email(
            "ORBCOMM Service Notification: S-000003 Resolved",
            "Start Time: 2025-10-20 10:00 EST\nEnd Time: 2025-10-20 16:30 GMT",
        ))
        .expect("parse");
        assert_eq!(n.incident_start_time.as_deref(), Some("2025-10-20 15:00:00"));
        assert_eq!(n.incident_time_zone.as_deref(), Some("UTC"));
        assert_eq!(n.incident_duration_minutes, Some(90));
    }

    #[test]
    fn zero_length_window_has_no_duration() {
        let n = parse(&email(
            "ORBCOMM Service Notification: S-000004 Resolved",
            "Start Time: 2025-10-20 10:00 GMT\nEnd Time: 2025-10-20 10:00 GMT",
        ))
        .expect("parse");
        assert_eq!(n.incident_duration_minutes, None);
        assert!(n
            .warnings
            .iter()
            .any(|w| w.code == WARN_INCIDENT_DURATION_NON_POSITIVE));
    }
}
