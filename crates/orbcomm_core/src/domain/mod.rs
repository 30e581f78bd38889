use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Network affected by a notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Platform {
    #[serde(rename = "IDP")]
    Idp,
    #[serde(rename = "OGx")]
    Ogx,
    #[serde(rename = "OGWS")]
    Ogws,
    Unknown,
}

impl Platform {
    /// Classification vocabulary, in match order.
    pub const KNOWN: [Platform; 3] = [Platform::Idp, Platform::Ogx, Platform::Ogws];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Idp => "IDP",
            Platform::Ogx => "OGx",
            Platform::Ogws => "OGWS",
            Platform::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Status {
    Open,
    Resolved,
    Continuing,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Open => "Open",
            Status::Resolved => "Resolved",
            Status::Continuing => "Continuing",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Priority {
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Medium => "Medium",
            Priority::High => "High",
        }
    }
}

/// Returned when a stored enum column holds a value outside its vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized {kind} value {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! str_enum {
    ($ty:ident, $kind:literal, [$($variant:ident),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == $ty::$variant.as_str() {
                        return Ok($ty::$variant);
                    }
                )+
                Err(UnknownVariant {
                    kind: $kind,
                    value: s.to_string(),
                })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(Platform, "platform", [Idp, Ogx, Ogws, Unknown]);
str_enum!(Status, "status", [Open, Resolved, Continuing]);
str_enum!(Priority, "priority", [Medium, High]);

/// One physical email, as handed over by the mail source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEmail {
    /// Globally unique per physical email; the deduplication key.
    pub message_id: String,
    pub subject: String,
    /// HTML or plain text, already decoded to UTF-8.
    pub body: String,
    pub received_at: OffsetDateTime,
    pub source_mailbox: String,
}

/// Structured fields extracted from one email. Not persisted directly.
///
/// Notes:
/// - `received_at` is canonical RFC3339 UTC truncated to whole seconds, so stored values
///   order lexically.
/// - Incident times are naive `YYYY-MM-DD HH:MM:SS` strings in `incident_time_zone`. They are
///   only ever populated together, and only for Resolved notifications.
/// - `incident_duration_minutes` is never zero or negative; `None` means "unknown".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedNotification {
    pub reference_number: String,
    pub platform: Platform,
    pub event_type: String,
    pub status: Status,
    pub priority: Priority,

    pub received_at: String,
    pub date_received: String,
    pub time_received: String,

    pub scheduled_date: Option<String>,
    pub scheduled_time: Option<String>,
    pub duration: Option<String>,

    pub incident_start_time: Option<String>,
    pub incident_end_time: Option<String>,
    pub incident_time_zone: Option<String>,
    pub incident_duration_minutes: Option<i64>,

    pub affected_services: Vec<String>,
    pub summary: String,

    pub raw_subject: String,
    pub raw_body: String,
    pub source_mailbox: String,

    pub warnings: Vec<ValidationWarning>,
}

/// Persisted form of a parsed notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationRecord {
    pub id: i64,
    pub message_id: String,
    pub source_mailbox: String,
    pub reference_number: String,

    pub received_at: String,
    pub date_received: String,
    pub time_received: String,

    pub platform: Platform,
    pub event_type: String,
    pub status: Status,
    pub priority: Priority,

    pub scheduled_date: Option<String>,
    pub scheduled_time: Option<String>,
    pub duration: Option<String>,

    pub incident_start_time: Option<String>,
    pub incident_end_time: Option<String>,
    pub incident_time_zone: Option<String>,
    pub incident_duration_minutes: Option<i64>,

    pub affected_services: Vec<String>,
    pub summary: String,
    pub raw_subject: String,
    pub raw_body: String,

    pub is_archived: bool,
}

impl NotificationRecord {
    /// Build the record a store should hold for `parsed` under `message_id`.
    ///
    /// `id` is assigned by the store; `is_archived` is preserved by stores on update.
    pub fn from_parsed(id: i64, message_id: &str, parsed: &ParsedNotification) -> Self {
        Self {
            id,
            message_id: message_id.to_string(),
            source_mailbox: parsed.source_mailbox.clone(),
            reference_number: parsed.reference_number.clone(),
            received_at: parsed.received_at.clone(),
            date_received: parsed.date_received.clone(),
            time_received: parsed.time_received.clone(),
            platform: parsed.platform,
            event_type: parsed.event_type.clone(),
            status: parsed.status,
            priority: parsed.priority,
            scheduled_date: parsed.scheduled_date.clone(),
            scheduled_time: parsed.scheduled_time.clone(),
            duration: parsed.duration.clone(),
            incident_start_time: parsed.incident_start_time.clone(),
            incident_end_time: parsed.incident_end_time.clone(),
            incident_time_zone: parsed.incident_time_zone.clone(),
            incident_duration_minutes: parsed.incident_duration_minutes,
            affected_services: parsed.affected_services.clone(),
            summary: parsed.summary.clone(),
            raw_subject: parsed.raw_subject.clone(),
            raw_body: parsed.raw_body.clone(),
            is_archived: false,
        }
    }
}

/// Links the authoritative Open and Resolved records of one incident.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationPair {
    pub id: i64,
    pub reference_number: String,
    pub open_notification_id: Option<i64>,
    pub resolved_notification_id: Option<i64>,
    /// Resolved email received minus Open email received: notification delay, not outage.
    pub time_to_resolve_minutes: Option<i64>,
    /// Outage window stated in the Resolved email.
    pub incident_duration_minutes: Option<i64>,
}

/// Pair contents computed by the reconciler; the store assigns identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairLinks {
    pub reference_number: String,
    pub open_notification_id: Option<i64>,
    pub resolved_notification_id: Option<i64>,
    pub time_to_resolve_minutes: Option<i64>,
    pub incident_duration_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationWarning {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
}

impl ValidationWarning {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_their_column_text() {
        for p in [Platform::Idp, Platform::Ogx, Platform::Ogws, Platform::Unknown] {
            assert_eq!(p.as_str().parse::<Platform>(), Ok(p));
        }
        assert_eq!("Continuing".parse::<Status>(), Ok(Status::Continuing));
        assert_eq!("High".parse::<Priority>(), Ok(Priority::High));
        assert!("Closed".parse::<Status>().is_err());
    }
}
