//! Independent field extractors.
//!
//! Every extractor is best-effort and returns an `Option` (or a default); none of them can
//! fail the parse. Vendor formatting drifts without notice, so each rule stands alone.

use lazy_static::lazy_static;
use regex::Regex;

use crate::domain::{Platform, Priority, Status};

lazy_static! {
    static ref REFERENCE_RE: Regex = Regex::new(r"[A-Z]-\d{6}").expect("reference regex must parse");

    static ref PLATFORM_RES: Vec<(Platform, Regex)> = Platform::KNOWN
        .iter()
        .map(|p| {
            let re = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(p.as_str())))
                .expect("platform regex must parse");
            (*p, re)
        })
        .collect();

    static ref RESOLUTION_WORDS_RE: Regex =
        Regex::new(r"(?i)\b(resolved|completed|restored)\b").expect("resolution regex must parse");
    static ref CONTINUATION_WORDS_RE: Regex =
        Regex::new(r"(?i)\b(continuing|ongoing)\b").expect("continuation regex must parse");
    static ref OPEN_WORD_RE: Regex = Regex::new(r"(?i)\bopen\b").expect("open regex must parse");
    static ref RESOLVED_TIME_LABEL_RE: Regex =
        Regex::new(r"(?im)^\s*resolved\s+time\s*:").expect("resolved time regex must parse");

    static ref MONTH_DATE_RE: Regex = Regex::new(
        r"(?i)\b((?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2}(?:st|nd|rd|th)?)\b"
    )
    .expect("month date regex must parse");
    static ref SLASH_DATE_RE: Regex =
        Regex::new(r"\b(\d{1,2}/\d{1,2}/\d{4})\b").expect("slash date regex must parse");
    static ref ISO_DATE_RE: Regex =
        Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").expect("iso date regex must parse");
    static ref CLOCK_TIME_RE: Regex =
        Regex::new(r"(?i)\b(\d{1,2}:\d{2}(?:\s*(?:UTC|GMT|EST|PST|[AP]M))?)")
            .expect("clock time regex must parse");
    static ref DURATION_RE: Regex = Regex::new(
        r"(?i)\b(?:last|duration|take|approximately)\s+(\d+)\s+(hour|minute|day)s?\b"
    )
    .expect("duration regex must parse");

    static ref SERVICE_RES: Vec<(&'static str, Regex)> = [
        "Partner-Support",
        "VAPP",
        "OGWS",
        "Gateway",
        "API",
        "Portal",
        "satellite",
        "modem",
    ]
    .iter()
    .map(|k| {
        let re = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(k)))
            .expect("service regex must parse");
        (*k, re)
    })
    .collect();

    // Listed order is the tie-break: the first group with any match decides.
    static ref PRIORITY_GROUPS: Vec<(Regex, Priority)> = vec![
        (
            Regex::new(r"(?i)\b(critical|urgent|immediate)\b").expect("priority regex must parse"),
            Priority::High,
        ),
        (
            Regex::new(r"(?i)\b(performance|degradation|outage)\b")
                .expect("priority regex must parse"),
            Priority::High,
        ),
        (
            Regex::new(r"(?i)\bmaintenance\b").expect("priority regex must parse"),
            Priority::Medium,
        ),
    ];

    static ref MAINTENANCE_RE: Regex =
        Regex::new(r"(?i)\bmaintenance\b").expect("maintenance regex must parse");
    static ref DISRUPTION_RE: Regex =
        Regex::new(r"(?i)\b(disruption|outage|degradation|interruption)\b")
            .expect("disruption regex must parse");
}

/// Labels that start a new field in notification bodies.
const KNOWN_LABELS: [&str; 9] = [
    "platform",
    "event",
    "status",
    "summary",
    "reference",
    "start time",
    "end time",
    "resolved time",
    "impact",
];

/// First vendor reference number in `text`.
pub fn find_reference(text: &str) -> Option<String> {
    REFERENCE_RE.find(text).map(|m| m.as_str().to_string())
}

/// Value of the first `Label: value` line, label matched case-insensitively.
pub fn label_value<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    text.lines().find_map(|line| strip_label(line, label))
}

fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let line = line.trim_start();
    let head = line.get(..label.len())?;
    if !head.eq_ignore_ascii_case(label) {
        return None;
    }
    let rest = line[label.len()..].trim_start();
    rest.strip_prefix(':').map(str::trim)
}

fn starts_with_known_label(line: &str) -> bool {
    KNOWN_LABELS
        .iter()
        .any(|label| strip_label(line, label).is_some())
}

/// Whole-word platform keyword in `text`, in vocabulary order.
pub fn classify_platform(text: &str) -> Option<Platform> {
    PLATFORM_RES
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(p, _)| *p)
}

/// Body `Platform:` label first, then the subject, then anywhere in the body.
pub fn platform(subject: &str, text: &str) -> Platform {
    label_value(text, "platform")
        .and_then(classify_platform)
        .or_else(|| classify_platform(subject))
        .or_else(|| classify_platform(text))
        .unwrap_or(Platform::Unknown)
}

fn status_keywords(text: &str) -> Option<Status> {
    if RESOLUTION_WORDS_RE.is_match(text) {
        Some(Status::Resolved)
    } else if CONTINUATION_WORDS_RE.is_match(text) {
        Some(Status::Continuing)
    } else if OPEN_WORD_RE.is_match(text) {
        Some(Status::Open)
    } else {
        None
    }
}

/// Subject keywords, then the body `Status:` label, then a `Resolved Time` label.
///
/// Falls back to Open: an incident is never marked resolved without resolution text.
pub fn status(subject: &str, text: &str) -> Status {
    status_keywords(subject)
        .or_else(|| label_value(text, "status").and_then(status_keywords))
        .or_else(|| {
            RESOLVED_TIME_LABEL_RE
                .is_match(text)
                .then_some(Status::Resolved)
        })
        .unwrap_or(Status::Open)
}

/// Body `Event:` label, else a category guessed from subject and body wording.
pub fn event_type(subject: &str, text: &str) -> String {
    if let Some(v) = label_value(text, "event").filter(|v| !v.is_empty()) {
        return v.to_string();
    }
    let haystack = format!("{subject}\n{text}");
    if MAINTENANCE_RE.is_match(&haystack) {
        "Scheduled Maintenance".to_string()
    } else if DISRUPTION_RE.is_match(&haystack) {
        "Service Disruption".to_string()
    } else {
        "Service Notification".to_string()
    }
}

/// Text following the `Summary:` label, up to the next labelled line.
pub fn summary(text: &str) -> String {
    let mut lines = text.lines();
    let mut parts = Vec::new();
    for line in lines.by_ref() {
        if let Some(first) = strip_label(line, "summary") {
            if !first.is_empty() {
                parts.push(first);
            }
            break;
        }
    }
    for line in lines {
        if starts_with_known_label(line) {
            break;
        }
        parts.push(line.trim());
    }
    parts.join(" ")
}

pub fn scheduled_date(summary: &str) -> Option<String> {
    [&*MONTH_DATE_RE, &*SLASH_DATE_RE, &*ISO_DATE_RE]
        .iter()
        .find_map(|re| re.captures(summary))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn scheduled_time(summary: &str) -> Option<String> {
    CLOCK_TIME_RE
        .captures(summary)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Stated maintenance length, e.g. "2 hour(s)".
pub fn stated_duration(summary: &str) -> Option<String> {
    let caps = DURATION_RE.captures(summary)?;
    let n = caps.get(1)?.as_str();
    let unit = caps.get(2)?.as_str().to_lowercase();
    Some(format!("{n} {unit}(s)"))
}

pub fn affected_services(summary: &str) -> Vec<String> {
    SERVICE_RES
        .iter()
        .filter(|(_, re)| re.is_match(summary))
        .map(|(k, _)| k.to_string())
        .collect()
}

pub fn infer_priority(event_type: &str, summary: &str) -> Priority {
    let haystack = format!("{event_type}\n{summary}");
    PRIORITY_GROUPS
        .iter()
        .find(|(re, _)| re.is_match(&haystack))
        .map(|(_, p)| *p)
        .unwrap_or(Priority::Medium)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reference_is_found_regardless_of_surroundings() {
        assert_eq!(find_reference("[S-003141] IDP").as_deref(), Some("S-003141"));
        assert_eq!(find_reference("refXM-0031470z").as_deref(), Some("M-003147"));
        assert_eq!(find_reference("S123456"), None);
        assert_eq!(find_reference("s-003141"), None);
    }

    #[test]
    fn labels_match_case_insensitively() {
        let text = "PLATFORM : OGx\nStatus:Resolved";
        assert_eq!(label_value(text, "platform"), Some("OGx"));
        assert_eq!(label_value(text, "status"), Some("Resolved"));
        assert_eq!(label_value(text, "event"), None);
    }

    #[test]
    fn platform_prefers_body_label_then_subject() {
        assert_eq!(platform("... OGx ...", "Platform: IDP"), Platform::Idp);
        assert_eq!(platform("[M-003128] OGX - RESOLVED", ""), Platform::Ogx);
        assert_eq!(platform("", "affects OGWS users"), Platform::Ogws);
        assert_eq!(platform("no platform", "Platform: ST2100"), Platform::Unknown);
    }

    #[test]
    fn status_defaults_to_open() {
        assert_eq!(status("ORBCOMM Service Notification [S-1]", "nothing"), Status::Open);
        assert_eq!(status("M-003147 - RESOLVED", ""), Status::Resolved);
        assert_eq!(status("M-003147 Continuing", ""), Status::Continuing);
        assert_eq!(status("M-003147", "Status: Resolved"), Status::Resolved);
        assert_eq!(status("M-003147", "Resolved Time: 2025-01-01 10:00 GMT"), Status::Resolved);
        assert_eq!(status("M-003147 Open", "Status: Resolved"), Status::Open);
        assert_eq!(status("issue unresolved", ""), Status::Open);
    }

    #[test]
    fn body_prose_does_not_change_status() {
        let body = "Summary: The issue has been resolved and service is restored.";
        assert_eq!(status("ORBCOMM Service Notification: M-003147", body), Status::Open);
        assert_eq!(status("ORBCOMM Service Notification: M-003147", "Updates are ongoing."), Status::Open);
    }

    #[test]
    fn summary_stops_at_next_label() {
        let text = "Platform: IDP\nSummary: Dear Partner,\nwe are investigating.\nStart Time: 2025-10-22 15:05 GMT";
        assert_eq!(summary(text), "Dear Partner, we are investigating.");
        assert_eq!(summary("no summary here"), "");
    }

    #[test]
    fn scheduling_fields_come_from_summary() {
        let s = "Maintenance on November 5th at 15:00 UTC will last 2 hours and affect the Gateway and API.";
        assert_eq!(scheduled_date(s).as_deref(), Some("November 5th"));
        assert_eq!(scheduled_time(s).as_deref(), Some("15:00 UTC"));
        assert_eq!(stated_duration(s).as_deref(), Some("2 hour(s)"));
        assert_eq!(affected_services(s), vec!["Gateway".to_string(), "API".to_string()]);
        assert_eq!(affected_services("a rapid fix"), Vec::<String>::new());
    }

    #[test]
    fn priority_uses_first_group_in_listed_order() {
        assert_eq!(infer_priority("Scheduled Maintenance", "routine"), Priority::Medium);
        assert_eq!(infer_priority("Service Disruption", "performance degradation"), Priority::High);
        assert_eq!(infer_priority("Scheduled Maintenance", "urgent patch"), Priority::High);
        assert_eq!(infer_priority("Notice", "hello"), Priority::Medium);
    }
}
