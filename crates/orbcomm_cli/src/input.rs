use serde::Deserialize;

use orbcomm_core::domain::RawEmail;
use orbcomm_core::error::AppError;
use orbcomm_core::normalize::timestamps::parse_received_at;
use orbcomm_core::sync::EmailFailure;

/// One email as exported by the mail fetcher.
#[derive(Debug, Deserialize)]
struct ExportedEmail {
    message_id: String,
    subject: String,
    #[serde(default)]
    body: String,
    /// RFC3339, or RFC2822 as found in the `Date:` header.
    received_at: String,
    #[serde(default)]
    source_mailbox: Option<String>,
}

#[derive(Debug, Default)]
pub struct LoadedEmails {
    pub emails: Vec<RawEmail>,
    /// Entries dropped before parsing, e.g. an unreadable timestamp.
    pub rejected: Vec<EmailFailure>,
}

/// Read a JSON array of exported emails.
pub fn load_emails(text: &str, default_mailbox: &str) -> Result<LoadedEmails, AppError> {
    let exported: Vec<ExportedEmail> = serde_json::from_str(text).map_err(|e| {
        AppError::new("INGEST_EXPORT_INVALID", "Email export must be a JSON array of emails")
            .with_details(e.to_string())
    })?;

    let mut out = LoadedEmails::default();
    for e in exported {
        let Some(received_at) = parse_received_at(&e.received_at) else {
            tracing::warn!(message_id = %e.message_id, received_at = %e.received_at, "unreadable received_at");
            out.rejected.push(EmailFailure {
                message_id: e.message_id,
                code: "INGEST_RECEIVED_AT_INVALID".to_string(),
                message: format!("received_at {:?} is not RFC3339 or RFC2822", e.received_at),
                retryable: false,
            });
            continue;
        };
        out.emails.push(RawEmail {
            message_id: e.message_id,
            subject: e.subject,
            body: e.body,
            received_at,
            source_mailbox: e
                .source_mailbox
                .unwrap_or_else(|| default_mailbox.to_string()),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn loads_exports_and_rejects_bad_timestamps() {
        let text = r#"[
          {"message_id": "a", "subject": "s", "body": "b", "received_at": "2025-10-20T14:00:00Z"},
          {"message_id": "b", "subject": "s", "received_at": "Mon, 20 Oct 2025 10:00:00 -0400",
           "source_mailbox": "ops@example.com"},
          {"message_id": "c", "subject": "s", "received_at": "yesterday"}
        ]"#;

        let loaded = load_emails(text, "noc@example.com").unwrap();
        assert_eq!(loaded.emails.len(), 2);
        assert_eq!(loaded.emails[0].source_mailbox, "noc@example.com");
        assert_eq!(loaded.emails[1].source_mailbox, "ops@example.com");
        assert_eq!(loaded.emails[0].received_at, loaded.emails[1].received_at);
        assert_eq!(loaded.rejected.len(), 1);
        assert_eq!(loaded.rejected[0].message_id, "c");
    }

    #[test]
    fn non_array_export_is_an_error() {
        let err = load_emails(r#"{"message_id": "a"}"#, "noc").unwrap_err();
        assert_eq!(err.code, "INGEST_EXPORT_INVALID");
    }
}
