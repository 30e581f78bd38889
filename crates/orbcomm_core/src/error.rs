use serde::{Deserialize, Serialize};
use std::fmt;

/// Single structured error shape used across the tracker and surfaced by the CLI.
///
/// Storage failures are marked `retryable`: upserts are keyed by message id and
/// reference number, so re-running the same email after a transient failure is safe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppError {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
    pub retryable: bool,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: false,
        }
    }

    /// A retryable failure reported by the storage layer.
    pub fn storage(
        code: impl Into<String>,
        message: impl Into<String>,
        source: impl fmt::Display,
    ) -> Self {
        Self::new(code, message)
            .with_details(source.to_string())
            .with_retryable(true)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}
