//! Storage collaborator contract.
//!
//! The reconciler is written against [`NotificationStore`] only. [`SqliteStore`] backs the
//! tracker database; [`MemoryStore`] keeps everything in maps for tests and dry runs.

mod memory;
pub(crate) mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::domain::{NotificationPair, NotificationRecord, PairLinks, ParsedNotification};
use crate::error::AppError;

/// Result of writing a record keyed by message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordWrite {
    pub record: NotificationRecord,
    /// `false` when an existing row with the same message id was updated in place.
    pub created: bool,
    /// Reference number the row carried before this write, when it differed.
    pub previous_reference: Option<String>,
}

pub trait NotificationStore {
    fn get_record_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<NotificationRecord>, AppError>;

    /// Earliest-received Open record for `reference_number`.
    fn get_open_record(&self, reference_number: &str)
        -> Result<Option<NotificationRecord>, AppError>;

    /// Earliest-received Resolved record for `reference_number`.
    fn get_resolved_record(
        &self,
        reference_number: &str,
    ) -> Result<Option<NotificationRecord>, AppError>;

    /// Insert, or update in place when `message_id` is already stored. Identity and the
    /// archive flag survive updates.
    fn upsert_record(
        &mut self,
        message_id: &str,
        parsed: &ParsedNotification,
    ) -> Result<RecordWrite, AppError>;

    fn get_pair(&self, reference_number: &str) -> Result<Option<NotificationPair>, AppError>;

    /// Insert-if-absent, else update, keyed by reference number.
    fn upsert_pair(&mut self, links: &PairLinks) -> Result<NotificationPair, AppError>;

    /// Returns whether a row was removed.
    fn delete_pair(&mut self, reference_number: &str) -> Result<bool, AppError>;

    /// Distinct reference numbers across all stored records, sorted.
    fn list_reference_numbers(&self) -> Result<Vec<String>, AppError>;
}
