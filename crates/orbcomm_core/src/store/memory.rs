use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{
    NotificationPair, NotificationRecord, PairLinks, ParsedNotification, Status,
};
use crate::error::AppError;
use crate::store::{NotificationStore, RecordWrite};

/// Map-backed store with the same contract as the SQLite one.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: BTreeMap<String, NotificationRecord>,
    pairs: BTreeMap<String, NotificationPair>,
    next_record_id: i64,
    next_pair_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> impl Iterator<Item = &NotificationRecord> {
        self.records.values()
    }

    pub fn pairs(&self) -> impl Iterator<Item = &NotificationPair> {
        self.pairs.values()
    }

    fn first_with_status(&self, reference_number: &str, status: Status) -> Option<NotificationRecord> {
        self.records
            .values()
            .filter(|r| r.reference_number == reference_number && r.status == status)
            .min_by(|a, b| (&a.received_at, a.id).cmp(&(&b.received_at, b.id)))
            .cloned()
    }
}

impl NotificationStore for MemoryStore {
    fn get_record_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<NotificationRecord>, AppError> {
        Ok(self.records.get(message_id).cloned())
    }

    fn get_open_record(
        &self,
        reference_number: &str,
    ) -> Result<Option<NotificationRecord>, AppError> {
        Ok(self.first_with_status(reference_number, Status::Open))
    }

    fn get_resolved_record(
        &self,
        reference_number: &str,
    ) -> Result<Option<NotificationRecord>, AppError> {
        Ok(self.first_with_status(reference_number, Status::Resolved))
    }

    fn upsert_record(
        &mut self,
        message_id: &str,
        parsed: &ParsedNotification,
    ) -> Result<RecordWrite, AppError> {
        let existing = self
            .records
            .get(message_id)
            .map(|r| (r.id, r.is_archived, r.reference_number.clone()));
        let created = existing.is_none();
        let (id, is_archived, previous_reference) = match existing {
            Some((id, archived, reference)) => (
                id,
                archived,
                Some(reference).filter(|r| *r != parsed.reference_number),
            ),
            None => {
                self.next_record_id += 1;
                (self.next_record_id, false, None)
            }
        };

        let mut record = NotificationRecord::from_parsed(id, message_id, parsed);
        record.is_archived = is_archived;
        self.records.insert(message_id.to_string(), record.clone());

        Ok(RecordWrite {
            record,
            created,
            previous_reference,
        })
    }

    fn get_pair(&self, reference_number: &str) -> Result<Option<NotificationPair>, AppError> {
        Ok(self.pairs.get(reference_number).cloned())
    }

    fn upsert_pair(&mut self, links: &PairLinks) -> Result<NotificationPair, AppError> {
        let id = match self.pairs.get(&links.reference_number) {
            Some(p) => p.id,
            None => {
                self.next_pair_id += 1;
                self.next_pair_id
            }
        };
        let pair = NotificationPair {
            id,
            reference_number: links.reference_number.clone(),
            open_notification_id: links.open_notification_id,
            resolved_notification_id: links.resolved_notification_id,
            time_to_resolve_minutes: links.time_to_resolve_minutes,
            incident_duration_minutes: links.incident_duration_minutes,
        };
        self.pairs.insert(links.reference_number.clone(), pair.clone());
        Ok(pair)
    }

    fn delete_pair(&mut self, reference_number: &str) -> Result<bool, AppError> {
        Ok(self.pairs.remove(reference_number).is_some())
    }

    fn list_reference_numbers(&self) -> Result<Vec<String>, AppError> {
        let refs: BTreeSet<&String> = self.records.values().map(|r| &r.reference_number).collect();
        Ok(refs.into_iter().cloned().collect())
    }
}
