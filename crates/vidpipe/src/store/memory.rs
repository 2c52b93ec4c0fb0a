//! In-memory record store for tests and embedded use.

use std::collections::HashMap;
use std::sync::RwLock;

use super::RecordStore;
use crate::error::StoreError;
use crate::record::{FieldUpdate, ProcessRecord, ProcessingErrorEntry, RecordId, RecordStatus};

#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<RecordId, ProcessRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryRecordStore {
    fn create(&self, record: &ProcessRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::LockPoisoned)?;
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    fn load_record(&self, id: &RecordId) -> Result<Option<ProcessRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records.get(id).cloned())
    }

    fn merge_field(&self, id: &RecordId, update: FieldUpdate) -> Result<u64, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::LockPoisoned)?;
        let record = records.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        update.apply(record);
        Ok(record.version)
    }

    fn append_error(&self, id: &RecordId, entry: ProcessingErrorEntry) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::LockPoisoned)?;
        let record = records.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        record.processing_errors.push(entry);
        record.version += 1;
        record.updated_at = chrono::Utc::now();
        Ok(())
    }

    fn ids_with_status(&self, status: RecordStatus) -> Result<Vec<RecordId>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut matching: Vec<&ProcessRecord> = records
            .values()
            .filter(|r| r.status == status && r.deleted_at.is_none())
            .collect();
        matching.sort_by_key(|r| r.created_at);
        Ok(matching.into_iter().map(|r| r.id).collect())
    }
}
