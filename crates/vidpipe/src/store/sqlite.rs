//! SQLite-backed record store.

use super::RecordStore;
use crate::db::{record_repo, Database, DatabaseError};
use crate::error::StoreError;
use crate::record::{FieldUpdate, ProcessRecord, ProcessingErrorEntry, RecordId, RecordStatus};

/// Record store over the shared [`Database`] handle.
#[derive(Clone)]
pub struct SqliteRecordStore {
    db: Database,
}

impl SqliteRecordStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn is_constraint_violation(err: &DatabaseError) -> bool {
    matches!(
        err,
        DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl RecordStore for SqliteRecordStore {
    fn create(&self, record: &ProcessRecord) -> Result<(), StoreError> {
        record_repo::insert(&self.db, record).map_err(|e| {
            if is_constraint_violation(&e) {
                StoreError::AlreadyExists(record.id)
            } else {
                StoreError::Database(e)
            }
        })
    }

    fn load_record(&self, id: &RecordId) -> Result<Option<ProcessRecord>, StoreError> {
        Ok(record_repo::find_by_id(&self.db, id)?)
    }

    fn merge_field(&self, id: &RecordId, update: FieldUpdate) -> Result<u64, StoreError> {
        log::debug!("Merging {} into record {}", update.path(), id);
        record_repo::apply_update(&self.db, id, &update)?.ok_or(StoreError::NotFound(*id))
    }

    fn append_error(&self, id: &RecordId, entry: ProcessingErrorEntry) -> Result<(), StoreError> {
        if record_repo::append_error(&self.db, id, &entry)? {
            Ok(())
        } else {
            Err(StoreError::NotFound(*id))
        }
    }

    fn ids_with_status(&self, status: RecordStatus) -> Result<Vec<RecordId>, StoreError> {
        Ok(record_repo::list_ids_by_status(&self.db, status)?)
    }
}
