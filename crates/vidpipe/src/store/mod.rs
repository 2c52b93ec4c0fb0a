//! Process record store.
//!
//! The narrow persistence contract the coordinator needs: load a record,
//! merge one owned field group, append to the error log. Whole-record writes
//! happen only on creation.

use chrono::Utc;

use crate::error::StoreError;
use crate::record::{FieldUpdate, ProcessRecord, ProcessingErrorEntry, RecordId, RecordStatus};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;

/// Persistence interface for process records.
///
/// Implementations must apply each [`FieldUpdate`] as a targeted update of
/// its field group and bump the record version; they must never replace the
/// whole record.
pub trait RecordStore: Send + Sync {
    /// Inserts a new record. Fails with [`StoreError::AlreadyExists`] if the id
    /// is taken.
    fn create(&self, record: &ProcessRecord) -> Result<(), StoreError>;

    fn load_record(&self, id: &RecordId) -> Result<Option<ProcessRecord>, StoreError>;

    /// Applies one field-scoped update and returns the new version.
    fn merge_field(&self, id: &RecordId, update: FieldUpdate) -> Result<u64, StoreError>;

    /// Appends an audit entry. Entries are never rewritten.
    fn append_error(&self, id: &RecordId, entry: ProcessingErrorEntry) -> Result<(), StoreError>;

    /// Ids of non-deleted records currently in `status`.
    fn ids_with_status(&self, status: RecordStatus) -> Result<Vec<RecordId>, StoreError>;

    /// Marks the record deleted without removing it.
    fn soft_delete(&self, id: &RecordId) -> Result<u64, StoreError> {
        self.merge_field(id, FieldUpdate::DeletedAt(Utc::now()))
    }
}
