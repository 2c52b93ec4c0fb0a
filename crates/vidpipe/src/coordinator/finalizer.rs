//! Merging stage results into the record.
//!
//! Each result maps to field updates on the stage's own field group, so
//! results from parallel stages never touch the same data. Compression is
//! merged in two steps: its output is parked in `pendingResult` and promoted
//! into `files.processed` once no other stage reads the original upload.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::StoreError;
use crate::record::{
    FieldOwner, FieldUpdate, JobState, PendingResult, ProcessRecord, RecordId, StorageType,
};
use crate::stage::Stage;
use crate::store::RecordStore;
use crate::worker::StageResult;

use super::dag;

/// Field updates for one stage result plus the job state it leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub updates: Vec<FieldUpdate>,
    pub state: JobState,
}

/// Plans the merge of `result` into `record`. An `Err` describes a broken
/// invariant; nothing must be written in that case.
pub fn plan_merge(record: &ProcessRecord, result: StageResult) -> Result<MergePlan, String> {
    let completed = |updates| MergePlan {
        updates,
        state: JobState::Completed,
    };

    let plan = match result {
        StageResult::Compression(file) => {
            if record.pending_result.is_some() {
                return Err("compression result already pending".to_string());
            }
            MergePlan {
                updates: vec![FieldUpdate::PendingResult(PendingResult::Compression(file))],
                state: JobState::PendingMerge,
            }
        }
        StageResult::AudioExtraction(file) => completed(vec![FieldUpdate::AudioFile(file)]),
        StageResult::Transcription(transcript) => {
            completed(vec![FieldUpdate::Transcript(transcript)])
        }
        StageResult::Tags(tags) => completed(vec![FieldUpdate::Tags(tags)]),
        StageResult::Todo(items) => completed(vec![FieldUpdate::TodoList(items)]),
        StageResult::Title(title) => completed(vec![FieldUpdate::Title(title)]),
        StageResult::Embedding(embedding) => {
            if record.tags.is_none() || record.title.is_none() {
                return Err("embedding produced before tags and title were merged".to_string());
            }
            completed(vec![FieldUpdate::Embedding(embedding)])
        }
        StageResult::ArchivalUpload { s3_location } => {
            if record.pending_result.is_some() {
                return Err("cannot finalize storage state while pendingResult is set".to_string());
            }
            if record.files.processed.is_none() {
                return Err("archival upload finished without a processed file".to_string());
            }
            completed(vec![FieldUpdate::ProcessedStorage {
                storage_type: StorageType::S3,
                s3_location: Some(s3_location),
            }])
        }
        StageResult::Cleanup => {
            let archived = record
                .files
                .processed
                .as_ref()
                .is_some_and(|f| f.storage_type == StorageType::S3);
            if !archived {
                return Err(
                    "refusing to mark the original deleted before the processed file is in s3"
                        .to_string(),
                );
            }
            if record.files.original.is_none() {
                return Err("cleanup finished without an original file".to_string());
            }
            completed(vec![FieldUpdate::OriginalStorage(StorageType::Deleted)])
        }
    };
    Ok(plan)
}

/// Fails if any update touches a field group `stage` does not own.
pub fn check_ownership(stage: Stage, updates: &[FieldUpdate]) -> Result<(), String> {
    match updates.iter().find(|u| u.owner() != FieldOwner::Stage(stage)) {
        Some(update) => Err(format!(
            "{} result would write {}, which it does not own",
            stage,
            update.path()
        )),
        None => Ok(()),
    }
}

/// Updates that move the pending compression output into `files.processed`,
/// if that is safe now.
pub fn promotion(record: &ProcessRecord) -> Option<Vec<FieldUpdate>> {
    if !dag::can_promote_pending(record) {
        return None;
    }
    let Some(PendingResult::Compression(file)) = record.pending_result.clone() else {
        return None;
    };
    let job = record.job(Stage::Compression)?;
    Some(vec![
        FieldUpdate::PromotePending { processed: file },
        FieldUpdate::Job {
            stage: Stage::Compression,
            job: job.with_state(JobState::Completed),
        },
    ])
}

/// Failure to persist a merge after all attempts.
#[derive(Debug)]
pub struct FinalizeFailure {
    pub path: &'static str,
    pub attempts: u32,
    pub error: StoreError,
}

/// Applies merges with bounded retries on store errors.
pub struct Finalizer {
    store: Arc<dyn RecordStore>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl Finalizer {
    pub fn new(store: Arc<dyn RecordStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            retry_delay: Duration::from_millis(10),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Applies each update in order. A missing record is returned at once;
    /// other store errors are retried up to `max_attempts` per update.
    pub fn apply(&self, id: &RecordId, updates: Vec<FieldUpdate>) -> Result<(), FinalizeFailure> {
        for update in updates {
            let path = update.path();
            let mut attempt = 1;
            loop {
                match self.store.merge_field(id, update.clone()) {
                    Ok(_) => break,
                    Err(e @ StoreError::NotFound(_)) => {
                        return Err(FinalizeFailure {
                            path,
                            attempts: attempt,
                            error: e,
                        });
                    }
                    Err(e) if attempt >= self.max_attempts => {
                        return Err(FinalizeFailure {
                            path,
                            attempts: attempt,
                            error: e,
                        });
                    }
                    Err(e) => {
                        log::warn!(
                            "Merge of {} into record {} failed (attempt {}/{}): {}",
                            path,
                            id,
                            attempt,
                            self.max_attempts,
                            e
                        );
                        thread::sleep(self.retry_delay * attempt);
                        attempt += 1;
                    }
                }
            }
        }
        Ok(())
    }
}
