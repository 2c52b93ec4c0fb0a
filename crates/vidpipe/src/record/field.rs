//! Field-scoped record updates.
//!
//! Every mutation of a [`ProcessRecord`] is expressed as a [`FieldUpdate`]
//! touching one owned field group. Stages own disjoint groups, so updates
//! produced by parallel stages never overlap and never require a whole-record
//! write.

use chrono::{DateTime, Utc};

use super::status::RecordStatus;
use super::types::{
    Embedding, FileRef, JobRef, PendingResult, ProcessRecord, ProcessingDetails, Progress,
    StorageType, Tag, TodoItem, Transcript,
};
use crate::stage::Stage;

/// Who is allowed to write a field group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOwner {
    Stage(Stage),
    Coordinator,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Status(RecordStatus),
    ProcessingDetails(Option<ProcessingDetails>),
    Progress(Progress),
    OriginalFile(FileRef),
    ProcessingStartedAt(DateTime<Utc>),
    CompletedAt(DateTime<Utc>),
    Job { stage: Stage, job: JobRef },
    Cancelled,
    DeletedAt(DateTime<Utc>),

    /// Compression result parked until it is safe to finalize.
    PendingResult(PendingResult),
    /// Atomically moves the pending compression output into `files.processed`
    /// and clears `pendingResult`.
    PromotePending { processed: FileRef },
    AudioFile(FileRef),
    Transcript(Transcript),
    Tags(Vec<Tag>),
    TodoList(Vec<TodoItem>),
    Title(String),
    Embedding(Embedding),
    ProcessedStorage {
        storage_type: StorageType,
        s3_location: Option<String>,
    },
    OriginalStorage(StorageType),
}

impl FieldUpdate {
    pub fn owner(&self) -> FieldOwner {
        match self {
            FieldUpdate::Status(_)
            | FieldUpdate::ProcessingDetails(_)
            | FieldUpdate::Progress(_)
            | FieldUpdate::OriginalFile(_)
            | FieldUpdate::ProcessingStartedAt(_)
            | FieldUpdate::CompletedAt(_)
            | FieldUpdate::Job { .. }
            | FieldUpdate::Cancelled
            | FieldUpdate::DeletedAt(_) => FieldOwner::Coordinator,
            FieldUpdate::PendingResult(_) | FieldUpdate::PromotePending { .. } => {
                FieldOwner::Stage(Stage::Compression)
            }
            FieldUpdate::AudioFile(_) => FieldOwner::Stage(Stage::AudioExtraction),
            FieldUpdate::Transcript(_) => FieldOwner::Stage(Stage::Transcription),
            FieldUpdate::Tags(_) => FieldOwner::Stage(Stage::Tags),
            FieldUpdate::TodoList(_) => FieldOwner::Stage(Stage::Todo),
            FieldUpdate::Title(_) => FieldOwner::Stage(Stage::Title),
            FieldUpdate::Embedding(_) => FieldOwner::Stage(Stage::Embedding),
            FieldUpdate::ProcessedStorage { .. } => FieldOwner::Stage(Stage::ArchivalUpload),
            FieldUpdate::OriginalStorage(_) => FieldOwner::Stage(Stage::Cleanup),
        }
    }

    /// Dotted path of the field group, for logs and audit entries.
    pub fn path(&self) -> &'static str {
        match self {
            FieldUpdate::Status(_) => "status",
            FieldUpdate::ProcessingDetails(_) => "processingDetails",
            FieldUpdate::Progress(_) => "progress",
            FieldUpdate::OriginalFile(_) => "files.original",
            FieldUpdate::ProcessingStartedAt(_) => "processingStartedAt",
            FieldUpdate::CompletedAt(_) => "completedAt",
            FieldUpdate::Job { .. } => "jobs",
            FieldUpdate::Cancelled => "cancelled",
            FieldUpdate::DeletedAt(_) => "deletedAt",
            FieldUpdate::PendingResult(_) => "pendingResult",
            FieldUpdate::PromotePending { .. } => "files.processed",
            FieldUpdate::AudioFile(_) => "files.audio",
            FieldUpdate::Transcript(_) => "transcript",
            FieldUpdate::Tags(_) => "tags",
            FieldUpdate::TodoList(_) => "todoList",
            FieldUpdate::Title(_) => "title",
            FieldUpdate::Embedding(_) => "embedding",
            FieldUpdate::ProcessedStorage { .. } => "files.processed.storageType",
            FieldUpdate::OriginalStorage(_) => "files.original.storageType",
        }
    }

    /// Applies the update to an in-memory record. Touches only the owned
    /// field group plus `version`/`updatedAt`.
    pub fn apply(self, record: &mut ProcessRecord) {
        match self {
            FieldUpdate::Status(status) => record.status = status,
            FieldUpdate::ProcessingDetails(details) => record.processing_details = details,
            FieldUpdate::Progress(progress) => record.progress = progress,
            FieldUpdate::OriginalFile(file) => record.files.original = Some(file),
            FieldUpdate::ProcessingStartedAt(at) => record.processing_started_at = Some(at),
            FieldUpdate::CompletedAt(at) => record.completed_at = Some(at),
            FieldUpdate::Job { stage, job } => {
                record.jobs.insert(stage, job);
            }
            FieldUpdate::Cancelled => record.cancelled = true,
            FieldUpdate::DeletedAt(at) => {
                record.deleted_at = Some(at);
                record.cancelled = true;
            }
            FieldUpdate::PendingResult(pending) => record.pending_result = Some(pending),
            FieldUpdate::PromotePending { processed } => {
                record.files.processed = Some(processed);
                record.pending_result = None;
            }
            FieldUpdate::AudioFile(file) => record.files.audio = Some(file),
            FieldUpdate::Transcript(transcript) => record.transcript = Some(transcript),
            FieldUpdate::Tags(tags) => record.tags = Some(tags),
            FieldUpdate::TodoList(items) => record.todo_list = Some(items),
            FieldUpdate::Title(title) => record.title = Some(title),
            FieldUpdate::Embedding(embedding) => record.embedding = Some(embedding),
            FieldUpdate::ProcessedStorage {
                storage_type,
                s3_location,
            } => {
                if let Some(processed) = record.files.processed.as_mut() {
                    processed.storage_type = storage_type;
                    processed.s3_location = s3_location;
                }
            }
            FieldUpdate::OriginalStorage(storage_type) => {
                if let Some(original) = record.files.original.as_mut() {
                    original.storage_type = storage_type;
                }
            }
        }
        record.version += 1;
        record.updated_at = Utc::now();
    }
}
