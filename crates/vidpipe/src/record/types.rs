//! The authoritative per-upload process record.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::RecordStatus;
use crate::stage::Stage;

/// Identifier of a process record (one per uploaded video).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of one enqueued stage attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sub-status naming the currently active stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingDetails {
    CompressingVideo,
    ExtractingAudio,
    TranscribingAudio,
    GeneratingTags,
    GeneratingTodo,
    GeneratingTitle,
    GeneratingEmbeddings,
    UploadingToStorage,
    CleaningUp,
}

impl ProcessingDetails {
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Compression => ProcessingDetails::CompressingVideo,
            Stage::AudioExtraction => ProcessingDetails::ExtractingAudio,
            Stage::Transcription => ProcessingDetails::TranscribingAudio,
            Stage::Tags => ProcessingDetails::GeneratingTags,
            Stage::Todo => ProcessingDetails::GeneratingTodo,
            Stage::Title => ProcessingDetails::GeneratingTitle,
            Stage::Embedding => ProcessingDetails::GeneratingEmbeddings,
            Stage::ArchivalUpload => ProcessingDetails::UploadingToStorage,
            Stage::Cleanup => ProcessingDetails::CleaningUp,
        }
    }
}

impl fmt::Display for ProcessingDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingDetails::CompressingVideo => write!(f, "Compressing video"),
            ProcessingDetails::ExtractingAudio => write!(f, "Extracting audio"),
            ProcessingDetails::TranscribingAudio => write!(f, "Transcribing audio"),
            ProcessingDetails::GeneratingTags => write!(f, "Generating tags"),
            ProcessingDetails::GeneratingTodo => write!(f, "Extracting action items"),
            ProcessingDetails::GeneratingTitle => write!(f, "Generating title"),
            ProcessingDetails::GeneratingEmbeddings => write!(f, "Generating embeddings"),
            ProcessingDetails::UploadingToStorage => write!(f, "Uploading to storage"),
            ProcessingDetails::CleaningUp => write!(f, "Cleaning up"),
        }
    }
}

/// Aggregated, derived progress. Only the progress aggregator writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// 0..=100, never decreasing for a given record.
    pub percentage: u8,
    pub current_step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_details: Option<String>,
    /// Best-effort estimate in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            percentage: 0,
            current_step: "Waiting for upload".to_string(),
            step_details: None,
            estimated_time_remaining: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    LocalTemp,
    Local,
    S3,
    Deleted,
}

/// A stored file belonging to the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub path: String,
    pub size: u64,
    pub format: String,
    pub storage_type: StorageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_location: Option<String>,
}

impl FileRef {
    pub fn local(path: impl Into<String>, size: u64, format: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size,
            format: format.into(),
            storage_type: StorageType::Local,
            s3_location: None,
        }
    }
}

/// The durably staged upload handed to `submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFileRef {
    pub path: String,
    pub size: u64,
    pub format: String,
}

impl SourceFileRef {
    pub fn new(path: impl Into<String>, size: u64, format: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size,
            format: format.into(),
        }
    }

    pub(crate) fn into_file_ref(self) -> FileRef {
        FileRef {
            path: self.path,
            size: self.size,
            format: self.format,
            storage_type: StorageType::LocalTemp,
            s3_location: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFiles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<FileRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<FileRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<FileRef>,
}

/// A stage output produced before it is safe to merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "file", rename_all = "snake_case")]
pub enum PendingResult {
    Compression(FileRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    /// Relevance in `[0, 1]`.
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub task: String,
    /// Offset into the video, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingMetadata {
    pub model: String,
    pub dimensions: usize,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub metadata: EmbeddingMetadata,
}

/// Lifecycle of one stage's job as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    /// Succeeded, result parked in `pendingResult`.
    PendingMerge,
    Completed,
    Failed,
    Skipped,
}

impl JobState {
    /// Completed or skipped: the stage will never run again for this record.
    pub fn is_resolved(self) -> bool {
        matches!(self, JobState::Completed | JobState::Skipped)
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    pub job_id: JobId,
    pub attempt: u32,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRef {
    pub fn queued(job_id: JobId, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            attempt,
            state: JobState::Queued,
            enqueued_at: now,
            updated_at: now,
        }
    }

    pub fn with_state(&self, state: JobState) -> Self {
        Self {
            state,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingErrorEntry {
    pub step: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl ProcessingErrorEntry {
    pub fn new(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
            details: None,
            attempt: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub id: RecordId,
    pub tenant_id: String,
    pub owner_id: String,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_details: Option<ProcessingDetails>,
    pub progress: Progress,
    pub files: RecordFiles,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_result: Option<PendingResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Transcript>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<Tag>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo_list: Option<Vec<TodoItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,
    #[serde(default)]
    pub jobs: BTreeMap<Stage, JobRef>,
    #[serde(default)]
    pub processing_errors: Vec<ProcessingErrorEntry>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Incremented by every merge.
    pub version: u64,
}

impl ProcessRecord {
    /// A fresh record in `uploading` status.
    pub fn new(tenant_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self::with_id(RecordId::new(), tenant_id, owner_id)
    }

    pub fn with_id(id: RecordId, tenant_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            tenant_id: tenant_id.into(),
            owner_id: owner_id.into(),
            status: RecordStatus::Uploading,
            processing_details: None,
            progress: Progress::default(),
            files: RecordFiles {
                original: None,
                processed: None,
                audio: None,
            },
            pending_result: None,
            transcript: None,
            tags: None,
            todo_list: None,
            title: None,
            embedding: None,
            jobs: BTreeMap::new(),
            processing_errors: Vec::new(),
            cancelled: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            completed_at: None,
            version: 0,
        }
    }

    pub fn job(&self, stage: Stage) -> Option<&JobRef> {
        self.jobs.get(&stage)
    }

    pub fn stage_state(&self, stage: Stage) -> Option<JobState> {
        self.jobs.get(&stage).map(|j| j.state)
    }

    /// True once the stage can no longer be enqueued for this record.
    pub fn is_stage_resolved(&self, stage: Stage) -> bool {
        self.stage_state(stage).is_some_and(JobState::is_resolved)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Cancelled or soft-deleted records accept no further work.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled || self.deleted_at.is_some()
    }

    pub fn active_stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.jobs
            .iter()
            .filter(|(_, job)| job.state.is_active())
            .map(|(stage, _)| *stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_defaults() {
        let record = ProcessRecord::new("tenant-1", "user-1");
        assert_eq!(record.status, RecordStatus::Uploading);
        assert_eq!(record.progress.percentage, 0);
        assert!(record.jobs.is_empty());
        assert!(record.pending_result.is_none());
        assert!(!record.is_cancelled());
        assert_eq!(record.version, 0);
    }

    #[test]
    fn test_record_id_parse() {
        let id = RecordId::new();
        let parsed: RecordId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<RecordId>().is_err());
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let mut record = ProcessRecord::new("t", "o");
        record.processing_details = Some(ProcessingDetails::ExtractingAudio);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["tenantId"], "t");
        assert_eq!(json["processingDetails"], "extracting_audio");
        assert_eq!(json["progress"]["percentage"], 0);
        assert!(json.get("pendingResult").is_none());
    }

    #[test]
    fn test_pending_result_shape() {
        let pending = PendingResult::Compression(FileRef::local("/work/a.mp4", 10, "mp4"));
        let json = serde_json::to_value(&pending).unwrap();
        assert_eq!(json["stage"], "compression");
        assert_eq!(json["file"]["storageType"], "local");
    }

    #[test]
    fn test_job_state_resolution() {
        assert!(JobState::Completed.is_resolved());
        assert!(JobState::Skipped.is_resolved());
        assert!(!JobState::Failed.is_resolved());
        assert!(!JobState::PendingMerge.is_resolved());
        assert!(JobState::Queued.is_active());
        assert!(!JobState::PendingMerge.is_active());
    }

    #[test]
    fn test_deleted_record_counts_as_cancelled() {
        let mut record = ProcessRecord::new("t", "o");
        record.deleted_at = Some(Utc::now());
        assert!(record.is_cancelled());
    }
}
