//! Units of work exchanged between the coordinator, the queues and workers.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{
    Embedding, FileRef, JobId, ProcessRecord, RecordId, Tag, TodoItem, Transcript,
};
use crate::stage::Stage;

/// One attempt of one stage for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageJob {
    pub job_id: JobId,
    pub record_id: RecordId,
    pub stage: Stage,
    /// 1-based attempt number.
    pub attempt: u32,
    pub input: StageInput,
    pub enqueued_at: DateTime<Utc>,
}

impl StageJob {
    pub fn new(record_id: RecordId, stage: Stage, attempt: u32, input: StageInput) -> Self {
        Self {
            job_id: JobId::new(),
            record_id,
            stage,
            attempt,
            input,
            enqueued_at: Utc::now(),
        }
    }
}

/// Everything a worker needs, snapshotted from the record at enqueue time.
///
/// Output paths are unique per attempt, so an abandoned attempt that is
/// still writing never touches the file a later attempt produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageInput {
    Compression {
        source: FileRef,
        output_path: PathBuf,
    },
    AudioExtraction {
        source: FileRef,
        output_path: PathBuf,
    },
    Transcription {
        audio: FileRef,
    },
    Tags {
        transcript: Transcript,
    },
    Todo {
        transcript: Transcript,
    },
    Title {
        transcript: Transcript,
    },
    Embedding {
        transcript: Transcript,
        tags: Vec<Tag>,
        title: String,
    },
    ArchivalUpload {
        processed: FileRef,
    },
    Cleanup {
        original: FileRef,
    },
}

/// Per-record directory for intermediate files.
pub fn record_work_dir(work_dir: &Path, record_id: &RecordId) -> PathBuf {
    work_dir.join(record_id.to_string())
}

fn missing(stage: Stage, field: &str) -> String {
    format!("cannot build {} input: {} is not set", stage, field)
}

impl StageInput {
    /// Builds the input for attempt `attempt` of `stage` from the record's
    /// merged fields. Fails if a field the stage reads has not been merged yet.
    pub fn from_record(
        stage: Stage,
        record: &ProcessRecord,
        work_dir: &Path,
        attempt: u32,
    ) -> Result<Self, String> {
        let dir = record_work_dir(work_dir, &record.id);
        let transcript = || {
            record
                .transcript
                .clone()
                .ok_or_else(|| missing(stage, "transcript"))
        };

        let input = match stage {
            Stage::Compression => StageInput::Compression {
                source: record
                    .files
                    .original
                    .clone()
                    .ok_or_else(|| missing(stage, "files.original"))?,
                output_path: dir.join(format!("compressed.attempt-{}.mp4", attempt)),
            },
            Stage::AudioExtraction => StageInput::AudioExtraction {
                source: record
                    .files
                    .original
                    .clone()
                    .ok_or_else(|| missing(stage, "files.original"))?,
                output_path: dir.join(format!("audio.attempt-{}.wav", attempt)),
            },
            Stage::Transcription => StageInput::Transcription {
                audio: record
                    .files
                    .audio
                    .clone()
                    .ok_or_else(|| missing(stage, "files.audio"))?,
            },
            Stage::Tags => StageInput::Tags {
                transcript: transcript()?,
            },
            Stage::Todo => StageInput::Todo {
                transcript: transcript()?,
            },
            Stage::Title => StageInput::Title {
                transcript: transcript()?,
            },
            Stage::Embedding => StageInput::Embedding {
                transcript: transcript()?,
                tags: record.tags.clone().ok_or_else(|| missing(stage, "tags"))?,
                title: record.title.clone().ok_or_else(|| missing(stage, "title"))?,
            },
            Stage::ArchivalUpload => StageInput::ArchivalUpload {
                processed: record
                    .files
                    .processed
                    .clone()
                    .ok_or_else(|| missing(stage, "files.processed"))?,
            },
            Stage::Cleanup => StageInput::Cleanup {
                original: record
                    .files
                    .original
                    .clone()
                    .ok_or_else(|| missing(stage, "files.original"))?,
            },
        };
        Ok(input)
    }

    pub fn stage(&self) -> Stage {
        match self {
            StageInput::Compression { .. } => Stage::Compression,
            StageInput::AudioExtraction { .. } => Stage::AudioExtraction,
            StageInput::Transcription { .. } => Stage::Transcription,
            StageInput::Tags { .. } => Stage::Tags,
            StageInput::Todo { .. } => Stage::Todo,
            StageInput::Title { .. } => Stage::Title,
            StageInput::Embedding { .. } => Stage::Embedding,
            StageInput::ArchivalUpload { .. } => Stage::ArchivalUpload,
            StageInput::Cleanup { .. } => Stage::Cleanup,
        }
    }
}

/// Typed output of a successful stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "value", rename_all = "snake_case")]
pub enum StageResult {
    Compression(FileRef),
    AudioExtraction(FileRef),
    Transcription(Transcript),
    Tags(Vec<Tag>),
    Todo(Vec<TodoItem>),
    Title(String),
    Embedding(Embedding),
    /// The processed artifact is durably stored at `s3_location`.
    ArchivalUpload { s3_location: String },
    /// The original upload was removed from local storage.
    Cleanup,
}

impl StageResult {
    pub fn stage(&self) -> Stage {
        match self {
            StageResult::Compression(_) => Stage::Compression,
            StageResult::AudioExtraction(_) => Stage::AudioExtraction,
            StageResult::Transcription(_) => Stage::Transcription,
            StageResult::Tags(_) => Stage::Tags,
            StageResult::Todo(_) => Stage::Todo,
            StageResult::Title(_) => Stage::Title,
            StageResult::Embedding(_) => Stage::Embedding,
            StageResult::ArchivalUpload { .. } => Stage::ArchivalUpload,
            StageResult::Cleanup => Stage::Cleanup,
        }
    }
}

/// The only channel through which a worker reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Success(StageResult),
    RetryableFailure(String),
    FatalFailure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retryable,
    Fatal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Retryable => "retryable",
            FailureKind::Fatal => "fatal",
        }
    }
}

/// A failed attempt as seen by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
        }
    }
}
