//! Builders for test configurations and stage results.

#![allow(dead_code)]

use chrono::Utc;

use vidpipe::config::{OrchestratorConfig, StageOverride};
use vidpipe::record::{
    Embedding, EmbeddingMetadata, FileRef, Tag, TodoItem, Transcript, TranscriptSegment,
};
use vidpipe::worker::{StageInput, StageJob, StageResult};
use vidpipe::{QueueName, Stage};

/// Builder for `OrchestratorConfig` with test-friendly defaults: no backoff,
/// one worker per queue.
pub struct ConfigBuilder {
    config: OrchestratorConfig,
}

impl ConfigBuilder {
    pub fn new(work_directory: &str) -> Self {
        let mut config = OrchestratorConfig::with_work_directory(work_directory);
        for stage in Stage::ALL {
            config.stages.insert(
                stage,
                StageOverride {
                    backoff_base_ms: Some(0),
                    ..Default::default()
                },
            );
        }
        for queue in QueueName::ALL {
            config.workers.insert(queue, 1);
        }
        config.event_capacity = 4096;
        Self { config }
    }

    pub fn max_attempts(mut self, stage: Stage, attempts: u32) -> Self {
        self.stage_override(stage).max_attempts = Some(attempts);
        self
    }

    pub fn timeout_secs(mut self, stage: Stage, secs: u64) -> Self {
        self.stage_override(stage).timeout_secs = Some(secs);
        self
    }

    pub fn workers(mut self, queue: QueueName, count: usize) -> Self {
        self.config.workers.insert(queue, count);
        self
    }

    pub fn cancel_grace_secs(mut self, secs: u64) -> Self {
        self.config.cancel_grace_secs = secs;
        self
    }

    pub fn dispatcher_threads(mut self, threads: usize) -> Self {
        self.config.dispatcher_threads = threads;
        self
    }

    pub fn finalize_max_attempts(mut self, attempts: u32) -> Self {
        self.config.finalize_max_attempts = attempts;
        self
    }

    pub fn database_path(mut self, path: &str) -> Self {
        self.config.database_path = Some(path.to_string());
        self
    }

    pub fn build(self) -> OrchestratorConfig {
        self.config
    }

    fn stage_override(&mut self, stage: Stage) -> &mut StageOverride {
        self.config.stages.entry(stage).or_default()
    }
}

pub fn transcript() -> Transcript {
    Transcript {
        text: "Welcome back. Today we fix the flaky deploy and then write the retro.".into(),
        segments: vec![
            TranscriptSegment {
                start: 0.0,
                end: 2.5,
                text: "Welcome back.".into(),
            },
            TranscriptSegment {
                start: 2.5,
                end: 9.0,
                text: "Today we fix the flaky deploy and then write the retro.".into(),
            },
        ],
        language: Some("en".into()),
        confidence: Some(0.93),
    }
}

pub fn tags() -> Vec<Tag> {
    vec![
        Tag {
            name: "deploy".into(),
            weight: 0.9,
        },
        Tag {
            name: "retro".into(),
            weight: 0.6,
        },
    ]
}

pub fn todo_list() -> Vec<TodoItem> {
    vec![TodoItem {
        task: "Fix the flaky deploy".into(),
        timestamp: Some(4.0),
        completed: false,
    }]
}

pub fn embedding() -> Embedding {
    Embedding {
        vector: vec![0.12, -0.4, 0.33, 0.08],
        metadata: EmbeddingMetadata {
            model: "text-embedding-small".into(),
            dimensions: 4,
            generated_at: Utc::now(),
        },
    }
}

/// The result a well-behaved worker would return for `job`.
pub fn success_for(job: &StageJob) -> StageResult {
    match &job.input {
        StageInput::Compression { output_path, .. } => StageResult::Compression(FileRef::local(
            output_path.to_string_lossy(),
            4_096,
            "mp4",
        )),
        StageInput::AudioExtraction { output_path, .. } => StageResult::AudioExtraction(
            FileRef::local(output_path.to_string_lossy(), 1_024, "wav"),
        ),
        StageInput::Transcription { .. } => StageResult::Transcription(transcript()),
        StageInput::Tags { .. } => StageResult::Tags(tags()),
        StageInput::Todo { .. } => StageResult::Todo(todo_list()),
        StageInput::Title { .. } => StageResult::Title("Fixing the flaky deploy".into()),
        StageInput::Embedding { .. } => StageResult::Embedding(embedding()),
        StageInput::ArchivalUpload { processed } => StageResult::ArchivalUpload {
            s3_location: format!("s3://videos/{}/{}", job.record_id, processed.format),
        },
        StageInput::Cleanup { .. } => StageResult::Cleanup,
    }
}
