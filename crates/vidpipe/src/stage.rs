//! Pipeline stages and the named queues that carry them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One unit of pipeline work.
///
/// Variants are declared in DAG order; `Ord` follows that order and is used
/// to pick the most downstream active stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Compression,
    AudioExtraction,
    Transcription,
    Tags,
    Todo,
    Title,
    Embedding,
    ArchivalUpload,
    Cleanup,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Compression,
        Stage::AudioExtraction,
        Stage::Transcription,
        Stage::Tags,
        Stage::Todo,
        Stage::Title,
        Stage::Embedding,
        Stage::ArchivalUpload,
        Stage::Cleanup,
    ];

    /// The queue this stage's jobs are placed on.
    pub fn queue(self) -> QueueName {
        match self {
            Stage::Compression => QueueName::VideoCompression,
            Stage::AudioExtraction => QueueName::AudioExtraction,
            Stage::Transcription => QueueName::Transcription,
            Stage::Tags | Stage::Todo | Stage::Title | Stage::Embedding => QueueName::AiAnalysis,
            Stage::ArchivalUpload => QueueName::ArchivalUpload,
            Stage::Cleanup => QueueName::LocalCleanup,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Compression => "compression",
            Stage::AudioExtraction => "audio_extraction",
            Stage::Transcription => "transcription",
            Stage::Tags => "tags",
            Stage::Todo => "todo",
            Stage::Title => "title",
            Stage::Embedding => "embedding",
            Stage::ArchivalUpload => "archival_upload",
            Stage::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// The six independent work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    VideoCompression,
    AudioExtraction,
    Transcription,
    AiAnalysis,
    ArchivalUpload,
    LocalCleanup,
}

impl QueueName {
    pub const ALL: [QueueName; 6] = [
        QueueName::VideoCompression,
        QueueName::AudioExtraction,
        QueueName::Transcription,
        QueueName::AiAnalysis,
        QueueName::ArchivalUpload,
        QueueName::LocalCleanup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::VideoCompression => "video-compression",
            QueueName::AudioExtraction => "audio-extraction",
            QueueName::Transcription => "transcription",
            QueueName::AiAnalysis => "ai-analysis",
            QueueName::ArchivalUpload => "archival-upload",
            QueueName::LocalCleanup => "local-cleanup",
        }
    }

    /// Stages whose jobs travel on this queue.
    pub fn stages(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |s| s.queue() == self)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
