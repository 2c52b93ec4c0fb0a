use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::stage::{QueueName, Stage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub version: String,
    /// Root for per-record working files (`<work_directory>/<record_id>/...`).
    pub work_directory: String,
    /// Defaults to `~/.vidpipe/data/vidpipe.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    /// Worker threads per queue. Missing queues use [`default_worker_count`].
    #[serde(default)]
    pub workers: BTreeMap<QueueName, usize>,
    /// Per-stage overrides on top of [`StageSettings::default_for`].
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageOverride>,
    #[serde(default = "default_finalize_max_attempts")]
    pub finalize_max_attempts: u32,
    /// How long a timed-out attempt gets to stop after it is cancelled
    /// before its retry is scheduled anyway.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// Threads applying worker reports. Reports for one record always go to
    /// the same thread.
    #[serde(default = "default_dispatcher_threads")]
    pub dispatcher_threads: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_finalize_max_attempts() -> u32 {
    3
}

fn default_dispatcher_threads() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_cancel_grace_secs() -> u64 {
    30
}

fn default_event_capacity() -> usize {
    256
}

/// Default workers for a queue, derived from the CPU count. Compression is
/// the heaviest stage and gets half the cores.
pub fn default_worker_count(queue: QueueName) -> usize {
    let cpus = num_cpus::get().max(1);
    match queue {
        QueueName::VideoCompression => (cpus / 2).max(1),
        QueueName::AiAnalysis => cpus.clamp(1, 4),
        _ => cpus.clamp(1, 2),
    }
}

impl OrchestratorConfig {
    /// A valid configuration with every default applied.
    pub fn with_work_directory(work_directory: impl Into<String>) -> Self {
        Self {
            version: "1.0".to_string(),
            work_directory: work_directory.into(),
            database_path: None,
            workers: BTreeMap::new(),
            stages: BTreeMap::new(),
            finalize_max_attempts: default_finalize_max_attempts(),
            cancel_grace_secs: default_cancel_grace_secs(),
            dispatcher_threads: default_dispatcher_threads(),
            event_capacity: default_event_capacity(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn workers_for(&self, queue: QueueName) -> usize {
        self.workers
            .get(&queue)
            .copied()
            .unwrap_or_else(|| default_worker_count(queue))
    }

    /// Effective settings for a stage: defaults with overrides applied.
    pub fn stage(&self, stage: Stage) -> StageSettings {
        let base = StageSettings::default_for(stage);
        match self.stages.get(&stage) {
            Some(o) => StageSettings {
                weight: o.weight.unwrap_or(base.weight),
                essential: o.essential.unwrap_or(base.essential),
                max_attempts: o.max_attempts.unwrap_or(base.max_attempts),
                backoff_base_ms: o.backoff_base_ms.unwrap_or(base.backoff_base_ms),
                backoff_max_ms: o.backoff_max_ms.unwrap_or(base.backoff_max_ms),
                timeout_secs: o.timeout_secs.unwrap_or(base.timeout_secs),
            },
            None => base,
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(p) => Some(PathBuf::from(p)),
            None => crate::db::default_database_path(),
        }
    }
}

/// Resolved policy for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSettings {
    /// Share of the overall progress bar. All weights sum to 100.
    pub weight: u8,
    /// Failure of an essential stage fails the run.
    pub essential: bool,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub timeout_secs: u64,
}

impl StageSettings {
    pub fn default_for(stage: Stage) -> Self {
        let (weight, essential, timeout_secs) = match stage {
            Stage::Compression => (25, true, 1800),
            Stage::AudioExtraction => (10, true, 600),
            Stage::Transcription => (25, true, 1800),
            Stage::Tags => (7, true, 300),
            Stage::Todo => (6, false, 300),
            Stage::Title => (7, true, 300),
            Stage::Embedding => (10, false, 120),
            Stage::ArchivalUpload => (5, true, 900),
            Stage::Cleanup => (5, false, 60),
        };
        Self {
            weight,
            essential,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before attempt `attempt + 1`: `min(base * 2^(attempt-1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOverride {
    #[serde(default)]
    pub weight: Option<u8>,
    #[serde(default)]
    pub essential: Option<bool>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_base_ms: Option<u64>,
    #[serde(default)]
    pub backoff_max_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Pretty,
        }
    }
}
