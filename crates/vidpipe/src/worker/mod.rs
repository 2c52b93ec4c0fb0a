//! Stage worker contract and execution.

pub mod job;
pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::WorkerError;
use crate::progress::ProgressReporter;
use crate::record::{JobId, RecordId};
use crate::stage::Stage;

pub use job::{
    record_work_dir, FailureKind, StageFailure, StageInput, StageJob, StageOutcome, StageResult,
};
pub use pool::WorkerPool;

/// A stage implementation (media tool, speech model, LLM call, storage
/// upload...). Must be safe to invoke again for the same job.
pub trait StageWorker: Send + Sync {
    fn execute(&self, job: &StageJob, progress: &dyn ProgressReporter) -> StageOutcome;
}

impl<F> StageWorker for F
where
    F: Fn(&StageJob, &dyn ProgressReporter) -> StageOutcome + Send + Sync,
{
    fn execute(&self, job: &StageJob, progress: &dyn ProgressReporter) -> StageOutcome {
        self(job, progress)
    }
}

/// Reports sent from worker threads to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Started {
        record_id: RecordId,
        stage: Stage,
        job_id: JobId,
    },
    Progress {
        record_id: RecordId,
        stage: Stage,
        job_id: JobId,
        fraction: f32,
    },
    Finished {
        record_id: RecordId,
        stage: Stage,
        job_id: JobId,
        attempt: u32,
        outcome: StageOutcome,
    },
}

impl WorkerMessage {
    pub fn record_id(&self) -> RecordId {
        match self {
            WorkerMessage::Started { record_id, .. }
            | WorkerMessage::Progress { record_id, .. }
            | WorkerMessage::Finished { record_id, .. } => *record_id,
        }
    }
}

/// Stage -> worker lookup.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<Stage, Arc<dyn StageWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: Stage, worker: Arc<dyn StageWorker>) {
        self.workers.insert(stage, worker);
    }

    pub fn with(mut self, stage: Stage, worker: Arc<dyn StageWorker>) -> Self {
        self.register(stage, worker);
        self
    }

    pub fn get(&self, stage: Stage) -> Result<Arc<dyn StageWorker>, WorkerError> {
        self.workers
            .get(&stage)
            .cloned()
            .ok_or(WorkerError::MissingWorker(stage))
    }

    /// Fails on the first stage without a worker.
    pub fn ensure_complete(&self) -> Result<(), WorkerError> {
        for stage in Stage::ALL {
            self.get(stage)?;
        }
        Ok(())
    }
}
