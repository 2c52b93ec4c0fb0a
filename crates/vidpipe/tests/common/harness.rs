//! Test harness driving a `StageCoordinator` by hand.
//!
//! Jobs are pulled off the in-memory queues and reported back synchronously,
//! so each test decides the exact order in which workers finish.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;

use vidpipe::coordinator::StageCoordinator;
use vidpipe::record::{JobState, ProcessRecord, RecordId, SourceFileRef, StorageType};
use vidpipe::worker::{StageFailure, StageJob, StageOutcome};
use vidpipe::{
    MemoryRecordStore, PipelineEvent, PipelineEventBroadcaster, QueueSet, RecordStatus,
    RecordStore, Stage,
};

use super::builders::{success_for, ConfigBuilder};

pub struct TestHarness {
    temp_dir: TempDir,
    pub coordinator: StageCoordinator,
    receiver: Mutex<broadcast::Receiver<PipelineEvent>>,
    seen: Mutex<Vec<PipelineEvent>>,
    pulled: Mutex<Vec<StageJob>>,
}

impl TestHarness {
    /// Harness over an in-memory store with default stage policies.
    pub fn new() -> Self {
        Self::with(|c| c, Arc::new(MemoryRecordStore::new()))
    }

    /// Harness with a customised configuration.
    pub fn with_config(customise: impl FnOnce(ConfigBuilder) -> ConfigBuilder) -> Self {
        Self::with(customise, Arc::new(MemoryRecordStore::new()))
    }

    /// Harness over a caller-provided store.
    pub fn with_store(store: Arc<dyn RecordStore>) -> Self {
        Self::with(|c| c, store)
    }

    pub fn with(
        customise: impl FnOnce(ConfigBuilder) -> ConfigBuilder,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let work_dir = temp_dir.path().join("work");
        let config = customise(ConfigBuilder::new(&work_dir.to_string_lossy())).build();
        vidpipe::validate_config(&config).expect("test config must be valid");

        let events = PipelineEventBroadcaster::new(config.event_capacity);
        let receiver = events.subscribe();
        let coordinator = StageCoordinator::new(&config, store, QueueSet::in_memory(), events);

        Self {
            temp_dir,
            coordinator,
            receiver: Mutex::new(receiver),
            seen: Mutex::new(Vec::new()),
            pulled: Mutex::new(Vec::new()),
        }
    }

    pub fn work_dir(&self) -> std::path::PathBuf {
        self.temp_dir.path().join("work")
    }

    /// Creates a record and submits a staged upload for it.
    pub fn submit(&self) -> RecordId {
        let record = self
            .coordinator
            .create_record("tenant-1", "owner-1")
            .expect("create record");
        let source = SourceFileRef::new(
            self.temp_dir
                .path()
                .join("uploads")
                .join(format!("{}.mov", record.id))
                .to_string_lossy(),
            50_000,
            "mov",
        );
        assert!(self.coordinator.submit(record.id, source).expect("submit"));
        record.id
    }

    pub fn record(&self, id: RecordId) -> ProcessRecord {
        self.coordinator
            .store()
            .load_record(&id)
            .expect("load record")
            .expect("record exists")
    }

    // ─── Queues ─────────────────────────────────────────────────────────────

    fn pull_all(&self) {
        let mut pulled = self.pulled.lock().unwrap();
        for (_, queue) in self.coordinator.queues().iter() {
            while let Ok(Some(job)) = queue.dequeue(Duration::ZERO) {
                pulled.push(job);
            }
        }
    }

    /// Takes the waiting job for `stage` of `id`, if any.
    pub fn take(&self, id: RecordId, stage: Stage) -> Option<StageJob> {
        self.pull_all();
        let mut pulled = self.pulled.lock().unwrap();
        let pos = pulled
            .iter()
            .position(|j| j.record_id == id && j.stage == stage)?;
        Some(pulled.remove(pos))
    }

    pub fn expect_job(&self, id: RecordId, stage: Stage) -> StageJob {
        self.take(id, stage)
            .unwrap_or_else(|| panic!("expected a waiting {} job", stage))
    }

    /// Stages with a waiting job for `id`, in DAG order.
    pub fn waiting(&self, id: RecordId) -> Vec<Stage> {
        self.pull_all();
        let mut stages: Vec<Stage> = self
            .pulled
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.record_id == id)
            .map(|j| j.stage)
            .collect();
        stages.sort();
        stages
    }

    // ─── Worker reports ─────────────────────────────────────────────────────

    pub fn succeed(&self, job: &StageJob) {
        self.coordinator
            .on_stage_started(job.record_id, job.stage, job.job_id)
            .expect("stage started");
        self.coordinator
            .on_stage_completed(job.record_id, job.stage, job.job_id, success_for(job))
            .expect("stage completed");
    }

    pub fn fail(&self, job: &StageJob, failure: StageFailure) {
        self.coordinator
            .on_stage_failed(job.record_id, job.stage, job.job_id, failure)
            .expect("stage failed");
    }

    /// Runs every waiting job of `id` through `script` until no job is left.
    /// `script` returns `None` to use the default successful result.
    pub fn drive(&self, id: RecordId, script: impl Fn(&StageJob) -> Option<StageOutcome>) {
        for _ in 0..100 {
            let Some(stage) = self.waiting(id).into_iter().next() else {
                return;
            };
            let job = self.expect_job(id, stage);
            match script(&job) {
                None => self.succeed(&job),
                Some(StageOutcome::Success(result)) => self
                    .coordinator
                    .on_stage_completed(id, job.stage, job.job_id, result)
                    .expect("stage completed"),
                Some(StageOutcome::RetryableFailure(message)) => {
                    self.fail(&job, StageFailure::retryable(message))
                }
                Some(StageOutcome::FatalFailure(message)) => {
                    self.fail(&job, StageFailure::fatal(message))
                }
            }
            self.check_invariants(id);
        }
        panic!("pipeline did not settle");
    }

    /// Runs the whole pipeline with every stage succeeding.
    pub fn run_to_end(&self, id: RecordId) {
        self.drive(id, |_| None);
    }

    // ─── Events and checks ──────────────────────────────────────────────────

    /// All events received so far.
    pub fn events(&self) -> Vec<PipelineEvent> {
        let mut receiver = self.receiver.lock().unwrap();
        let mut seen = self.seen.lock().unwrap();
        while let Ok(event) = receiver.try_recv() {
            seen.push(event);
        }
        seen.clone()
    }

    pub fn enqueue_count(&self, id: RecordId, stage: Stage) -> usize {
        self.events()
            .iter()
            .filter(|e| {
                matches!(e, PipelineEvent::StageEnqueued { record_id, stage: s, .. }
                    if *record_id == id && *s == stage)
            })
            .count()
    }

    /// Stages in the order they were first enqueued.
    pub fn enqueue_order(&self, id: RecordId) -> Vec<Stage> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::StageEnqueued {
                    record_id,
                    stage,
                    attempt: 1,
                    ..
                } if *record_id == id => Some(*stage),
                _ => None,
            })
            .collect()
    }

    /// Asserts the properties that must hold after every event.
    pub fn check_invariants(&self, id: RecordId) {
        let record = self.record(id);

        if record.status == RecordStatus::Completed {
            assert!(record.pending_result.is_none(), "completed with pending result");
        }

        if let Some(original) = &record.files.original {
            if original.storage_type == StorageType::Deleted {
                let archived = record
                    .files
                    .processed
                    .as_ref()
                    .is_some_and(|p| p.storage_type == StorageType::S3);
                assert!(archived, "original deleted before processed file was archived");
            }
        }

        if record.job(Stage::Transcription).is_some() {
            assert_eq!(
                record.stage_state(Stage::Compression),
                Some(JobState::Completed),
                "transcription enqueued before compression was merged"
            );
        }

        if record.job(Stage::Embedding).is_some_and(|j| j.state != JobState::Skipped) {
            assert!(record.tags.is_some(), "embedding enqueued without tags");
            assert!(record.title.is_some(), "embedding enqueued without title");
        }

        for stage in Stage::ALL {
            if let Some(job) = record.job(stage) {
                assert!(
                    self.enqueue_count(id, stage) as u32 <= job.attempt.max(1),
                    "{} enqueued more often than its attempts",
                    stage
                );
            }
        }
    }
}
