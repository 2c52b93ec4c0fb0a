//! The DAG scheduler.
//!
//! Every event for a record (upload accepted, job started, progress, job
//! completed, job failed, cancellation) is handled under that record's lock,
//! against a fresh snapshot from the store. Decisions are made by the pure
//! functions in [`dag`], [`finalizer`] and [`StagePolicy`]; this module only
//! applies them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;

use super::dag::{self, DagAction, Readiness};
use super::finalizer::{self, Finalizer};
use super::locks::RecordLocks;
use super::policy::{FailureDecision, StagePolicy};
use crate::broadcast::{PipelineEvent, PipelineEventBroadcaster};
use crate::config::OrchestratorConfig;
use crate::error::{CoordinatorError, StoreError};
use crate::progress::{compute_progress, StageWeights};
use crate::queue::QueueSet;
use crate::record::{
    FieldUpdate, JobId, JobRef, JobState, ProcessRecord, ProcessingDetails, ProcessingErrorEntry,
    Progress, RecordId, RecordStatus, SourceFileRef,
};
use crate::stage::Stage;
use crate::store::RecordStore;
use crate::worker::{
    FailureKind, StageFailure, StageInput, StageJob, StageOutcome, StageResult, WorkerMessage,
};

/// Read-only view returned by [`StageCoordinator::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub status: RecordStatus,
    pub processing_details: Option<ProcessingDetails>,
    pub progress: Progress,
    pub errors: Vec<ProcessingErrorEntry>,
}

pub struct StageCoordinator {
    store: Arc<dyn RecordStore>,
    queues: QueueSet,
    policy: StagePolicy,
    weights: StageWeights,
    finalizer: Finalizer,
    work_dir: PathBuf,
    events: PipelineEventBroadcaster,
    locks: RecordLocks,
    /// Last reported fraction per active stage. Memory only.
    inner_progress: Mutex<HashMap<RecordId, HashMap<Stage, f32>>>,
}

impl StageCoordinator {
    pub fn new(
        config: &OrchestratorConfig,
        store: Arc<dyn RecordStore>,
        queues: QueueSet,
        events: PipelineEventBroadcaster,
    ) -> Self {
        Self {
            finalizer: Finalizer::new(Arc::clone(&store), config.finalize_max_attempts),
            store,
            queues,
            policy: StagePolicy::from_config(config),
            weights: StageWeights::from_config(config),
            work_dir: PathBuf::from(&config.work_directory),
            events,
            locks: RecordLocks::new(),
            inner_progress: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn events(&self) -> &PipelineEventBroadcaster {
        &self.events
    }

    pub fn policy(&self) -> &StagePolicy {
        &self.policy
    }

    // ─── Ingress ────────────────────────────────────────────────────────────

    /// Creates a record in `uploading` status for a new upload.
    pub fn create_record(
        &self,
        tenant_id: &str,
        owner_id: &str,
    ) -> Result<ProcessRecord, CoordinatorError> {
        let record = ProcessRecord::new(tenant_id, owner_id);
        self.store.create(&record)?;
        info!("Created record {} for tenant {}", record.id, tenant_id);
        Ok(record)
    }

    /// Attaches the staged upload and starts the pipeline.
    ///
    /// Returns `false` without side effects if the record already has an
    /// upload attached or its pipeline has started.
    pub fn submit(&self, id: RecordId, source: SourceFileRef) -> Result<bool, CoordinatorError> {
        self.locks.with(id, || {
            let record = self.load(id)?;
            if record.deleted_at.is_some() {
                return Err(CoordinatorError::RecordDeleted { id });
            }
            if record.status != RecordStatus::Uploading
                || record.files.original.is_some()
                || !record.jobs.is_empty()
            {
                debug!("Ignoring duplicate submit for record {}", id);
                return Ok(false);
            }

            info!("Upload for record {} staged at {}", id, source.path);
            self.merge(id, FieldUpdate::OriginalFile(source.into_file_ref()))?;
            self.accept_upload(id)?;
            Ok(true)
        })
    }

    /// Starts the pipeline for a record whose original file is attached.
    /// Idempotent.
    pub fn on_upload_accepted(&self, id: RecordId) -> Result<(), CoordinatorError> {
        self.locks.with(id, || self.accept_upload(id))
    }

    fn accept_upload(&self, id: RecordId) -> Result<(), CoordinatorError> {
        let record = self.load(id)?;
        if record.deleted_at.is_some() {
            return Err(CoordinatorError::RecordDeleted { id });
        }
        if record.is_cancelled() || record.processing_started_at.is_some() {
            debug!("Upload for record {} already accepted or cancelled", id);
            return Ok(());
        }
        if record.files.original.is_none() {
            return Err(self.violation(id, "upload accepted without an original file"));
        }

        match record.status {
            RecordStatus::Uploading => self.set_status(&record, RecordStatus::Uploaded)?,
            RecordStatus::Uploaded => {}
            other => {
                return Err(self.violation(id, format!("upload accepted in status {}", other)));
            }
        }
        self.merge(id, FieldUpdate::ProcessingStartedAt(Utc::now()))?;
        self.advance(id)
    }

    // ─── Worker reports ─────────────────────────────────────────────────────

    pub fn handle_message(&self, message: WorkerMessage) -> Result<(), CoordinatorError> {
        match message {
            WorkerMessage::Started {
                record_id,
                stage,
                job_id,
            } => self.on_stage_started(record_id, stage, job_id),
            WorkerMessage::Progress {
                record_id,
                stage,
                job_id,
                fraction,
            } => self.on_stage_progress(record_id, stage, job_id, fraction),
            WorkerMessage::Finished {
                record_id,
                stage,
                job_id,
                outcome,
                ..
            } => match outcome {
                StageOutcome::Success(result) => {
                    self.on_stage_completed(record_id, stage, job_id, result)
                }
                StageOutcome::RetryableFailure(message) => {
                    self.on_stage_failed(record_id, stage, job_id, StageFailure::retryable(message))
                }
                StageOutcome::FatalFailure(message) => {
                    self.on_stage_failed(record_id, stage, job_id, StageFailure::fatal(message))
                }
            },
        }
    }

    pub fn on_stage_started(
        &self,
        id: RecordId,
        stage: Stage,
        job_id: JobId,
    ) -> Result<(), CoordinatorError> {
        self.locks.with(id, || {
            let record = self.load(id)?;
            if self.discard_reason(&record, stage, job_id).is_some() {
                return Ok(());
            }
            if let Some(job) = record.job(stage).filter(|j| j.state == JobState::Queued) {
                self.merge(
                    id,
                    FieldUpdate::Job {
                        stage,
                        job: job.with_state(JobState::Running),
                    },
                )?;
                self.refresh(id)?;
            }
            Ok(())
        })
    }

    /// Records a worker's inner progress. Only persisted when it moves the
    /// overall percentage.
    pub fn on_stage_progress(
        &self,
        id: RecordId,
        stage: Stage,
        job_id: JobId,
        fraction: f32,
    ) -> Result<(), CoordinatorError> {
        self.locks.with(id, || {
            let record = self.load(id)?;
            if self.discard_reason(&record, stage, job_id).is_some() {
                return Ok(());
            }
            self.set_inner(id, stage, fraction);

            let progress = compute_progress(&record, &self.weights, &self.inner_for(id), Utc::now());
            if progress.percentage > record.progress.percentage {
                self.store_progress(&record, progress)?;
            }
            Ok(())
        })
    }

    /// Merges a successful result and enqueues whatever became eligible.
    pub fn on_stage_completed(
        &self,
        id: RecordId,
        stage: Stage,
        job_id: JobId,
        result: StageResult,
    ) -> Result<(), CoordinatorError> {
        self.locks.with(id, || {
            let record = self.load(id)?;
            if let Some(reason) = self.discard_reason(&record, stage, job_id) {
                self.discard(id, stage, reason);
                return Ok(());
            }

            let _span =
                tracing::info_span!("stage_completed", record_id = %id, stage = %stage).entered();

            if result.stage() != stage {
                let failure =
                    StageFailure::fatal(format!("worker returned a {} result", result.stage()));
                return self.handle_failure(&record, stage, failure);
            }

            let plan = finalizer::plan_merge(&record, result)
                .map_err(|message| self.violation(id, message))?;
            finalizer::check_ownership(stage, &plan.updates)
                .map_err(|message| self.violation(id, message))?;
            let Some(job) = record.job(stage) else {
                return Err(self.violation(id, format!("no job entry for {}", stage)));
            };

            let mut updates = plan.updates;
            updates.push(FieldUpdate::Job {
                stage,
                job: job.with_state(plan.state),
            });
            if !self.finalize(&record, stage, updates)? {
                return Ok(());
            }

            self.clear_inner(id, Some(stage));
            info!("Stage {} completed for record {}", stage, id);
            self.events.send(PipelineEvent::StageCompleted {
                record_id: id,
                stage,
            });
            self.advance(id)
        })
    }

    /// Records the failure and retries, skips, or fails the run per policy.
    pub fn on_stage_failed(
        &self,
        id: RecordId,
        stage: Stage,
        job_id: JobId,
        failure: StageFailure,
    ) -> Result<(), CoordinatorError> {
        self.locks.with(id, || {
            let record = self.load(id)?;
            if let Some(reason) = self.discard_reason(&record, stage, job_id) {
                self.discard(id, stage, reason);
                return Ok(());
            }
            let _span =
                tracing::info_span!("stage_failed", record_id = %id, stage = %stage).entered();
            self.handle_failure(&record, stage, failure)
        })
    }

    fn handle_failure(
        &self,
        record: &ProcessRecord,
        stage: Stage,
        failure: StageFailure,
    ) -> Result<(), CoordinatorError> {
        let id = record.id;
        let Some(job) = record.job(stage) else {
            return Err(self.violation(id, format!("failure reported for unscheduled {}", stage)));
        };
        let settings = self.policy.settings(stage);
        let decision = self.policy.decide(stage, failure.kind, job.attempt);

        warn!(
            "Stage {} failed for record {} (attempt {}/{}, {}): {}",
            stage,
            id,
            job.attempt,
            settings.max_attempts,
            failure.kind.as_str(),
            failure.message
        );

        let entry = ProcessingErrorEntry::new(stage.as_str(), failure.message.clone())
            .with_details(format!(
                "attempt {} of {} ({})",
                job.attempt,
                settings.max_attempts,
                failure.kind.as_str()
            ))
            .with_attempt(job.attempt);
        self.store.append_error(&id, entry)?;
        self.merge(
            id,
            FieldUpdate::Job {
                stage,
                job: job.with_state(JobState::Failed),
            },
        )?;
        self.clear_inner(id, Some(stage));
        self.events.send(PipelineEvent::StageFailed {
            record_id: id,
            stage,
            attempt: job.attempt,
            message: failure.message.clone(),
        });

        self.apply_decision(id, stage, decision, &failure.message)
    }

    /// Acts on a failure decision for a stage whose job is already `Failed`.
    fn apply_decision(
        &self,
        id: RecordId,
        stage: Stage,
        decision: FailureDecision,
        message: &str,
    ) -> Result<(), CoordinatorError> {
        match decision {
            FailureDecision::Retry {
                next_attempt,
                delay,
            } => {
                let record = self.load(id)?;
                self.enqueue_stage(&record, stage, next_attempt, delay)?;
                self.events.send(PipelineEvent::StageRetryScheduled {
                    record_id: id,
                    stage,
                    attempt: next_attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                self.refresh(id)
            }
            FailureDecision::Skip => {
                let record = self.load(id)?;
                self.skip_stage(&record, stage, format!("optional stage failed: {}", message))?;
                self.advance(id)
            }
            FailureDecision::FailRun => {
                let record = self.load(id)?;
                self.fail_run(&record, None)
            }
        }
    }

    // ─── Recovery ───────────────────────────────────────────────────────────

    /// Resumes records a previous process left mid-pipeline.
    ///
    /// Jobs recorded as queued or running were lost with that process; each
    /// counts as an interrupted attempt and goes through the retry policy. A
    /// stale copy still sitting in a durable queue is discarded by job id when
    /// it reports. Returns the number of records resumed.
    pub fn recover(&self) -> Result<usize, CoordinatorError> {
        let mut resumed = 0;
        for status in RecordStatus::in_flight() {
            for id in self.store.ids_with_status(status)? {
                match self.locks.with(id, || self.resume(id)) {
                    Ok(true) => resumed += 1,
                    Ok(false) => {}
                    Err(e) => error!("Failed to resume record {}: {}", id, e),
                }
            }
        }
        if resumed > 0 {
            info!("Resumed {} interrupted records", resumed);
        }
        Ok(resumed)
    }

    fn resume(&self, id: RecordId) -> Result<bool, CoordinatorError> {
        let record = self.load(id)?;
        if record.is_cancelled() || record.is_terminal() || record.deleted_at.is_some() {
            return Ok(false);
        }
        if record.processing_started_at.is_none() {
            if record.files.original.is_none() {
                // Still waiting for its upload.
                return Ok(false);
            }
            self.accept_upload(id)?;
            return Ok(true);
        }

        let _span = tracing::info_span!("resume", record_id = %id).entered();
        for stage in Stage::ALL {
            let record = self.load(id)?;
            if record.is_terminal() {
                return Ok(true);
            }
            let Some(job) = record.job(stage).cloned() else {
                continue;
            };
            match job.state {
                JobState::Queued | JobState::Running => {
                    info!(
                        "Stage {} of record {} was interrupted at attempt {}",
                        stage, id, job.attempt
                    );
                    self.handle_failure(
                        &record,
                        stage,
                        StageFailure::retryable("interrupted by orchestrator restart"),
                    )?;
                }
                JobState::Failed => {
                    // The failure was logged but its decision never applied.
                    let decision = self.policy.decide(stage, FailureKind::Retryable, job.attempt);
                    self.apply_decision(id, stage, decision, "interrupted before retry")?;
                }
                JobState::PendingMerge
                    if record.pending_result.is_none() && record.files.processed.is_some() =>
                {
                    // Promotion merged the file but not the job state.
                    self.merge(
                        id,
                        FieldUpdate::Job {
                            stage,
                            job: job.with_state(JobState::Completed),
                        },
                    )?;
                }
                _ => {}
            }
        }
        self.advance(id)?;
        Ok(true)
    }

    // ─── Queries and control ────────────────────────────────────────────────

    pub fn get_status(&self, id: RecordId) -> Result<StatusSnapshot, CoordinatorError> {
        let record = self.load(id)?;
        Ok(StatusSnapshot {
            status: record.status,
            processing_details: record.processing_details,
            progress: record.progress,
            errors: record.processing_errors,
        })
    }

    /// Stops all further enqueueing for the record. Jobs already running may
    /// finish; their results are discarded.
    pub fn cancel(&self, id: RecordId) -> Result<(), CoordinatorError> {
        self.locks.with(id, || {
            let record = self.load(id)?;
            if !record.cancelled {
                self.merge(id, FieldUpdate::Cancelled)?;
            }
            self.stop(id);
            info!("Cancelled record {}", id);
            Ok(())
        })
    }

    /// Marks the record deleted and cancels its pipeline.
    pub fn soft_delete(&self, id: RecordId) -> Result<(), CoordinatorError> {
        self.locks.with(id, || {
            let record = self.load(id)?;
            if record.deleted_at.is_none() {
                self.store.soft_delete(&id)?;
            }
            self.stop(id);
            info!("Soft-deleted record {}", id);
            Ok(())
        })
    }

    fn stop(&self, id: RecordId) {
        let purged = self.queues.purge_record(&id);
        if purged > 0 {
            debug!("Purged {} queued jobs of record {}", purged, id);
        }
        self.clear_inner(id, None);
    }

    // ─── Scheduling ─────────────────────────────────────────────────────────

    /// Promotes pending results and applies DAG actions until nothing
    /// changes, then refreshes status, sub-status and progress.
    fn advance(&self, id: RecordId) -> Result<(), CoordinatorError> {
        // Each round resolves at least one stage or promotes the pending
        // result, so this bound is never reached by a correct graph.
        for _ in 0..=Stage::ALL.len() * 2 {
            let record = self.load(id)?;
            if record.is_cancelled() || record.is_terminal() {
                return Ok(());
            }

            if let Some(updates) = finalizer::promotion(&record) {
                debug!("Promoting pending compression result of record {}", id);
                if !self.finalize(&record, Stage::Compression, updates)? {
                    return Ok(());
                }
                continue;
            }

            let actions = dag::evaluate(&record, |s| self.policy.is_essential(s));
            if actions.is_empty() {
                return self.refresh(id);
            }

            for action in actions {
                match action {
                    DagAction::Enqueue(stage) => {
                        self.enqueue_stage(&record, stage, 1, Duration::ZERO)?;
                    }
                    DagAction::Skip { stage, blocked_on } => {
                        self.skip_stage(&record, stage, format!("{} was skipped", blocked_on))?;
                    }
                    DagAction::FailRun { stage, blocked_on } => {
                        let entry = ProcessingErrorEntry::new(
                            stage.as_str(),
                            format!("cannot run: required stage {} was skipped", blocked_on),
                        );
                        return self.fail_run(&record, Some(entry));
                    }
                }
            }
        }
        Err(self.violation(id, "stage graph did not settle"))
    }

    fn enqueue_stage(
        &self,
        record: &ProcessRecord,
        stage: Stage,
        attempt: u32,
        delay: Duration,
    ) -> Result<(), CoordinatorError> {
        let id = record.id;
        if record.is_cancelled() || record.is_terminal() {
            debug!("Not enqueueing {} for record {} ({})", stage, id, record.status);
            return Ok(());
        }
        if dag::readiness(record, stage) != Readiness::Ready {
            return Err(self.violation(id, format!("{} enqueued with unmet prerequisites", stage)));
        }

        let max_attempts = self.policy.settings(stage).max_attempts;
        let allowed = match record.job(stage) {
            None => attempt == 1,
            Some(job) => {
                job.state == JobState::Failed
                    && attempt == job.attempt + 1
                    && job.attempt < max_attempts
            }
        };
        if !allowed {
            return Err(self.violation(
                id,
                format!("refusing to enqueue {} attempt {}: job already recorded", stage, attempt),
            ));
        }

        let input = StageInput::from_record(stage, record, &self.work_dir, attempt)
            .map_err(|message| self.violation(id, message))?;
        let job = StageJob::new(id, stage, attempt, input);
        let job_ref = JobRef::queued(job.job_id, attempt);
        let job_id = job.job_id;

        // The entry goes first so a fast worker's report finds it.
        self.merge(
            id,
            FieldUpdate::Job {
                stage,
                job: job_ref.clone(),
            },
        )?;
        if let Err(e) = self.queues.enqueue(job, delay) {
            error!("Failed to enqueue {} for record {}: {}", stage, id, e);
            self.merge(
                id,
                FieldUpdate::Job {
                    stage,
                    job: job_ref.with_state(JobState::Failed),
                },
            )?;
            return Err(e.into());
        }

        info!(
            "Enqueued {} for record {} (attempt {}, delay {:?})",
            stage, id, attempt, delay
        );
        self.events.send(PipelineEvent::StageEnqueued {
            record_id: id,
            stage,
            job_id,
            attempt,
        });
        Ok(())
    }

    fn skip_stage(
        &self,
        record: &ProcessRecord,
        stage: Stage,
        reason: String,
    ) -> Result<(), CoordinatorError> {
        let job = match record.job(stage) {
            Some(job) => job.with_state(JobState::Skipped),
            None => JobRef::queued(JobId::new(), 0).with_state(JobState::Skipped),
        };
        self.merge(record.id, FieldUpdate::Job { stage, job })?;
        info!("Skipped {} for record {}: {}", stage, record.id, reason);
        self.events.send(PipelineEvent::StageSkipped {
            record_id: record.id,
            stage,
            reason,
        });
        Ok(())
    }

    /// Applies merge updates through the finalizer. Returns `false` if the
    /// store kept failing and the run was failed instead.
    fn finalize(
        &self,
        record: &ProcessRecord,
        stage: Stage,
        updates: Vec<FieldUpdate>,
    ) -> Result<bool, CoordinatorError> {
        match self.finalizer.apply(&record.id, updates) {
            Ok(()) => Ok(true),
            Err(failure) => {
                if let StoreError::NotFound(id) = failure.error {
                    return Err(CoordinatorError::RecordNotFound(id));
                }
                error!(
                    "Giving up on merging {} result into record {} after {} attempts: {}",
                    stage, record.id, failure.attempts, failure.error
                );
                let entry = ProcessingErrorEntry::new(
                    "finalize",
                    format!("failed to merge {} into {}: {}", stage, failure.path, failure.error),
                )
                .with_details(format!(
                    "attempt {} of {} (fatal)",
                    failure.attempts,
                    self.finalizer.max_attempts()
                ))
                .with_attempt(failure.attempts);
                self.fail_run(record, Some(entry))?;
                Ok(false)
            }
        }
    }

    fn fail_run(
        &self,
        record: &ProcessRecord,
        entry: Option<ProcessingErrorEntry>,
    ) -> Result<(), CoordinatorError> {
        let id = record.id;
        if let Some(entry) = entry {
            self.store.append_error(&id, entry)?;
        }
        if !record.status.can_transition_to(RecordStatus::Failed) {
            return Err(self.violation(id, format!("cannot fail record in status {}", record.status)));
        }
        self.set_status(record, RecordStatus::Failed)?;
        self.merge(id, FieldUpdate::ProcessingDetails(None))?;
        self.stop(id);

        let record = self.load(id)?;
        let progress = compute_progress(&record, &self.weights, &HashMap::new(), Utc::now());
        if progress != record.progress {
            self.store_progress(&record, progress)?;
        }
        error!("Record {} failed", id);
        Ok(())
    }

    /// Brings status, sub-status and progress in line with the job map.
    fn refresh(&self, id: RecordId) -> Result<(), CoordinatorError> {
        let record = self.load(id)?;
        if record.is_cancelled() || record.is_terminal() {
            return Ok(());
        }

        let complete = dag::is_complete(&record);
        let target = if complete {
            RecordStatus::Completed
        } else {
            dag::target_status(&record)
        };

        if target != record.status {
            let path = record.status.path_to(target).ok_or_else(|| {
                self.violation(
                    id,
                    format!("illegal status move {} -> {}", record.status, target),
                )
            })?;
            let mut current = record.clone();
            for step in path {
                self.set_status(&current, step)?;
                current.status = step;
            }
            if complete {
                self.merge(id, FieldUpdate::CompletedAt(Utc::now()))?;
            }
        }

        let details = if complete {
            None
        } else {
            dag::active_details(&record)
        };
        if details != record.processing_details {
            self.merge(id, FieldUpdate::ProcessingDetails(details))?;
        }

        let record = self.load(id)?;
        let progress = compute_progress(&record, &self.weights, &self.inner_for(id), Utc::now());
        if progress != record.progress {
            self.store_progress(&record, progress)?;
        }

        if complete {
            self.clear_inner(id, None);
            info!("Record {} completed", id);
        }
        Ok(())
    }

    fn set_status(&self, record: &ProcessRecord, to: RecordStatus) -> Result<(), CoordinatorError> {
        let from = record.status;
        if !from.can_transition_to(to) {
            return Err(self.violation(record.id, format!("illegal status move {} -> {}", from, to)));
        }
        if to == RecordStatus::Completed && record.pending_result.is_some() {
            return Err(self.violation(record.id, "completed while pendingResult is set"));
        }
        self.merge(record.id, FieldUpdate::Status(to))?;
        debug!("Record {} status {} -> {}", record.id, from, to);
        self.events.send(PipelineEvent::StatusChanged {
            record_id: record.id,
            from,
            to,
            at: Utc::now(),
        });
        Ok(())
    }

    fn store_progress(&self, record: &ProcessRecord, progress: Progress) -> Result<(), CoordinatorError> {
        let changed = progress.percentage != record.progress.percentage
            || progress.current_step != record.progress.current_step;
        let event = PipelineEvent::ProgressUpdated {
            record_id: record.id,
            percentage: progress.percentage,
            current_step: progress.current_step.clone(),
        };
        self.merge(record.id, FieldUpdate::Progress(progress))?;
        if changed {
            self.events.send(event);
        }
        Ok(())
    }

    // ─── Helpers ────────────────────────────────────────────────────────────

    fn load(&self, id: RecordId) -> Result<ProcessRecord, CoordinatorError> {
        self.store
            .load_record(&id)?
            .ok_or(CoordinatorError::RecordNotFound(id))
    }

    fn merge(&self, id: RecordId, update: FieldUpdate) -> Result<u64, CoordinatorError> {
        Ok(self.store.merge_field(&id, update)?)
    }

    /// Why a report for `job_id` must not be applied, if it must not.
    fn discard_reason(&self, record: &ProcessRecord, stage: Stage, job_id: JobId) -> Option<String> {
        if record.is_cancelled() {
            return Some("record cancelled".to_string());
        }
        if record.is_terminal() {
            return Some(format!("record already {}", record.status));
        }
        match record.job(stage) {
            None => Some("no job recorded for stage".to_string()),
            Some(job) if job.job_id != job_id => Some(format!(
                "stale attempt (current job is attempt {})",
                job.attempt
            )),
            Some(job) if !job.state.is_active() => {
                Some(format!("job already {:?}", job.state).to_lowercase())
            }
            Some(_) => None,
        }
    }

    fn discard(&self, id: RecordId, stage: Stage, reason: String) {
        info!("Discarding {} report for record {}: {}", stage, id, reason);
        self.events.send(PipelineEvent::ResultDiscarded {
            record_id: id,
            stage,
            reason,
        });
    }

    fn violation(&self, id: RecordId, message: impl Into<String>) -> CoordinatorError {
        let message = message.into();
        error!("Invariant violation on record {}: {}", id, message);
        CoordinatorError::InvariantViolation { id, message }
    }

    fn inner_for(&self, id: RecordId) -> HashMap<Stage, f32> {
        self.inner_progress
            .lock()
            .ok()
            .and_then(|m| m.get(&id).cloned())
            .unwrap_or_default()
    }

    fn set_inner(&self, id: RecordId, stage: Stage, fraction: f32) {
        if let Ok(mut map) = self.inner_progress.lock() {
            map.entry(id).or_default().insert(stage, fraction.clamp(0.0, 1.0));
        }
    }

    fn clear_inner(&self, id: RecordId, stage: Option<Stage>) {
        if let Ok(mut map) = self.inner_progress.lock() {
            match stage {
                Some(stage) => {
                    if let Some(stages) = map.get_mut(&id) {
                        stages.remove(&stage);
                        if stages.is_empty() {
                            map.remove(&id);
                        }
                    }
                }
                None => {
                    map.remove(&id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageOverride;
    use crate::record::FileRef;
    use crate::store::MemoryRecordStore;

    fn coordinator() -> StageCoordinator {
        let mut config = OrchestratorConfig::with_work_directory("/work");
        for stage in Stage::ALL {
            config.stages.insert(
                stage,
                StageOverride {
                    backoff_base_ms: Some(0),
                    ..Default::default()
                },
            );
        }
        StageCoordinator::new(
            &config,
            Arc::new(MemoryRecordStore::new()),
            QueueSet::in_memory(),
            PipelineEventBroadcaster::new(64),
        )
    }

    fn submitted(coord: &StageCoordinator) -> RecordId {
        let record = coord.create_record("tenant", "owner").unwrap();
        assert!(coord
            .submit(record.id, SourceFileRef::new("/uploads/in.mov", 1024, "mov"))
            .unwrap());
        record.id
    }

    fn take(coord: &StageCoordinator, stage: Stage) -> StageJob {
        coord
            .queues()
            .for_stage(stage)
            .dequeue(Duration::ZERO)
            .unwrap()
            .unwrap()
    }

    fn load(coord: &StageCoordinator, id: RecordId) -> ProcessRecord {
        coord.store().load_record(&id).unwrap().unwrap()
    }

    #[test]
    fn test_submit_starts_compression_and_audio() {
        let coord = coordinator();
        let id = submitted(&coord);

        let record = load(&coord, id);
        assert_eq!(record.status, RecordStatus::ProcessingMedia);
        assert_eq!(record.stage_state(Stage::Compression), Some(JobState::Queued));
        assert_eq!(record.stage_state(Stage::AudioExtraction), Some(JobState::Queued));
        assert!(record.job(Stage::Transcription).is_none());
        assert_eq!(coord.queues().total_depth(), 2);
    }

    #[test]
    fn test_duplicate_submit_is_noop() {
        let coord = coordinator();
        let id = submitted(&coord);
        let again = coord
            .submit(id, SourceFileRef::new("/uploads/other.mov", 1, "mov"))
            .unwrap();
        assert!(!again);
        assert_eq!(coord.queues().total_depth(), 2);
        assert_eq!(
            load(&coord, id).files.original.unwrap().path,
            "/uploads/in.mov"
        );
    }

    #[test]
    fn test_upload_accepted_without_file_is_violation() {
        let coord = coordinator();
        let record = coord.create_record("t", "o").unwrap();
        let err = coord.on_upload_accepted(record.id).unwrap_err();
        assert!(matches!(err, CoordinatorError::InvariantViolation { .. }));
    }

    #[test]
    fn test_started_marks_running() {
        let coord = coordinator();
        let id = submitted(&coord);
        let job = take(&coord, Stage::AudioExtraction);

        coord.on_stage_started(id, job.stage, job.job_id).unwrap();
        let record = load(&coord, id);
        assert_eq!(record.stage_state(Stage::AudioExtraction), Some(JobState::Running));
        assert_eq!(
            record.processing_details,
            Some(ProcessingDetails::ExtractingAudio)
        );
    }

    #[test]
    fn test_compression_result_waits_for_audio() {
        let coord = coordinator();
        let id = submitted(&coord);
        let compression = take(&coord, Stage::Compression);
        let audio = take(&coord, Stage::AudioExtraction);

        coord
            .on_stage_completed(
                id,
                Stage::Compression,
                compression.job_id,
                StageResult::Compression(FileRef::local("/work/c.mp4", 10, "mp4")),
            )
            .unwrap();
        let record = load(&coord, id);
        assert!(record.pending_result.is_some());
        assert!(record.files.processed.is_none());
        assert_eq!(record.stage_state(Stage::Compression), Some(JobState::PendingMerge));

        coord
            .on_stage_completed(
                id,
                Stage::AudioExtraction,
                audio.job_id,
                StageResult::AudioExtraction(FileRef::local("/work/a.wav", 5, "wav")),
            )
            .unwrap();
        let record = load(&coord, id);
        assert!(record.pending_result.is_none());
        assert_eq!(record.files.processed.as_ref().unwrap().path, "/work/c.mp4");
        assert_eq!(record.stage_state(Stage::Compression), Some(JobState::Completed));
        assert_eq!(record.status, RecordStatus::Transcribing);
    }

    #[test]
    fn test_stale_job_result_is_discarded() {
        let coord = coordinator();
        let id = submitted(&coord);
        let _audio = take(&coord, Stage::AudioExtraction);
        let mut events = coord.events().subscribe();

        coord
            .on_stage_completed(
                id,
                Stage::AudioExtraction,
                JobId::new(),
                StageResult::AudioExtraction(FileRef::local("/work/a.wav", 5, "wav")),
            )
            .unwrap();

        let record = load(&coord, id);
        assert!(record.files.audio.is_none());
        assert!(matches!(
            events.try_recv().unwrap(),
            PipelineEvent::ResultDiscarded { .. }
        ));
    }

    #[test]
    fn test_wrong_result_variant_fails_essential_stage() {
        let coord = coordinator();
        let id = submitted(&coord);
        let audio = take(&coord, Stage::AudioExtraction);

        coord
            .on_stage_completed(
                id,
                Stage::AudioExtraction,
                audio.job_id,
                StageResult::Title("nope".into()),
            )
            .unwrap();

        let record = load(&coord, id);
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.processing_errors.len(), 1);
        assert_eq!(record.processing_errors[0].step, "audio_extraction");
        assert_eq!(coord.queues().total_depth(), 0);
    }

    #[test]
    fn test_retryable_failure_reenqueues_next_attempt() {
        let coord = coordinator();
        let id = submitted(&coord);
        let audio = take(&coord, Stage::AudioExtraction);

        coord
            .on_stage_failed(
                id,
                Stage::AudioExtraction,
                audio.job_id,
                StageFailure::retryable("ffmpeg busy"),
            )
            .unwrap();

        let record = load(&coord, id);
        let job = record.job(Stage::AudioExtraction).unwrap();
        assert_eq!(job.attempt, 2);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(record.processing_errors[0].attempt, Some(1));
        assert_eq!(
            record.processing_errors[0].details.as_deref(),
            Some("attempt 1 of 3 (retryable)")
        );

        let retry = take(&coord, Stage::AudioExtraction);
        assert_eq!(retry.attempt, 2);
        assert_ne!(retry.job_id, audio.job_id);
    }

    #[test]
    fn test_progress_only_moves_forward() {
        let coord = coordinator();
        let id = submitted(&coord);
        let compression = take(&coord, Stage::Compression);

        coord
            .on_stage_progress(id, Stage::Compression, compression.job_id, 0.8)
            .unwrap();
        let high = load(&coord, id).progress.percentage;
        assert_eq!(high, 20);

        coord
            .on_stage_progress(id, Stage::Compression, compression.job_id, 0.1)
            .unwrap();
        assert_eq!(load(&coord, id).progress.percentage, high);
    }

    #[test]
    fn test_cancel_purges_and_discards() {
        let coord = coordinator();
        let id = submitted(&coord);
        let audio = take(&coord, Stage::AudioExtraction);

        coord.cancel(id).unwrap();
        assert_eq!(coord.queues().total_depth(), 0);

        coord
            .on_stage_completed(
                id,
                Stage::AudioExtraction,
                audio.job_id,
                StageResult::AudioExtraction(FileRef::local("/work/a.wav", 5, "wav")),
            )
            .unwrap();
        let record = load(&coord, id);
        assert!(record.cancelled);
        assert!(record.files.audio.is_none());
        assert!(record.job(Stage::Transcription).is_none());
    }

    #[test]
    fn test_submit_on_deleted_record_errors() {
        let coord = coordinator();
        let record = coord.create_record("t", "o").unwrap();
        coord.soft_delete(record.id).unwrap();
        let err = coord
            .submit(record.id, SourceFileRef::new("/u.mov", 1, "mov"))
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::RecordDeleted { .. }));
    }

    #[test]
    fn test_status_snapshot_of_unknown_record() {
        let coord = coordinator();
        assert!(matches!(
            coord.get_status(RecordId::new()),
            Err(CoordinatorError::RecordNotFound(_))
        ));
    }
}
