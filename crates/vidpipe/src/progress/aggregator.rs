//! Progress aggregation.
//!
//! Pure functions from record state to a [`Progress`] value. The result is
//! clamped against the previously stored value so the percentage never
//! regresses, whatever order stage events arrive in.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::config::OrchestratorConfig;
use crate::record::{JobState, ProcessRecord, Progress, RecordStatus};
use crate::stage::Stage;

/// Share of the progress bar per stage. Sums to 100.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageWeights(BTreeMap<Stage, u8>);

impl StageWeights {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self(
            Stage::ALL
                .into_iter()
                .map(|s| (s, config.stage(s).weight))
                .collect(),
        )
    }

    pub fn weight(&self, stage: Stage) -> u8 {
        self.0.get(&stage).copied().unwrap_or(0)
    }
}

/// Seconds left, extrapolated linearly from the time spent so far.
pub fn estimate_remaining(percentage: u8, started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<u64> {
    let started_at = started_at?;
    if percentage == 0 || percentage >= 100 {
        return None;
    }
    let elapsed = (now - started_at).num_seconds().max(0) as u64;
    Some(elapsed * (100 - percentage as u64) / percentage as u64)
}

fn status_label(status: RecordStatus) -> &'static str {
    match status {
        RecordStatus::Uploading => "Waiting for upload",
        RecordStatus::Uploaded => "Upload received",
        RecordStatus::ProcessingMedia => "Processing media",
        RecordStatus::Transcribing => "Transcribing",
        RecordStatus::Analyzing => "Analyzing",
        RecordStatus::Finalizing => "Finalizing",
        RecordStatus::Completed => "Completed",
        RecordStatus::Failed => "Failed",
    }
}

/// Computes progress for `record`.
///
/// `inner` holds the last reported fraction of each active stage. Stages that
/// are completed, skipped or parked awaiting merge count with their full
/// weight; queued and running stages count with `weight * inner`.
pub fn compute_progress(
    record: &ProcessRecord,
    weights: &StageWeights,
    inner: &HashMap<Stage, f32>,
    now: DateTime<Utc>,
) -> Progress {
    let mut total = 0.0f64;
    let mut running = Vec::new();
    for (stage, job) in &record.jobs {
        let weight = weights.weight(*stage) as f64;
        match job.state {
            JobState::Completed | JobState::Skipped | JobState::PendingMerge => total += weight,
            JobState::Queued | JobState::Running => {
                let fraction = inner.get(stage).copied().unwrap_or(0.0).clamp(0.0, 1.0) as f64;
                total += weight * fraction;
                if job.state == JobState::Running {
                    running.push(stage.as_str());
                }
            }
            JobState::Failed => {}
        }
    }

    let computed = if record.status == RecordStatus::Completed {
        100
    } else {
        (total.floor() as u64).min(100) as u8
    };
    let percentage = computed.max(record.progress.percentage);

    let current_step = match record.processing_details {
        Some(details) => details.to_string(),
        None => status_label(record.status).to_string(),
    };

    Progress {
        percentage,
        current_step,
        step_details: if running.is_empty() {
            None
        } else {
            Some(format!("Running: {}", running.join(", ")))
        },
        estimated_time_remaining: if record.status.is_terminal() {
            None
        } else {
            estimate_remaining(percentage, record.processing_started_at, now)
        },
    }
}
