use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::record::{JobId, RecordId};
use crate::stage::Stage;
use crate::worker::WorkerMessage;

/// Events a stage worker may emit while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Fraction of the stage's own work done, `0.0..=1.0`.
    Fraction(f32),
    /// Free-form phase note, logged only.
    Phase { message: String },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);

    /// Set once the attempt has been abandoned (timed out). Long-running
    /// workers should check it between steps and return promptly.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards inner progress of one job to the dispatcher and carries the
/// job's cancellation flag.
pub struct ChannelProgress {
    record_id: RecordId,
    stage: Stage,
    job_id: JobId,
    sender: Sender<WorkerMessage>,
    cancelled: Arc<AtomicBool>,
}

impl ChannelProgress {
    pub fn new(record_id: RecordId, stage: Stage, job_id: JobId, sender: Sender<WorkerMessage>) -> Self {
        Self {
            record_id,
            stage,
            job_id,
            sender,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that cancels this job when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

impl ProgressReporter for ChannelProgress {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn report(&self, event: ProgressEvent) {
        if self.is_cancelled() {
            return;
        }
        match event {
            ProgressEvent::Fraction(fraction) => {
                let message = WorkerMessage::Progress {
                    record_id: self.record_id,
                    stage: self.stage,
                    job_id: self.job_id,
                    fraction: fraction.clamp(0.0, 1.0),
                };
                // Best effort: a full channel drops the update.
                if self.sender.try_send(message).is_err() {
                    log::trace!("Dropped progress update for {} {}", self.record_id, self.stage);
                }
            }
            ProgressEvent::Phase { message } => {
                log::debug!("[{} {}] {}", self.record_id, self.stage, message);
            }
        }
    }
}
