use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::record::{JobId, RecordId, RecordStatus};
use crate::stage::Stage;

/// Something that happened to a record's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageEnqueued {
        record_id: RecordId,
        stage: Stage,
        job_id: JobId,
        attempt: u32,
    },
    StageRetryScheduled {
        record_id: RecordId,
        stage: Stage,
        attempt: u32,
        delay_ms: u64,
    },
    StageCompleted {
        record_id: RecordId,
        stage: Stage,
    },
    StageFailed {
        record_id: RecordId,
        stage: Stage,
        attempt: u32,
        message: String,
    },
    StageSkipped {
        record_id: RecordId,
        stage: Stage,
        reason: String,
    },
    StatusChanged {
        record_id: RecordId,
        from: RecordStatus,
        to: RecordStatus,
        at: DateTime<Utc>,
    },
    ProgressUpdated {
        record_id: RecordId,
        percentage: u8,
        current_step: String,
    },
    /// A report arrived for a cancelled, finished or superseded job.
    ResultDiscarded {
        record_id: RecordId,
        stage: Stage,
        reason: String,
    },
}

impl PipelineEvent {
    pub fn record_id(&self) -> RecordId {
        match self {
            PipelineEvent::StageEnqueued { record_id, .. }
            | PipelineEvent::StageRetryScheduled { record_id, .. }
            | PipelineEvent::StageCompleted { record_id, .. }
            | PipelineEvent::StageFailed { record_id, .. }
            | PipelineEvent::StageSkipped { record_id, .. }
            | PipelineEvent::StatusChanged { record_id, .. }
            | PipelineEvent::ProgressUpdated { record_id, .. }
            | PipelineEvent::ResultDiscarded { record_id, .. } => *record_id,
        }
    }
}

/// Broadcasts pipeline events to any number of subscribers.
#[derive(Clone)]
pub struct PipelineEventBroadcaster {
    sender: Arc<broadcast::Sender<PipelineEvent>>,
}

impl PipelineEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: PipelineEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for PipelineEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
