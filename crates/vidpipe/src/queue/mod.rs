//! Named job queues.
//!
//! Each queue carries jobs for the stages mapped onto it. Queues are injected
//! into the coordinator and the worker pools as a [`QueueSet`], so tests can
//! drive the pipeline by pulling jobs directly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueueError;
use crate::record::RecordId;
use crate::stage::{QueueName, Stage};
use crate::worker::StageJob;

pub mod memory;

pub use memory::InMemoryQueue;

pub trait JobQueue: Send + Sync {
    fn name(&self) -> QueueName;

    /// Adds a job that becomes visible to consumers after `delay`.
    fn enqueue(&self, job: StageJob, delay: Duration) -> Result<(), QueueError>;

    /// Waits up to `wait` for a ready job. `Ok(None)` on timeout,
    /// `Err(QueueError::Closed)` once the queue is closed.
    fn dequeue(&self, wait: Duration) -> Result<Option<StageJob>, QueueError>;

    /// Jobs waiting in the queue, delayed ones included.
    fn depth(&self) -> usize;

    /// Removes every waiting job of the record. Returns how many were removed.
    fn purge_record(&self, record_id: &RecordId) -> usize;

    fn close(&self);
}

/// The six pipeline queues, keyed by name.
#[derive(Clone)]
pub struct QueueSet {
    queues: BTreeMap<QueueName, Arc<dyn JobQueue>>,
}

impl QueueSet {
    /// Builds a set from caller-provided queues. Every [`QueueName`] must be
    /// present exactly once.
    pub fn new(queues: Vec<Arc<dyn JobQueue>>) -> Result<Self, QueueError> {
        let mut map = BTreeMap::new();
        for queue in queues {
            let name = queue.name();
            if map.insert(name, queue).is_some() {
                return Err(QueueError::Duplicate(name));
            }
        }
        for name in QueueName::ALL {
            if !map.contains_key(&name) {
                return Err(QueueError::Missing(name));
            }
        }
        Ok(Self { queues: map })
    }

    pub fn in_memory() -> Self {
        let queues = QueueName::ALL
            .into_iter()
            .map(|name| (name, Arc::new(InMemoryQueue::new(name)) as Arc<dyn JobQueue>))
            .collect();
        Self { queues }
    }

    pub fn get(&self, name: QueueName) -> Arc<dyn JobQueue> {
        // Every name is present by construction.
        Arc::clone(&self.queues[&name])
    }

    pub fn for_stage(&self, stage: Stage) -> Arc<dyn JobQueue> {
        self.get(stage.queue())
    }

    pub fn enqueue(&self, job: StageJob, delay: Duration) -> Result<(), QueueError> {
        self.for_stage(job.stage).enqueue(job, delay)
    }

    pub fn purge_record(&self, record_id: &RecordId) -> usize {
        self.queues.values().map(|q| q.purge_record(record_id)).sum()
    }

    pub fn total_depth(&self) -> usize {
        self.queues.values().map(|q| q.depth()).sum()
    }

    pub fn close_all(&self) {
        for queue in self.queues.values() {
            queue.close();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (QueueName, &Arc<dyn JobQueue>)> {
        self.queues.iter().map(|(name, q)| (*name, q))
    }
}
