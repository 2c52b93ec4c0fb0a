//! In-process delayed queue.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::JobQueue;
use crate::error::QueueError;
use crate::record::RecordId;
use crate::stage::QueueName;
use crate::worker::StageJob;

struct Entry {
    available_at: Instant,
    job: StageJob,
}

#[derive(Default)]
struct State {
    /// Sorted by `available_at`; FIFO among equal instants.
    entries: VecDeque<Entry>,
    closed: bool,
}

/// FIFO queue with per-job visibility delay, backed by a `Mutex` + `Condvar`.
pub struct InMemoryQueue {
    name: QueueName,
    state: Mutex<State>,
    ready: Condvar,
}

impl InMemoryQueue {
    pub fn new(name: QueueName) -> Self {
        Self {
            name,
            state: Mutex::new(State::default()),
            ready: Condvar::new(),
        }
    }
}

impl JobQueue for InMemoryQueue {
    fn name(&self) -> QueueName {
        self.name
    }

    fn enqueue(&self, job: StageJob, delay: Duration) -> Result<(), QueueError> {
        if job.stage.queue() != self.name {
            return Err(QueueError::WrongQueue {
                stage: job.stage,
                queue: self.name,
            });
        }

        let mut state = self.state.lock().map_err(|_| QueueError::LockPoisoned)?;
        if state.closed {
            return Err(QueueError::Closed(self.name));
        }

        let available_at = Instant::now() + delay;
        let pos = state
            .entries
            .iter()
            .position(|e| e.available_at > available_at)
            .unwrap_or(state.entries.len());
        state.entries.insert(pos, Entry { available_at, job });
        drop(state);

        self.ready.notify_one();
        Ok(())
    }

    fn dequeue(&self, wait: Duration) -> Result<Option<StageJob>, QueueError> {
        let deadline = Instant::now() + wait;
        let mut state = self.state.lock().map_err(|_| QueueError::LockPoisoned)?;

        loop {
            if state.closed {
                return Err(QueueError::Closed(self.name));
            }

            let now = Instant::now();
            if state
                .entries
                .front()
                .is_some_and(|e| e.available_at <= now)
            {
                return Ok(state.entries.pop_front().map(|e| e.job));
            }

            if now >= deadline {
                return Ok(None);
            }

            let wake_at = state
                .entries
                .front()
                .map(|e| e.available_at.min(deadline))
                .unwrap_or(deadline);
            let (guard, _) = self
                .ready
                .wait_timeout(state, wake_at.saturating_duration_since(now))
                .map_err(|_| QueueError::LockPoisoned)?;
            state = guard;
        }
    }

    fn depth(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    fn purge_record(&self, record_id: &RecordId) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        let before = state.entries.len();
        state.entries.retain(|e| e.job.record_id != *record_id);
        before - state.entries.len()
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.ready.notify_all();
    }
}
