use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::error::{QueueError, WorkerError};
use crate::progress::ChannelProgress;
use crate::queue::JobQueue;
use crate::stage::Stage;
use crate::worker::{StageJob, StageOutcome, StageWorker, WorkerMessage, WorkerRegistry};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Worker threads pulling from one queue.
pub struct WorkerPool {
    queue_name: crate::stage::QueueName,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `worker_count` threads for `queue`. Every stage of the queue
    /// must have a registered worker and a timeout. A timed-out attempt is
    /// cancelled and given `cancel_grace` to stop before its failure is
    /// reported.
    pub fn start(
        queue: Arc<dyn JobQueue>,
        registry: &WorkerRegistry,
        timeouts: &HashMap<Stage, Duration>,
        cancel_grace: Duration,
        worker_count: usize,
        messages: Sender<WorkerMessage>,
    ) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::SpawnFailed(format!(
                "queue '{}' needs at least one worker",
                queue.name()
            )));
        }

        let queue_name = queue.name();
        let mut stage_workers = HashMap::new();
        for stage in queue_name.stages() {
            let timeout = timeouts.get(&stage).copied().ok_or_else(|| {
                WorkerError::SpawnFailed(format!("no timeout configured for stage '{}'", stage))
            })?;
            stage_workers.insert(stage, (registry.get(stage)?, timeout));
        }
        let stage_workers = Arc::new(stage_workers);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let queue = Arc::clone(&queue);
            let stage_workers = Arc::clone(&stage_workers);
            let shutdown_flag = Arc::clone(&shutdown);
            let messages = messages.clone();

            let handle = thread::Builder::new()
                .name(format!("{}-{}", queue_name, worker_id))
                .spawn(move || {
                    run_worker(
                        worker_id,
                        queue,
                        stage_workers,
                        cancel_grace,
                        shutdown_flag,
                        messages,
                    );
                })
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

            workers.push(handle);
        }

        info!("Started {} workers for queue {}", worker_count, queue_name);

        Ok(Self {
            queue_name,
            workers,
            shutdown,
        })
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool {}...", self.queue_name);
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Joins all worker threads. Call [`shutdown`](Self::shutdown) or close
    /// the queue first.
    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {}-{} panicked: {:?}", self.queue_name, i, e);
            } else {
                debug!("Worker {}-{} finished", self.queue_name, i);
            }
        }

        info!("All workers of {} have stopped", self.queue_name);
    }
}

type StageWorkers = HashMap<Stage, (Arc<dyn StageWorker>, Duration)>;

fn run_worker(
    worker_id: usize,
    queue: Arc<dyn JobQueue>,
    stage_workers: Arc<StageWorkers>,
    cancel_grace: Duration,
    shutdown: Arc<AtomicBool>,
    messages: Sender<WorkerMessage>,
) {
    let queue_name = queue.name();
    debug!("Worker {}-{} started", queue_name, worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {}-{} received shutdown signal", queue_name, worker_id);
            break;
        }

        let job = match queue.dequeue(POLL_INTERVAL) {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(QueueError::Closed(_)) => {
                debug!("Worker {}-{} queue closed", queue_name, worker_id);
                break;
            }
            Err(e) => {
                error!("Worker {}-{} failed to dequeue: {}", queue_name, worker_id, e);
                break;
            }
        };

        let Some((worker, timeout)) = stage_workers.get(&job.stage) else {
            // Queues only accept their own stages.
            error!("No worker for stage {} on queue {}", job.stage, queue_name);
            continue;
        };

        let _span = tracing::info_span!(
            "stage_job",
            record_id = %job.record_id,
            stage = %job.stage,
            attempt = job.attempt
        )
        .entered();

        let started = WorkerMessage::Started {
            record_id: job.record_id,
            stage: job.stage,
            job_id: job.job_id,
        };
        if messages.send(started).is_err() {
            error!("Worker {}-{} lost the dispatcher", queue_name, worker_id);
            break;
        }

        let outcome =
            execute_with_timeout(Arc::clone(worker), &job, *timeout, cancel_grace, &messages);
        let finished = WorkerMessage::Finished {
            record_id: job.record_id,
            stage: job.stage,
            job_id: job.job_id,
            attempt: job.attempt,
            outcome,
        };
        if let Err(e) = messages.send(finished) {
            error!("Worker {}-{} failed to send result: {}", queue_name, worker_id, e);
            break;
        }
    }

    debug!("Worker {}-{} stopped", queue_name, worker_id);
}

/// Runs the stage on a helper thread and gives up after `timeout`.
///
/// An overrunning attempt is cancelled through its reporter and reported as
/// retryable only after it has returned, or after `cancel_grace` has passed,
/// so its retry does not normally run next to it. Its late result is dropped.
pub(crate) fn execute_with_timeout(
    worker: Arc<dyn StageWorker>,
    job: &StageJob,
    timeout: Duration,
    cancel_grace: Duration,
    messages: &Sender<WorkerMessage>,
) -> StageOutcome {
    let (tx, rx) = bounded::<StageOutcome>(1);
    let progress = ChannelProgress::new(job.record_id, job.stage, job.job_id, messages.clone());
    let cancel = progress.cancel_handle();
    let helper_job = job.clone();

    let spawned = thread::Builder::new()
        .name(format!("{}-exec", job.stage))
        .spawn(move || {
            let outcome = worker.execute(&helper_job, &progress);
            let _ = tx.send(outcome);
        });
    if let Err(e) = spawned {
        return StageOutcome::RetryableFailure(format!("failed to start stage thread: {}", e));
    }

    match rx.recv_timeout(timeout) {
        Ok(outcome) => outcome,
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                "Stage {} for record {} timed out after {:?}, cancelling attempt {}",
                job.stage, job.record_id, timeout, job.attempt
            );
            cancel.store(true, Ordering::Release);
            match rx.recv_timeout(cancel_grace) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("Abandoned {} attempt {} has stopped", job.stage, job.attempt);
                }
                Err(RecvTimeoutError::Timeout) => {
                    error!(
                        "Stage {} for record {} still running {:?} after cancellation; retrying anyway",
                        job.stage, job.record_id, cancel_grace
                    );
                }
            }
            StageOutcome::RetryableFailure(format!("timed out after {}s", timeout.as_secs_f64()))
        }
        Err(RecvTimeoutError::Disconnected) => {
            StageOutcome::RetryableFailure("stage worker panicked".to_string())
        }
    }
}
