//! Orchestrator runtime.
//!
//! Wires the coordinator to one worker pool per queue and runs the dispatcher
//! threads that feed worker reports back into the coordinator. A router hashes
//! each report by record onto a shard, so reports for one record stay ordered
//! while different records are handled in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn};

use crate::broadcast::PipelineEventBroadcaster;
use crate::config::{validate_config, OrchestratorConfig};
use crate::coordinator::StageCoordinator;
use crate::db::{default_database_path, Database};
use crate::error::{ConfigError, Result, WorkerError};
use crate::queue::QueueSet;
use crate::store::{RecordStore, SqliteRecordStore};
use crate::record::RecordId;
use crate::worker::{WorkerMessage, WorkerPool, WorkerRegistry};

const DISPATCH_POLL: Duration = Duration::from_millis(100);
const MESSAGE_CAPACITY: usize = 1024;

/// A running pipeline: coordinator, worker pools and dispatchers.
pub struct Orchestrator {
    coordinator: Arc<StageCoordinator>,
    pools: Vec<WorkerPool>,
    /// Router first, then the shards it feeds.
    dispatchers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Validates the configuration and the worker registry, starts the pools
    /// and the dispatcher, then resumes records left mid-pipeline in `store`.
    pub fn start(
        config: &OrchestratorConfig,
        store: Arc<dyn RecordStore>,
        queues: QueueSet,
        registry: WorkerRegistry,
    ) -> Result<Self> {
        validate_config(config)?;
        registry.ensure_complete()?;

        let events = PipelineEventBroadcaster::new(config.event_capacity);
        let coordinator = Arc::new(StageCoordinator::new(config, store, queues.clone(), events));
        let timeouts = coordinator.policy().timeouts();
        let (tx, rx) = bounded::<WorkerMessage>(MESSAGE_CAPACITY);

        let mut pools = Vec::new();
        for (name, queue) in queues.iter() {
            let pool = WorkerPool::start(
                Arc::clone(queue),
                &registry,
                &timeouts,
                config.cancel_grace(),
                config.workers_for(name),
                tx.clone(),
            );
            match pool {
                Ok(pool) => pools.push(pool),
                Err(e) => {
                    stop_pools(pools, &queues);
                    return Err(e.into());
                }
            }
        }
        // Only the pools keep senders; the channel disconnects once they exit.
        drop(tx);

        let shutdown = Arc::new(AtomicBool::new(false));
        let dispatchers = match spawn_dispatchers(
            rx,
            &coordinator,
            &shutdown,
            config.dispatcher_threads.max(1),
        ) {
            Ok(handles) => handles,
            Err(e) => {
                stop_pools(pools, &queues);
                return Err(e.into());
            }
        };

        info!(
            "Orchestrator started with {} worker pools and {} dispatch shards",
            pools.len(),
            dispatchers.len() - 1
        );

        if let Err(e) = coordinator.recover() {
            error!("Failed to scan for interrupted records: {}", e);
        }

        Ok(Self {
            coordinator,
            pools,
            dispatchers,
            shutdown,
        })
    }

    pub fn coordinator(&self) -> &Arc<StageCoordinator> {
        &self.coordinator
    }

    /// Stops the pools, closes every queue and joins all threads. Reports
    /// already sent by workers are still dispatched.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let dispatchers = std::mem::take(&mut self.dispatchers);
        if dispatchers.is_empty() {
            return;
        }
        info!("Shutting down orchestrator...");

        let pools = std::mem::take(&mut self.pools);
        stop_pools(pools, self.coordinator.queues());

        // Workers are joined; whatever they sent is already in the channel.
        // The router drains it, then dropping its senders ends the shards.
        self.shutdown.store(true, Ordering::Release);
        join_all(dispatchers);
        info!("Orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn stop_pools(pools: Vec<WorkerPool>, queues: &QueueSet) {
    for pool in &pools {
        pool.shutdown();
    }
    queues.close_all();
    for pool in pools {
        pool.wait();
    }
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.join() {
            error!("Dispatcher panicked: {:?}", e);
        }
    }
}

/// Starts `shards` dispatch threads plus the router feeding them. The router
/// is returned first.
fn spawn_dispatchers(
    rx: Receiver<WorkerMessage>,
    coordinator: &Arc<StageCoordinator>,
    shutdown: &Arc<AtomicBool>,
    shards: usize,
) -> std::result::Result<Vec<JoinHandle<()>>, WorkerError> {
    let mut senders = Vec::with_capacity(shards);
    let mut handles = Vec::with_capacity(shards + 1);
    for n in 0..shards {
        let (shard_tx, shard_rx) = bounded::<WorkerMessage>(MESSAGE_CAPACITY);
        let coordinator = Arc::clone(coordinator);
        let spawned = thread::Builder::new()
            .name(format!("vidpipe-dispatch-{}", n))
            .spawn(move || dispatch_shard(shard_rx, coordinator));
        match spawned {
            Ok(handle) => {
                senders.push(shard_tx);
                handles.push(handle);
            }
            Err(e) => {
                drop(senders);
                join_all(handles);
                return Err(WorkerError::SpawnFailed(e.to_string()));
            }
        }
    }

    let shutdown = Arc::clone(shutdown);
    let spawned = thread::Builder::new()
        .name("vidpipe-dispatcher".to_string())
        .spawn(move || route(rx, senders, shutdown));
    match spawned {
        Ok(router) => {
            handles.insert(0, router);
            Ok(handles)
        }
        Err(e) => {
            // The closure and its senders were dropped with the failed spawn.
            join_all(handles);
            Err(WorkerError::SpawnFailed(e.to_string()))
        }
    }
}

fn shard_for(record_id: RecordId, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    record_id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

fn route(rx: Receiver<WorkerMessage>, shards: Vec<Sender<WorkerMessage>>, shutdown: Arc<AtomicBool>) {
    loop {
        match rx.recv_timeout(DISPATCH_POLL) {
            Ok(message) => {
                let shard = shard_for(message.record_id(), shards.len());
                if shards[shard].send(message).is_err() {
                    error!("Dispatch shard {} is gone, dropping worker report", shard);
                }
            }
            // A timed-out job's helper thread may still hold a sender, so
            // disconnection alone cannot end the loop.
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                info!("Dispatcher stopping: all workers exited");
                break;
            }
        }
    }
}

fn dispatch_shard(rx: Receiver<WorkerMessage>, coordinator: Arc<StageCoordinator>) {
    for message in rx.iter() {
        if let Err(e) = coordinator.handle_message(message) {
            error!("Failed to handle worker report: {}", e);
        }
    }
}


/// Opens the SQLite store at the configured path, or at the default
/// location when none is set.
pub fn open_sqlite_store(config: &OrchestratorConfig) -> Result<Arc<SqliteRecordStore>> {
    let path = match config.database_path() {
        Some(path) => path,
        None => default_database_path().ok_or_else(|| ConfigError::Validation {
            message: "database_path is not set and no home directory was found".to_string(),
        })?,
    };
    let db = Database::open(&path)?;
    if config.database_path.is_none() {
        warn!("No database_path configured, using {}", path.display());
    }
    Ok(Arc::new(SqliteRecordStore::new(db)))
}
