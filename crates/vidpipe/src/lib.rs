//! Video processing pipeline orchestrator.
//!
//! Turns an uploaded video into a processed record by scheduling nine stages
//! (compression, audio extraction, transcription, AI analysis, archival and
//! cleanup) as a dependency graph over six job queues, merging each stage's
//! output into its own field group of the record.

pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod logging;
pub mod progress;
pub mod queue;
pub mod record;
pub mod runtime;
pub mod stage;
pub mod store;
pub mod worker;

pub use broadcast::{PipelineEvent, PipelineEventBroadcaster};
pub use config::{load_config, load_config_from_str, validate_config, OrchestratorConfig};
pub use coordinator::{StageCoordinator, StatusSnapshot};
pub use error::{
    ConfigError, CoordinatorError, QueueError, Result, StoreError, VidpipeError, WorkerError,
};
pub use logging::init_logging;
pub use progress::{NoopProgress, ProgressEvent, ProgressReporter};
pub use queue::{InMemoryQueue, JobQueue, QueueSet};
pub use record::{ProcessRecord, RecordId, RecordStatus, SourceFileRef};
pub use runtime::{open_sqlite_store, Orchestrator};
pub use stage::{QueueName, Stage};
pub use store::{MemoryRecordStore, RecordStore, SqliteRecordStore};
pub use worker::{
    StageFailure, StageInput, StageJob, StageOutcome, StageResult, StageWorker, WorkerRegistry,
};
