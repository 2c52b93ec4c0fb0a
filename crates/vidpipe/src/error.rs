use std::path::PathBuf;
use thiserror::Error;

use crate::record::RecordId;
use crate::stage::{QueueName, Stage};

#[derive(Error, Debug)]
pub enum VidpipeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid settings for stage '{stage}': {reason}")]
    InvalidStage { stage: Stage, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(RecordId),

    #[error("Record already exists: {0}")]
    AlreadyExists(RecordId),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Failed to encode field '{field}': {source}")]
    Encode {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Corrupt column '{column}' for record {id}: {reason}")]
    Corrupt {
        id: RecordId,
        column: &'static str,
        reason: String,
    },

    #[error("Record store lock poisoned")]
    LockPoisoned,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue '{0}' is closed")]
    Closed(QueueName),

    #[error("Queue '{0}' is not configured")]
    Missing(QueueName),

    #[error("Queue '{0}' is configured twice")]
    Duplicate(QueueName),

    #[error("Stage '{stage}' cannot be placed on queue '{queue}'")]
    WrongQueue { stage: Stage, queue: QueueName },

    #[error("Queue lock poisoned")]
    LockPoisoned,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("No worker registered for stage '{0}'")]
    MissingWorker(Stage),
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("Record {id} was deleted")]
    RecordDeleted { id: RecordId },

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A programming error in the coordinator. Never applied to the record.
    #[error("Invariant violation on record {id}: {message}")]
    InvariantViolation { id: RecordId, message: String },

    #[error("Record lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, VidpipeError>;
