pub mod field;
pub mod status;
pub mod types;

pub use field::{FieldOwner, FieldUpdate};
pub use status::RecordStatus;
pub use types::{
    Embedding, EmbeddingMetadata, FileRef, JobId, JobRef, JobState, PendingResult,
    ProcessRecord, ProcessingDetails, ProcessingErrorEntry, Progress, RecordFiles, RecordId,
    SourceFileRef, StorageType, Tag, TodoItem, Transcript, TranscriptSegment,
};
