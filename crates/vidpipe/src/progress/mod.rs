pub mod aggregator;
pub mod reporter;

pub use aggregator::{compute_progress, estimate_remaining, StageWeights};
pub use reporter::{ChannelProgress, NoopProgress, ProgressEvent, ProgressReporter};
