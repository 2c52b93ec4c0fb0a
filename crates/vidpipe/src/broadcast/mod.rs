//! Internal subscription mechanism for pipeline events.
//!
//! Status pollers and push adapters live outside this crate; they subscribe
//! here instead of polling the record store.

pub mod pipeline_events;

pub use pipeline_events::{PipelineEvent, PipelineEventBroadcaster};
