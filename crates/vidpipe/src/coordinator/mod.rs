//! Stage coordination.
//!
//! [`dag`] decides what may run, [`policy`] what a failure means,
//! [`finalizer`] how a result lands in the record. [`StageCoordinator`]
//! applies those decisions to the store and the queues.

pub mod dag;
pub mod finalizer;
pub mod locks;
pub mod policy;
pub mod stage_coordinator;

pub use dag::{DagAction, Prereq, Readiness};
pub use finalizer::{FinalizeFailure, Finalizer, MergePlan};
pub use locks::RecordLocks;
pub use policy::{FailureDecision, StagePolicy};
pub use stage_coordinator::{StageCoordinator, StatusSnapshot};
