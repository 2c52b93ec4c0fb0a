//! Shared test utilities for vidpipe integration tests.
//!
//! This module provides:
//! - `TestHarness` driving a coordinator by pulling jobs straight off the queues
//! - Builders for configurations and canned stage results

pub mod builders;
pub mod harness;

pub use builders::*;
// Not every test binary drives the harness.
#[allow(unused_imports)]
pub use harness::TestHarness;
