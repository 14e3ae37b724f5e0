//! Test queue manager -- admits, queues and runs test executions.
//!
//! Split into focused submodules:
//! - `core`: manager struct, builder, shared state and status bookkeeping
//! - `admission`: queueing, cancellation and read-side queries
//! - `processing`: worker pool, lock renewal, stall detection and job settlement
//! - `execution`: test-case loading, batched fan-out and single-test execution
//! - `progress`: per-job live progress and halt flags

mod admission;
mod core;
mod execution;
mod processing;
mod progress;
#[cfg(test)]
mod tests;

pub use self::core::{TestQueueManager, TestQueueManagerBuilder};
