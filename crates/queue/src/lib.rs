pub mod error;
pub mod job;
pub mod memory;
pub mod queue;

pub use error::QueueError;
pub use job::{JobState, NackOutcome, NewJob, QueueStats, QueuedJob, RemoveOutcome, StalledJob};
pub use memory::MemoryJobQueue;
pub use queue::JobQueue;
