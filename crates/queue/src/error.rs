//! Queue error types.

use thiserror::Error;

use crate::job::JobState;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("duplicate job id: {0}")]
    Duplicate(String),

    #[error("job {id} is {state}, expected {expected}")]
    InvalidState {
        id: String,
        state: JobState,
        expected: JobState,
    },

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}
