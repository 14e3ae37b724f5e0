use promptbench_core::CoreError;
use promptbench_queue::QueueError;
use thiserror::Error;

use crate::semaphore::ReleaseError;
use crate::store::StoreError;

/// Errors raised by the scheduler, the resource manager and job processing.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Projected usage would exceed the configured limits.
    #[error("Insufficient resources: {0}")]
    Admission(String),

    /// Bad input or missing test cases. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Execution timeout: test {test_case_id} exceeded {timeout_ms}ms")]
    ExecutionTimeout { test_case_id: String, timeout_ms: u64 },

    #[error("Execution failed for test {test_case_id}: {message}")]
    Execution {
        test_case_id: String,
        message: String,
    },

    /// A job halted dispatch after a test failed with `stop_on_first_failure`.
    #[error("Stopped on first failure: test {0} failed")]
    StoppedOnFailure(String),

    #[error(transparent)]
    Release(#[from] ReleaseError),

    #[error("Job {0} stalled")]
    Stalled(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Short kind recorded in result metadata and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerError::Admission(_) => "admission",
            SchedulerError::Validation(_) => "validation",
            SchedulerError::ExecutionTimeout { .. } => "timeout",
            SchedulerError::Execution { .. } => "execution",
            SchedulerError::StoppedOnFailure(_) => "stopped",
            SchedulerError::Release(_) => "release",
            SchedulerError::Stalled(_) => "stalled",
            SchedulerError::Queue(_) => "queue",
            SchedulerError::Store(_) => "store",
            SchedulerError::Serialization(_) => "serialization",
            SchedulerError::ShuttingDown => "shutdown",
            SchedulerError::Internal(_) => "internal",
        }
    }

    /// Whether a job that failed with this error should be attempted again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SchedulerError::Validation(_)
                | SchedulerError::Serialization(_)
                | SchedulerError::ShuttingDown
        )
    }
}

impl From<CoreError> for SchedulerError {
    fn from(e: CoreError) -> Self {
        SchedulerError::Validation(e.to_string())
    }
}
