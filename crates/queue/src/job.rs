//! Job records and bookkeeping types shared by queue backends.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use promptbench_core::config::BackoffPolicy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// A job submitted to the queue.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Caller-chosen unique id.
    pub id: String,
    pub payload: serde_json::Value,
    /// Higher runs first.
    pub priority: i32,
    /// Falls back to the queue's configured attempts.
    pub max_attempts: Option<u32>,
    /// Falls back to the queue's configured backoff.
    pub backoff: Option<BackoffPolicy>,
}

impl NewJob {
    pub fn new(id: impl Into<String>, payload: serde_json::Value, priority: i32) -> Self {
        Self {
            id: id.into(),
            payload,
            priority,
            max_attempts: None,
            backoff: None,
        }
    }

    /// Serialize `payload` as the job body.
    pub fn from_payload<T: Serialize>(
        id: impl Into<String>,
        payload: &T,
        priority: i32,
    ) -> Result<Self, QueueError> {
        Ok(Self::new(id, serde_json::to_value(payload)?, priority))
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// A job as handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    /// Attempts started so far, including the current one.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub created_at: DateTime<Utc>,
    /// Reason recorded by the most recent failed attempt.
    pub last_error: Option<String>,
}

impl QueuedJob {
    /// Deserialize the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}

/// Where a job currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Scheduled for another attempt after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// No attempts left, or the failure was not retryable.
    Failed,
}

/// Result of asking the queue to drop a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The job was waiting or delayed and is gone.
    Removed,
    /// A worker holds the job; it cannot be removed.
    Active,
    /// The job already reached a terminal state.
    Finished(JobState),
    NotFound,
}

/// An active job whose lock expired without renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    pub id: String,
    /// True when moved back to waiting; false when failed for stalling too often.
    pub requeued: bool,
}

/// Per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    /// Completed jobs still retained.
    pub completed: usize,
    /// Failed jobs still retained.
    pub failed: usize,
    pub delayed: usize,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueStats {{ waiting: {}, active: {}, completed: {}, failed: {}, delayed: {} }}",
            self.waiting, self.active, self.completed, self.failed, self.delayed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        card: String,
        ids: Vec<String>,
    }

    #[test]
    fn payload_roundtrips_through_json() {
        let payload = Payload {
            card: "card-1".into(),
            ids: vec!["1".into(), "2".into()],
        };
        let new_job = NewJob::from_payload("job-1", &payload, 3).unwrap();
        let queued = QueuedJob {
            id: new_job.id,
            payload: new_job.payload,
            priority: new_job.priority,
            attempts_made: 1,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            created_at: Utc::now(),
            last_error: None,
        };
        assert_eq!(queued.decode::<Payload>().unwrap(), payload);
        assert!(!queued.is_final_attempt());
    }

    #[test]
    fn stats_display() {
        let stats = QueueStats {
            waiting: 2,
            active: 1,
            ..Default::default()
        };
        let display = format!("{}", stats);
        assert!(display.contains("waiting: 2"));
        assert!(display.contains("active: 1"));
    }

    #[test]
    fn with_attempts_never_zero() {
        let job = NewJob::new("j", serde_json::Value::Null, 0).with_attempts(0);
        assert_eq!(job.max_attempts, Some(1));
    }
}
