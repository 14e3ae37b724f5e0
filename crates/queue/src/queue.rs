//! Job queue trait.

use async_trait::async_trait;

use crate::error::QueueError;
use crate::job::{JobState, NackOutcome, NewJob, QueueStats, QueuedJob, RemoveOutcome, StalledJob};

/// Trait for priority job queue backends.
///
/// Implementations order waiting jobs by priority (higher first) and then by
/// arrival, hold a lock on each active job, and own the retry/backoff policy
/// for failed attempts.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job in the waiting state.
    async fn enqueue(&self, job: NewJob) -> Result<(), QueueError>;

    /// Take the next ready job, marking it active and starting an attempt.
    ///
    /// Returns `None` when nothing is ready. Fails with [`QueueError::Closed`]
    /// once the queue is closed.
    async fn poll(&self) -> Result<Option<QueuedJob>, QueueError>;

    /// Acknowledge successful processing of an active job.
    async fn ack(&self, id: &str) -> Result<(), QueueError>;

    /// Record a failed attempt. Retryable failures with attempts left are
    /// delayed per the job's backoff; everything else fails the job.
    async fn nack(&self, id: &str, error: &str, retryable: bool) -> Result<NackOutcome, QueueError>;

    /// Drop a waiting or delayed job.
    async fn remove(&self, id: &str) -> Result<RemoveOutcome, QueueError>;

    /// Renew the lock on an active job. Returns false if the job is no longer active.
    async fn extend_lock(&self, id: &str) -> Result<bool, QueueError>;

    /// Find active jobs whose lock expired and requeue or fail them.
    async fn check_stalled(&self) -> Result<Vec<StalledJob>, QueueError>;

    /// Current state of a job, if the queue still knows it.
    async fn job_state(&self, id: &str) -> Result<Option<JobState>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Stop handing out jobs. Idempotent.
    async fn close(&self) -> Result<(), QueueError>;
}
