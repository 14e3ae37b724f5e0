//! In-process priority job queue.
//!
//! Waiting jobs are kept in a `BTreeMap` keyed by `(Reverse(priority), seq)`
//! so iteration order is "highest priority, then oldest". Failed attempts
//! move to a delayed set keyed by their ready time and are promoted back to
//! waiting on the next poll after that time passes.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use promptbench_core::config::QueueConfig;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::job::{JobState, NackOutcome, NewJob, QueueStats, QueuedJob, RemoveOutcome, StalledJob};
use crate::queue::JobQueue;

type WaitKey = (Reverse<i32>, u64);
type DelayKey = (Instant, u64);

struct Entry {
    job: QueuedJob,
    state: JobState,
    wait_key: Option<WaitKey>,
    delay_key: Option<DelayKey>,
    lock_until: Option<Instant>,
    stalled_count: u32,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Entry>,
    waiting: BTreeMap<WaitKey, String>,
    delayed: BTreeMap<DelayKey, String>,
    active: usize,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    next_seq: u64,
    closed: bool,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn push_waiting(&mut self, id: &str) {
        let seq = self.next_seq();
        if let Some(entry) = self.jobs.get_mut(id) {
            let key = (Reverse(entry.job.priority), seq);
            entry.state = JobState::Waiting;
            entry.wait_key = Some(key);
            entry.delay_key = None;
            entry.lock_until = None;
            self.waiting.insert(key, id.to_string());
        }
    }

    /// Move delayed jobs whose backoff elapsed back to waiting.
    fn promote_due(&mut self, now: Instant) {
        let due: Vec<DelayKey> = self
            .delayed
            .range(..=(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in due {
            if let Some(id) = self.delayed.remove(&key) {
                debug!(job_id = %id, "Promoting delayed job");
                self.push_waiting(&id);
            }
        }
    }

    fn active_entry(&mut self, id: &str) -> Result<&mut Entry, QueueError> {
        let entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if entry.state != JobState::Active {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                state: entry.state,
                expected: JobState::Active,
            });
        }
        Ok(entry)
    }

    /// Move an active job to a terminal state, evicting the oldest retained
    /// job of that state beyond `keep`.
    fn finish(&mut self, id: &str, state: JobState, keep: usize) {
        if let Some(entry) = self.jobs.get_mut(id) {
            entry.state = state;
            entry.lock_until = None;
        }
        self.active = self.active.saturating_sub(1);
        let retained = match state {
            JobState::Completed => &mut self.completed,
            _ => &mut self.failed,
        };
        retained.push_back(id.to_string());
        let mut evicted = Vec::new();
        while retained.len() > keep {
            if let Some(old) = retained.pop_front() {
                evicted.push(old);
            }
        }
        for old in evicted {
            self.jobs.remove(&old);
        }
    }
}

/// Single-process [`JobQueue`] with priority ordering, delayed retries,
/// stalled-job detection and bounded retention of finished jobs.
pub struct MemoryJobQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
}

impl MemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of a job the queue still retains.
    pub fn get_job(&self, id: &str) -> Option<QueuedJob> {
        self.inner().jobs.get(id).map(|e| e.job.clone())
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<(), QueueError> {
        let mut inner = self.inner();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if inner.jobs.contains_key(&job.id) {
            return Err(QueueError::Duplicate(job.id));
        }

        let id = job.id.clone();
        let queued = QueuedJob {
            id: job.id,
            payload: job.payload,
            priority: job.priority,
            attempts_made: 0,
            max_attempts: job.max_attempts.unwrap_or(self.config.max_attempts).max(1),
            backoff: job.backoff.unwrap_or(self.config.backoff),
            created_at: Utc::now(),
            last_error: None,
        };
        debug!(job_id = %id, priority = queued.priority, "Job enqueued");
        inner.jobs.insert(
            id.clone(),
            Entry {
                job: queued,
                state: JobState::Waiting,
                wait_key: None,
                delay_key: None,
                lock_until: None,
                stalled_count: 0,
            },
        );
        inner.push_waiting(&id);
        Ok(())
    }

    async fn poll(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut inner = self.inner();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        let now = Instant::now();
        inner.promote_due(now);

        let Some((_, id)) = inner.waiting.pop_first() else {
            return Ok(None);
        };
        inner.active += 1;
        let lock_until = now + self.config.lock_duration();
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Err(QueueError::NotFound(id));
        };
        entry.state = JobState::Active;
        entry.wait_key = None;
        entry.lock_until = Some(lock_until);
        entry.job.attempts_made += 1;
        Ok(Some(entry.job.clone()))
    }

    async fn ack(&self, id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner();
        inner.active_entry(id)?;
        inner.finish(id, JobState::Completed, self.config.keep_completed);
        debug!(job_id = %id, "Job completed");
        Ok(())
    }

    async fn nack(&self, id: &str, error: &str, retryable: bool) -> Result<NackOutcome, QueueError> {
        let mut inner = self.inner();
        let entry = inner.active_entry(id)?;
        entry.job.last_error = Some(error.to_string());
        let attempt = entry.job.attempts_made;

        if retryable && attempt < entry.job.max_attempts {
            let delay = entry.job.backoff.delay_for(attempt);
            entry.state = JobState::Delayed;
            entry.lock_until = None;
            let seq = inner.next_seq();
            let key = (Instant::now() + delay, seq);
            if let Some(entry) = inner.jobs.get_mut(id) {
                entry.delay_key = Some(key);
            }
            inner.delayed.insert(key, id.to_string());
            inner.active = inner.active.saturating_sub(1);
            info!(job_id = %id, attempt, delay_ms = delay.as_millis() as u64, "Job scheduled for retry");
            return Ok(NackOutcome::Retrying { attempt, delay });
        }

        inner.finish(id, JobState::Failed, self.config.keep_failed);
        warn!(job_id = %id, attempt, "Job failed: {}", error);
        Ok(NackOutcome::Failed)
    }

    async fn remove(&self, id: &str) -> Result<RemoveOutcome, QueueError> {
        let mut inner = self.inner();
        let Some((state, wait_key, delay_key)) = inner
            .jobs
            .get(id)
            .map(|e| (e.state, e.wait_key, e.delay_key))
        else {
            return Ok(RemoveOutcome::NotFound);
        };
        match state {
            JobState::Waiting | JobState::Delayed => {
                if let Some(key) = wait_key {
                    inner.waiting.remove(&key);
                }
                if let Some(key) = delay_key {
                    inner.delayed.remove(&key);
                }
                inner.jobs.remove(id);
                debug!(job_id = %id, "Job removed");
                Ok(RemoveOutcome::Removed)
            }
            JobState::Active => Ok(RemoveOutcome::Active),
            finished => Ok(RemoveOutcome::Finished(finished)),
        }
    }

    async fn extend_lock(&self, id: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner();
        match inner.jobs.get_mut(id) {
            Some(entry) if entry.state == JobState::Active => {
                entry.lock_until = Some(Instant::now() + self.config.lock_duration());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn check_stalled(&self) -> Result<Vec<StalledJob>, QueueError> {
        let mut inner = self.inner();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .jobs
            .iter()
            .filter(|(_, e)| e.state == JobState::Active && e.lock_until.is_some_and(|t| t <= now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut stalled = Vec::with_capacity(expired.len());
        for id in expired {
            let stalled_count = match inner.jobs.get_mut(&id) {
                Some(entry) => {
                    entry.stalled_count += 1;
                    entry.stalled_count
                }
                None => continue,
            };
            if stalled_count > self.config.max_stalled_count {
                if let Some(entry) = inner.jobs.get_mut(&id) {
                    entry.job.last_error = Some("job stalled more than allowable limit".into());
                }
                inner.finish(&id, JobState::Failed, self.config.keep_failed);
                warn!(job_id = %id, stalled_count, "Stalled job failed");
                stalled.push(StalledJob { id, requeued: false });
            } else {
                inner.active = inner.active.saturating_sub(1);
                inner.push_waiting(&id);
                warn!(job_id = %id, stalled_count, "Stalled job moved back to waiting");
                stalled.push(StalledJob { id, requeued: true });
            }
        }
        Ok(stalled)
    }

    async fn job_state(&self, id: &str) -> Result<Option<JobState>, QueueError> {
        Ok(self.inner().jobs.get(id).map(|e| e.state))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let inner = self.inner();
        Ok(QueueStats {
            waiting: inner.waiting.len(),
            active: inner.active,
            completed: inner.completed.len(),
            failed: inner.failed.len(),
            delayed: inner.delayed.len(),
        })
    }

    async fn close(&self) -> Result<(), QueueError> {
        let mut inner = self.inner();
        if !inner.closed {
            inner.closed = true;
            info!(waiting = inner.waiting.len(), active = inner.active, "Job queue closed");
        }
        Ok(())
    }
}
