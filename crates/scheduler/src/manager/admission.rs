use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use promptbench_core::{
    ConfigOverrides, ExecutionId, ExecutionJob, ExecutionProgress, ExecutionStatus, TestCaseId,
};
use promptbench_queue::{JobState, NewJob, QueueStats, RemoveOutcome};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Rounds of queue lookups a cancel makes while a job changes hands.
const CANCEL_ATTEMPTS: usize = 50;
const CANCEL_RETRY_PAUSE: Duration = Duration::from_millis(10);

use super::TestQueueManager;
use crate::error::SchedulerError;
use crate::events::SchedulerEvent;
use crate::resources::ResourceRequirement;

impl TestQueueManager {
    /// Admit and enqueue a test execution. Returns the execution id.
    ///
    /// Admission only checks that the request fits current usage; resources
    /// are reserved when a worker starts the job.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::Validation`] for an empty id list, blank card or
    ///   model, or an invalid merged config.
    /// - [`SchedulerError::Admission`] when projected usage exceeds limits.
    /// - [`SchedulerError::ShuttingDown`] after [`shutdown`](Self::shutdown).
    pub async fn queue_test_execution(
        &self,
        prompt_card_id: &str,
        test_case_ids: &[TestCaseId],
        model: &str,
        overrides: ConfigOverrides,
        priority: i32,
    ) -> Result<ExecutionId, SchedulerError> {
        if self.inner.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        if prompt_card_id.trim().is_empty() {
            return Err(SchedulerError::Validation("prompt card id is required".into()));
        }
        if model.trim().is_empty() {
            return Err(SchedulerError::Validation("model is required".into()));
        }

        let ids = dedup_ids(test_case_ids);
        if ids.is_empty() {
            return Err(SchedulerError::Validation(
                "at least one test case id is required".into(),
            ));
        }

        let config = overrides.apply(&self.inner.defaults);
        config.validate()?;

        let requirement = ResourceRequirement::for_job(&config, priority);
        if let Err(e) = self.inner.resources.ensure_available(&requirement) {
            warn!(
                prompt_card_id,
                tests = ids.len(),
                priority,
                error = %e,
                "Execution rejected at admission"
            );
            return Err(e);
        }

        let job = ExecutionJob {
            id: Uuid::new_v4().to_string(),
            prompt_card_id: prompt_card_id.to_string(),
            test_case_ids: ids,
            model: model.to_string(),
            config,
            priority,
            created_at: Utc::now(),
        };
        let new_job = NewJob::from_payload(job.id.clone(), &job, priority)?
            .with_attempts(job.config.queue_attempts());
        self.inner.queue.enqueue(new_job).await?;
        self.inner.set_status(&job.id, ExecutionStatus::Queued);

        info!(
            execution_id = %job.id,
            prompt_card_id,
            model,
            tests = job.test_case_ids.len(),
            priority,
            bucket = %job.bucket(),
            "Execution queued"
        );
        self.inner.events.publish(SchedulerEvent::JobQueued {
            execution_id: job.id.clone(),
            priority,
        });

        Ok(job.id)
    }

    /// Cancel an execution.
    ///
    /// A waiting job is removed from the queue. A running job stops
    /// dispatching new tests but lets in-flight tests finish, and ends
    /// `Cancelled` whatever its attempt reports. Returns false when the
    /// execution is unknown or already finished.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<bool, SchedulerError> {
        for _ in 0..CANCEL_ATTEMPTS {
            if self.inner.cancel_active(execution_id) {
                info!(execution_id, "Cancel requested for running execution");
                self.publish_cancelled(execution_id);
                return Ok(true);
            }

            match self.inner.queue.remove(execution_id).await? {
                RemoveOutcome::Removed => {
                    self.inner.resources.release_resources(execution_id);
                    self.inner.set_status(execution_id, ExecutionStatus::Cancelled);
                    if let Ok(mut m) = self.inner.metrics.write() {
                        m.record_job_cancelled();
                    }
                    info!(execution_id, "Queued execution cancelled");
                    self.publish_cancelled(execution_id);
                    return Ok(true);
                }
                RemoveOutcome::Active => {
                    if self.cancel_between_workers(execution_id).await? {
                        info!(execution_id, "Cancel requested for starting execution");
                        self.publish_cancelled(execution_id);
                        return Ok(true);
                    }
                }
                RemoveOutcome::Finished(state) => {
                    info!(execution_id, state = %state, "Execution already finished");
                    return Ok(false);
                }
                RemoveOutcome::NotFound => return Ok(false),
            }
            tokio::time::sleep(CANCEL_RETRY_PAUSE).await;
        }

        warn!(execution_id, "Execution kept changing state; cancel not applied");
        Ok(false)
    }

    /// Leave a cancel for a job the queue holds as active but no worker has
    /// registered. Returns false when the attempt settled meanwhile and the
    /// queue should be asked again.
    async fn cancel_between_workers(&self, execution_id: &str) -> Result<bool, SchedulerError> {
        if !self.inner.add_pending_cancel(execution_id) {
            return Ok(false);
        }
        // Registered after the worker looked for pending cancels.
        self.inner.cancel_active(execution_id);

        if self.inner.queue.job_state(execution_id).await? == Some(JobState::Active) {
            return Ok(true);
        }
        // Settled before seeing the cancel: withdraw it unless a worker took it.
        Ok(!self.inner.take_pending_cancel(execution_id))
    }

    fn publish_cancelled(&self, execution_id: &str) {
        self.inner.events.publish(SchedulerEvent::JobCancelled {
            execution_id: execution_id.to_string(),
        });
    }

    /// Live progress of a running execution.
    pub fn get_execution_progress(&self, execution_id: &str) -> Option<ExecutionProgress> {
        self.inner.active_job(execution_id).map(|job| job.snapshot())
    }

    /// Progress of every execution currently held by a worker.
    pub fn get_active_executions(&self) -> Vec<ExecutionProgress> {
        self.inner
            .active
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|job| job.snapshot())
            .collect()
    }

    /// Lifecycle status. Falls back to the queue's view for executions that
    /// aged out of the local status history.
    pub async fn execution_status(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionStatus>, SchedulerError> {
        if self.inner.active_job(execution_id).is_some() {
            return Ok(Some(ExecutionStatus::Running));
        }
        if let Some(status) = self.inner.status_of(execution_id) {
            return Ok(Some(status));
        }
        let state = self.inner.queue.job_state(execution_id).await?;
        Ok(state.map(|s| match s {
            JobState::Waiting | JobState::Delayed => ExecutionStatus::Queued,
            JobState::Active => ExecutionStatus::Running,
            JobState::Completed => ExecutionStatus::Completed,
            JobState::Failed => ExecutionStatus::Failed,
        }))
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats, SchedulerError> {
        Ok(self.inner.queue.stats().await?)
    }

    /// Subscribe to lifecycle, progress and resource events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }
}

/// Drop blank and repeated ids, keeping first-seen order.
fn dedup_ids(ids: &[TestCaseId]) -> Vec<TestCaseId> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty() && seen.insert(*id))
        .map(str::to_string)
        .collect()
}
