use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use promptbench_core::{ExecutionJob, ExecutionStatus, TestExecutionResult};
use promptbench_queue::{NackOutcome, QueueError, QueuedJob};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::core::{ManagerInner, Runtime};
use super::progress::ActiveJob;
use super::TestQueueManager;
use crate::error::SchedulerError;
use crate::events::SchedulerEvent;
use crate::resources::{ResourceEvent, ResourceRequirement};

/// How a job attempt ended.
pub(super) enum JobOutcome {
    Completed(Vec<TestExecutionResult>),
    Cancelled,
    Failed(SchedulerError),
}

/// Lower bound on lock renewal frequency.
const MIN_LOCK_RENEWAL: Duration = Duration::from_millis(10);

/// Releases a job's reservation and active entry however the attempt ends.
struct ActiveGuard<'a> {
    inner: &'a ManagerInner,
    id: &'a str,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.inner.resources.release_resources(self.id);
        self.inner.unregister_active(self.id);
    }
}

impl TestQueueManager {
    /// Spawn the job workers, the stalled-job sweeper and the resource
    /// monitor. Calling it again while running is a no-op.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.inner.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        let mut runtime = self.runtime.lock().unwrap_or_else(|p| p.into_inner());
        if runtime.is_some() {
            return Ok(());
        }

        let (shutdown, signal) = watch::channel(false);
        let workers = self.inner.settings.resolved_max_concurrent_jobs();
        let mut handles = Vec::with_capacity(workers + 2);

        for worker in 0..workers {
            let inner = Arc::clone(&self.inner);
            handles.push(tokio::spawn(inner.worker_loop(worker, signal.clone())));
        }
        handles.push(tokio::spawn(
            Arc::clone(&self.inner).stalled_loop(signal.clone()),
        ));
        handles.push(tokio::spawn(
            Arc::clone(&self.inner).forward_resource_events(self.inner.resources.subscribe(), signal),
        ));
        self.inner.resources.start_monitoring();

        info!(
            workers,
            stalled_interval_ms = self.inner.queue_config.stalled_interval_ms,
            "Test queue manager started"
        );
        *runtime = Some(Runtime { shutdown, handles });
        Ok(())
    }

    /// Stop accepting work, let in-flight jobs finish, then close the queue,
    /// the resource manager and the event stream.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        if self
            .inner
            .shutting_down
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return Ok(());
        }
        info!("Shutting down test queue manager");

        let runtime = self.runtime.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(runtime) = runtime {
            let _ = runtime.shutdown.send(true);
            for handle in runtime.handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Scheduler task ended abnormally");
                }
            }
        }

        self.inner.queue.close().await?;
        self.inner.resources.destroy();
        self.inner.events.close();
        info!("Test queue manager stopped");
        Ok(())
    }
}

impl ManagerInner {
    pub(super) async fn worker_loop(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "Job worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.queue.poll().await {
                Ok(Some(job)) => self.handle_job(job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                    }
                }
                Err(QueueError::Closed) => break,
                Err(e) => {
                    warn!(worker, error = %e, "Queue poll failed");
                    tokio::time::sleep(self.settings.poll_interval()).await;
                }
            }
        }
        debug!(worker, "Job worker stopped");
    }

    /// Run one job attempt while renewing its queue lock, then settle it.
    async fn handle_job(&self, queued: QueuedJob) {
        let job: ExecutionJob = match queued.decode() {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %queued.id, error = %e, "Undecodable job payload");
                if let Err(e) = self.queue.nack(&queued.id, &e.to_string(), false).await {
                    warn!(job_id = %queued.id, error = %e, "Failed to reject job");
                }
                self.set_status(&queued.id, ExecutionStatus::Failed);
                return;
            }
        };

        let renew_every = (self.queue_config.lock_duration() / 2).max(MIN_LOCK_RENEWAL);
        let mut renew = tokio::time::interval_at(Instant::now() + renew_every, renew_every);
        let run = AssertUnwindSafe(self.run_job(&job, queued.attempts_made)).catch_unwind();
        tokio::pin!(run);

        let outcome = loop {
            tokio::select! {
                result = &mut run => {
                    break result.unwrap_or_else(|_| {
                        error!(execution_id = %job.id, "Job processing panicked");
                        JobOutcome::Failed(SchedulerError::Internal("job processing panicked".into()))
                    });
                }
                _ = renew.tick() => match self.queue.extend_lock(&job.id).await {
                    Ok(true) => trace!(execution_id = %job.id, "Lock renewed"),
                    Ok(false) => warn!(execution_id = %job.id, "Lock lost for running execution"),
                    Err(e) => warn!(execution_id = %job.id, error = %e, "Lock renewal failed"),
                },
            }
        };

        self.settle(&job, outcome).await;
    }

    async fn run_job(&self, job: &ExecutionJob, attempt: u32) -> JobOutcome {
        let requirement = ResourceRequirement::for_job(&job.config, job.priority);
        if let Err(e) = self.resources.reserve_resources(&job.id, &requirement) {
            warn!(execution_id = %job.id, attempt, error = %e, "Could not reserve resources");
            let unstarted = ActiveJob::new(&job.id, job.test_case_ids.len(), attempt);
            self.publish_progress(unstarted.fail(e.to_string()));
            return JobOutcome::Failed(e);
        }

        let active = Arc::new(ActiveJob::new(&job.id, job.test_case_ids.len(), attempt));
        self.register_active(&job.id, Arc::clone(&active));
        let guard = ActiveGuard {
            inner: self,
            id: &job.id,
        };
        if self.take_pending_cancel(&job.id) {
            active.cancel();
        }

        self.set_status(&job.id, ExecutionStatus::Running);
        if let Ok(mut m) = self.metrics.write() {
            m.jobs_started += 1;
        }
        info!(
            execution_id = %job.id,
            attempt,
            tests = job.test_case_ids.len(),
            model = %job.model,
            max_concurrent_tests = job.config.max_concurrent_tests,
            suggested_concurrency = self.resources.get_optimal_concurrency(),
            "Execution started"
        );
        self.events.publish(SchedulerEvent::JobStarted {
            execution_id: job.id.clone(),
            attempt,
        });

        let outcome = self.execute_job(job, &active).await;
        // Later cancels go through the pending set.
        drop(guard);
        if active.is_cancelled() {
            return JobOutcome::Cancelled;
        }
        if let JobOutcome::Failed(e) = &outcome {
            self.publish_progress(active.fail(e.to_string()));
        }
        outcome
    }

    /// Report the attempt's outcome to the queue and subscribers.
    async fn settle(&self, job: &ExecutionJob, outcome: JobOutcome) {
        let cancel_pending = self.begin_settle(&job.id);
        let outcome = match outcome {
            JobOutcome::Cancelled => JobOutcome::Cancelled,
            _ if cancel_pending => {
                info!(execution_id = %job.id, "Cancel arrived before the attempt settled");
                JobOutcome::Cancelled
            }
            outcome => outcome,
        };
        self.report(job, outcome).await;
        self.end_settle(&job.id);
    }

    async fn report(&self, job: &ExecutionJob, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed(results) => {
                if let Err(e) = self.queue.ack(&job.id).await {
                    warn!(execution_id = %job.id, error = %e, "Failed to acknowledge job");
                }
                self.set_status(&job.id, ExecutionStatus::Completed);
                if let Ok(mut m) = self.metrics.write() {
                    m.record_job_completed();
                }
                let passed = results.iter().filter(|r| r.passed).count();
                info!(
                    execution_id = %job.id,
                    passed,
                    failed = results.len() - passed,
                    "Execution completed"
                );
                self.events.publish(SchedulerEvent::JobCompleted {
                    execution_id: job.id.clone(),
                    results,
                });
            }
            JobOutcome::Cancelled => {
                if let Err(e) = self.queue.ack(&job.id).await {
                    warn!(execution_id = %job.id, error = %e, "Failed to acknowledge cancelled job");
                }
                self.set_status(&job.id, ExecutionStatus::Cancelled);
                if let Ok(mut m) = self.metrics.write() {
                    m.record_job_cancelled();
                }
                info!(execution_id = %job.id, "Execution cancelled");
            }
            JobOutcome::Failed(error) => {
                let message = error.to_string();
                let retrying = match self
                    .queue
                    .nack(&job.id, &message, error.is_retryable())
                    .await
                {
                    Ok(NackOutcome::Retrying { attempt, delay }) => {
                        info!(
                            execution_id = %job.id,
                            next_attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Execution will be retried"
                        );
                        true
                    }
                    Ok(NackOutcome::Failed) => false,
                    Err(e) => {
                        warn!(execution_id = %job.id, error = %e, "Failed to report job failure");
                        false
                    }
                };

                self.set_status(
                    &job.id,
                    if retrying {
                        ExecutionStatus::Queued
                    } else {
                        ExecutionStatus::Failed
                    },
                );
                if let Ok(mut m) = self.metrics.write() {
                    m.record_job_failed(retrying);
                }
                warn!(
                    execution_id = %job.id,
                    kind = error.kind(),
                    error = %message,
                    retrying,
                    "Execution failed"
                );
                self.events.publish(SchedulerEvent::JobFailed {
                    execution_id: job.id.clone(),
                    error: message,
                    retrying,
                });
            }
        }
    }

    /// Periodically requeue or fail jobs whose lock expired.
    pub(super) async fn stalled_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.queue_config.stalled_interval();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.queue.check_stalled().await {
                Ok(stalled) => {
                    for job in stalled {
                        let error = SchedulerError::Stalled(job.id.clone());
                        warn!(execution_id = %job.id, requeued = job.requeued, error = %error, "Stalled job detected");
                        if !job.requeued {
                            self.set_status(&job.id, ExecutionStatus::Failed);
                        }
                        self.events.publish(SchedulerEvent::JobStalled {
                            execution_id: job.id,
                            requeued: job.requeued,
                        });
                    }
                }
                Err(QueueError::Closed) => break,
                Err(e) => warn!(error = %e, "Stalled job check failed"),
            }
        }
        debug!("Stalled job sweeper stopped");
    }

    /// Re-publish resource stress and emergency events to scheduler subscribers.
    pub(super) async fn forward_resource_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ResourceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Ok(ResourceEvent::SystemStress(usage)) => {
                        self.events.publish(SchedulerEvent::SystemStress(usage));
                    }
                    Ok(ResourceEvent::EmergencyThreshold { kind, usage }) => {
                        self.events.publish(SchedulerEvent::EmergencyThreshold { kind, usage });
                    }
                    Ok(ResourceEvent::ResourcesUpdated(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Resource event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}
