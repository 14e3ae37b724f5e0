use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use promptbench_core::{ExecutionJob, ResultMetadata, TestCase, TestExecutionResult};
use tracing::{debug, error, info, warn};

use super::core::ManagerInner;
use super::processing::JobOutcome;
use super::progress::{ActiveJob, PROGRESS_DONE, PROGRESS_LOADED, PROGRESS_PERSISTING};
use crate::error::SchedulerError;
use crate::semaphore::Semaphore;

impl ManagerInner {
    /// Load, fan out and persist one job's tests.
    pub(super) async fn execute_job(&self, job: &ExecutionJob, active: &ActiveJob) -> JobOutcome {
        self.publish_progress(active.advance(0, "Starting execution"));
        if active.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        let cases = match self.load_test_cases(job).await {
            Ok(cases) => cases,
            Err(e) => return JobOutcome::Failed(e),
        };
        debug!(
            execution_id = %job.id,
            attempt = active.attempt,
            tests = cases.len(),
            "Test cases loaded"
        );
        self.publish_progress(
            active.advance(PROGRESS_LOADED, format!("Loaded {} test cases", cases.len())),
        );

        let results = self.run_batches(job, active, &cases).await;

        if active.is_cancelled() {
            if !results.is_empty() {
                if let Err(e) = self.store.store_results(&job.id, &results).await {
                    warn!(execution_id = %job.id, error = %e, "Failed to persist partial results");
                }
            }
            return JobOutcome::Cancelled;
        }

        if let Some(test_case_id) = active.stop_reason() {
            if let Err(e) = self.store.store_results(&job.id, &results).await {
                warn!(execution_id = %job.id, error = %e, "Failed to persist results");
            }
            return JobOutcome::Failed(SchedulerError::StoppedOnFailure(test_case_id));
        }

        self.publish_progress(active.advance(PROGRESS_PERSISTING, "Persisting results"));
        if let Err(e) = self.store.store_results(&job.id, &results).await {
            return JobOutcome::Failed(e.into());
        }
        self.publish_progress(active.advance(PROGRESS_DONE, "Execution completed"));
        JobOutcome::Completed(results)
    }

    /// Fetch the job's test cases in request order, through the cache when
    /// enabled. Fails if any requested id is missing.
    async fn load_test_cases(&self, job: &ExecutionJob) -> Result<Vec<TestCase>, SchedulerError> {
        let ids = &job.test_case_ids;
        let cached = if job.config.cache_enabled {
            self.cache.get(ids)
        } else {
            None
        };
        let from_cache = cached.is_some();

        let loaded = match cached {
            Some(cases) => {
                debug!(execution_id = %job.id, tests = cases.len(), "Test cases served from cache");
                cases
            }
            None => Arc::new(self.store.load_test_cases(ids).await?),
        };

        let by_id: HashMap<&str, &TestCase> = loaded.iter().map(|c| (c.id.as_str(), c)).collect();
        let missing: Vec<&str> = ids
            .iter()
            .map(String::as_str)
            .filter(|id| !by_id.contains_key(id))
            .collect();
        if !missing.is_empty() {
            return Err(SchedulerError::Validation(format!(
                "{} of {} test cases not found: {}",
                missing.len(),
                ids.len(),
                missing.join(", ")
            )));
        }

        let ordered = ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|c| (*c).clone()))
            .collect();
        if job.config.cache_enabled && !from_cache {
            self.cache.put(ids, Arc::clone(&loaded));
        }
        Ok(ordered)
    }

    /// Run `cases` in batches of `min(2 × concurrency, cap)`, with at most
    /// `max_concurrent_tests` in flight. Stops dispatching once the job halts.
    async fn run_batches(
        &self,
        job: &ExecutionJob,
        active: &ActiveJob,
        cases: &[TestCase],
    ) -> Vec<TestExecutionResult> {
        let semaphore = Semaphore::new(job.config.max_concurrent_tests);
        let batch_size = job.config.batch_size(self.settings.batch_size_cap);
        let batches = cases.len().div_ceil(batch_size);
        let mut results = Vec::with_capacity(cases.len());

        for (index, batch) in cases.chunks(batch_size).enumerate() {
            if active.should_halt() {
                info!(execution_id = %job.id, remaining_batches = batches - index, "Dispatch halted");
                break;
            }
            debug!(
                execution_id = %job.id,
                batch = index + 1,
                batches,
                size = batch.len(),
                "Dispatching batch"
            );

            let slots = batch
                .iter()
                .map(|case| self.run_slot(job, active, &semaphore, case));
            results.extend(join_all(slots).await.into_iter().flatten());

            if index + 1 < batches && !active.should_halt() {
                tokio::time::sleep(self.settings.batch_pause()).await;
            }
        }

        results
    }

    /// Wait for a permit and run one test, unless the job halted meanwhile.
    async fn run_slot(
        &self,
        job: &ExecutionJob,
        active: &ActiveJob,
        semaphore: &Semaphore,
        case: &TestCase,
    ) -> Option<TestExecutionResult> {
        let permit = semaphore.acquire().await;
        if active.should_halt() {
            debug!(execution_id = %job.id, test_case_id = %case.id, "Test skipped after halt");
            return None;
        }

        self.publish_progress(active.begin_test(&case.id));
        let result = AssertUnwindSafe(self.execute_test_case(job, case))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(execution_id = %job.id, test_case_id = %case.id, "Test execution panicked");
                let error = SchedulerError::Execution {
                    test_case_id: case.id.clone(),
                    message: "test execution panicked".into(),
                };
                failed_result(job, case, String::new(), Duration::ZERO, error.kind(), &error)
            });

        if let Ok(mut m) = self.metrics.write() {
            m.record_test(
                Duration::from_millis(result.execution_time_ms),
                result.passed,
                result.metadata.error_kind.as_deref() == Some("timeout"),
            );
        }
        if !result.passed && job.config.stop_on_first_failure && active.stop_after(&case.id) {
            info!(execution_id = %job.id, test_case_id = %case.id, "Stopping after first failure");
        }
        self.publish_progress(active.finish_test(result.passed));

        if let Err(e) = permit.release() {
            error!(execution_id = %job.id, error = %e, "Permit release failed");
        }
        Some(result)
    }

    /// Render the prompt, call the model under the per-test timeout, and
    /// validate the output. Errors become failed results.
    async fn execute_test_case(&self, job: &ExecutionJob, case: &TestCase) -> TestExecutionResult {
        let started = Instant::now();

        let prompt = match self.renderer.render(&case.prompt_template, &case.input_variables) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(execution_id = %job.id, test_case_id = %case.id, error = %e, "Prompt render failed");
                return failed_result(
                    job,
                    case,
                    case.prompt_template.clone(),
                    started.elapsed(),
                    "template",
                    &e,
                );
            }
        };

        let timeout = job.config.timeout_per_test();
        match tokio::time::timeout(timeout, self.llm.generate(&prompt, &job.model)).await {
            Ok(Ok(generation)) => {
                let assertion_results = self.validator.validate(&generation.response, &case.assertions);
                let passed = assertion_results.iter().all(|r| r.passed);
                let elapsed = started.elapsed();
                debug!(
                    execution_id = %job.id,
                    test_case_id = %case.id,
                    passed,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Test finished"
                );
                TestExecutionResult {
                    execution_id: job.id.clone(),
                    test_case_id: case.id.clone(),
                    passed,
                    llm_output: generation.response,
                    assertion_results,
                    execution_time_ms: elapsed.as_millis() as u64,
                    model: job.model.clone(),
                    prompt_used: prompt,
                    created_at: Utc::now(),
                    metadata: ResultMetadata {
                        prompt_tokens: generation.usage.prompt_tokens,
                        completion_tokens: generation.usage.completion_tokens,
                        total_tokens: generation.usage.total_tokens,
                        ..Default::default()
                    },
                }
            }
            Ok(Err(e)) => {
                let error = SchedulerError::Execution {
                    test_case_id: case.id.clone(),
                    message: e.to_string(),
                };
                warn!(execution_id = %job.id, test_case_id = %case.id, error = %error, "Model call failed");
                failed_result(job, case, prompt, started.elapsed(), error.kind(), &error)
            }
            Err(_) => {
                let error = SchedulerError::ExecutionTimeout {
                    test_case_id: case.id.clone(),
                    timeout_ms: job.config.timeout_per_test_ms,
                };
                warn!(execution_id = %job.id, test_case_id = %case.id, error = %error, "Test timed out");
                failed_result(job, case, prompt, started.elapsed(), error.kind(), &error)
            }
        }
    }
}

fn failed_result(
    job: &ExecutionJob,
    case: &TestCase,
    prompt: String,
    elapsed: Duration,
    kind: &str,
    error: &SchedulerError,
) -> TestExecutionResult {
    TestExecutionResult {
        execution_id: job.id.clone(),
        test_case_id: case.id.clone(),
        passed: false,
        llm_output: String::new(),
        assertion_results: Vec::new(),
        execution_time_ms: elapsed.as_millis() as u64,
        model: job.model.clone(),
        prompt_used: prompt,
        created_at: Utc::now(),
        metadata: ResultMetadata {
            error_kind: Some(kind.to_string()),
            error: Some(error.to_string()),
            ..Default::default()
        },
    }
}
