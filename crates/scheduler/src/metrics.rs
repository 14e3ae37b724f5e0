use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters for jobs and tests processed by a [`TestQueueManager`](crate::TestQueueManager).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionMetrics {
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    /// Failed attempts handed back to the queue for another try.
    pub jobs_retried: u64,
    pub jobs_cancelled: u64,
    pub tests_executed: u64,
    pub tests_passed: u64,
    pub tests_failed: u64,
    pub tests_timed_out: u64,
    /// Mean wall-clock time per executed test.
    pub avg_test_duration: Duration,
    pub last_job_finished: Option<DateTime<Utc>>,
}

impl ExecutionMetrics {
    /// Record one finished test.
    pub fn record_test(&mut self, duration: Duration, passed: bool, timed_out: bool) {
        self.tests_executed += 1;
        if passed {
            self.tests_passed += 1;
        } else {
            self.tests_failed += 1;
        }
        if timed_out {
            self.tests_timed_out += 1;
        }

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let count = self.tests_executed;
        self.avg_test_duration = if count == 1 {
            duration
        } else {
            let prev = self.avg_test_duration.as_nanos() as f64;
            let cur = duration.as_nanos() as f64;
            Duration::from_nanos((prev + (cur - prev) / count as f64) as u64)
        };
    }

    pub fn record_job_completed(&mut self) {
        self.jobs_completed += 1;
        self.last_job_finished = Some(Utc::now());
    }

    pub fn record_job_failed(&mut self, retrying: bool) {
        if retrying {
            self.jobs_retried += 1;
        } else {
            self.jobs_failed += 1;
            self.last_job_finished = Some(Utc::now());
        }
    }

    pub fn record_job_cancelled(&mut self) {
        self.jobs_cancelled += 1;
        self.last_job_finished = Some(Utc::now());
    }

    /// Share of executed tests that passed, 0.0 when nothing ran.
    pub fn pass_rate(&self) -> f64 {
        if self.tests_executed == 0 {
            0.0
        } else {
            self.tests_passed as f64 / self.tests_executed as f64
        }
    }
}
