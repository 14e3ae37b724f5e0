use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use promptbench_core::{ExecutionProgress, TestCaseId, PROGRESS_FAILED};

/// Progress once test cases are loaded.
pub(super) const PROGRESS_LOADED: i32 = 10;
/// Share of the bar covered by running tests.
const PROGRESS_TESTS_SPAN: usize = 80;
/// Progress while results are persisted.
pub(super) const PROGRESS_PERSISTING: i32 = 95;
pub(super) const PROGRESS_DONE: i32 = 100;

/// Live state of a job a worker is running.
///
/// Percent only moves forward, except for the terminal
/// [`PROGRESS_FAILED`].
pub(crate) struct ActiveJob {
    progress: Mutex<ExecutionProgress>,
    cancelled: AtomicBool,
    stopped_by: Mutex<Option<TestCaseId>>,
    pub(super) attempt: u32,
}

impl ActiveJob {
    pub(super) fn new(job_id: &str, total_tests: usize, attempt: u32) -> Self {
        Self {
            progress: Mutex::new(ExecutionProgress::new(job_id, total_tests)),
            cancelled: AtomicBool::new(false),
            stopped_by: Mutex::new(None),
            attempt,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExecutionProgress> {
        self.progress.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn snapshot(&self) -> ExecutionProgress {
        self.lock().clone()
    }

    pub(super) fn advance(&self, percent: i32, message: impl Into<String>) -> ExecutionProgress {
        let mut progress = self.lock();
        if progress.percent != PROGRESS_FAILED {
            progress.percent = progress.percent.max(percent);
        }
        progress.message = message.into();
        progress.updated_at = Utc::now();
        progress.clone()
    }

    pub(super) fn begin_test(&self, test_case_id: &str) -> ExecutionProgress {
        let mut progress = self.lock();
        progress.current_test = Some(test_case_id.to_string());
        progress.message = format!("Running test {}", test_case_id);
        progress.updated_at = Utc::now();
        progress.clone()
    }

    pub(super) fn finish_test(&self, passed: bool) -> ExecutionProgress {
        let mut progress = self.lock();
        if passed {
            progress.completed_tests += 1;
        } else {
            progress.failed_tests += 1;
        }
        let finished = progress.finished_tests();
        let total = progress.total_tests.max(1);
        let percent = PROGRESS_LOADED + (PROGRESS_TESTS_SPAN * finished / total) as i32;
        if progress.percent != PROGRESS_FAILED {
            progress.percent = progress.percent.max(percent);
        }
        progress.message = format!("Completed {}/{} tests", finished, progress.total_tests);
        progress.updated_at = Utc::now();
        progress.clone()
    }

    pub(super) fn fail(&self, message: impl Into<String>) -> ExecutionProgress {
        let mut progress = self.lock();
        progress.percent = PROGRESS_FAILED;
        progress.current_test = None;
        progress.message = message.into();
        progress.updated_at = Utc::now();
        progress.clone()
    }

    pub(super) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Record the first failing test under `stop_on_first_failure`.
    /// Returns true only for the call that set it.
    pub(super) fn stop_after(&self, test_case_id: &str) -> bool {
        let mut stopped = self.stopped_by.lock().unwrap_or_else(|p| p.into_inner());
        if stopped.is_some() {
            return false;
        }
        *stopped = Some(test_case_id.to_string());
        true
    }

    pub(super) fn stop_reason(&self) -> Option<TestCaseId> {
        self.stopped_by
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// No further tests should start.
    pub(super) fn should_halt(&self) -> bool {
        self.is_cancelled() || self.stop_reason().is_some()
    }
}
