use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::test_case::{AssertionResult, PromptCardId, TestCaseId};

/// Execution identifier, one per admitted job.
pub type ExecutionId = String;

/// Default per-job test concurrency: `min(8, 2 × cores)`.
pub fn default_max_concurrent_tests() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (2 * cores).min(8)
}

/// Resources a job declares it will consume while running.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            memory_mb: 512.0,
            cpu_percent: 20.0,
        }
    }
}

/// Per-job execution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub max_concurrent_tests: usize,
    pub timeout_per_test_ms: u64,
    pub retry_failed_tests: bool,
    pub max_retries: u32,
    pub stop_on_first_failure: bool,
    pub resource_limits: ResourceBudget,
    pub cache_enabled: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tests: default_max_concurrent_tests(),
            timeout_per_test_ms: 30_000,
            retry_failed_tests: true,
            max_retries: 2,
            stop_on_first_failure: false,
            resource_limits: ResourceBudget::default(),
            cache_enabled: true,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout_per_test(&self) -> Duration {
        Duration::from_millis(self.timeout_per_test_ms)
    }

    /// Whole-job attempts granted to the queue: one plus `max_retries` when
    /// retries are enabled.
    pub fn queue_attempts(&self) -> u32 {
        if self.retry_failed_tests {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    /// Batch size used when fanning out test cases: `min(2 × concurrency, cap)`.
    pub fn batch_size(&self, cap: usize) -> usize {
        (2 * self.max_concurrent_tests).min(cap).max(1)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_concurrent_tests == 0 {
            return Err(CoreError::InvalidConfig(
                "max_concurrent_tests must be at least 1".into(),
            ));
        }
        if self.timeout_per_test_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "timeout_per_test_ms must be greater than 0".into(),
            ));
        }
        if self.resource_limits.cpu_percent < 0.0 || self.resource_limits.memory_mb < 0.0 {
            return Err(CoreError::InvalidConfig(
                "resource_limits must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// Caller-supplied overrides merged over [`ExecutionConfig`] defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigOverrides {
    pub max_concurrent_tests: Option<usize>,
    pub timeout_per_test_ms: Option<u64>,
    pub retry_failed_tests: Option<bool>,
    pub max_retries: Option<u32>,
    pub stop_on_first_failure: Option<bool>,
    pub resource_limits: Option<ResourceBudget>,
    pub cache_enabled: Option<bool>,
}

impl ConfigOverrides {
    pub fn apply(&self, base: &ExecutionConfig) -> ExecutionConfig {
        ExecutionConfig {
            max_concurrent_tests: self.max_concurrent_tests.unwrap_or(base.max_concurrent_tests),
            timeout_per_test_ms: self.timeout_per_test_ms.unwrap_or(base.timeout_per_test_ms),
            retry_failed_tests: self.retry_failed_tests.unwrap_or(base.retry_failed_tests),
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            stop_on_first_failure: self
                .stop_on_first_failure
                .unwrap_or(base.stop_on_first_failure),
            resource_limits: self.resource_limits.unwrap_or(base.resource_limits),
            cache_enabled: self.cache_enabled.unwrap_or(base.cache_enabled),
        }
    }
}

/// Coarse priority class derived from a signed job priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PriorityBucket {
    Low,
    Medium,
    High,
    /// May exceed normal limits up to the emergency ceiling.
    Critical,
}

impl PriorityBucket {
    /// `> 5` is high, `< -5` is low, anything else medium.
    pub fn from_priority(priority: i32) -> Self {
        if priority > 5 {
            PriorityBucket::High
        } else if priority < -5 {
            PriorityBucket::Low
        } else {
            PriorityBucket::Medium
        }
    }
}

impl fmt::Display for PriorityBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityBucket::Low => write!(f, "low"),
            PriorityBucket::Medium => write!(f, "medium"),
            PriorityBucket::High => write!(f, "high"),
            PriorityBucket::Critical => write!(f, "critical"),
        }
    }
}

/// One admitted request to run a set of test cases for a prompt card and
/// model. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionJob {
    pub id: ExecutionId,
    pub prompt_card_id: PromptCardId,
    pub test_case_ids: Vec<TestCaseId>,
    pub model: String,
    pub config: ExecutionConfig,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl ExecutionJob {
    pub fn bucket(&self) -> PriorityBucket {
        PriorityBucket::from_priority(self.priority)
    }
}

/// Token counts and error markers attached to a result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
    /// `"timeout"`, `"execution"` or `"template"` when the test errored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one test case attempt. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestExecutionResult {
    pub execution_id: ExecutionId,
    pub test_case_id: TestCaseId,
    /// AND of every assertion outcome; false when the test errored.
    pub passed: bool,
    pub llm_output: String,
    pub assertion_results: Vec<AssertionResult>,
    pub execution_time_ms: u64,
    pub model: String,
    pub prompt_used: String,
    pub created_at: DateTime<Utc>,
    pub metadata: ResultMetadata,
}

impl TestExecutionResult {
    pub fn error(&self) -> Option<&str> {
        self.metadata.error.as_deref()
    }
}

/// Progress value reported for a job that failed.
pub const PROGRESS_FAILED: i32 = -1;

/// Live, in-memory progress of a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub job_id: ExecutionId,
    /// 0–100, or [`PROGRESS_FAILED`].
    pub percent: i32,
    pub message: String,
    pub current_test: Option<TestCaseId>,
    pub total_tests: usize,
    /// Tests that finished and passed.
    pub completed_tests: usize,
    /// Tests that finished and failed.
    pub failed_tests: usize,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionProgress {
    pub fn new(job_id: impl Into<ExecutionId>, total_tests: usize) -> Self {
        Self {
            job_id: job_id.into(),
            percent: 0,
            message: "Starting execution".to_string(),
            current_test: None,
            total_tests,
            completed_tests: 0,
            failed_tests: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn finished_tests(&self) -> usize {
        self.completed_tests + self.failed_tests
    }
}

/// Lifecycle state of an execution job. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
