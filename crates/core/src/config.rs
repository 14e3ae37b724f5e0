use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::execution::default_max_concurrent_tests;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub scheduler: SchedulerConfig,
    pub resources: ResourceLimits,
    pub queue: QueueConfig,
    pub llm: LlmConfig,
    pub ollama: OllamaConfig,
}

/// Well-known env keys that identify a profile when prefixed.
const PROFILE_MARKER_KEYS: &[&str] = &[
    "OPENAI_API_KEY",
    "OLLAMA_URL",
    "LLM_PROVIDER",
    "MAX_CONCURRENT_JOBS",
];

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `PROMPTBENCH_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("PROMPTBENCH_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            scheduler: SchedulerConfig::from_env_profiled(p),
            resources: ResourceLimits::from_env_profiled(p),
            queue: QueueConfig::from_env_profiled(p),
            llm: LlmConfig::from_env_profiled(p),
            ollama: OllamaConfig::from_env_profiled(p),
        }
    }

    /// Parse a TOML document. Missing sections and fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, CoreError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.scheduler.batch_size_cap == 0 {
            return Err(CoreError::InvalidConfig("scheduler.batch_size_cap must be at least 1".into()));
        }
        if self.resources.emergency_cpu_threshold < self.resources.max_cpu_percent {
            return Err(CoreError::InvalidConfig(
                "resources.emergency_cpu_threshold must be >= max_cpu_percent".into(),
            ));
        }
        if self.resources.emergency_memory_mb < self.resources.max_memory_mb {
            return Err(CoreError::InvalidConfig(
                "resources.emergency_memory_mb must be >= max_memory_mb".into(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(CoreError::InvalidConfig("queue.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Discover available profiles by scanning env vars for `{PREFIX}_{MARKER_KEY}` patterns.
    /// Always includes "default" (the unprefixed config).
    pub fn available_profiles() -> Vec<String> {
        let mut profiles = std::collections::BTreeSet::new();
        profiles.insert("default".to_string());

        for (key, _) in env::vars() {
            for marker in PROFILE_MARKER_KEYS {
                if let Some(prefix) = key.strip_suffix(&format!("_{}", marker)) {
                    if !prefix.is_empty()
                        && prefix.chars().all(|c| c.is_ascii_uppercase() || c == '_')
                    {
                        profiles.insert(prefix.to_string());
                    }
                }
            }
        }

        profiles.into_iter().collect()
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  scheduler:   jobs={}, tests/job={}, timeout={}ms",
            self.scheduler.resolved_max_concurrent_jobs(),
            self.scheduler.resolved_default_concurrent_tests(),
            self.scheduler.default_timeout_per_test_ms
        );
        tracing::info!(
            "  resources:   cpu={}%, memory={}MB, tests={}",
            self.resources.max_cpu_percent,
            self.resources.max_memory_mb,
            self.resources.max_concurrent_tests
        );
        tracing::info!(
            "  queue:       attempts={}, backoff={:?}",
            self.queue.max_attempts,
            self.queue.backoff
        );
        tracing::info!("  llm:         provider={}", self.llm.provider);
        tracing::info!("  ollama:      url={}", self.ollama.url);
    }

    /// Return a redacted view safe for API responses (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "scheduler": {
                "max_concurrent_jobs": self.scheduler.resolved_max_concurrent_jobs(),
                "default_max_concurrent_tests": self.scheduler.resolved_default_concurrent_tests(),
                "default_timeout_per_test_ms": self.scheduler.default_timeout_per_test_ms,
            },
            "resources": self.resources,
            "queue": self.queue,
            "llm": {
                "provider": self.llm.provider,
                "configured": self.llm.is_configured(),
            },
            "ollama": { "url": self.ollama.url },
        })
    }
}

// ── Scheduler ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrent jobs. 0 = `min(5, cores)`.
    pub max_concurrent_jobs: usize,
    /// Default per-job test concurrency. 0 = `min(8, 2 × cores)`.
    pub default_max_concurrent_tests: usize,
    pub default_timeout_per_test_ms: u64,
    /// Upper bound on a test batch, whatever the job's concurrency.
    pub batch_size_cap: usize,
    /// Pause between batches within a job.
    pub batch_pause_ms: u64,
    pub test_case_cache_capacity: usize,
    pub test_case_cache_ttl_secs: u64,
    /// Terminal statuses remembered for `execution_status`.
    pub status_history: usize,
    /// How often idle workers poll the queue.
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            default_max_concurrent_tests: 0,
            default_timeout_per_test_ms: 30_000,
            batch_size_cap: 20,
            batch_pause_ms: 100,
            test_case_cache_capacity: 100,
            test_case_cache_ttl_secs: 600,
            status_history: 1_000,
            poll_interval_ms: 50,
        }
    }
}

impl SchedulerConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            max_concurrent_jobs: profiled_env_parse(p, "MAX_CONCURRENT_JOBS", d.max_concurrent_jobs),
            default_max_concurrent_tests: profiled_env_parse(
                p,
                "DEFAULT_MAX_CONCURRENT_TESTS",
                d.default_max_concurrent_tests,
            ),
            default_timeout_per_test_ms: profiled_env_parse(
                p,
                "DEFAULT_TEST_TIMEOUT_MS",
                d.default_timeout_per_test_ms,
            ),
            batch_size_cap: profiled_env_parse(p, "BATCH_SIZE_CAP", d.batch_size_cap),
            batch_pause_ms: profiled_env_parse(p, "BATCH_PAUSE_MS", d.batch_pause_ms),
            test_case_cache_capacity: profiled_env_parse(
                p,
                "TEST_CASE_CACHE_CAPACITY",
                d.test_case_cache_capacity,
            ),
            test_case_cache_ttl_secs: profiled_env_parse(
                p,
                "TEST_CASE_CACHE_TTL_SECS",
                d.test_case_cache_ttl_secs,
            ),
            status_history: profiled_env_parse(p, "STATUS_HISTORY", d.status_history),
            poll_interval_ms: profiled_env_parse(p, "QUEUE_POLL_INTERVAL_MS", d.poll_interval_ms),
        }
    }

    /// Resolve job-level worker count (0 means `min(5, cores)`).
    pub fn resolved_max_concurrent_jobs(&self) -> usize {
        if self.max_concurrent_jobs == 0 {
            available_cores().min(5)
        } else {
            self.max_concurrent_jobs
        }
    }

    /// Resolve default per-job test concurrency (0 means `min(8, 2 × cores)`).
    pub fn resolved_default_concurrent_tests(&self) -> usize {
        if self.default_max_concurrent_tests == 0 {
            default_max_concurrent_tests()
        } else {
            self.default_max_concurrent_tests
        }
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn test_case_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.test_case_cache_ttl_secs)
    }
}

// ── Resources ─────────────────────────────────────────────────

/// Admission limits enforced by the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_cpu_percent: f64,
    pub max_memory_mb: f64,
    pub max_concurrent_tests: usize,
    /// Ceiling for critical-priority admissions.
    pub emergency_cpu_threshold: f64,
    /// Ceiling for critical-priority admissions.
    pub emergency_memory_mb: f64,
    pub monitor_interval_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: 80.0,
            max_memory_mb: 2048.0,
            max_concurrent_tests: 20,
            emergency_cpu_threshold: 95.0,
            emergency_memory_mb: 3072.0,
            monitor_interval_ms: 5_000,
        }
    }
}

impl ResourceLimits {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            max_cpu_percent: profiled_env_parse(p, "RESOURCE_MAX_CPU_PERCENT", d.max_cpu_percent),
            max_memory_mb: profiled_env_parse(p, "RESOURCE_MAX_MEMORY_MB", d.max_memory_mb),
            max_concurrent_tests: profiled_env_parse(
                p,
                "RESOURCE_MAX_CONCURRENT_TESTS",
                d.max_concurrent_tests,
            ),
            emergency_cpu_threshold: profiled_env_parse(
                p,
                "RESOURCE_EMERGENCY_CPU_PERCENT",
                d.emergency_cpu_threshold,
            ),
            emergency_memory_mb: profiled_env_parse(
                p,
                "RESOURCE_EMERGENCY_MEMORY_MB",
                d.emergency_memory_mb,
            ),
            monitor_interval_ms: profiled_env_parse(
                p,
                "RESOURCE_MONITOR_INTERVAL_MS",
                d.monitor_interval_ms,
            ),
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }
}

// ── Queue ─────────────────────────────────────────────────────

/// Delay applied before a failed job is retried.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffPolicy {
    Fixed { delay_ms: u64 },
    /// `base_ms × 2^(attempt - 1)`.
    Exponential { base_ms: u64 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential { base_ms: 2_000 }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential { base_ms } => {
                let exp = attempt.saturating_sub(1).min(16);
                Duration::from_millis(base_ms.saturating_mul(1u64 << exp))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts for jobs that don't specify their own.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Completed jobs retained for inspection.
    pub keep_completed: usize,
    /// Failed jobs retained for inspection.
    pub keep_failed: usize,
    /// Lock held by a worker on an active job before it counts as stalled.
    pub lock_duration_ms: u64,
    pub stalled_interval_ms: u64,
    /// Times a job may stall before it is failed outright.
    pub max_stalled_count: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            keep_completed: 100,
            keep_failed: 50,
            lock_duration_ms: 30_000,
            stalled_interval_ms: 30_000,
            max_stalled_count: 1,
        }
    }
}

impl QueueConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        let backoff_ms = profiled_env_parse(p, "QUEUE_BACKOFF_MS", 2_000u64);
        let backoff = match profiled_env_or(p, "QUEUE_BACKOFF", "exponential").as_str() {
            "fixed" => BackoffPolicy::Fixed { delay_ms: backoff_ms },
            _ => BackoffPolicy::Exponential { base_ms: backoff_ms },
        };
        Self {
            max_attempts: profiled_env_parse(p, "QUEUE_MAX_ATTEMPTS", d.max_attempts),
            backoff,
            keep_completed: profiled_env_parse(p, "QUEUE_KEEP_COMPLETED", d.keep_completed),
            keep_failed: profiled_env_parse(p, "QUEUE_KEEP_FAILED", d.keep_failed),
            lock_duration_ms: profiled_env_parse(p, "QUEUE_LOCK_DURATION_MS", d.lock_duration_ms),
            stalled_interval_ms: profiled_env_parse(
                p,
                "QUEUE_STALLED_INTERVAL_MS",
                d.stalled_interval_ms,
            ),
            max_stalled_count: profiled_env_parse(p, "QUEUE_MAX_STALLED_COUNT", d.max_stalled_count),
        }
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms.max(1))
    }
}

// ── LLM (OpenAI / Ollama) ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// "openai", "ollama"
    pub provider: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            openai_api_key: None,
            openai_base_url: None,
            temperature: 0.1,
            max_tokens: 4096,
            request_timeout_secs: 120,
        }
    }
}

impl LlmConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            provider: profiled_env_or(p, "LLM_PROVIDER", &d.provider),
            openai_api_key: profiled_env_opt(p, "OPENAI_API_KEY"),
            openai_base_url: profiled_env_opt(p, "OPENAI_BASE_URL"),
            temperature: profiled_env_parse(p, "LLM_TEMPERATURE", d.temperature),
            max_tokens: profiled_env_parse(p, "LLM_MAX_TOKENS", d.max_tokens),
            request_timeout_secs: profiled_env_parse(
                p,
                "LLM_REQUEST_TIMEOUT_SECS",
                d.request_timeout_secs,
            ),
        }
    }

    pub fn is_configured(&self) -> bool {
        match self.provider.as_str() {
            "openai" => self.openai_api_key.is_some(),
            "ollama" => true,
            _ => false,
        }
    }
}

// ── Ollama (local models) ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub url: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
        }
    }
}

impl OllamaConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_or(p, "OLLAMA_URL", "http://localhost:11434"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_with_missing_sections_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
            [scheduler]
            max_concurrent_jobs = 3
            batch_pause_ms = 10

            [queue]
            backoff = { type = "fixed", delay_ms = 500 }
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_concurrent_jobs, 3);
        assert_eq!(config.scheduler.batch_pause_ms, 10);
        assert_eq!(config.scheduler.batch_size_cap, 20);
        assert_eq!(config.queue.backoff, BackoffPolicy::Fixed { delay_ms: 500 });
        assert_eq!(config.resources, ResourceLimits::default());
    }

    #[test]
    fn toml_rejects_emergency_below_limit() {
        let err = Config::from_toml_str(
            r#"
            [resources]
            max_cpu_percent = 90.0
            emergency_cpu_threshold = 50.0
            "#,
        );
        assert!(matches!(err, Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = BackoffPolicy::Exponential { base_ms: 2_000 };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::Fixed { delay_ms: 250 };
        assert_eq!(policy.delay_for(1), policy.delay_for(5));
    }

    #[test]
    fn resolved_worker_counts() {
        let mut config = SchedulerConfig::default();
        let jobs = config.resolved_max_concurrent_jobs();
        assert!(jobs >= 1 && jobs <= 5);

        config.max_concurrent_jobs = 8;
        assert_eq!(config.resolved_max_concurrent_jobs(), 8);

        config.default_max_concurrent_tests = 3;
        assert_eq!(config.resolved_default_concurrent_tests(), 3);
    }

    #[test]
    fn redacted_summary_hides_keys() {
        let mut config = Config::default();
        config.llm.provider = "openai".into();
        config.llm.openai_api_key = Some("sk-secret".into());
        let summary = config.redacted_summary().to_string();
        assert!(!summary.contains("sk-secret"));
        assert!(summary.contains("\"configured\":true"));
    }

    #[test]
    fn redacted_summary_reports_ollama_url() {
        let mut config = Config::default();
        config.ollama.url = "http://gpu-box:11434".into();
        let summary = config.redacted_summary();
        assert_eq!(summary["ollama"]["url"], "http://gpu-box:11434");
        assert_eq!(summary["llm"]["provider"], "ollama");
    }
}
