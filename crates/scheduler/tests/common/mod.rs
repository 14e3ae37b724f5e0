//! Shared fixtures for scheduler integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use promptbench_core::config::{BackoffPolicy, QueueConfig, ResourceLimits, SchedulerConfig};
use promptbench_core::{Assertion, TestCase, TestExecutionResult};
use promptbench_llm::{Generation, LlmError, LlmProvider};
use promptbench_scheduler::{
    HostSample, MemoryStore, ResourceManager, SchedulerEvent, StaticSampler, StoreError,
    TestQueueManager, TestStore,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const SETTLE: Duration = Duration::from_millis(50);

/// What the mock model does with a prompt.
pub enum Reply {
    Echo,
    Fail(&'static str),
    Hang,
}

/// Deterministic model stand-in. Echoes the prompt by default.
pub struct MockLlm {
    calls: AtomicUsize,
    delay: Duration,
    rule: Box<dyn Fn(&str) -> Reply + Send + Sync>,
}

impl MockLlm {
    pub fn echo() -> Self {
        Self::new(|_| Reply::Echo)
    }

    pub fn hanging() -> Self {
        Self::new(|_| Reply::Hang)
    }

    pub fn new(rule: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            rule: Box::new(rule),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    async fn generate(&self, prompt: &str, model: &str) -> Result<Generation, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match (self.rule)(prompt) {
            Reply::Echo => Ok(Generation::new(prompt, model)),
            Reply::Fail(message) => Err(LlmError::Other(message.to_string())),
            Reply::Hang => std::future::pending().await,
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Store whose first `failures` result writes are rejected.
pub struct FlakyStore {
    pub inner: MemoryStore,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl TestStore for FlakyStore {
    async fn load_test_cases(&self, ids: &[String]) -> Result<Vec<TestCase>, StoreError> {
        self.inner.load_test_cases(ids).await
    }

    async fn store_results(
        &self,
        execution_id: &str,
        results: &[TestExecutionResult],
    ) -> Result<(), StoreError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("database offline".into()));
        }
        self.inner.store_results(execution_id, results).await
    }
}

/// Store whose first `failures` case loads stall for `delay` and then fail.
pub struct StallingStore {
    pub inner: MemoryStore,
    failures: AtomicUsize,
    delay: Duration,
}

impl StallingStore {
    pub fn new(failures: usize, delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(failures),
            delay,
        }
    }
}

#[async_trait]
impl TestStore for StallingStore {
    async fn load_test_cases(&self, ids: &[String]) -> Result<Vec<TestCase>, StoreError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            return Err(StoreError::Unavailable("replica lagging".into()));
        }
        self.inner.load_test_cases(ids).await
    }

    async fn store_results(
        &self,
        execution_id: &str,
        results: &[TestExecutionResult],
    ) -> Result<(), StoreError> {
        self.inner.store_results(execution_id, results).await
    }
}

/// Test case rendering `"Echo: {{x}}"` and expecting `"Echo"` back.
pub fn echo_case(id: &str) -> TestCase {
    let mut input_variables = BTreeMap::new();
    input_variables.insert("x".to_string(), json!(format!("value-{}", id)));
    TestCase {
        id: id.to_string(),
        name: format!("echo {}", id),
        prompt_card_id: "card-1".to_string(),
        input_variables,
        assertions: vec![Assertion::contains("Echo")],
        prompt_template: "Echo: {{x}}".to_string(),
    }
}

pub fn ids(range: std::ops::RangeInclusive<u32>) -> Vec<String> {
    range.map(|i| i.to_string()).collect()
}

pub fn store_with(cases: impl IntoIterator<Item = TestCase>) -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.insert_test_cases(cases);
    Arc::new(store)
}

pub fn fast_settings() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_jobs: 2,
        batch_pause_ms: 5,
        poll_interval_ms: 5,
        ..SchedulerConfig::default()
    }
}

pub fn fast_queue() -> QueueConfig {
    QueueConfig {
        backoff: BackoffPolicy::Fixed { delay_ms: 10 },
        ..QueueConfig::default()
    }
}

/// Resource manager over a pinned idle host.
pub fn idle_resources() -> (Arc<ResourceManager>, StaticSampler) {
    let sampler = StaticSampler::idle();
    let limits = ResourceLimits {
        monitor_interval_ms: 50,
        ..ResourceLimits::default()
    };
    let manager = ResourceManager::with_sampler(limits, Box::new(sampler.clone()));
    (Arc::new(manager), sampler)
}

pub fn busy_host() -> HostSample {
    HostSample {
        cpu_percent: 90.0,
        memory_total_mb: 16_384.0,
        ..Default::default()
    }
}

pub fn manager_with(
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn TestStore>,
    settings: SchedulerConfig,
) -> (TestQueueManager, StaticSampler) {
    let (resources, sampler) = idle_resources();
    let manager = TestQueueManager::builder(llm, store)
        .settings(settings)
        .queue_config(fast_queue())
        .resources(resources)
        .build();
    (manager, sampler)
}

pub fn manager(llm: Arc<dyn LlmProvider>, store: Arc<dyn TestStore>) -> TestQueueManager {
    manager_with(llm, store, fast_settings()).0
}

/// Receive events until one matches, failing after [`TIMEOUT`].
pub async fn wait_for(
    rx: &mut broadcast::Receiver<SchedulerEvent>,
    mut matches: impl FnMut(&SchedulerEvent) -> bool,
) -> SchedulerEvent {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub fn is_terminal_for(event: &SchedulerEvent, id: &str) -> bool {
    match event {
        SchedulerEvent::JobCompleted { execution_id, .. } => execution_id == id,
        SchedulerEvent::JobFailed {
            execution_id,
            retrying,
            ..
        } => execution_id == id && !retrying,
        _ => false,
    }
}
