use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use promptbench_core::config::{QueueConfig, SchedulerConfig};
use promptbench_core::{
    Assertion, Config, ConfigOverrides, ExecutionStatus, TestCase, PROGRESS_FAILED,
};
use promptbench_llm::{Generation, LlmError, LlmProvider};
use tokio::sync::broadcast;

use super::TestQueueManager;
use crate::events::SchedulerEvent;
use crate::resources::{HostSample, ResourceManager, StaticSampler};
use crate::store::MemoryStore;

/// Echoes prompts and counts calls.
struct CountingLlm {
    calls: AtomicUsize,
}

impl CountingLlm {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for CountingLlm {
    async fn generate(&self, prompt: &str, model: &str) -> Result<Generation, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Generation::new(prompt, model))
    }

    fn name(&self) -> &str {
        "counting"
    }
}

fn case(id: &str) -> TestCase {
    TestCase {
        id: id.to_string(),
        name: id.to_string(),
        prompt_card_id: "card".to_string(),
        input_variables: BTreeMap::new(),
        assertions: vec![Assertion::contains("hello")],
        prompt_template: "hello".to_string(),
    }
}

fn manager(llm: Arc<CountingLlm>) -> TestQueueManager {
    manager_on(llm, StaticSampler::idle())
}

fn manager_on(llm: Arc<CountingLlm>, sampler: StaticSampler) -> TestQueueManager {
    let store = MemoryStore::new();
    store.insert_test_cases([case("a"), case("b")]);
    let resources = ResourceManager::with_sampler(Default::default(), Box::new(sampler));
    TestQueueManager::builder(llm, Arc::new(store))
        .settings(SchedulerConfig {
            max_concurrent_jobs: 1,
            poll_interval_ms: 5,
            batch_pause_ms: 1,
            ..SchedulerConfig::default()
        })
        .queue_config(QueueConfig::default())
        .resources(Arc::new(resources))
        .build()
}

async fn wait_for_status(manager: &TestQueueManager, id: &str, status: ExecutionStatus) {
    for _ in 0..500 {
        if manager.execution_status(id).await.unwrap() == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached {:?}", id, status);
}

#[tokio::test]
async fn terminal_status_is_final() {
    let manager = manager(Arc::new(CountingLlm::new()));
    let inner = &manager.inner;

    inner.set_status("e1", ExecutionStatus::Queued);
    inner.set_status("e1", ExecutionStatus::Running);
    assert_eq!(inner.status_of("e1"), Some(ExecutionStatus::Running));

    inner.set_status("e1", ExecutionStatus::Cancelled);
    inner.set_status("e1", ExecutionStatus::Completed);
    inner.set_status("e1", ExecutionStatus::Queued);
    assert_eq!(inner.status_of("e1"), Some(ExecutionStatus::Cancelled));
}

#[tokio::test]
async fn pending_cancel_is_honoured_when_the_job_starts() {
    let llm = Arc::new(CountingLlm::new());
    let manager = manager(llm.clone());
    let id = manager
        .queue_test_execution("card", &["a".into(), "b".into()], "m", ConfigOverrides::default(), 0)
        .await
        .unwrap();

    // As if the cancel raced the worker's dequeue.
    manager.inner.add_pending_cancel(&id);
    manager.start().unwrap();

    wait_for_status(&manager, &id, ExecutionStatus::Cancelled).await;
    assert_eq!(llm.calls(), 0);
    assert!(!manager.inner.take_pending_cancel(&id));
    assert!(manager.get_active_executions().is_empty());
    assert_eq!(manager.metrics().jobs_cancelled, 1);
    assert_eq!(manager.metrics().jobs_started, 1);

    manager.shutdown().await.unwrap();
}

fn saturated_cpu() -> HostSample {
    HostSample {
        cpu_percent: 99.0,
        memory_total_mb: 16_384.0,
        ..Default::default()
    }
}

/// Drain buffered events without waiting.
fn buffered(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn failed_reservation_reports_failed_progress() {
    let llm = Arc::new(CountingLlm::new());
    let sampler = StaticSampler::idle();
    let manager = manager_on(llm.clone(), sampler.clone());
    let mut rx = manager.subscribe();
    let id = manager
        .queue_test_execution("card", &["a".into()], "m", ConfigOverrides::default(), 0)
        .await
        .unwrap();

    sampler.set(saturated_cpu());
    manager.start().unwrap();

    let mut failed_progress = false;
    let retrying = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(SchedulerEvent::ProgressUpdated(p)) if p.job_id == id => {
                    failed_progress |= p.percent == PROGRESS_FAILED;
                }
                Ok(SchedulerEvent::JobFailed { execution_id, retrying, .. }) if execution_id == id => {
                    return retrying;
                }
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .unwrap();

    assert!(retrying);
    assert!(failed_progress);
    assert_eq!(llm.calls(), 0);
    assert_eq!(manager.metrics().jobs_started, 0);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn pending_cancel_wins_over_a_failed_reservation() {
    let llm = Arc::new(CountingLlm::new());
    let sampler = StaticSampler::idle();
    let manager = manager_on(llm.clone(), sampler.clone());
    let id = manager
        .queue_test_execution("card", &["a".into()], "m", ConfigOverrides::default(), 0)
        .await
        .unwrap();

    sampler.set(saturated_cpu());
    manager.inner.add_pending_cancel(&id);
    manager.start().unwrap();

    wait_for_status(&manager, &id, ExecutionStatus::Cancelled).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = manager.get_queue_stats().await.unwrap();
    assert_eq!(stats.waiting + stats.delayed + stats.active, 0);
    assert_eq!(manager.metrics().jobs_retried, 0);
    assert_eq!(manager.metrics().jobs_cancelled, 1);
    assert_eq!(llm.calls(), 0);
    assert!(!manager.inner.take_pending_cancel(&id));
    manager.shutdown().await.unwrap();
}

#[test]
fn settling_attempt_refuses_new_cancels() {
    let manager = manager(Arc::new(CountingLlm::new()));
    let inner = &manager.inner;

    assert!(inner.add_pending_cancel("e1"));
    assert!(inner.begin_settle("e1"));
    assert!(!inner.add_pending_cancel("e1"));
    inner.end_settle("e1");

    assert!(!inner.take_pending_cancel("e1"));
    assert!(inner.add_pending_cancel("e1"));
}

#[tokio::test]
async fn cancel_racing_a_settling_attempt_leaves_nothing_behind() {
    let manager = manager(Arc::new(CountingLlm::new()));
    let mut rx = manager.subscribe();
    let id = manager
        .queue_test_execution("card", &["a".into()], "m", ConfigOverrides::default(), 0)
        .await
        .unwrap();

    // Play the worker by hand: take the job, then report it while the
    // cancel is looking it up.
    let job = manager.inner.queue.poll().await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert!(!manager.inner.begin_settle(&id));

    let settle = async {
        tokio::time::sleep(Duration::from_millis(40)).await;
        manager.inner.queue.ack(&id).await.unwrap();
        manager.inner.end_settle(&id);
    };
    let (cancelled, ()) = tokio::join!(manager.cancel_execution(&id), settle);

    assert!(!cancelled.unwrap());
    assert!(!manager.inner.take_pending_cancel(&id));
    assert!(!buffered(&mut rx)
        .iter()
        .any(|e| matches!(e, SchedulerEvent::JobCancelled { .. })));
}

#[test]
fn from_config_carries_scheduler_defaults() {
    let mut config = Config::default();
    config.scheduler.default_timeout_per_test_ms = 1_234;
    config.scheduler.default_max_concurrent_tests = 3;

    let manager = TestQueueManager::from_config(
        &config,
        Arc::new(CountingLlm::new()),
        Arc::new(MemoryStore::new()),
    )
    .build();
    let defaults = manager.default_execution_config();
    assert_eq!(defaults.timeout_per_test_ms, 1_234);
    assert_eq!(defaults.max_concurrent_tests, 3);
    assert!(defaults.retry_failed_tests);
    assert_eq!(defaults.max_retries, 2);
    assert!(defaults.cache_enabled);
    assert!(!manager.is_running());
}
