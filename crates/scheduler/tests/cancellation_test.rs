//! Cancellation, admission rejection and shutdown behaviour.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use promptbench_core::{ConfigOverrides, ExecutionStatus};
use promptbench_scheduler::{SchedulerError, SchedulerEvent};
use tokio::sync::broadcast::error::RecvError;

async fn wait_for_status(
    manager: &promptbench_scheduler::TestQueueManager,
    id: &str,
    status: ExecutionStatus,
) {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if manager.execution_status(id).await.unwrap() == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("status never reached");
}

#[tokio::test]
async fn cancelling_a_queued_job_removes_it() {
    let store = store_with([echo_case("1")]);
    let llm = Arc::new(MockLlm::echo());
    let manager = manager(llm.clone(), store);
    let mut rx = manager.subscribe();

    let id = manager
        .queue_test_execution("card-1", &ids(1..=1), "mock-model", ConfigOverrides::default(), 0)
        .await
        .unwrap();
    assert_eq!(manager.get_queue_stats().await.unwrap().waiting, 1);

    assert!(manager.cancel_execution(&id).await.unwrap());
    assert_eq!(manager.get_queue_stats().await.unwrap().waiting, 0);
    assert!(manager.resources().reservation(&id).is_none());
    assert_eq!(
        manager.execution_status(&id).await.unwrap(),
        Some(ExecutionStatus::Cancelled)
    );
    wait_for(&mut rx, |e| {
        matches!(e, SchedulerEvent::JobCancelled { execution_id } if execution_id == &id)
    })
    .await;

    assert!(!manager.cancel_execution(&id).await.unwrap());

    manager.start().unwrap();
    tokio::time::sleep(SETTLE).await;
    assert_eq!(llm.calls(), 0);
    assert_eq!(manager.metrics().jobs_cancelled, 1);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancelling_unknown_execution_returns_false() {
    let manager = manager(Arc::new(MockLlm::echo()), store_with([]));
    assert!(!manager.cancel_execution("no-such-job").await.unwrap());
}

#[tokio::test]
async fn cancelling_a_running_job_lets_in_flight_tests_finish() {
    let store = store_with((1..=4).map(|i| echo_case(&i.to_string())));
    let llm = Arc::new(MockLlm::echo().with_delay(Duration::from_millis(150)));
    let manager = manager(llm.clone(), store.clone());
    let mut rx = manager.subscribe();
    manager.start().unwrap();

    let overrides = ConfigOverrides {
        max_concurrent_tests: Some(1),
        ..Default::default()
    };
    let id = manager
        .queue_test_execution("card-1", &ids(1..=4), "mock-model", overrides, 0)
        .await
        .unwrap();

    wait_for(&mut rx, |e| match e {
        SchedulerEvent::ProgressUpdated(p) => p.job_id == id && p.current_test.is_some(),
        _ => false,
    })
    .await;
    assert!(manager.get_execution_progress(&id).is_some());
    assert!(manager.resources().reservation(&id).is_some());

    assert!(manager.cancel_execution(&id).await.unwrap());

    let finished = wait_for(&mut rx, |e| match e {
        SchedulerEvent::ProgressUpdated(p) => p.job_id == id && p.completed_tests >= 1,
        _ => false,
    })
    .await;
    let SchedulerEvent::ProgressUpdated(progress) = finished else {
        unreachable!()
    };
    assert_eq!(progress.failed_tests, 0);

    wait_for_status(&manager, &id, ExecutionStatus::Cancelled).await;
    assert!(manager.get_execution_progress(&id).is_none());
    assert!(manager.resources().reservation(&id).is_none());

    let persisted = store.results_for(&id).unwrap();
    assert_eq!(persisted.len(), 1);
    assert!(persisted[0].passed);
    assert_eq!(llm.calls(), 1);

    // Already settled; a second cancel is a no-op.
    assert!(!manager.cancel_execution(&id).await.unwrap());

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancelled_job_is_not_retried_after_a_transient_failure() {
    let store = Arc::new(StallingStore::new(1, Duration::from_millis(200)));
    store.inner.insert_test_cases([echo_case("1"), echo_case("2")]);
    let llm = Arc::new(MockLlm::echo());
    let manager = manager(llm.clone(), store.clone());
    let mut rx = manager.subscribe();
    manager.start().unwrap();

    let id = manager
        .queue_test_execution("card-1", &ids(1..=2), "mock-model", ConfigOverrides::default(), 0)
        .await
        .unwrap();
    wait_for(&mut rx, |e| {
        matches!(e, SchedulerEvent::JobStarted { execution_id, .. } if execution_id == &id)
    })
    .await;

    // Lands while the first load is still stalled.
    assert!(manager.cancel_execution(&id).await.unwrap());
    wait_for_status(&manager, &id, ExecutionStatus::Cancelled).await;

    // Well past the queue's retry backoff.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        manager.execution_status(&id).await.unwrap(),
        Some(ExecutionStatus::Cancelled)
    );
    assert_eq!(llm.calls(), 0);
    assert_eq!(store.inner.load_count(), 0);

    let metrics = manager.metrics();
    assert_eq!(metrics.jobs_started, 1);
    assert_eq!(metrics.jobs_retried, 0);
    assert_eq!(metrics.jobs_cancelled, 1);
    let stats = manager.get_queue_stats().await.unwrap();
    assert_eq!(stats.waiting + stats.delayed + stats.active, 0);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn admission_rejects_work_on_a_busy_host() {
    let store = store_with([echo_case("1")]);
    let (manager, sampler) = manager_with(Arc::new(MockLlm::echo()), store, fast_settings());
    sampler.set(busy_host());

    let err = manager
        .queue_test_execution("card-1", &ids(1..=1), "mock-model", ConfigOverrides::default(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Admission(_)), "{:?}", err);
    assert_eq!(manager.get_queue_stats().await.unwrap().waiting, 0);

    // High priority does not lift the normal limits.
    let err = manager
        .queue_test_execution("card-1", &ids(1..=1), "mock-model", ConfigOverrides::default(), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Admission(_)));

    sampler.set(promptbench_scheduler::HostSample {
        cpu_percent: 10.0,
        memory_total_mb: 16_384.0,
        ..Default::default()
    });
    let id = manager
        .queue_test_execution("card-1", &ids(1..=1), "mock-model", ConfigOverrides::default(), 0)
        .await
        .unwrap();
    assert_eq!(
        manager.execution_status(&id).await.unwrap(),
        Some(ExecutionStatus::Queued)
    );
    assert_eq!(manager.get_queue_stats().await.unwrap().waiting, 1);
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_queueing() {
    let manager = manager(Arc::new(MockLlm::echo()), store_with([]));

    let empty: Vec<String> = vec![" ".into()];
    for (card, ids, model) in [
        ("card-1", empty.clone(), "mock-model"),
        ("", vec!["1".to_string()], "mock-model"),
        ("card-1", vec!["1".to_string()], " "),
    ] {
        let err = manager
            .queue_test_execution(card, &ids, model, ConfigOverrides::default(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)), "{:?}", err);
    }

    let zero = ConfigOverrides {
        timeout_per_test_ms: Some(0),
        ..Default::default()
    };
    let err = manager
        .queue_test_execution("card-1", &["1".to_string()], "mock-model", zero, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));
    assert_eq!(manager.get_queue_stats().await.unwrap().waiting, 0);
}

#[tokio::test]
async fn shutdown_closes_queue_and_event_stream() {
    let store = store_with([echo_case("1")]);
    let manager = manager(Arc::new(MockLlm::echo()), store);
    let mut rx = manager.subscribe();
    manager.start().unwrap();
    assert!(manager.is_running());
    assert!(manager.resources().is_monitoring());

    manager.shutdown().await.unwrap();
    assert!(!manager.is_running());
    assert!(!manager.resources().is_monitoring());

    let closed = tokio::time::timeout(TIMEOUT, async {
        loop {
            match rx.recv().await {
                Err(RecvError::Closed) => return,
                _ => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    let err = manager
        .queue_test_execution("card-1", &ids(1..=1), "mock-model", ConfigOverrides::default(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ShuttingDown));
    assert!(matches!(manager.start(), Err(SchedulerError::ShuttingDown)));

    // Second shutdown is a no-op.
    manager.shutdown().await.unwrap();
}
