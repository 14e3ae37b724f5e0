//! Broadcast event buses for scheduler and resource events.

use std::sync::{Mutex, MutexGuard};

use promptbench_core::{ExecutionId, ExecutionProgress, TestExecutionResult};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::resources::{ResourceUsage, ThresholdKind};

const DEFAULT_CAPACITY: usize = 256;

/// Fan-out channel that can be closed once. After [`close`](Self::close),
/// publishing is a no-op and existing subscribers see the stream end.
pub struct EventBus<E: Clone> {
    sender: Mutex<Option<broadcast::Sender<E>>>,
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<broadcast::Sender<E>>> {
        self.sender.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Subscribe to future events. A subscription taken after close yields
    /// `RecvError::Closed` immediately.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        match self.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Returns the number of subscribers that will see the event.
    pub fn publish(&self, event: E) -> usize {
        match self.lock().as_ref() {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    pub fn close(&self) {
        self.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().as_ref().map_or(0, |s| s.receiver_count())
    }
}

/// Lifecycle and progress notifications from the test queue manager.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    JobQueued {
        execution_id: ExecutionId,
        priority: i32,
    },
    JobStarted {
        execution_id: ExecutionId,
        attempt: u32,
    },
    ProgressUpdated(ExecutionProgress),
    JobCompleted {
        execution_id: ExecutionId,
        results: Vec<TestExecutionResult>,
    },
    JobFailed {
        execution_id: ExecutionId,
        error: String,
        /// The queue scheduled another attempt.
        retrying: bool,
    },
    JobCancelled {
        execution_id: ExecutionId,
    },
    JobStalled {
        execution_id: ExecutionId,
        requeued: bool,
    },
    SystemStress(ResourceUsage),
    EmergencyThreshold {
        kind: ThresholdKind,
        usage: ResourceUsage,
    },
}

impl SchedulerEvent {
    /// The execution this event concerns, if any.
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            SchedulerEvent::JobQueued { execution_id, .. }
            | SchedulerEvent::JobStarted { execution_id, .. }
            | SchedulerEvent::JobCompleted { execution_id, .. }
            | SchedulerEvent::JobFailed { execution_id, .. }
            | SchedulerEvent::JobCancelled { execution_id }
            | SchedulerEvent::JobStalled { execution_id, .. } => Some(execution_id),
            SchedulerEvent::ProgressUpdated(progress) => Some(&progress.job_id),
            SchedulerEvent::SystemStress(_) | SchedulerEvent::EmergencyThreshold { .. } => None,
        }
    }
}
