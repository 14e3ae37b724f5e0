use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;
use promptbench_core::config::{QueueConfig, ResourceLimits, SchedulerConfig};
use promptbench_core::{Config, ExecutionConfig, ExecutionId, ExecutionProgress, ExecutionStatus};
use promptbench_llm::LlmProvider;
use promptbench_queue::{JobQueue, MemoryJobQueue};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::progress::ActiveJob;
use crate::assertions::{AssertionValidator, BuiltinValidator};
use crate::cache::TestCaseCache;
use crate::events::{EventBus, SchedulerEvent};
use crate::metrics::ExecutionMetrics;
use crate::resources::ResourceManager;
use crate::store::TestStore;
use crate::template::PromptRenderer;

/// Background tasks spawned by [`TestQueueManager::start`].
pub(super) struct Runtime {
    pub(super) shutdown: watch::Sender<bool>,
    pub(super) handles: Vec<JoinHandle<()>>,
}

/// Cancels for jobs the queue reports active but no worker has registered,
/// and the attempts whose outcome is being reported to the queue.
#[derive(Default)]
pub(super) struct CancelLedger {
    pending: HashSet<ExecutionId>,
    settling: HashSet<ExecutionId>,
}

/// State shared between the public handle and its worker tasks.
pub(super) struct ManagerInner {
    pub(super) settings: SchedulerConfig,
    pub(super) queue_config: QueueConfig,
    /// Execution config that per-request overrides are merged over.
    pub(super) defaults: ExecutionConfig,
    pub(super) resources: Arc<ResourceManager>,
    pub(super) queue: Arc<dyn JobQueue>,
    pub(super) llm: Arc<dyn LlmProvider>,
    pub(super) store: Arc<dyn TestStore>,
    pub(super) validator: Arc<dyn AssertionValidator>,
    pub(super) renderer: PromptRenderer,
    pub(super) cache: TestCaseCache,
    pub(super) events: EventBus<SchedulerEvent>,
    /// Jobs currently held by a worker.
    pub(super) active: RwLock<HashMap<ExecutionId, Arc<ActiveJob>>>,
    pub(super) cancels: Mutex<CancelLedger>,
    pub(super) statuses: Mutex<LruCache<ExecutionId, ExecutionStatus>>,
    pub(super) metrics: RwLock<ExecutionMetrics>,
    pub(super) shutting_down: AtomicBool,
}

impl ManagerInner {
    pub(super) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(super) fn active_job(&self, id: &str) -> Option<Arc<ActiveJob>> {
        self.active
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// Flag a registered job as cancelled. The flag is set under the map's
    /// read lock, so it is visible to the worker once it unregisters.
    pub(super) fn cancel_active(&self, id: &str) -> bool {
        match self.active.read().unwrap_or_else(|p| p.into_inner()).get(id) {
            Some(job) => {
                job.cancel();
                true
            }
            None => false,
        }
    }

    pub(super) fn register_active(&self, id: &str, job: Arc<ActiveJob>) {
        self.active
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.to_string(), job);
    }

    pub(super) fn unregister_active(&self, id: &str) {
        self.active
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
    }

    fn cancel_ledger(&self) -> std::sync::MutexGuard<'_, CancelLedger> {
        self.cancels.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(super) fn take_pending_cancel(&self, id: &str) -> bool {
        self.cancel_ledger().pending.remove(id)
    }

    /// Record a cancel for a job between the queue and a worker. Returns
    /// false while the job's attempt is being settled.
    pub(super) fn add_pending_cancel(&self, id: &str) -> bool {
        let mut ledger = self.cancel_ledger();
        if ledger.settling.contains(id) {
            return false;
        }
        ledger.pending.insert(id.to_string());
        true
    }

    /// Close the attempt to new cancels. Returns whether one was pending.
    pub(super) fn begin_settle(&self, id: &str) -> bool {
        let mut ledger = self.cancel_ledger();
        ledger.settling.insert(id.to_string());
        ledger.pending.remove(id)
    }

    pub(super) fn end_settle(&self, id: &str) {
        self.cancel_ledger().settling.remove(id);
    }

    /// Record a status. Terminal statuses are never overwritten.
    pub(super) fn set_status(&self, id: &str, status: ExecutionStatus) {
        let mut statuses = self.statuses.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(current) = statuses.peek(id) {
            if current.is_terminal() {
                debug!(execution_id = id, current = %current, ignored = %status, "Status already final");
                return;
            }
        }
        statuses.put(id.to_string(), status);
    }

    pub(super) fn status_of(&self, id: &str) -> Option<ExecutionStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .copied()
    }

    pub(super) fn publish_progress(&self, progress: ExecutionProgress) {
        self.events.publish(SchedulerEvent::ProgressUpdated(progress));
    }
}

/// Resource-aware scheduler for test executions.
///
/// Requests are admitted against the [`ResourceManager`], stored in a
/// priority [`JobQueue`], and run by a pool of
/// `max_concurrent_jobs` workers once [`start`](Self::start) is called.
pub struct TestQueueManager {
    pub(super) inner: Arc<ManagerInner>,
    pub(super) runtime: Mutex<Option<Runtime>>,
}

impl TestQueueManager {
    pub fn builder(llm: Arc<dyn LlmProvider>, store: Arc<dyn TestStore>) -> TestQueueManagerBuilder {
        TestQueueManagerBuilder::new(llm, store)
    }

    /// Builder seeded with the scheduler, queue and resource sections of `config`.
    pub fn from_config(
        config: &Config,
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn TestStore>,
    ) -> TestQueueManagerBuilder {
        TestQueueManagerBuilder::new(llm, store)
            .settings(config.scheduler.clone())
            .queue_config(config.queue.clone())
            .resource_limits(config.resources.clone())
    }

    /// Execution config applied when a request has no overrides.
    pub fn default_execution_config(&self) -> &ExecutionConfig {
        &self.inner.defaults
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.inner.resources
    }

    pub fn cache(&self) -> &TestCaseCache {
        &self.inner.cache
    }

    /// Snapshot of the execution metrics.
    pub fn metrics(&self) -> ExecutionMetrics {
        self.inner
            .metrics
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.runtime
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }
}

impl Drop for TestQueueManager {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = runtime.shutdown.send(true);
        }
    }
}

/// Assembles a [`TestQueueManager`]. Anything not supplied gets an
/// in-process default: a [`MemoryJobQueue`], a host-sampling
/// [`ResourceManager`] and the [`BuiltinValidator`].
pub struct TestQueueManagerBuilder {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn TestStore>,
    settings: SchedulerConfig,
    queue_config: QueueConfig,
    limits: ResourceLimits,
    resources: Option<Arc<ResourceManager>>,
    queue: Option<Arc<dyn JobQueue>>,
    validator: Option<Arc<dyn AssertionValidator>>,
}

impl TestQueueManagerBuilder {
    fn new(llm: Arc<dyn LlmProvider>, store: Arc<dyn TestStore>) -> Self {
        Self {
            llm,
            store,
            settings: SchedulerConfig::default(),
            queue_config: QueueConfig::default(),
            limits: ResourceLimits::default(),
            resources: None,
            queue: None,
            validator: None,
        }
    }

    pub fn settings(mut self, settings: SchedulerConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn queue_config(mut self, queue_config: QueueConfig) -> Self {
        self.queue_config = queue_config;
        self
    }

    /// Limits for the default resource manager. Ignored when
    /// [`resources`](Self::resources) is supplied.
    pub fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn resources(mut self, resources: Arc<ResourceManager>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn AssertionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn build(self) -> TestQueueManager {
        let settings = self.settings;
        let defaults = ExecutionConfig {
            max_concurrent_tests: settings.resolved_default_concurrent_tests(),
            timeout_per_test_ms: settings.default_timeout_per_test_ms,
            ..ExecutionConfig::default()
        };
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(MemoryJobQueue::new(self.queue_config.clone())));
        let resources = self
            .resources
            .unwrap_or_else(|| Arc::new(ResourceManager::new(self.limits)));
        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(BuiltinValidator));
        let history = NonZeroUsize::new(settings.status_history).unwrap_or(NonZeroUsize::MIN);

        info!(
            llm = self.llm.name(),
            workers = settings.resolved_max_concurrent_jobs(),
            default_tests = defaults.max_concurrent_tests,
            "Test queue manager configured"
        );

        TestQueueManager {
            inner: Arc::new(ManagerInner {
                cache: TestCaseCache::new(
                    settings.test_case_cache_capacity,
                    settings.test_case_cache_ttl(),
                ),
                settings,
                queue_config: self.queue_config,
                defaults,
                resources,
                queue,
                llm: self.llm,
                store: self.store,
                validator,
                renderer: PromptRenderer::new(),
                events: EventBus::default(),
                active: RwLock::new(HashMap::new()),
                cancels: Mutex::new(CancelLedger::default()),
                statuses: Mutex::new(LruCache::new(history)),
                metrics: RwLock::new(ExecutionMetrics::default()),
                shutting_down: AtomicBool::new(false),
            }),
            runtime: Mutex::new(None),
        }
    }
}
