//! Resource-aware parallel test execution.
//!
//! Execution requests are admitted against live resource budgets by the
//! [`ResourceManager`], queued by priority, and run by a small pool of job
//! workers. Inside a job, test cases fan out in batches through a FIFO-fair
//! [`Semaphore`] sized to the job's `max_concurrent_tests`.

pub mod assertions;
pub mod cache;
pub mod error;
pub mod events;
pub mod manager;
pub mod metrics;
pub mod resources;
pub mod semaphore;
pub mod store;
pub mod template;

pub use assertions::{AssertionValidator, BuiltinValidator};
pub use cache::TestCaseCache;
pub use error::SchedulerError;
pub use events::{EventBus, SchedulerEvent};
pub use manager::{TestQueueManager, TestQueueManagerBuilder};
pub use metrics::ExecutionMetrics;
pub use resources::{
    CapacityCheck, HostSample, HostSampler, ReservedTotals, ResourceEvent, ResourceManager,
    ResourceRequirement, ResourceUsage, StaticSampler, ThresholdKind, UsageSampler,
};
pub use semaphore::{Permit, ReleaseError, ResourceAwareSemaphore, Semaphore};
pub use store::{MemoryStore, StoreError, TestStore};
pub use template::PromptRenderer;
