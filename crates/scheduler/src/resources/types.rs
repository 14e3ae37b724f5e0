use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promptbench_core::{ExecutionConfig, PriorityBucket};
use serde::{Deserialize, Serialize};

/// What a job asks the resource manager for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub concurrent_tests: usize,
    pub priority: PriorityBucket,
}

impl Default for ResourceRequirement {
    fn default() -> Self {
        Self {
            cpu_percent: 20.0,
            memory_mb: 512.0,
            concurrent_tests: 1,
            priority: PriorityBucket::Medium,
        }
    }
}

impl ResourceRequirement {
    /// Requirement declared by a job's config, bucketed by its priority.
    pub fn for_job(config: &ExecutionConfig, priority: i32) -> Self {
        Self {
            cpu_percent: config.resource_limits.cpu_percent,
            memory_mb: config.resource_limits.memory_mb,
            concurrent_tests: config.max_concurrent_tests,
            priority: PriorityBucket::from_priority(priority),
        }
    }

    /// Override the bucket. [`PriorityBucket::Critical`] is only reachable
    /// this way.
    pub fn with_bucket(mut self, bucket: PriorityBucket) -> Self {
        self.priority = bucket;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.priority == PriorityBucket::Critical
    }
}

/// A point-in-time view of host usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub memory_total_mb: f64,
    /// Reservations currently held in the ledger.
    pub active_tasks: usize,
    pub load_average: f64,
    pub timestamp: DateTime<Utc>,
}

impl Default for ResourceUsage {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_mb: 0.0,
            memory_total_mb: 0.0,
            active_tasks: 0,
            load_average: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// Sum of every outstanding reservation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReservedTotals {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub concurrent_tests: usize,
    pub tasks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdKind {
    Cpu,
    Memory,
}

impl fmt::Display for ThresholdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdKind::Cpu => write!(f, "cpu"),
            ThresholdKind::Memory => write!(f, "memory"),
        }
    }
}

/// Events published by the resource monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResourceEvent {
    ResourcesUpdated(ResourceUsage),
    SystemStress(ResourceUsage),
    EmergencyThreshold {
        kind: ThresholdKind,
        usage: ResourceUsage,
    },
}

/// Answers whether a requirement fits right now.
#[async_trait]
pub trait CapacityCheck: Send + Sync {
    async fn has_capacity(&self, requirement: &ResourceRequirement) -> bool;
}
