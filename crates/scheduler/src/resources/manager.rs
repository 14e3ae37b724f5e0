use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use async_trait::async_trait;
use chrono::Utc;
use promptbench_core::config::ResourceLimits;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::sampler::{HostSampler, UsageSampler};
use super::types::{
    CapacityCheck, ReservedTotals, ResourceEvent, ResourceRequirement, ResourceUsage,
    ThresholdKind,
};
use crate::error::SchedulerError;
use crate::events::EventBus;

/// CPU percent a single additional test is assumed to cost.
const CPU_PER_TEST: f64 = 15.0;
/// Memory a single additional test is assumed to cost.
const MEMORY_MB_PER_TEST: f64 = 100.0;
/// Fraction of a limit beyond which the host counts as stressed.
const STRESS_RATIO: f64 = 0.8;

struct Monitor {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Tracks host usage plus outstanding reservations and decides whether new
/// work fits.
///
/// Reservations are keyed by task id. Projected usage for a request is the
/// sampled usage plus every reservation plus the request itself.
pub struct ResourceManager {
    limits: ResourceLimits,
    sampler: Mutex<Box<dyn UsageSampler>>,
    ledger: Mutex<HashMap<String, ResourceRequirement>>,
    latest: RwLock<ResourceUsage>,
    events: EventBus<ResourceEvent>,
    monitor: Mutex<Option<Monitor>>,
    cores: usize,
}

impl ResourceManager {
    /// Manager sampling the real host.
    pub fn new(limits: ResourceLimits) -> Self {
        Self::with_sampler(limits, Box::new(HostSampler::new()))
    }

    pub fn with_sampler(limits: ResourceLimits, sampler: Box<dyn UsageSampler>) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            limits,
            sampler: Mutex::new(sampler),
            ledger: Mutex::new(HashMap::new()),
            latest: RwLock::new(ResourceUsage::default()),
            events: EventBus::default(),
            monitor: Mutex::new(None),
            cores,
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn ledger(&self) -> MutexGuard<'_, HashMap<String, ResourceRequirement>> {
        self.ledger.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take a fresh sample and remember it as the latest usage.
    pub fn refresh_usage(&self) -> ResourceUsage {
        let sample = self
            .sampler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .sample();
        let usage = ResourceUsage {
            cpu_percent: sample.cpu_percent,
            memory_mb: sample.memory_mb,
            memory_total_mb: sample.memory_total_mb,
            active_tasks: self.ledger().len(),
            load_average: sample.load_average,
            timestamp: Utc::now(),
        };
        *self.latest.write().unwrap_or_else(|p| p.into_inner()) = usage.clone();
        usage
    }

    /// The most recent sample without touching the host.
    pub fn current_usage(&self) -> ResourceUsage {
        self.latest
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn reserved_totals(&self) -> ReservedTotals {
        totals(self.ledger().iter().map(|(_, r)| r))
    }

    pub fn reservation(&self, task_id: &str) -> Option<ResourceRequirement> {
        self.ledger().get(task_id).cloned()
    }

    /// Check whether `requirement` would fit right now. Reserves nothing.
    pub fn check_resource_availability(&self, requirement: &ResourceRequirement) -> bool {
        match self.ensure_available(requirement) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, priority = %requirement.priority, "Capacity check failed");
                false
            }
        }
    }

    /// Like [`check_resource_availability`](Self::check_resource_availability)
    /// but reports which limit would be exceeded.
    pub fn ensure_available(&self, requirement: &ResourceRequirement) -> Result<(), SchedulerError> {
        let usage = self.refresh_usage();
        let reserved = self.reserved_totals();
        self.evaluate(&usage, &reserved, requirement)
            .map_err(SchedulerError::Admission)
    }

    /// Atomically check and record a reservation for `task_id`. A second
    /// reservation under the same id replaces the first.
    pub fn reserve_resources(
        &self,
        task_id: &str,
        requirement: &ResourceRequirement,
    ) -> Result<(), SchedulerError> {
        let usage = self.refresh_usage();
        let mut ledger = self.ledger();
        let reserved = totals(
            ledger
                .iter()
                .filter(|(id, _)| id.as_str() != task_id)
                .map(|(_, r)| r),
        );
        self.evaluate(&usage, &reserved, requirement)
            .map_err(SchedulerError::Admission)?;
        ledger.insert(task_id.to_string(), requirement.clone());
        info!(
            task_id,
            cpu = requirement.cpu_percent,
            memory_mb = requirement.memory_mb,
            tests = requirement.concurrent_tests,
            priority = %requirement.priority,
            reservations = ledger.len(),
            "Resources reserved"
        );
        Ok(())
    }

    /// Drop the reservation for `task_id`. Returns false if there was none.
    pub fn release_resources(&self, task_id: &str) -> bool {
        let mut ledger = self.ledger();
        match ledger.remove(task_id) {
            Some(_) => {
                info!(task_id, reservations = ledger.len(), "Resources released");
                true
            }
            None => false,
        }
    }

    /// Suggested concurrency given the headroom left after sampled usage and
    /// reservations. Zero once any budget is spent; callers sizing a
    /// [`Semaphore`](crate::semaphore::Semaphore) clamp it themselves.
    pub fn get_optimal_concurrency(&self) -> usize {
        let usage = self.refresh_usage();
        let reserved = self.reserved_totals();
        let cpu_left = self.limits.max_cpu_percent - usage.cpu_percent - reserved.cpu_percent;
        let memory_left = self.limits.max_memory_mb - usage.memory_mb - reserved.memory_mb;
        let tests_left = self
            .limits
            .max_concurrent_tests
            .saturating_sub(reserved.concurrent_tests);

        let by_cpu = (cpu_left / CPU_PER_TEST).floor().max(0.0) as usize;
        let by_memory = (memory_left / MEMORY_MB_PER_TEST).floor().max(0.0) as usize;
        by_cpu.min(by_memory).min(tests_left)
    }

    /// True above 80% of the CPU or memory limit, or when the load average
    /// exceeds 80% of the core count.
    pub fn is_system_under_stress(&self) -> bool {
        self.is_stressed(&self.refresh_usage())
    }

    fn is_stressed(&self, usage: &ResourceUsage) -> bool {
        usage.cpu_percent > self.limits.max_cpu_percent * STRESS_RATIO
            || usage.memory_mb > self.limits.max_memory_mb * STRESS_RATIO
            || usage.load_average > self.cores as f64 * STRESS_RATIO
    }

    fn evaluate(
        &self,
        usage: &ResourceUsage,
        reserved: &ReservedTotals,
        requirement: &ResourceRequirement,
    ) -> Result<(), String> {
        let (cpu_limit, memory_limit) = if requirement.is_critical() {
            (
                self.limits.emergency_cpu_threshold,
                self.limits.emergency_memory_mb,
            )
        } else {
            (self.limits.max_cpu_percent, self.limits.max_memory_mb)
        };

        let cpu = usage.cpu_percent + reserved.cpu_percent + requirement.cpu_percent;
        if cpu > cpu_limit {
            return Err(format!(
                "projected CPU {:.1}% exceeds limit {:.1}%",
                cpu, cpu_limit
            ));
        }

        let memory = usage.memory_mb + reserved.memory_mb + requirement.memory_mb;
        if memory > memory_limit {
            return Err(format!(
                "projected memory {:.0}MB exceeds limit {:.0}MB",
                memory, memory_limit
            ));
        }

        let tests = reserved.concurrent_tests + requirement.concurrent_tests;
        if tests > self.limits.max_concurrent_tests {
            return Err(format!(
                "projected concurrent tests {} exceeds limit {}",
                tests, self.limits.max_concurrent_tests
            ));
        }

        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    /// Sample the host every `monitor_interval` and publish updates, stress
    /// and emergency events. Restarting replaces the running monitor.
    pub fn start_monitoring(self: &Arc<Self>) {
        self.stop_monitoring();

        let stop = Arc::new(Notify::new());
        let signal = Arc::clone(&stop);
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.limits.monitor_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.observe();
                    }
                }
            }
            debug!("Resource monitor stopped");
        });

        *self.monitor.lock().unwrap_or_else(|p| p.into_inner()) = Some(Monitor { stop, handle });
        info!(interval_ms = interval.as_millis() as u64, "Resource monitor started");
    }

    fn observe(&self) {
        let usage = self.refresh_usage();
        self.events.publish(ResourceEvent::ResourcesUpdated(usage.clone()));

        if self.is_stressed(&usage) {
            warn!(
                cpu = usage.cpu_percent,
                memory_mb = usage.memory_mb,
                load = usage.load_average,
                "System under stress"
            );
            self.events.publish(ResourceEvent::SystemStress(usage.clone()));
        }
        if usage.cpu_percent > self.limits.emergency_cpu_threshold {
            warn!(cpu = usage.cpu_percent, "Emergency CPU threshold exceeded");
            self.events.publish(ResourceEvent::EmergencyThreshold {
                kind: ThresholdKind::Cpu,
                usage: usage.clone(),
            });
        }
        if usage.memory_mb > self.limits.emergency_memory_mb {
            warn!(memory_mb = usage.memory_mb, "Emergency memory threshold exceeded");
            self.events.publish(ResourceEvent::EmergencyThreshold {
                kind: ThresholdKind::Memory,
                usage,
            });
        }
    }

    pub fn stop_monitoring(&self) {
        if let Some(monitor) = self.monitor.lock().unwrap_or_else(|p| p.into_inner()).take() {
            monitor.stop.notify_one();
            monitor.handle.abort();
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Stop the monitor and close the event stream.
    pub fn destroy(&self) {
        self.stop_monitoring();
        self.events.close();
        info!("Resource manager destroyed");
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

#[async_trait]
impl CapacityCheck for ResourceManager {
    async fn has_capacity(&self, requirement: &ResourceRequirement) -> bool {
        self.check_resource_availability(requirement)
    }
}

fn totals<'a>(reservations: impl Iterator<Item = &'a ResourceRequirement>) -> ReservedTotals {
    reservations.fold(ReservedTotals::default(), |mut acc, r| {
        acc.cpu_percent += r.cpu_percent;
        acc.memory_mb += r.memory_mb;
        acc.concurrent_tests += r.concurrent_tests;
        acc.tasks += 1;
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{HostSample, StaticSampler};
    use promptbench_core::PriorityBucket;
    use std::time::Duration;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            max_cpu_percent: 80.0,
            max_memory_mb: 2048.0,
            max_concurrent_tests: 20,
            emergency_cpu_threshold: 95.0,
            emergency_memory_mb: 3072.0,
            monitor_interval_ms: 10,
        }
    }

    fn manager_with(sample: HostSample) -> (ResourceManager, StaticSampler) {
        let sampler = StaticSampler::new(sample);
        let manager = ResourceManager::with_sampler(limits(), Box::new(sampler.clone()));
        (manager, sampler)
    }

    fn idle() -> (ResourceManager, StaticSampler) {
        manager_with(HostSample::default())
    }

    fn req(cpu: f64, memory: f64, tests: usize) -> ResourceRequirement {
        ResourceRequirement {
            cpu_percent: cpu,
            memory_mb: memory,
            concurrent_tests: tests,
            priority: PriorityBucket::Medium,
        }
    }

    #[test]
    fn fits_within_limits() {
        let (manager, _) = idle();
        assert!(manager.check_resource_availability(&req(20.0, 512.0, 4)));
    }

    #[test]
    fn sampled_usage_counts_against_limits() {
        let (manager, _) = manager_with(HostSample {
            cpu_percent: 70.0,
            ..Default::default()
        });
        assert!(!manager.check_resource_availability(&req(20.0, 0.0, 1)));
        assert!(manager.check_resource_availability(&req(10.0, 0.0, 1)));
    }

    #[test]
    fn reservations_accumulate() {
        let (manager, _) = idle();
        let r = req(30.0, 100.0, 1);
        manager.reserve_resources("a", &r).unwrap();
        manager.reserve_resources("b", &r).unwrap();
        let err = manager.reserve_resources("c", &r).unwrap_err();
        assert!(matches!(err, SchedulerError::Admission(_)));
        assert!(manager.reservation("c").is_none());

        let totals = manager.reserved_totals();
        assert_eq!(totals.tasks, 2);
        assert_eq!(totals.cpu_percent, 60.0);
    }

    #[test]
    fn concurrent_test_limit_is_enforced() {
        let (manager, _) = idle();
        manager.reserve_resources("a", &req(1.0, 1.0, 15)).unwrap();
        assert!(!manager.check_resource_availability(&req(1.0, 1.0, 6)));
        assert!(manager.check_resource_availability(&req(1.0, 1.0, 5)));
    }

    #[test]
    fn re_reserving_replaces() {
        let (manager, _) = idle();
        manager.reserve_resources("a", &req(50.0, 0.0, 1)).unwrap();
        manager.reserve_resources("a", &req(60.0, 0.0, 1)).unwrap();
        assert_eq!(manager.reserved_totals().cpu_percent, 60.0);
    }

    #[test]
    fn release_is_idempotent() {
        let (manager, _) = idle();
        manager.reserve_resources("a", &req(10.0, 10.0, 1)).unwrap();
        assert!(manager.release_resources("a"));
        assert!(!manager.release_resources("a"));
        assert!(!manager.release_resources("never"));
        assert_eq!(manager.reserved_totals(), ReservedTotals::default());
    }

    #[test]
    fn critical_uses_emergency_ceiling() {
        let (manager, _) = manager_with(HostSample {
            cpu_percent: 70.0,
            memory_mb: 2000.0,
            ..Default::default()
        });
        let normal = req(20.0, 100.0, 1);
        assert!(!manager.check_resource_availability(&normal));
        let critical = normal.with_bucket(PriorityBucket::Critical);
        assert!(manager.check_resource_availability(&critical));

        let too_much = req(30.0, 100.0, 1).with_bucket(PriorityBucket::Critical);
        assert!(!manager.check_resource_availability(&too_much));
    }

    #[test]
    fn optimal_concurrency_tracks_headroom() {
        let (manager, sampler) = idle();
        // 80 / 15 = 5 by CPU; 2048 / 100 = 20 by memory; 20 by tests.
        assert_eq!(manager.get_optimal_concurrency(), 5);

        sampler.set(HostSample {
            cpu_percent: 50.0,
            ..Default::default()
        });
        assert_eq!(manager.get_optimal_concurrency(), 2);

        sampler.set(HostSample {
            cpu_percent: 79.0,
            ..Default::default()
        });
        assert_eq!(manager.get_optimal_concurrency(), 0);

        sampler.set(HostSample {
            cpu_percent: 200.0,
            memory_mb: 9000.0,
            ..Default::default()
        });
        assert_eq!(manager.get_optimal_concurrency(), 0);
    }

    #[test]
    fn reservations_can_exhaust_optimal_concurrency() {
        let (manager, _) = idle();
        manager.reserve_resources("t1", &req(70.0, 256.0, 2)).unwrap();
        assert_eq!(manager.get_optimal_concurrency(), 0);
        manager.release_resources("t1");
        assert_eq!(manager.get_optimal_concurrency(), 5);
    }

    #[test]
    fn stress_detection() {
        let (manager, sampler) = idle();
        assert!(!manager.is_system_under_stress());
        sampler.set(HostSample {
            cpu_percent: 65.0,
            ..Default::default()
        });
        assert!(manager.is_system_under_stress());
        sampler.set(HostSample {
            memory_mb: 1700.0,
            ..Default::default()
        });
        assert!(manager.is_system_under_stress());
    }

    #[test]
    fn usage_reports_active_tasks() {
        let (manager, _) = idle();
        manager.reserve_resources("a", &req(1.0, 1.0, 1)).unwrap();
        assert_eq!(manager.refresh_usage().active_tasks, 1);
        assert_eq!(manager.current_usage().active_tasks, 1);
    }

    #[tokio::test]
    async fn monitor_publishes_events() {
        let sampler = StaticSampler::new(HostSample {
            cpu_percent: 97.0,
            memory_mb: 100.0,
            ..Default::default()
        });
        let manager = Arc::new(ResourceManager::with_sampler(
            limits(),
            Box::new(sampler.clone()),
        ));
        let mut rx = manager.subscribe();
        manager.start_monitoring();
        assert!(manager.is_monitoring());

        let mut saw_update = false;
        let mut saw_stress = false;
        let mut saw_emergency = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !(saw_update && saw_stress && saw_emergency) {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("monitor events")
                .unwrap();
            match event {
                ResourceEvent::ResourcesUpdated(_) => saw_update = true,
                ResourceEvent::SystemStress(_) => saw_stress = true,
                ResourceEvent::EmergencyThreshold { kind, .. } => {
                    assert_eq!(kind, ThresholdKind::Cpu);
                    saw_emergency = true;
                }
            }
        }

        manager.destroy();
        assert!(!manager.is_monitoring());
        // Stream ends once the bus is closed and buffered events drain.
        loop {
            match rx.recv().await {
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
