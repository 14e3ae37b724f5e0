use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Permit, Semaphore};
use crate::error::SchedulerError;
use crate::resources::{CapacityCheck, ResourceRequirement};

struct Watch {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// A [`Semaphore`] that refuses new permits while the capacity check reports
/// the host as constrained.
///
/// Permits already handed out are never revoked; the check only gates new
/// acquisitions.
pub struct ResourceAwareSemaphore {
    semaphore: Semaphore,
    check: Arc<dyn CapacityCheck>,
    requirement: ResourceRequirement,
    watch: Mutex<Option<Watch>>,
}

impl ResourceAwareSemaphore {
    pub fn new(
        max_permits: usize,
        check: Arc<dyn CapacityCheck>,
        requirement: ResourceRequirement,
    ) -> Self {
        Self {
            semaphore: Semaphore::new(max_permits),
            check,
            requirement,
            watch: Mutex::new(None),
        }
    }

    /// Fail fast with [`SchedulerError::Admission`] when constrained,
    /// otherwise wait for a permit.
    pub async fn acquire(&self) -> Result<Permit, SchedulerError> {
        self.ensure_capacity().await?;
        Ok(self.semaphore.acquire().await)
    }

    pub async fn try_acquire(&self) -> Result<Option<Permit>, SchedulerError> {
        self.ensure_capacity().await?;
        Ok(self.semaphore.try_acquire())
    }

    async fn ensure_capacity(&self) -> Result<(), SchedulerError> {
        if self.check.has_capacity(&self.requirement).await {
            Ok(())
        } else {
            Err(SchedulerError::Admission(format!(
                "cannot acquire permit: host lacks capacity for {:.1}% CPU / {:.0}MB",
                self.requirement.cpu_percent, self.requirement.memory_mb
            )))
        }
    }

    pub fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }

    /// Periodically re-evaluate capacity and log while constrained.
    /// Replaces any watch already running.
    pub fn start_watch(&self, interval: Duration) {
        self.stop_watch();

        let stop = Arc::new(Notify::new());
        let check = Arc::clone(&self.check);
        let requirement = self.requirement.clone();
        let semaphore = self.semaphore.clone();
        let signal = Arc::clone(&stop);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = ticker.tick() => {
                        if check.has_capacity(&requirement).await {
                            debug!(held = semaphore.held_count(), "Semaphore capacity ok");
                        } else {
                            warn!(
                                held = semaphore.held_count(),
                                waiting = semaphore.waiting_count(),
                                "Semaphore constrained by host resources"
                            );
                        }
                    }
                }
            }
        });

        *self.lock_watch() = Some(Watch { stop, handle });
    }

    pub fn stop_watch(&self) {
        if let Some(watch) = self.lock_watch().take() {
            watch.stop.notify_one();
            watch.handle.abort();
        }
    }

    pub fn is_watching(&self) -> bool {
        self.lock_watch().is_some()
    }

    fn lock_watch(&self) -> std::sync::MutexGuard<'_, Option<Watch>> {
        self.watch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ResourceAwareSemaphore {
    fn drop(&mut self) {
        self.stop_watch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Toggle(AtomicBool);

    #[async_trait]
    impl CapacityCheck for Toggle {
        async fn has_capacity(&self, _requirement: &ResourceRequirement) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn refuses_when_constrained() {
        let check = Arc::new(Toggle(AtomicBool::new(false)));
        let sem = ResourceAwareSemaphore::new(2, check.clone(), ResourceRequirement::default());

        let err = sem.acquire().await.unwrap_err();
        assert!(matches!(err, SchedulerError::Admission(_)));
        assert_eq!(sem.semaphore().held_count(), 0);

        check.0.store(true, Ordering::SeqCst);
        let permit = sem.acquire().await.unwrap();
        assert_eq!(sem.semaphore().held_count(), 1);
        permit.release().unwrap();
    }

    #[tokio::test]
    async fn held_permits_survive_constraint() {
        let check = Arc::new(Toggle(AtomicBool::new(true)));
        let sem = ResourceAwareSemaphore::new(1, check.clone(), ResourceRequirement::default());
        let permit = sem.try_acquire().await.unwrap().unwrap();

        check.0.store(false, Ordering::SeqCst);
        assert!(sem.try_acquire().await.is_err());
        assert!(!permit.is_released());
        drop(permit);
        assert_eq!(sem.semaphore().held_count(), 0);
    }

    #[tokio::test]
    async fn watch_starts_and_stops() {
        let check = Arc::new(Toggle(AtomicBool::new(false)));
        let sem = ResourceAwareSemaphore::new(1, check, ResourceRequirement::default());
        sem.start_watch(Duration::from_millis(5));
        assert!(sem.is_watching());
        tokio::time::sleep(Duration::from_millis(20)).await;
        sem.stop_watch();
        assert!(!sem.is_watching());
    }
}
