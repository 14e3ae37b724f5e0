//! Counting semaphore with strict FIFO hand-off.
//!
//! Unlike `tokio::sync::Semaphore`, a permit holder can observe a second
//! release of the same permit as an error instead of silently inflating the
//! count, and a released permit passes directly to the oldest live waiter.

mod resource_aware;

pub use resource_aware::ResourceAwareSemaphore;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, trace};

/// A permit was released more than once.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Semaphore permit already released")]
pub struct ReleaseError;

struct State {
    held: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

struct Inner {
    max_permits: usize,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return one permit: hand it to the oldest waiter still listening, or
    /// put it back in the pool.
    fn release_one(&self) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                trace!(held = state.held, "Permit handed to waiter");
                return;
            }
        }
        state.held = state.held.saturating_sub(1);
    }
}

/// FIFO counting semaphore. Cloning shares the same permit pool.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

impl Semaphore {
    /// A zero-sized pool is bumped to one permit.
    pub fn new(max_permits: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_permits: max_permits.max(1),
                state: Mutex::new(State {
                    held: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Wait for a permit. Waiters are served in arrival order.
    ///
    /// Dropping the returned future before it resolves gives up the place in
    /// line; a permit already handed over is returned to the pool.
    pub async fn acquire(&self) -> Permit {
        loop {
            let rx = {
                let mut state = self.inner.lock();
                if state.held < self.inner.max_permits {
                    state.held += 1;
                    return Permit::new(Arc::clone(&self.inner));
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };

            let mut pending = PendingAcquire {
                rx,
                inner: Arc::clone(&self.inner),
                granted: false,
            };
            if (&mut pending.rx).await.is_ok() {
                pending.granted = true;
                return Permit::new(Arc::clone(&self.inner));
            }
        }
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.inner.lock();
        if state.held < self.inner.max_permits {
            state.held += 1;
            Some(Permit::new(Arc::clone(&self.inner)))
        } else {
            None
        }
    }

    pub fn max_permits(&self) -> usize {
        self.inner.max_permits
    }

    /// Permits currently held, including ones in transit to a waiter.
    pub fn held_count(&self) -> usize {
        self.inner.lock().held
    }

    pub fn available_count(&self) -> usize {
        self.inner.max_permits.saturating_sub(self.held_count())
    }

    /// Callers blocked in [`acquire`](Self::acquire).
    pub fn waiting_count(&self) -> usize {
        self.inner
            .lock()
            .waiters
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Semaphore")
            .field("max_permits", &self.inner.max_permits)
            .field("held", &state.held)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

struct PendingAcquire {
    rx: oneshot::Receiver<()>,
    inner: Arc<Inner>,
    granted: bool,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.inner.release_one();
        }
    }
}

/// One unit of the semaphore's capacity. Released on drop if not released
/// explicitly.
pub struct Permit {
    inner: Arc<Inner>,
    released: AtomicBool,
}

impl Permit {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            released: AtomicBool::new(false),
        }
    }

    /// Give the permit back. Only the first call has an effect.
    pub fn release(&self) -> Result<(), ReleaseError> {
        if self.released.swap(true, Ordering::AcqRel) {
            error!("Attempted to release a semaphore permit twice");
            return Err(ReleaseError);
        }
        self.inner.release_one();
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !*self.released.get_mut() {
            self.inner.release_one();
        }
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("released", &self.is_released())
            .finish()
    }
}
