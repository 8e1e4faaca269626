//! Bounded concurrency limiter — the primitive under event dispatch,
//! embedding calls, and replay.
//!
//! A counting semaphore with a FIFO wait queue. Released permits hand off
//! to the head of the queue; no preemption or priority.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of concurrent permits.
pub const DEFAULT_CAPACITY: usize = 10;

/// Bounded FIFO concurrency limiter.
#[derive(Clone)]
pub struct Limiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    active: Arc<AtomicUsize>,
    pending: Arc<AtomicUsize>,
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Limiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            capacity: capacity.max(1),
            active: Arc::new(AtomicUsize::new(0)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Acquire one permit, waiting FIFO behind earlier callers when the
    /// capacity is exhausted. The permit releases on drop.
    pub async fn acquire(&self) -> Permit {
        self.pending.fetch_add(1, Ordering::Relaxed);
        // The semaphore is owned by this limiter and never closed.
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("limiter semaphore closed");
        self.pending.fetch_sub(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        Permit {
            _permit: permit,
            active: Arc::clone(&self.active),
        }
    }

    /// Run one future under a permit.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        fut.await
    }

    /// Run `f` over every item with bounded concurrency, preserving input
    /// order in the output.
    pub async fn map<I, T, U, F, Fut>(&self, items: I, f: F) -> Vec<U>
    where
        I: IntoIterator<Item = T>,
        F: Fn(T) -> Fut,
        Fut: Future<Output = U>,
    {
        let futures: Vec<_> = items.into_iter().map(|item| self.run(f(item))).collect();
        futures::future::join_all(futures).await
    }

    /// Number of permits currently held.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Number of callers waiting for a permit.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// RAII handle for one held permit.
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}
