//! Bounded object pools
//!
//! A pool hands out at most `capacity` instances. Idle instances sit in a
//! channel; once the cap is reached, [`BufferPool::acquire`] blocks until
//! one is released, logging periodically while it waits.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// An object that can be cleared and handed out again
pub trait Poolable: Send + 'static {
    /// Drop content while keeping allocated capacity
    fn reset(&mut self);
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub created: usize,
    pub idle: usize,
}

/// Fixed-capacity pool of reusable objects
pub struct BufferPool<T: Poolable> {
    name: &'static str,
    idle_tx: Sender<T>,
    idle_rx: Receiver<T>,
    created: AtomicUsize,
    capacity: usize,
    wait_log_interval: Duration,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Poolable> BufferPool<T> {
    /// Create a pool of at most `capacity` objects built by `factory`
    pub fn new(
        name: &'static str,
        capacity: usize,
        wait_log_interval: Duration,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        let capacity = capacity.max(1);
        let (idle_tx, idle_rx) = bounded(capacity);
        Self {
            name,
            idle_tx,
            idle_rx,
            created: AtomicUsize::new(0),
            capacity,
            wait_log_interval,
            factory: Box::new(factory),
        }
    }

    /// Take an idle object, create one under the cap, or wait for a release
    pub fn acquire(&self) -> T {
        if let Some(item) = self.try_acquire() {
            return item;
        }

        let started = Instant::now();
        loop {
            match self.idle_rx.recv_timeout(self.wait_log_interval) {
                Ok(item) => {
                    debug!(
                        "Got a {} after waiting {}ms",
                        self.name,
                        started.elapsed().as_millis()
                    );
                    return item;
                }
                Err(RecvTimeoutError::Timeout) => {
                    // An instance may have been forgotten meanwhile
                    if let Some(item) = self.try_allocate() {
                        return item;
                    }
                    warn!(
                        "has waited for a {} for {}ms",
                        self.name,
                        started.elapsed().as_millis()
                    );
                }
                // The pool holds both ends, so this cannot happen while `self` lives
                Err(RecvTimeoutError::Disconnected) => return (self.factory)(),
            }
        }
    }

    /// Take an idle object or create one under the cap, without blocking
    pub fn try_acquire(&self) -> Option<T> {
        match self.idle_rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => self.try_allocate(),
        }
    }

    /// Like [`Self::acquire`] but gives up after `timeout`
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<T> {
        if let Some(item) = self.try_acquire() {
            return Some(item);
        }
        match self.idle_rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(_) => self.try_allocate(),
        }
    }

    /// Reset an object and make it available again
    pub fn release(&self, mut item: T) {
        item.reset();
        if self.idle_tx.try_send(item).is_err() {
            // More releases than acquisitions; drop the extra instance
            self.forget();
        }
    }

    /// Account for an acquired object that was dropped instead of released
    pub fn forget(&self) {
        let _ = self
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            created: self.created.load(Ordering::Acquire),
            idle: self.idle_rx.len(),
        }
    }

    fn try_allocate(&self) -> Option<T> {
        let reserved = self
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok();
        reserved.then(|| (self.factory)())
    }
}
