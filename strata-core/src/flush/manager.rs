//! Flush scheduling
//!
//! Each open file is a [`FlushTarget`]. A target is queued at most once at
//! a time, guarded by its `managed` flag; after one of its MemTables is
//! flushed the target is re-submitted so its queue keeps draining.

use crate::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Something holding MemTables waiting to be flushed
pub trait FlushTarget: Send + Sync {
    /// Name used in logs
    fn name(&self) -> String;

    /// Number of MemTables waiting to be flushed
    fn flushing_count(&self) -> usize;

    /// Flush the oldest waiting MemTable
    fn flush_one(&self) -> Result<()>;

    /// Set while the target sits in the flush queue or is being flushed
    fn managed(&self) -> &AtomicBool;
}

enum FlushJob {
    Flush(Arc<dyn FlushTarget>),
    Shutdown,
}

/// Counters of a [`FlushManager`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub submitted: u64,
    pub flushed: u64,
    pub failed: u64,
}

struct Shared {
    tx: Sender<FlushJob>,
    reject_write: Arc<AtomicBool>,
    shutdown: AtomicBool,
    submitted: AtomicU64,
    flushed: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn submit(&self, target: Arc<dyn FlushTarget>) -> bool {
        if self.shutdown.load(Ordering::Acquire) || target.flushing_count() == 0 {
            return false;
        }
        if target
            .managed()
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        debug!("Submit {} for flushing", target.name());
        self.submitted.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(FlushJob::Flush(Arc::clone(&target))).is_err() {
            target.managed().store(false, Ordering::Release);
            return false;
        }
        true
    }
}

/// Fixed pool of flush worker threads
pub struct FlushManager {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FlushManager {
    /// Start `threads` workers. A failed flush raises `reject_write`.
    pub fn new(threads: usize, reject_write: Arc<AtomicBool>) -> Self {
        let (tx, rx) = unbounded();
        let shared = Arc::new(Shared {
            tx,
            reject_write,
            shutdown: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let workers = (0..threads.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("flush-{}", i))
                    .spawn(move || worker_loop(shared, rx))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!("Failed to start flush worker: {}", e);
                    None
                }
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queue `target` unless it is already queued or has nothing to flush
    pub fn submit(&self, target: Arc<dyn FlushTarget>) -> bool {
        self.shared.submit(target)
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            flushed: self.shared.flushed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Finish queued jobs, then stop the workers
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        if workers.is_empty() {
            return;
        }
        self.shared.shutdown.store(true, Ordering::Release);
        for _ in 0..workers.len() {
            let _ = self.shared.tx.send(FlushJob::Shutdown);
        }
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!("A flush worker panicked");
            }
        }
        info!("Flush manager stopped");
    }
}

impl Drop for FlushManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, rx: Receiver<FlushJob>) {
    while let Ok(job) = rx.recv() {
        let target = match job {
            FlushJob::Flush(target) => target,
            FlushJob::Shutdown => break,
        };

        match target.flush_one() {
            Ok(()) => {
                shared.flushed.fetch_add(1, Ordering::Relaxed);
                target.managed().store(false, Ordering::Release);
                shared.submit(target);
            }
            Err(e) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Flushing {} failed, rejecting further writes: {}",
                    target.name(),
                    e
                );
                shared.reject_write.store(true, Ordering::Release);
                target.managed().store(false, Ordering::Release);
            }
        }
    }
    debug!("Flush worker exits");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StrataError;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    struct Target {
        pending: AtomicUsize,
        flushed: AtomicUsize,
        managed: AtomicBool,
        fail: bool,
    }

    impl Target {
        fn new(pending: usize, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                pending: AtomicUsize::new(pending),
                flushed: AtomicUsize::new(0),
                managed: AtomicBool::new(false),
                fail,
            })
        }
    }

    impl FlushTarget for Target {
        fn name(&self) -> String {
            "target".into()
        }

        fn flushing_count(&self) -> usize {
            self.pending.load(Ordering::SeqCst)
        }

        fn flush_one(&self) -> Result<()> {
            if self.fail {
                return Err(StrataError::Flush("disk full".into()));
            }
            self.pending.fetch_sub(1, Ordering::SeqCst);
            self.flushed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn managed(&self) -> &AtomicBool {
            &self.managed
        }
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_resubmit_drains_queue() {
        let manager = FlushManager::new(2, Arc::new(AtomicBool::new(false)));
        let target = Target::new(3, false);
        assert!(manager.submit(target.clone()));
        // Second submit is a no-op while the first is queued or running
        manager.submit(target.clone());

        wait_for(|| target.flushed.load(Ordering::SeqCst) == 3);
        wait_for(|| !target.managed.load(Ordering::SeqCst));
        assert_eq!(manager.stats().flushed, 3);
        assert!(!manager.submit(target.clone()));
    }

    #[test]
    fn test_failure_rejects_writes() {
        let reject_write = Arc::new(AtomicBool::new(false));
        let manager = FlushManager::new(1, Arc::clone(&reject_write));
        let target = Target::new(1, true);
        assert!(manager.submit(target.clone()));

        wait_for(|| reject_write.load(Ordering::SeqCst));
        manager.shutdown();
        assert_eq!(manager.stats().failed, 1);
        assert_eq!(target.pending.load(Ordering::SeqCst), 1);
    }
}
