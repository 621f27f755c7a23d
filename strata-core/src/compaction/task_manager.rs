//! Compaction worker pool with a global in-flight budget

use super::CompactionTask;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

struct TaskCounter {
    running: Mutex<usize>,
    idle: Condvar,
}

/// One slot of the compaction budget; returned when dropped
pub struct TaskPermit {
    counter: Arc<TaskCounter>,
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        let mut running = self.counter.running.lock();
        *running = running.saturating_sub(1);
        self.counter.idle.notify_all();
    }
}

enum Job {
    Run(CompactionTask, TaskPermit),
    Shutdown,
}

/// Counters of a [`CompactionTaskManager`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
}

struct Shared {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Runs compaction tasks on `concurrent_compaction_thread` workers. At
/// most that many tasks are admitted at once, across all partitions.
pub struct CompactionTaskManager {
    tx: Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counter: Arc<TaskCounter>,
    limit: usize,
    shared: Arc<Shared>,
    shutdown: AtomicBool,
}

impl CompactionTaskManager {
    pub fn new(threads: usize) -> Self {
        let limit = threads.max(1);
        let (tx, rx) = unbounded();
        let shared = Arc::new(Shared {
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(limit);
        for i in 0..limit {
            let rx: Receiver<Job> = rx.clone();
            let shared = Arc::clone(&shared);
            match thread::Builder::new()
                .name(format!("compaction-{}", i))
                .spawn(move || worker_loop(rx, shared))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => error!("Failed to start compaction worker: {}", e),
            }
        }

        Self {
            tx,
            workers: Mutex::new(workers),
            counter: Arc::new(TaskCounter {
                running: Mutex::new(0),
                idle: Condvar::new(),
            }),
            limit,
            shared,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Reserve a slot of the budget, if one is free
    pub fn try_reserve(&self) -> Option<TaskPermit> {
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        let mut running = self.counter.running.lock();
        if *running >= self.limit {
            return None;
        }
        *running += 1;
        Some(TaskPermit {
            counter: Arc::clone(&self.counter),
        })
    }

    /// Queue `task`; its permit is released when the task finishes
    pub fn submit(&self, task: CompactionTask, permit: TaskPermit) -> bool {
        info!("Submit {}", task.description());
        if let Err(e) = self.tx.send(Job::Run(task, permit)) {
            if let Job::Run(task, _) = e.into_inner() {
                task.abort();
            }
            return false;
        }
        true
    }

    pub fn running(&self) -> usize {
        *self.counter.running.lock()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn stats(&self) -> CompactionStats {
        CompactionStats {
            running: self.running(),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Block until no task is admitted; false if `timeout` passed first
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut running = self.counter.running.lock();
        while *running > 0 {
            if self.counter.idle.wait_until(&mut running, deadline).timed_out() {
                return *running == 0;
            }
        }
        true
    }

    /// Let queued tasks finish, then stop the workers
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        if workers.is_empty() {
            return;
        }
        self.shutdown.store(true, Ordering::Release);
        for _ in 0..workers.len() {
            let _ = self.tx.send(Job::Shutdown);
        }
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!("A compaction worker panicked");
            }
        }
        info!("Compaction task manager stopped");
    }
}

impl Drop for CompactionTaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<Job>, shared: Arc<Shared>) {
    while let Ok(job) = rx.recv() {
        let (task, permit) = match job {
            Job::Run(task, permit) => (task, permit),
            Job::Shutdown => break,
        };
        let description = task.description();
        let started = Instant::now();
        match task.run() {
            Ok(()) => {
                shared.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    "{} finished in {}ms",
                    description,
                    started.elapsed().as_millis()
                );
            }
            Err(e) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                error!("{} failed: {}", description, e);
            }
        }
        drop(permit);
    }
    debug!("Compaction worker exits");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_limits_permits() {
        let manager = CompactionTaskManager::new(2);
        let a = manager.try_reserve().unwrap();
        let _b = manager.try_reserve().unwrap();
        assert!(manager.try_reserve().is_none());
        assert_eq!(manager.running(), 2);

        drop(a);
        assert_eq!(manager.running(), 1);
        assert!(manager.try_reserve().is_some());
    }

    #[test]
    fn test_wait_until_idle() {
        let manager = Arc::new(CompactionTaskManager::new(1));
        let permit = manager.try_reserve().unwrap();
        assert!(!manager.wait_until_idle(Duration::from_millis(20)));

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(permit);
        });
        assert!(manager.wait_until_idle(Duration::from_secs(5)));
        releaser.join().unwrap();

        manager.shutdown();
        assert!(manager.try_reserve().is_none());
    }
}
