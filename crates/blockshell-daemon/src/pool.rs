//! Worker threads for the daemon.
//!
//! Client connections go to a fixed-size [`ThreadPool`] fed by a bounded
//! channel; load beyond the pool size queues up to the channel capacity and is
//! rejected after that. Commands run for as long as they like, so each gets a
//! thread of its own from a [`JobRunner`], which refuses new work once its
//! limit is reached instead of queueing it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::SyncSender;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use tracing::error;
use tracing::warn;

/// A unit of work for a [`JobRunner`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum JobRejected {
    #[error("{running} jobs already running")]
    AtCapacity { running: usize },
    #[error("failed to spawn job thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub struct ThreadPool<T: Send + 'static> {
    name: String,
    workers: Vec<thread::JoinHandle<()>>,
    sender: SyncSender<T>,
    active: Arc<AtomicUsize>,
}

impl<T: Send + 'static> ThreadPool<T> {
    /// Spawn `size` workers that pass every received item to `handler`.
    /// Workers stop once `shutdown` is set or the pool is dropped.
    pub fn new<F>(
        name: &str,
        size: usize,
        capacity: usize,
        shutdown: Arc<AtomicBool>,
        handler: F,
    ) -> std::io::Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel::<T>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let handler = Arc::new(handler);
        let active = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(size);

        for id in 0..size {
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&handler);
            let shutdown = Arc::clone(&shutdown);
            let active = Arc::clone(&active);
            let pool_name = name.to_string();

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, id))
                .spawn(move || loop {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }

                    let item = {
                        let lock = match receiver.lock() {
                            Ok(l) => l,
                            Err(e) => {
                                error!(pool = %pool_name, worker_id = id, error = %e, "Worker receiver lock poisoned");
                                break;
                            }
                        };
                        match lock.recv_timeout(Duration::from_millis(100)) {
                            Ok(item) => item,
                            Err(mpsc::RecvTimeoutError::Timeout) => continue,
                            Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        }
                    };

                    active.fetch_add(1, Ordering::Relaxed);
                    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(item)));
                    active.fetch_sub(1, Ordering::Relaxed);
                    if outcome.is_err() {
                        error!(pool = %pool_name, worker_id = id, "Worker task panicked");
                    }
                });

            match spawned {
                Ok(h) => workers.push(h),
                Err(e) => {
                    error!(pool = name, worker_id = id, error = %e, "Failed to spawn worker");
                }
            }
        }

        if workers.is_empty() {
            return Err(std::io::Error::other("Failed to spawn any worker threads"));
        }

        if workers.len() < size {
            warn!(
                pool = name,
                spawned = workers.len(),
                requested = size,
                "Only spawned partial worker threads"
            );
        }

        Ok(ThreadPool {
            name: name.to_string(),
            workers,
            sender,
            active,
        })
    }

    /// Queue an item. Hands it back when the queue is full or closed.
    pub fn execute(&self, item: T) -> Result<(), T> {
        self.sender.try_send(item).map_err(|e| match e {
            mpsc::TrySendError::Full(i) | mpsc::TrySendError::Disconnected(i) => i,
        })
    }

    /// Items currently being handled.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Close the queue and join workers that finish within `grace`. Workers
    /// still busy after that are left detached.
    pub fn shutdown(self, grace: Duration) {
        drop(self.sender);
        let deadline = Instant::now() + grace;
        let mut detached = 0;
        for worker in self.workers {
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                detached += 1;
            }
        }
        if detached > 0 {
            warn!(pool = %self.name, detached, "Workers still busy at shutdown");
        }
    }
}

/// Releases a [`JobRunner`] slot when the job's thread ends, panicking or not.
struct RunningSlot(Arc<AtomicUsize>);

impl Drop for RunningSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs each job on a dedicated thread, at most `limit` at a time.
#[derive(Clone)]
pub struct JobRunner {
    name: Arc<str>,
    limit: usize,
    running: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
}

impl JobRunner {
    pub fn new(name: &str, limit: usize) -> Self {
        Self {
            name: Arc::from(name),
            limit: limit.max(1),
            running: Arc::new(AtomicUsize::new(0)),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Start `job` now, or reject it when `limit` jobs are already running.
    pub fn spawn(&self, job: Job) -> Result<(), JobRejected> {
        let limit = self.limit;
        self.running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|running| JobRejected::AtCapacity { running })?;
        let slot = RunningSlot(Arc::clone(&self.running));

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = Arc::clone(&self.name);
        thread::Builder::new()
            .name(format!("{}-{}", self.name, id))
            .spawn(move || {
                let _slot = slot;
                if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!(pool = %name, job_id = id, "Job panicked");
                }
            })?;
        Ok(())
    }

    /// Wait up to `grace` for running jobs to finish. Returns how many are
    /// still running; their threads are left detached.
    pub fn wait_idle(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        while self.running() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let left = self.running();
        if left > 0 {
            warn!(pool = %self.name, running = left, "Jobs still running at shutdown");
        }
        left
    }
}
