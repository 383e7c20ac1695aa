//! Worker threads that run one-shot jobs.
//!
//! Fence callbacks and request dispatch never run on the thread that
//! triggered them when a pool is in use. Jobs are boxed closures sent over a
//! crossbeam channel and picked up by whichever worker is free.

use crate::sync::lock;
use crossbeam_channel::{unbounded, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A job runs exactly once on some worker thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn increment(&self) {
        *lock(&self.count) += 1;
    }

    fn decrement(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Fixed-size pool of worker threads.
pub struct JobPool {
    name: String,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
}

impl JobPool {
    /// Spawn `threads` workers (at least one)
    pub fn new(name: &str, threads: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let pending = Arc::new(Pending::default());
        let mut workers = Vec::with_capacity(threads.max(1));

        for index in 0..threads.max(1) {
            let rx = rx.clone();
            let pending = Arc::clone(&pending);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || {
                    for job in rx.iter() {
                        job();
                        pending.decrement();
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => tracing::error!("Failed to spawn {} worker {}: {}", name, index, e),
            }
        }

        tracing::debug!("Job pool '{}' started with {} workers", name, workers.len());

        Self {
            name: name.to_string(),
            tx: Some(tx),
            workers,
            pending,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue `job`. The job is handed back if the pool cannot run it.
    pub fn post(&self, job: Job) -> std::result::Result<(), Job> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(job);
        };
        if self.workers.is_empty() {
            return Err(job);
        }
        self.pending.increment();
        tx.send(job).map_err(|e| {
            self.pending.decrement();
            e.into_inner()
        })
    }

    /// Number of queued or running jobs
    pub fn pending(&self) -> usize {
        *lock(&self.pending.count)
    }

    /// Block until every queued job has finished or `timeout` elapses.
    /// Returns `true` when the pool drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = lock(&self.pending.count);
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = match self.pending.idle.wait_timeout(count, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        // Closing the channel ends each worker's loop
        self.tx.take();
        let current = std::thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Worker of job pool '{}' panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_jobs_run_once() {
        let pool = JobPool::new("test", 3);
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..50 {
            let hits = Arc::clone(&hits);
            assert!(pool
                .post(Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }))
                .is_ok());
        }
        assert!(pool.wait_idle(Duration::from_secs(2)));
        assert_eq!(hits.load(Ordering::SeqCst), 50);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_wait_idle_times_out() {
        let pool = JobPool::new("slow", 1);
        let _ = pool.post(Box::new(|| std::thread::sleep(Duration::from_millis(200))));
        assert!(!pool.wait_idle(Duration::from_millis(10)));
        assert!(pool.wait_idle(Duration::from_secs(2)));
    }

    #[test]
    fn test_worker_names() {
        let pool = JobPool::new("named", 2);
        assert_eq!(pool.worker_count(), 2);
        assert_eq!(pool.name(), "named");
    }
}
