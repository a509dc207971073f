//! Bounded worker pool for blocking driver work.
//!
//! A fixed number of tokio worker tasks share the receiving end of a bounded
//! job channel. Each job runs on the blocking thread pool, so slow driver
//! hooks never stall the dispatch loop. [`WorkerPool::put`] waits for a free
//! slot when the queue is full and hands back a [`JobHandle`] that resolves
//! to the job's result.
//!
//! Jobs queued before a call to [`WorkerPool::empty`] are discarded instead of
//! run. Every job error is delivered to the job's handle and also kept until
//! the next [`WorkerPool::sync`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::utils::{lock_unpoisoned, panic_message};
use expctl_shared::errors::{PoolError, PoolResult};

type BoxedJob = Box<dyn FnOnce() -> PoolResult<()> + Send + 'static>;

struct QueuedJob {
    generation: u64,
    job: BoxedJob,
}

/// Future-like handle to a submitted job
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<PoolResult<T>>,
}

impl<T> JobHandle<T> {
    /// Wait for the job to finish.
    ///
    /// A job that was discarded, or whose pool went away, yields
    /// [`PoolError::Discarded`].
    pub async fn join(self) -> PoolResult<T> {
        self.rx.await.unwrap_or(Err(PoolError::Discarded))
    }
}

/// Fixed-size pool of blocking workers fed by a bounded queue
pub struct WorkerPool {
    max_workers: usize,
    sender: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    generation: Arc<AtomicU64>,
    errors: Arc<Mutex<Vec<PoolError>>>,
    completed: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Create a stopped pool with `max_workers` workers and room for
    /// `queue_capacity` waiting jobs
    pub fn new(max_workers: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            max_workers: max_workers.max(1),
            sender: Mutex::new(Some(tx)),
            receiver: Arc::new(AsyncMutex::new(rx)),
            workers: Mutex::new(Vec::new()),
            generation: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(Mutex::new(Vec::new())),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Number of jobs that ran to completion, successfully or not
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Launch the workers. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut workers = lock_unpoisoned(&self.workers);
        if !workers.is_empty() {
            debug!("Worker pool already started");
            return;
        }

        for id in 0..self.max_workers {
            let receiver = Arc::clone(&self.receiver);
            let generation = Arc::clone(&self.generation);
            let errors = Arc::clone(&self.errors);
            let completed = Arc::clone(&self.completed);
            workers.push(tokio::spawn(worker_loop(
                id, receiver, generation, errors, completed,
            )));
        }
        info!("Worker pool started with {} workers", self.max_workers);
    }

    /// Submit a job, waiting while the queue is full.
    ///
    /// Jobs may be submitted before [`start`](Self::start); they run once the
    /// workers come up.
    pub async fn put<F, T>(&self, job: F) -> PoolResult<JobHandle<T>>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = lock_unpoisoned(&self.sender).clone().ok_or(PoolError::Closed)?;
        let (tx, rx) = oneshot::channel();
        let errors = Arc::clone(&self.errors);

        let wrapped: BoxedJob = Box::new(move || {
            let outcome = match catch_unwind(AssertUnwindSafe(job)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(PoolError::JobFailed {
                    message: format!("{:#}", e),
                }),
                Err(payload) => Err(PoolError::JobPanicked {
                    message: panic_message(payload),
                }),
            };

            let report = outcome.as_ref().err().cloned();
            if let Some(e) = &report {
                lock_unpoisoned(&errors).push(e.clone());
            }
            // the submitter may have dropped its handle
            let _ = tx.send(outcome);
            report.map_or(Ok(()), Err)
        });

        let queued = QueuedJob {
            generation: self.generation.load(Ordering::SeqCst),
            job: wrapped,
        };
        sender.send(queued).await.map_err(|_| PoolError::Closed)?;
        Ok(JobHandle { rx })
    }

    /// Discard every job that is queued but not yet started
    pub fn empty(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Worker pool emptied (generation {})", generation);
    }

    /// Report the first job error captured since the previous call
    pub fn sync(&self) -> PoolResult<()> {
        let mut errors = lock_unpoisoned(&self.errors);
        if errors.is_empty() {
            return Ok(());
        }
        let first = errors.remove(0);
        errors.clear();
        Err(first)
    }

    /// Stop accepting work, let the workers drain the queue and join them
    pub async fn destroy(&self) {
        lock_unpoisoned(&self.sender).take();

        let workers: Vec<JoinHandle<()>> = lock_unpoisoned(&self.workers).drain(..).collect();
        if workers.is_empty() {
            return;
        }

        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in lock_unpoisoned(&self.workers).drain(..) {
            handle.abort();
        }
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<AsyncMutex<mpsc::Receiver<QueuedJob>>>,
    generation: Arc<AtomicU64>,
    errors: Arc<Mutex<Vec<PoolError>>>,
    completed: Arc<AtomicUsize>,
) {
    loop {
        let next = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };

        let Some(queued) = next else {
            debug!("Worker {} exiting, queue closed", id);
            break;
        };

        if queued.generation < generation.load(Ordering::SeqCst) {
            debug!("Worker {} discarded a stale job", id);
            continue;
        }

        let result = tokio::task::spawn_blocking(queued.job).await;
        completed.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(Ok(())) => {}
            // already recorded by the job
            Ok(Err(e)) => debug!("Worker {} job error: {}", id, e),
            Err(e) => {
                warn!("Worker {} lost a job: {}", id, e);
                lock_unpoisoned(&errors).push(PoolError::JobPanicked {
                    message: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_more_jobs_than_workers() {
        let pool = WorkerPool::new(3, 4);
        pool.start();

        let mut handles = Vec::new();
        for n in 0..10usize {
            handles.push(
                pool.put(move || {
                    std::thread::sleep(Duration::from_millis(10));
                    Ok(n)
                })
                .await
                .unwrap(),
            );
        }

        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.join().await.unwrap()));
        }
        assert_eq!(seen.len(), 10);
        assert!(pool.sync().is_ok());

        pool.destroy().await;
        assert_eq!(pool.completed(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sync_reports_dropped_job_errors() {
        let pool = WorkerPool::new(2, 8);
        pool.start();

        let ok = pool.put(|| Ok(())).await.unwrap();
        ok.join().await.unwrap();
        assert!(pool.sync().is_ok());

        // fire and forget: the error has to surface through sync
        drop(
            pool.put(|| -> anyhow::Result<()> { anyhow::bail!("NOT A REAL ERROR") })
                .await
                .unwrap(),
        );
        pool.destroy().await;

        match pool.sync() {
            Err(PoolError::JobFailed { message }) => assert!(message.contains("NOT A REAL ERROR")),
            other => panic!("unexpected sync result: {:?}", other),
        }
        assert!(pool.sync().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_join_receives_error_and_panic() {
        let pool = WorkerPool::new(1, 4);
        pool.start();

        let failed = pool
            .put(|| -> anyhow::Result<()> { anyhow::bail!("bad hook") })
            .await
            .unwrap();
        assert!(matches!(failed.join().await, Err(PoolError::JobFailed { .. })));

        let panicked = pool
            .put(|| -> anyhow::Result<()> { panic!("driver exploded") })
            .await
            .unwrap();
        match panicked.join().await {
            Err(PoolError::JobPanicked { message }) => assert!(message.contains("exploded")),
            other => panic!("unexpected join result: {:?}", other),
        }

        // joined errors still surface through sync, once
        match pool.sync() {
            Err(PoolError::JobFailed { message }) => assert!(message.contains("bad hook")),
            other => panic!("unexpected sync result: {:?}", other),
        }
        assert!(pool.sync().is_ok());
        pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sync_only_fails_after_a_job_error() {
        let pool = WorkerPool::new(2, 8);
        pool.start();

        let mut handles = Vec::new();
        for n in 0..6u32 {
            handles.push(pool.put(move || Ok(n)).await.unwrap());
        }
        for handle in handles {
            handle.join().await.unwrap();
        }
        assert!(pool.sync().is_ok());

        let failed = pool
            .put(|| -> anyhow::Result<()> { anyhow::bail!("worker raised") })
            .await
            .unwrap();
        assert!(failed.join().await.is_err());
        assert!(matches!(pool.sync(), Err(PoolError::JobFailed { .. })));

        let ok = pool.put(|| Ok(())).await.unwrap();
        ok.join().await.unwrap();
        assert!(pool.sync().is_ok());
        pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_discards_queued_jobs() {
        let pool = WorkerPool::new(1, 16);

        let mut handles = Vec::new();
        for n in 0..5u32 {
            handles.push(pool.put(move || Ok(n)).await.unwrap());
        }
        pool.empty();
        let fresh = pool.put(|| Ok(99u32)).await.unwrap();

        pool.start();
        for handle in handles {
            assert!(matches!(handle.join().await, Err(PoolError::Discarded)));
        }
        assert_eq!(fresh.join().await.unwrap(), 99);

        pool.destroy().await;
        assert_eq!(pool.completed(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_destroy_rejects_new_jobs() {
        let pool = WorkerPool::new(2, 2);
        pool.start();
        pool.destroy().await;
        assert!(matches!(pool.put(|| Ok(())).await, Err(PoolError::Closed)));
    }
}
