//! Bounded worker pool for connection sessions
//!
//! `core_size` workers start eagerly and live until shutdown. When the job
//! queue is full, one extra worker is started as long as fewer than
//! `max_size` are running; extra workers retire after `keep_alive` without
//! work. At `max_size` with a full queue, [`WorkerPool::submit`] waits for
//! room, which stalls the caller (the accept loop) instead of rejecting.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

/// A unit of work, usually one client session
pub type Job = BoxFuture<'static, ()>;

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker pool is shut down")]
    Closed,
}

/// Worker pool sizing
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub core_size: usize,
    pub max_size: usize,
    pub queue_capacity: usize,
    pub keep_alive: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            core_size: 8,
            max_size: 32,
            queue_capacity: 64,
            keep_alive: Duration::from_secs(60),
        }
    }
}

type JobQueue = Arc<Mutex<mpsc::Receiver<Job>>>;

pub struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    queue: JobQueue,
    workers: JoinSet<()>,
    live: Arc<AtomicUsize>,
    next_id: usize,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    /// Start the pool with its core workers. Must be called inside a runtime.
    pub fn new(config: WorkerPoolConfig) -> Self {
        let core_size = config.core_size.max(1);
        let config = WorkerPoolConfig {
            core_size,
            max_size: config.max_size.max(core_size),
            queue_capacity: config.queue_capacity.max(1),
            keep_alive: config.keep_alive,
        };

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let mut pool = Self {
            sender: Some(sender),
            queue: Arc::new(Mutex::new(receiver)),
            workers: JoinSet::new(),
            live: Arc::new(AtomicUsize::new(0)),
            next_id: 0,
            config,
        };

        for _ in 0..pool.config.core_size {
            pool.spawn_worker(None);
        }

        tracing::info!(
            core = pool.config.core_size,
            max = pool.config.max_size,
            queue = pool.config.queue_capacity,
            "Worker pool started"
        );
        pool
    }

    /// Queue a job, growing the pool or waiting for room when the queue is full.
    pub async fn submit(&mut self, job: Job) -> Result<(), WorkerError> {
        let sender = self.sender.clone().ok_or(WorkerError::Closed)?;

        let job = match sender.try_send(job) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(WorkerError::Closed),
            Err(TrySendError::Full(job)) => job,
        };

        self.reap();
        if self.live_workers() < self.config.max_size {
            self.spawn_worker(Some(self.config.keep_alive));
            tracing::debug!(workers = self.live_workers(), "Job queue full, started extra worker");
        } else {
            tracing::debug!(workers = self.live_workers(), "Worker pool saturated, waiting for room");
        }

        sender.send(job).await.map_err(|_| WorkerError::Closed)
    }

    /// Workers currently running
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Jobs waiting in the queue
    pub fn queued(&self) -> usize {
        self.sender
            .as_ref()
            .map(|sender| sender.max_capacity() - sender.capacity())
            .unwrap_or(0)
    }

    /// Close the queue, let workers finish within `grace`, then abort the rest.
    pub async fn shutdown(mut self, grace: Duration) {
        self.sender.take();
        tracing::info!(workers = self.live_workers(), "Draining worker pool");

        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = self.workers.join_next().await {
                if let Err(e) = result {
                    tracing::warn!("Worker ended abnormally: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = self.workers.len(),
                "Workers still busy after {:?}, aborting",
                grace
            );
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }

        tracing::info!("Worker pool stopped");
    }

    /// Collect retired workers without waiting
    fn reap(&mut self) {
        while let Some(Some(result)) = self.workers.join_next().now_or_never() {
            if let Err(e) = result {
                tracing::warn!("Worker ended abnormally: {}", e);
            }
        }
    }

    /// `keep_alive: None` makes a core worker
    fn spawn_worker(&mut self, keep_alive: Option<Duration>) {
        let id = self.next_id;
        self.next_id += 1;

        self.live.fetch_add(1, Ordering::SeqCst);
        let live = LiveWorker(Arc::clone(&self.live));
        let queue = Arc::clone(&self.queue);

        self.workers.spawn(async move {
            let _live = live;
            worker_loop(id, queue, keep_alive).await;
        });
    }
}

/// Keeps the live-worker count right however the worker exits
struct LiveWorker(Arc<AtomicUsize>);

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn worker_loop(id: usize, queue: JobQueue, keep_alive: Option<Duration>) {
    loop {
        let next = async { queue.lock().await.recv().await };

        let job = match keep_alive {
            None => next.await,
            Some(idle) => match tokio::time::timeout(idle, next).await {
                Ok(job) => job,
                Err(_) => {
                    tracing::debug!(worker = id, "Extra worker idle for {:?}, retiring", idle);
                    return;
                }
            },
        };

        let Some(job) = job else {
            tracing::debug!(worker = id, "Job queue closed, worker exiting");
            return;
        };

        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            tracing::error!(worker = id, "Job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::oneshot;

    fn config(core: usize, max: usize, queue: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            core_size: core,
            max_size: max,
            queue_capacity: queue,
            keep_alive: Duration::from_millis(100),
        }
    }

    /// A job that runs until the returned sender fires or is dropped
    fn blocked_job() -> (Job, oneshot::Sender<()>) {
        let (release, wait) = oneshot::channel::<()>();
        let job = async move {
            let _ = wait.await;
        }
        .boxed();
        (job, release)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_runs_submitted_jobs() {
        let mut pool = WorkerPool::new(config(2, 4, 8));
        assert_eq!(pool.live_workers(), 2);

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let done = Arc::clone(&done);
            pool.submit(
                async move {
                    done.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .await
            .unwrap();
        }

        pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_grows_when_queue_full() {
        let mut pool = WorkerPool::new(config(1, 2, 1));

        let (first, release_first) = blocked_job();
        pool.submit(first).await.unwrap();
        settle().await;

        let (second, release_second) = blocked_job();
        pool.submit(second).await.unwrap();
        assert_eq!(pool.live_workers(), 1);

        // Queue is full: this one starts an extra worker
        let (third, release_third) = blocked_job();
        pool.submit(third).await.unwrap();
        assert_eq!(pool.live_workers(), 2);

        drop((release_first, release_second, release_third));
        pool.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_backpressure_at_max() {
        let mut pool = WorkerPool::new(config(1, 1, 1));

        let (first, release_first) = blocked_job();
        pool.submit(first).await.unwrap();
        settle().await;
        let (second, _release_second) = blocked_job();
        pool.submit(second).await.unwrap();

        let (third, _release_third) = blocked_job();
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.submit(third)).await;
        assert!(blocked.is_err(), "submit should wait while the pool is saturated");
        assert_eq!(pool.live_workers(), 1);

        drop(release_first);
        let (fourth, _release_fourth) = blocked_job();
        tokio::time::timeout(Duration::from_secs(1), pool.submit(fourth))
            .await
            .expect("room should free up")
            .unwrap();

        pool.shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_extra_worker_retires() {
        let mut pool = WorkerPool::new(config(1, 3, 1));

        let mut releases = Vec::new();
        for _ in 0..3 {
            let (job, release) = blocked_job();
            pool.submit(job).await.unwrap();
            releases.push(release);
            settle().await;
        }
        assert_eq!(pool.live_workers(), 2);

        drop(releases);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.live_workers(), 1);

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let mut pool = WorkerPool::new(config(1, 1, 4));
        let ran = Arc::new(AtomicBool::new(false));

        pool.submit(async { panic!("job failure"); }.boxed()).await.unwrap();
        let flag = Arc::clone(&ran);
        pool.submit(
            async move {
                flag.store(true, Ordering::SeqCst);
            }
            .boxed(),
        )
        .await
        .unwrap();

        pool.shutdown(Duration::from_secs(5)).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_jobs() {
        let mut pool = WorkerPool::new(config(2, 2, 2));
        pool.submit(std::future::pending::<()>().boxed()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), pool.shutdown(Duration::from_millis(50)))
            .await
            .expect("shutdown must respect its grace period");
    }
}
