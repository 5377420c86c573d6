//! Bounded background queue for best-effort federation work.
//!
//! Jobs run on a fixed pool of tokio tasks. A full queue drops the job with
//! a warning rather than blocking the caller.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::context::Context;
use crate::cache::mutex_lock;

const SOURCE: &str = "application::workers";
const METRIC_DROPPED: &str = "fedcache_worker_dropped_total";

pub type Job = Box<dyn FnOnce(Context) -> BoxFuture<'static, ()> + Send>;

struct Queued {
    name: &'static str,
    job: Job,
}

struct Shared {
    pending: AtomicUsize,
    idle: Notify,
}

pub struct WorkerQueue {
    sender: mpsc::Sender<Queued>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerQueue {
    /// Spawn `concurrency` workers reading from a queue of `capacity` jobs.
    /// Must be called within a tokio runtime.
    pub fn start(concurrency: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let shared = Arc::new(Shared {
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        let shutdown = CancellationToken::new();

        let handles = (0..concurrency.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    receiver.clone(),
                    shared.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        info!(concurrency, capacity, "federation workers started");
        Self {
            sender,
            shared,
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    /// Queue `job`; returns `false` when it was dropped.
    pub fn enqueue<F>(&self, name: &'static str, job: F) -> bool
    where
        F: FnOnce(Context) -> BoxFuture<'static, ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            warn!(job = name, "worker queue is shut down, dropping job");
            return false;
        }

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        match self.sender.try_send(Queued {
            name,
            job: Box::new(job),
        }) {
            Ok(()) => true,
            Err(err) => {
                finish(&self.shared);
                counter!(METRIC_DROPPED, "job" => name).increment(1);
                match err {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(job = name, "worker queue is full, dropping job");
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        warn!(job = name, "worker queue is closed, dropping job");
                    }
                }
                false
            }
        }
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Resolve once no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop the workers and wait for them. Running jobs see their context
    /// cancelled; queued jobs are discarded.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *mutex_lock(&self.handles, SOURCE, "shutdown"));
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "federation worker task failed");
            }
        }
        info!("federation workers stopped");
    }
}

fn finish(shared: &Shared) {
    if shared.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
        shared.idle.notify_waiters();
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Queued>>>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            queued = async { receiver.lock().await.recv().await } => queued,
        };
        let Some(Queued { name, job }) = next else {
            break;
        };

        debug!(worker, job = name, "running federation job");
        let cx = Context::with_cancellation(shutdown.child_token());
        if AssertUnwindSafe(job(cx)).catch_unwind().await.is_err() {
            error!(worker, job = name, "federation job panicked");
        }
        finish(&shared);
    }
    debug!(worker, "federation worker exiting");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn runs_queued_jobs_and_reports_idle() {
        let queue = WorkerQueue::start(2, 8);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = counter.clone();
            assert!(queue.enqueue("count", move |_cx| {
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }));
        }

        tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
            .await
            .expect("queue drains");
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_drops_jobs() {
        let queue = WorkerQueue::start(1, 1);
        let gate = Arc::new(Notify::new());

        let blocker = gate.clone();
        assert!(queue.enqueue("block", move |_cx| {
            async move { blocker.notified().await }.boxed()
        }));
        // Let the worker pick the blocker up so the queue slot frees.
        while queue.sender.capacity() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(queue.enqueue("fill", |_cx| async {}.boxed()));
        assert!(!queue.enqueue("overflow", |_cx| async {}.boxed()));

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
            .await
            .expect("queue drains");
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_job_does_not_stop_the_worker() {
        let queue = WorkerQueue::start(1, 4);
        let ran = Arc::new(AtomicUsize::new(0));

        assert!(queue.enqueue("panic", |_cx| async {
            panic!("boom");
        }
        .boxed()));
        let after = ran.clone();
        assert!(queue.enqueue("after", move |_cx| {
            async move {
                after.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }));

        tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
            .await
            .expect("queue drains");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_running_jobs_and_refuses_new_ones() {
        let queue = WorkerQueue::start(1, 4);
        let observed = Arc::new(AtomicUsize::new(0));

        let flag = observed.clone();
        assert!(queue.enqueue("wait", move |cx| {
            async move {
                cx.cancellation().cancelled().await;
                flag.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }));
        tokio::task::yield_now().await;

        queue.shutdown().await;
        assert!(!queue.enqueue("late", |_cx| async {}.boxed()));
    }
}
