//! Bounded worker pool for agent jobs.
//!
//! A FIFO queue of boxed futures drained by a fixed set of worker
//! tasks. `submit` never blocks: when the queue is full the caller gets
//! `QueueError::QueueFull` and surfaces it as a 503-equivalent. Nothing
//! agent-shaped runs on the gateway's socket tasks.

use futures::future::BoxFuture;
use lily_core::error::QueueError;
use tokio::sync::mpsc;
use tracing::{debug, info};

type Job = BoxFuture<'static, ()>;

/// Fixed-size worker pool over a bounded FIFO queue.
pub struct WorkerPool {
    /// `None` once shut down; dropping the sender closes the queue
    queue: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    workers: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WorkerPool {
    /// `workers` loops draining a queue of capacity `queue_size`.
    pub fn new(workers: usize, queue_size: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(queue_size.max(1));
        let rx = std::sync::Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers)
            .map(|worker_id| {
                let rx = std::sync::Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        // The lock is released before the job runs, so
                        // workers drain the queue concurrently
                        let job = { rx.lock().await.recv().await };
                        match job {
                            Some(job) => {
                                debug!(worker_id, "Job picked up");
                                job.await;
                            }
                            None => break,
                        }
                    }
                    debug!(worker_id, "Worker exiting");
                })
            })
            .collect();

        info!(workers, queue_size, "Worker pool started");
        Self {
            queue: std::sync::Mutex::new(Some(tx)),
            workers: tokio::sync::Mutex::new(handles),
        }
    }

    /// Pool sized to the hardware: `max(available_parallelism, 4)` workers.
    pub fn with_defaults(queue_size: usize) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .max(4);
        Self::new(workers, queue_size)
    }

    /// Enqueue a job; fails fast when the queue is full.
    pub fn submit<F>(&self, job: F) -> Result<(), QueueError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let sender = {
            let guard = self.queue.lock().unwrap();
            match guard.as_ref() {
                Some(tx) => tx.clone(),
                None => return Err(QueueError::ShutDown),
            }
        };
        sender.try_send(Box::pin(job)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => QueueError::ShutDown,
        })
    }

    /// Close the queue, let workers drain it, and join them.
    pub async fn shutdown(&self) {
        let sender = self.queue.lock().unwrap().take();
        drop(sender);
        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
        info!("Worker pool shut down");
    }
}
