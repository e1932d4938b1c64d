//! Worker pool and periodic resync.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::queue::WorkQueue;
use crate::reconciler::JobReconciler;
use crate::store::ClusterApi;

/// Fixed-size pool of tasks draining the work queue.
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    reconciler: Arc<JobReconciler>,
    threads: usize,
}

impl WorkerPool {
    pub fn new(queue: Arc<WorkQueue>, reconciler: Arc<JobReconciler>, threads: usize) -> Self {
        Self {
            queue,
            reconciler,
            threads: threads.max(1),
        }
    }

    /// Run the workers until shutdown is signaled.
    ///
    /// In-flight passes finish before this returns.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(threads = self.threads, "Starting worker pool");

        let mut handles = Vec::with_capacity(self.threads);
        for worker_id in 0..self.threads {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            handles.push(tokio::spawn(async move {
                while process_next(&queue, &reconciler).await {}
                debug!(worker_id, "Worker stopped");
            }));
        }

        while shutdown.changed().await.is_ok() {
            if *shutdown.borrow() {
                break;
            }
        }

        info!("Worker pool shutting down");
        self.queue.shut_down();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
    }
}

/// Take one key off the queue and reconcile it. Returns false once the queue is shut down.
pub async fn process_next(queue: &Arc<WorkQueue>, reconciler: &JobReconciler) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    match reconciler.sync_job(&key).await {
        Ok(requeue_after) => {
            queue.forget(&key);
            if let Some(delay) = requeue_after {
                debug!(job = %key, delay_ms = delay.as_millis() as u64, "Scheduling follow-up pass");
                queue.add_after(key.clone(), delay);
            }
        }
        Err(e) => {
            warn!(
                job = %key,
                error = %e,
                requeues = queue.num_requeues(&key),
                "Reconciliation failed, requeueing"
            );
            queue.add_rate_limited(key.clone());
        }
    }

    queue.done(&key);
    true
}

/// Enqueue every job on a fixed interval until shutdown.
#[instrument(skip(api, queue, shutdown))]
pub async fn run_resync(
    api: Arc<dyn ClusterApi>,
    queue: Arc<WorkQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Starting periodic resync");

    let mut ticker = tokio::time::interval(interval);
    // First tick fires immediately; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match api.list_jobs().await {
                    Ok(jobs) => {
                        debug!(jobs = jobs.len(), "Resyncing jobs");
                        for job in jobs {
                            queue.add(job.key());
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to list jobs for resync"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Resync shutting down");
                    break;
                }
            }
        }
    }
}
