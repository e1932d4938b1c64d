//! tfop controller library.
//!
//! Drives distributed TensorFlow training jobs to their desired state: one
//! unit and one discovery record per role ordinal, a rendezvous document in
//! every unit, and job conditions that follow the units' outcomes.
//!
//! ## Architecture
//!
//! - **Store** (`store`): the cluster API boundary and an in-memory cluster
//! - **Workload control** (`control`): owner-checked, timed create/delete calls
//! - **Reconciler** (`reconciler`): per-job passes gated by expectations
//! - **Queue and workers** (`queue`, `worker`): deduplicated keys, fixed pool
//! - **Handler** (`handler`): notifications to expectation observations and keys

pub mod cluster_spec;
pub mod config;
pub mod control;
pub mod error;
pub mod exit_code;
pub mod handler;
pub mod model;
pub mod queue;
pub mod reconciler;
pub mod store;
pub mod worker;

use std::sync::Arc;

use tfop_events::EventRecorder;
use tfop_reconcile::RequeueBackoff;
use tokio::sync::watch;
use tracing::{error, info};

use crate::cluster_spec::ClusterSpecBuilder;
use crate::config::Config;
use crate::control::WorkloadControl;
use crate::handler::EventHandler;
use crate::queue::WorkQueue;
use crate::reconciler::{JobExpectations, JobReconciler};
use crate::store::ClusterApi;
use crate::worker::WorkerPool;

/// A wired controller: reconciler, queue, handler and their shared state.
pub struct Controller {
    api: Arc<dyn ClusterApi>,
    queue: Arc<WorkQueue>,
    reconciler: Arc<JobReconciler>,
    handler: EventHandler,
    config: Config,
}

impl Controller {
    pub fn new(api: Arc<dyn ClusterApi>, recorder: Arc<dyn EventRecorder>, config: Config) -> Self {
        let expectations = Arc::new(JobExpectations::new(config.expectations_timeout));
        let queue = Arc::new(WorkQueue::with_backoff(RequeueBackoff::default()));
        let control =
            WorkloadControl::new(Arc::clone(&api), recorder).with_call_timeout(config.call_timeout);
        let reconciler = Arc::new(JobReconciler::new(
            Arc::clone(&api),
            control,
            Arc::clone(&expectations),
            ClusterSpecBuilder::new(config.cluster_domain.clone()),
            config.retryable_exit_codes.clone(),
        ));
        let handler = EventHandler::new(Arc::clone(&api), Arc::clone(&queue), expectations);

        Self {
            api,
            queue,
            reconciler,
            handler,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn reconciler(&self) -> &Arc<JobReconciler> {
        &self.reconciler
    }

    pub fn handler(&self) -> &EventHandler {
        &self.handler
    }

    /// Run the handler, the resync loop and the worker pool until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(
            threads = self.config.threads,
            resync_secs = self.config.resync_interval.as_secs(),
            "Starting controller"
        );

        // Subscribe before the initial listing so nothing falls in between.
        let events = self.api.subscribe();
        match self.api.list_jobs().await {
            Ok(jobs) => {
                for job in jobs {
                    self.queue.add(job.key());
                }
            }
            Err(e) => error!(error = %e, "Initial job listing failed"),
        }

        let handler_handle = tokio::spawn(self.handler.run(events, shutdown.clone()));
        let resync_handle = tokio::spawn(worker::run_resync(
            Arc::clone(&self.api),
            Arc::clone(&self.queue),
            self.config.resync_interval,
            shutdown.clone(),
        ));

        WorkerPool::new(self.queue, self.reconciler, self.config.threads)
            .run(shutdown)
            .await;

        for (name, handle) in [("handler", handler_handle), ("resync", resync_handle)] {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Task panicked");
            }
        }
        info!("Controller stopped");
    }
}
