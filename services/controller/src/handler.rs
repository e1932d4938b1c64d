//! Change notification handler.
//!
//! Maps unit and record notifications back to the job controlling them,
//! records the matching expectation observation and queues the job key.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use crate::model::{JobKey, OwnerReference, KIND};
use crate::queue::WorkQueue;
use crate::reconciler::{ExpectationKey, JobExpectations};
use crate::store::{ClusterApi, ClusterEvent};

/// Turns cluster notifications into expectation observations and queue entries.
#[derive(Clone)]
pub struct EventHandler {
    api: Arc<dyn ClusterApi>,
    queue: Arc<WorkQueue>,
    expectations: Arc<JobExpectations>,
}

impl EventHandler {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        queue: Arc<WorkQueue>,
        expectations: Arc<JobExpectations>,
    ) -> Self {
        Self {
            api,
            queue,
            expectations,
        }
    }

    /// Consume notifications until shutdown or until the stream closes.
    #[instrument(skip_all)]
    pub async fn run(
        self,
        mut events: broadcast::Receiver<ClusterEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting event handler");
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => self.handle(&event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Lost observations are recovered by expectation expiry and resync.
                        warn!(missed, "Event handler lagged behind notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Notification stream closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Event handler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Handle a single notification.
    pub async fn handle(&self, event: &ClusterEvent) {
        match event {
            ClusterEvent::JobAdded(job) | ClusterEvent::JobUpdated(job) => {
                self.queue.add(job.key());
            }
            ClusterEvent::JobDeleted(job) => {
                let key = job.key();
                self.expectations.delete_matching(|k| k.job == key);
                self.queue.add(key);
            }
            ClusterEvent::UnitAdded(unit) => {
                let role = unit.replica_type();
                if let Some(key) = self.resolve(&unit.namespace, unit.owner.as_ref()).await {
                    if let Some(role) = role {
                        self.expectations
                            .creation_observed(&ExpectationKey::units(&key, role));
                    }
                    self.queue.add(key);
                }
            }
            ClusterEvent::UnitUpdated { old, new } => {
                if let Some(key) = self.resolve(&new.namespace, new.owner.as_ref()).await {
                    // Graceful deletion is observed when it starts.
                    if new.is_terminating() && !old.is_terminating() {
                        if let Some(role) = new.replica_type() {
                            self.expectations
                                .deletion_observed(&ExpectationKey::units(&key, role));
                        }
                    }
                    if old != new {
                        self.queue.add(key);
                    }
                }
            }
            ClusterEvent::UnitDeleted(unit) => {
                if let Some(key) = self.resolve(&unit.namespace, unit.owner.as_ref()).await {
                    if !unit.is_terminating() {
                        if let Some(role) = unit.replica_type() {
                            self.expectations
                                .deletion_observed(&ExpectationKey::units(&key, role));
                        }
                    }
                    self.queue.add(key);
                }
            }
            ClusterEvent::RecordAdded(record) => {
                if let Some(key) = self.resolve(&record.namespace, record.owner.as_ref()).await {
                    if let Some(role) = record.replica_type() {
                        self.expectations
                            .creation_observed(&ExpectationKey::records(&key, role));
                    }
                    self.queue.add(key);
                }
            }
            ClusterEvent::RecordDeleted(record) => {
                if let Some(key) = self.resolve(&record.namespace, record.owner.as_ref()).await {
                    if let Some(role) = record.replica_type() {
                        self.expectations
                            .deletion_observed(&ExpectationKey::records(&key, role));
                    }
                    self.queue.add(key);
                }
            }
        }
    }

    /// Find the live job an object is controlled by.
    ///
    /// The owner reference names the job; its uid must match the stored job,
    /// so objects left behind by a deleted job of the same name are ignored.
    async fn resolve(&self, namespace: &str, owner: Option<&OwnerReference>) -> Option<JobKey> {
        let owner = owner.filter(|o| o.controller && o.kind == KIND)?;
        let key = JobKey::new(namespace, &owner.name);
        match self.api.get_job(&key).await {
            Ok(job) if job.metadata.uid == owner.uid => Some(key),
            Ok(_) => {
                debug!(job = %key, "Owner uid does not match the stored job, ignoring");
                None
            }
            Err(e) => {
                debug!(job = %key, error = %e, "Owner not found, ignoring");
                None
            }
        }
    }
}
