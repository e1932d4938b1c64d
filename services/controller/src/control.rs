//! Workload control: create and delete units and records on behalf of a job.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tfop_events::{EventRecorder, EventType};
use tracing::{debug, warn};

use crate::error::{ControlError, StoreError};
use crate::model::{DiscoveryRecord, Job, OwnerReference, Unit};
use crate::store::ClusterApi;

/// Event reasons recorded by workload control.
pub mod reasons {
    pub const SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
    pub const FAILED_CREATE: &str = "FailedCreate";
    pub const SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
    pub const FAILED_DELETE: &str = "FailedDelete";
}

/// Default bound on a single create/delete call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Façade over the cluster store for mutating calls.
///
/// Every object must carry a controller owner reference to the job; every
/// call is bounded by a timeout and produces an event record.
#[derive(Clone)]
pub struct WorkloadControl {
    api: Arc<dyn ClusterApi>,
    recorder: Arc<dyn EventRecorder>,
    call_timeout: Duration,
}

impl WorkloadControl {
    pub fn new(api: Arc<dyn ClusterApi>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self {
            api,
            recorder,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn recorder(&self) -> &Arc<dyn EventRecorder> {
        &self.recorder
    }

    pub async fn create_unit(&self, job: &Job, unit: Unit) -> Result<(), ControlError> {
        validate_owner(job, &unit.name, unit.owner.as_ref())?;
        let name = unit.name.clone();
        let result = self
            .call("create unit", &name, self.api.create_unit(unit))
            .await
            .map(|_| ());
        self.record_outcome(job, "unit", &name, true, &result);
        result
    }

    pub async fn delete_unit(&self, job: &Job, unit: &Unit) -> Result<(), ControlError> {
        validate_owner(job, &unit.name, unit.owner.as_ref())?;
        let result = self
            .call(
                "delete unit",
                &unit.name,
                self.api.delete_unit(&unit.namespace, &unit.name),
            )
            .await;
        self.record_outcome(job, "unit", &unit.name, false, &result);
        result
    }

    pub async fn create_record(
        &self,
        job: &Job,
        record: DiscoveryRecord,
    ) -> Result<(), ControlError> {
        validate_owner(job, &record.name, record.owner.as_ref())?;
        let name = record.name.clone();
        let result = self
            .call("create record", &name, self.api.create_record(record))
            .await
            .map(|_| ());
        self.record_outcome(job, "record", &name, true, &result);
        result
    }

    pub async fn delete_record(
        &self,
        job: &Job,
        record: &DiscoveryRecord,
    ) -> Result<(), ControlError> {
        validate_owner(job, &record.name, record.owner.as_ref())?;
        let result = self
            .call(
                "delete record",
                &record.name,
                self.api.delete_record(&record.namespace, &record.name),
            )
            .await;
        self.record_outcome(job, "record", &record.name, false, &result);
        result
    }

    async fn call<T, F>(
        &self,
        operation: &'static str,
        name: &str,
        fut: F,
    ) -> Result<T, ControlError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(ControlError::from),
            Err(_) => Err(ControlError::Timeout {
                operation,
                name: name.to_string(),
                timeout_ms: u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    fn record_outcome(
        &self,
        job: &Job,
        kind: &str,
        name: &str,
        create: bool,
        result: &Result<(), ControlError>,
    ) {
        let (event_type, reason, message) = match (create, result) {
            (true, Ok(())) => (
                EventType::Normal,
                reasons::SUCCESSFUL_CREATE,
                format!("Created {kind}: {name}"),
            ),
            (true, Err(e)) => (
                EventType::Warning,
                reasons::FAILED_CREATE,
                format!("Error creating {kind} {name}: {e}"),
            ),
            (false, Ok(())) => (
                EventType::Normal,
                reasons::SUCCESSFUL_DELETE,
                format!("Deleted {kind}: {name}"),
            ),
            (false, Err(e)) => (
                EventType::Warning,
                reasons::FAILED_DELETE,
                format!("Error deleting {kind} {name}: {e}"),
            ),
        };

        match result {
            Ok(()) => debug!(job = %job.key(), object = %name, "{message}"),
            Err(_) => warn!(job = %job.key(), object = %name, "{message}"),
        }
        self.recorder
            .event(job.object_ref(), event_type, reason, message);
    }
}

/// The object must be controlled by `job`.
fn validate_owner(job: &Job, name: &str, owner: Option<&OwnerReference>) -> Result<(), ControlError> {
    match owner {
        Some(owner) if owner.controller && owner.uid == job.metadata.uid => Ok(()),
        _ => Err(ControlError::InvalidOwner {
            name: name.to_string(),
            job: job.key().to_string(),
        }),
    }
}

impl ControlError {
    /// The target was already gone when deleting it.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ControlError::Api(e) if e.is_not_found())
    }
}
