//! Per-role discovery record reconciliation.

use futures_util::future::join_all;
use tfop_reconcile::select_for_scale_down;
use tracing::{debug, info, warn};

use super::{slice_by_index, ExpectationKey, JobReconciler};
use crate::error::FailedOperation;
use crate::model::{general_name, replica_labels, DiscoveryRecord, Job, ReplicaSpec, ReplicaType};

impl JobReconciler {
    /// Keep one discovery record per ordinal below the desired count.
    pub(super) async fn reconcile_records(
        &self,
        job: &Job,
        role: ReplicaType,
        spec: &ReplicaSpec,
        records: Vec<DiscoveryRecord>,
    ) -> Vec<FailedOperation> {
        let key = ExpectationKey::records(&job.key(), role);
        if !self.expectations.satisfied(&key) {
            debug!(job = %job.key(), role = %role, "Record expectations not satisfied, skipping");
            return Vec::new();
        }

        let desired = spec.replicas.max(0);
        let slices = slice_by_index(records, desired, DiscoveryRecord::replica_index, |r| {
            r.name.as_str()
        });

        let mut creates = Vec::new();
        let mut excess = Vec::new();
        for (&index, slot) in &slices {
            match slot.as_slice() {
                [] if index < desired => creates.push(self.new_record(job, role, spec, index)),
                [] => {}
                [record] if index >= desired && !record.is_terminating() => excess.push(record),
                [_] => {}
                many => warn!(
                    job = %job.key(),
                    role = %role,
                    index,
                    count = many.len(),
                    "Multiple records share one replica index, leaving them alone"
                ),
            }
        }

        let excess_count = excess.len();
        let deletes = select_for_scale_down(excess, excess_count, |r| {
            r.replica_index().unwrap_or(0)
        });
        if creates.is_empty() && deletes.is_empty() {
            return Vec::new();
        }

        info!(
            job = %job.key(),
            role = %role,
            creates = creates.len(),
            deletes = deletes.len(),
            "Reconciling discovery records"
        );
        if !creates.is_empty() {
            self.expectations.expect_creations(&key, creates.len() as u64);
        }
        if !deletes.is_empty() {
            self.expectations.expect_deletions(&key, deletes.len() as u64);
        }

        let control = &self.control;
        let create_calls = join_all(creates.into_iter().map(|record| async move {
            let name = record.name.clone();
            (name, control.create_record(job, record).await)
        }));
        let delete_calls = join_all(deletes.into_iter().map(|record| async move {
            (record.name.clone(), control.delete_record(job, record).await)
        }));
        let (created, deleted) = tokio::join!(create_calls, delete_calls);

        let mut failures = self.settle(&key, "create record", true, created);
        failures.extend(self.settle(&key, "delete record", false, deleted));
        failures
    }

    fn new_record(
        &self,
        job: &Job,
        role: ReplicaType,
        spec: &ReplicaSpec,
        index: i32,
    ) -> DiscoveryRecord {
        let labels = replica_labels(job, role, index);
        DiscoveryRecord {
            name: general_name(job.name(), role, index),
            namespace: job.namespace().to_string(),
            selector: labels.clone(),
            labels,
            owner: Some(job.owner_reference()),
            port: spec.template.port(),
            deletion_timestamp: None,
        }
    }
}
