//! Job reconciliation.
//!
//! A pass for one job key runs, in order:
//!
//! 1. Terminal handling for finished jobs (clean pod policy, counters reset)
//! 2. `Created` condition and template validation
//! 3. Backoff-limit and active-deadline checks
//! 4. Unit and record reconciliation per role, in priority order, each role
//!    gated by its expectations
//! 5. The completion and condition state machine
//! 6. Optimistic status write-back
//!
//! Create/delete failures never abort sibling calls; they are collected and
//! returned after status was written so the key is requeued with backoff.

mod job;
mod records;
mod status;
mod units;

use std::collections::BTreeMap;
use std::sync::Arc;

use tfop_reconcile::Expectations;
use tracing::warn;

use crate::cluster_spec::ClusterSpecBuilder;
use crate::control::WorkloadControl;
use crate::error::{ControlError, FailedOperation};
use crate::exit_code::RetryableExitCodes;
use crate::model::{JobKey, ReplicaType};
use crate::store::ClusterApi;

pub use status::{deadline_requeue, is_primary_completed, past_active_deadline, past_backoff_limit};
pub use units::RoleObservation;

/// Event reason recorded when a default container terminated with a code.
pub const EXITED_WITH_CODE: &str = "ExitedWithCode";

/// Which kind of object an expectation counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Units,
    Records,
}

/// Expectations are tracked per job, role and object kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExpectationKey {
    pub job: JobKey,
    pub role: ReplicaType,
    pub kind: ResourceKind,
}

impl ExpectationKey {
    pub fn units(job: &JobKey, role: ReplicaType) -> Self {
        Self {
            job: job.clone(),
            role,
            kind: ResourceKind::Units,
        }
    }

    pub fn records(job: &JobKey, role: ReplicaType) -> Self {
        Self {
            job: job.clone(),
            role,
            kind: ResourceKind::Records,
        }
    }
}

pub type JobExpectations = Expectations<ExpectationKey>;

/// Reconciles jobs against the cluster store.
pub struct JobReconciler {
    api: Arc<dyn ClusterApi>,
    control: WorkloadControl,
    expectations: Arc<JobExpectations>,
    cluster_spec: ClusterSpecBuilder,
    retryable_exit_codes: RetryableExitCodes,
}

impl JobReconciler {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        control: WorkloadControl,
        expectations: Arc<JobExpectations>,
        cluster_spec: ClusterSpecBuilder,
        retryable_exit_codes: RetryableExitCodes,
    ) -> Self {
        Self {
            api,
            control,
            expectations,
            cluster_spec,
            retryable_exit_codes,
        }
    }

    pub fn expectations(&self) -> &Arc<JobExpectations> {
        &self.expectations
    }

    /// Roles of `key` with units or records still expected.
    pub fn pending_roles(&self, key: &JobKey) -> Vec<ReplicaType> {
        ReplicaType::ALL
            .into_iter()
            .filter(|role| {
                !self.expectations.satisfied(&ExpectationKey::units(key, *role))
                    || !self.expectations.satisfied(&ExpectationKey::records(key, *role))
            })
            .collect()
    }

    /// Turn call results into failures, compensating the expectation of every failed call.
    ///
    /// A delete that finds its target already gone is not a failure.
    fn settle(
        &self,
        key: &ExpectationKey,
        operation: &'static str,
        creation: bool,
        results: Vec<(String, Result<(), ControlError>)>,
    ) -> Vec<FailedOperation> {
        let mut failures = Vec::new();
        for (name, result) in results {
            let Err(error) = result else { continue };
            if creation {
                self.expectations.creation_observed(key);
            } else {
                self.expectations.deletion_observed(key);
            }
            if !creation && error.is_not_found() {
                continue;
            }
            failures.push(FailedOperation {
                operation,
                name,
                error,
            });
        }
        failures
    }
}

/// Group objects into ordinal slots keyed by replica index.
///
/// Slots `0..replicas` are always present, empty when nothing claims them.
/// Objects without a valid index are dropped with a warning.
fn slice_by_index<T, I, N>(
    items: Vec<T>,
    replicas: i32,
    index_of: I,
    name_of: N,
) -> BTreeMap<i32, Vec<T>>
where
    I: Fn(&T) -> Option<i32>,
    N: Fn(&T) -> &str,
{
    let mut slices: BTreeMap<i32, Vec<T>> =
        (0..replicas.max(0)).map(|i| (i, Vec::new())).collect();
    for item in items {
        match index_of(&item) {
            Some(index) if index >= 0 => slices.entry(index).or_default().push(item),
            _ => warn!(object = %name_of(&item), "Ignoring object with invalid replica index"),
        }
    }
    slices
}
