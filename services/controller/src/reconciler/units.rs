//! Per-role unit reconciliation.

use futures_util::future::join_all;
use tfop_events::EventType;
use tfop_reconcile::select_for_scale_down;
use tracing::{debug, info, warn};

use super::{slice_by_index, ExpectationKey, JobReconciler, EXITED_WITH_CODE};
use crate::cluster_spec::ENV_TF_CONFIG;
use crate::error::{ControllerResult, FailedOperation};
use crate::model::{
    general_name, replica_labels, EnvVar, Job, ReplicaSpec, ReplicaStatus, ReplicaType,
    RestartPolicy, Unit, UnitPhase, UnitStatus, DEFAULT_CONTAINER_NAME,
};

/// What one role looked like during a pass, and what the pass did to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleObservation {
    pub role: ReplicaType,
    pub replicas: i32,
    pub restart_policy: RestartPolicy,

    /// Counts over units at ordinals below the desired count.
    pub status: ReplicaStatus,

    /// Outcome of the unit at ordinal 0.
    pub ordinal_zero_phase: Option<UnitPhase>,

    /// A unit failed with a retryable exit code and will be recreated.
    pub restarting: bool,

    /// A unit failed for good under the `ExitCode` policy.
    pub permanent_failure: Option<String>,

    /// Failed `ExitCode` units left in place because the role was gated.
    pub undeleted_failures: Vec<Unit>,

    pub creates: usize,
    pub deletes: usize,
    pub failures: Vec<FailedOperation>,
}

impl RoleObservation {
    fn new(role: ReplicaType, spec: &ReplicaSpec) -> Self {
        Self {
            role,
            replicas: spec.replicas.max(0),
            restart_policy: spec.restart_policy,
            status: ReplicaStatus::default(),
            ordinal_zero_phase: None,
            restarting: false,
            permanent_failure: None,
            undeleted_failures: Vec::new(),
            creates: 0,
            deletes: 0,
            failures: Vec::new(),
        }
    }
}

impl JobReconciler {
    /// Diff desired against observed units of `role` and converge.
    ///
    /// `units` are the job's owned units of this role. Counts are always
    /// collected; create/delete calls are only issued when the role's
    /// expectations are satisfied.
    pub(super) async fn reconcile_units(
        &self,
        job: &Job,
        role: ReplicaType,
        spec: &ReplicaSpec,
        units: Vec<Unit>,
    ) -> ControllerResult<RoleObservation> {
        let key = ExpectationKey::units(&job.key(), role);
        let act = self.expectations.satisfied(&key);
        let mut obs = RoleObservation::new(role, spec);
        let desired = obs.replicas;

        let slices = slice_by_index(units, desired, Unit::replica_index, |u| u.name.as_str());

        let mut creates = Vec::new();
        let mut excess = Vec::new();
        let mut exited: Vec<&Unit> = Vec::new();

        for (&index, slot) in &slices {
            match slot.as_slice() {
                [] => {
                    if index < desired {
                        creates.push(index);
                    }
                }
                [unit] => {
                    if index >= desired {
                        if !unit.is_terminating() {
                            excess.push(unit);
                        }
                        continue;
                    }

                    if index == 0 {
                        obs.ordinal_zero_phase = Some(unit.phase());
                    }
                    match unit.phase() {
                        UnitPhase::Running => obs.status.active += 1,
                        UnitPhase::Succeeded => obs.status.succeeded += 1,
                        UnitPhase::Failed => obs.status.failed += 1,
                        UnitPhase::Pending | UnitPhase::Unknown => {}
                    }

                    if spec.restart_policy == RestartPolicy::ExitCode
                        && unit.phase() == UnitPhase::Failed
                        && !unit.is_terminating()
                    {
                        self.classify_exit(job, unit, &mut obs, act);
                        exited.push(unit);
                    }
                }
                many => {
                    warn!(
                        job = %job.key(),
                        role = %role,
                        index,
                        count = many.len(),
                        "Multiple units share one replica index, leaving them alone"
                    );
                }
            }
        }

        let mut deletes = exited.clone();

        // Highest ordinals go first.
        let excess_count = excess.len();
        deletes.extend(select_for_scale_down(excess, excess_count, |u| {
            u.replica_index().unwrap_or(0)
        }));

        if !act {
            debug!(job = %job.key(), role = %role, "Unit expectations not satisfied, skipping changes");
            obs.undeleted_failures = exited.into_iter().cloned().collect();
            return Ok(obs);
        }

        let new_units = creates
            .iter()
            .map(|index| self.new_unit(job, role, spec, *index))
            .collect::<ControllerResult<Vec<_>>>()?;

        obs.creates = new_units.len();
        obs.deletes = deletes.len();
        if obs.creates == 0 && obs.deletes == 0 {
            return Ok(obs);
        }

        info!(
            job = %job.key(),
            role = %role,
            creates = obs.creates,
            deletes = obs.deletes,
            "Reconciling units"
        );

        if obs.creates > 0 {
            self.expectations.expect_creations(&key, obs.creates as u64);
        }
        if obs.deletes > 0 {
            self.expectations.expect_deletions(&key, obs.deletes as u64);
        }

        let control = &self.control;
        let create_calls = join_all(new_units.into_iter().map(|unit| async move {
            let name = unit.name.clone();
            (name, control.create_unit(job, unit).await)
        }));
        let delete_calls = join_all(deletes.into_iter().map(|unit| async move {
            (unit.name.clone(), control.delete_unit(job, unit).await)
        }));
        let (created, deleted) = tokio::join!(create_calls, delete_calls);

        obs.failures
            .extend(self.settle(&key, "create unit", true, created));
        obs.failures
            .extend(self.settle(&key, "delete unit", false, deleted));
        Ok(obs)
    }

    /// Decide whether a failed `ExitCode` unit is retried or fails the job.
    fn classify_exit(&self, job: &Job, unit: &Unit, obs: &mut RoleObservation, record: bool) {
        let Some(code) = unit.exit_code() else {
            obs.permanent_failure.get_or_insert_with(|| {
                format!(
                    "unit {}/{} failed without an exit code",
                    unit.namespace, unit.name
                )
            });
            return;
        };

        if record {
            self.control.recorder().event(
                job.object_ref(),
                EventType::Normal,
                EXITED_WITH_CODE,
                format!("Unit {}/{} exited with code {code}", unit.namespace, unit.name),
            );
        }

        if self.retryable_exit_codes.is_retryable(code) {
            info!(
                job = %job.key(),
                unit = %unit.name,
                exit_code = code,
                "Unit failed with retryable exit code, restarting"
            );
            obs.restarting = true;
        } else {
            obs.permanent_failure.get_or_insert_with(|| {
                format!(
                    "unit {}/{} exited with permanent code {code}",
                    unit.namespace, unit.name
                )
            });
        }
    }

    /// Build the unit for ordinal `index` of `role`.
    fn new_unit(
        &self,
        job: &Job,
        role: ReplicaType,
        spec: &ReplicaSpec,
        index: i32,
    ) -> ControllerResult<Unit> {
        let mut labels = spec.template.labels.clone();
        labels.extend(replica_labels(job, role, index));

        let mut containers = spec.template.containers.clone();
        if let Some(document) = self.cluster_spec.build(job, role, index)? {
            if let Some(container) = containers
                .iter_mut()
                .find(|c| c.name == DEFAULT_CONTAINER_NAME)
            {
                container.env.retain(|e| e.name != ENV_TF_CONFIG);
                container.env.push(EnvVar {
                    name: ENV_TF_CONFIG.to_string(),
                    value: document,
                });
            }
        }

        Ok(Unit {
            name: general_name(job.name(), role, index),
            namespace: job.namespace().to_string(),
            labels,
            owner: Some(job.owner_reference()),
            restart_policy: spec.restart_policy.to_native(),
            containers,
            status: UnitStatus::default(),
            deletion_timestamp: None,
        })
    }
}
