//! Per-job reconciliation pass.

use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, info, instrument, warn};

use super::status::{self, Verdict};
use super::{ExpectationKey, JobReconciler, RoleObservation};
use crate::error::{ControllerError, ControllerResult, FailedOperation, StoreError};
use crate::model::{
    reasons, CleanPodPolicy, DiscoveryRecord, Job, JobConditionType, JobKey, ReplicaType,
    RestartPolicy, Unit, UnitPhase,
};

impl JobReconciler {
    /// Run one reconciliation pass for `key`.
    ///
    /// Returns the delay after which the job wants another pass, if any.
    #[instrument(skip(self, key), fields(job = %key))]
    pub async fn sync_job(&self, key: &JobKey) -> ControllerResult<Option<Duration>> {
        let mut job = match self.api.get_job(key).await {
            Ok(job) => job,
            Err(StoreError::NotFound { .. }) => {
                debug!("Job no longer exists, forgetting expectations");
                self.expectations.delete_matching(|k| k.job == *key);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if job.metadata.deletion_timestamp.is_some() {
            debug!("Job is being deleted, skipping");
            return Ok(None);
        }

        let previous = job.status.clone();
        let uid = job.metadata.uid;
        let units: Vec<Unit> = self
            .api
            .list_units(job.namespace(), job.name())
            .await?
            .into_iter()
            .filter(|u| u.owner.as_ref().is_some_and(|o| o.controller && o.uid == uid))
            .collect();
        let records: Vec<DiscoveryRecord> = self
            .api
            .list_records(job.namespace(), job.name())
            .await?
            .into_iter()
            .filter(|r| r.owner.as_ref().is_some_and(|o| o.controller && o.uid == uid))
            .collect();

        let now = Utc::now();
        let mut failures = Vec::new();
        let mut requeue_after = None;

        if job.status.is_finished() {
            failures = self.clean_up_finished(&mut job, &units, &records).await;
        } else {
            job.status.update_conditions_at(
                JobConditionType::Created,
                reasons::JOB_CREATED,
                format!("TFJob {key} is created."),
                now,
            );

            if let Err(message) = validate(&job) {
                warn!(error = %message, "Invalid job spec");
                job.status.update_conditions_at(
                    JobConditionType::Failed,
                    reasons::INVALID_REPLICA_SPEC,
                    format!("TFJob {key} has an invalid replica spec: {message}"),
                    now,
                );
                job.status.completion_time.get_or_insert(now);
            } else if let Some((reason, message)) = exceeded_limit(&job, &units, now) {
                info!(reason, "Job exceeded its run policy, deleting all units");
                job.status
                    .update_conditions_at(JobConditionType::Failed, reason, message, now);
                job.status.completion_time.get_or_insert(now);
                failures = self.delete_all(&job, units.iter(), records.iter()).await;
                reset_active(&mut job);
            } else {
                failures = self.reconcile_roles(&mut job, units, records, now).await?;
                if !job.status.is_finished() {
                    requeue_after = status::deadline_requeue(&job, now);
                }
            }
        }

        if job.status != previous {
            let updated = self.api.update_job_status(&job).await?;
            debug!(
                version = updated.metadata.resource_version,
                "Job status written"
            );
        }

        if failures.is_empty() {
            Ok(requeue_after)
        } else {
            Err(ControllerError::Workload(failures))
        }
    }

    /// Diff every role in priority order, then run the state machine.
    async fn reconcile_roles(
        &self,
        job: &mut Job,
        units: Vec<Unit>,
        records: Vec<DiscoveryRecord>,
        now: chrono::DateTime<Utc>,
    ) -> ControllerResult<Vec<FailedOperation>> {
        let mut failures = Vec::new();
        let mut observations: Vec<RoleObservation> = Vec::new();

        let key = job.key();
        for role in ReplicaType::ALL
            .into_iter()
            .filter(|role| !job.spec.replica_specs.contains_key(role))
        {
            self.expectations
                .delete_expectations(&ExpectationKey::units(&key, role));
            self.expectations
                .delete_expectations(&ExpectationKey::records(&key, role));
        }

        let mut units_by_role = partition(units, Unit::replica_type);
        let mut records_by_role = partition(records, DiscoveryRecord::replica_type);

        for (role, spec) in &job.spec.replica_specs {
            let role_units = units_by_role.remove(role).unwrap_or_default();
            let role_records = records_by_role.remove(role).unwrap_or_default();

            let mut obs = self.reconcile_units(job, *role, spec, role_units).await?;
            failures.append(&mut obs.failures);
            failures.extend(
                self.reconcile_records(job, *role, spec, role_records)
                    .await,
            );
            observations.push(obs);
        }

        let verdict = status::apply_observations(job, &observations, now);
        debug!(?verdict, "Status evaluated");

        let pending = self.pending_roles(&key);
        if !pending.is_empty() {
            debug!(?pending, "Waiting on outstanding expectations");
        }

        if verdict == Verdict::Failed {
            let failed: Vec<Unit> = observations
                .iter_mut()
                .flat_map(|obs| std::mem::take(&mut obs.undeleted_failures))
                .collect();
            if !failed.is_empty() {
                info!(units = failed.len(), "Deleting failed units held back by expectations");
                failures.extend(self.delete_leftover(job, failed).await);
            }
        }

        if verdict == Verdict::Succeeded {
            // Non-primary units still running are no longer needed.
            let primary = job.primary_role();
            let leftover: Vec<Unit> = self
                .api
                .list_units(job.namespace(), job.name())
                .await?
                .into_iter()
                .filter(|u| {
                    u.owner
                        .as_ref()
                        .is_some_and(|o| o.controller && o.uid == job.metadata.uid)
                })
                .filter(|u| u.replica_type().is_some() && u.replica_type() != primary)
                .filter(|u| is_active(u) && !u.is_terminating())
                .collect();
            failures.extend(self.delete_leftover(job, leftover).await);
        }

        Ok(failures)
    }

    /// Delete units on top of what the role passes already expect.
    async fn delete_leftover(&self, job: &Job, units: Vec<Unit>) -> Vec<FailedOperation> {
        let key = job.key();
        let mut failures = Vec::new();
        for (role, units) in partition(units, Unit::replica_type) {
            let expectation = ExpectationKey::units(&key, role);
            self.expectations
                .raise_expectations(&expectation, 0, units.len() as u64);
            let calls = join_all(units.iter().map(|unit| async move {
                (unit.name.clone(), self.control.delete_unit(job, unit).await)
            }))
            .await;
            failures.extend(self.settle(&expectation, "delete unit", false, calls));
        }
        failures
    }

    /// Apply the clean pod policy to a finished job and zero its active counters.
    async fn clean_up_finished(
        &self,
        job: &mut Job,
        units: &[Unit],
        records: &[DiscoveryRecord],
    ) -> Vec<FailedOperation> {
        let policy = job.spec.run_policy.clean_pod_policy;
        let doomed: Vec<&Unit> = units
            .iter()
            .filter(|u| !u.is_terminating())
            .filter(|u| match policy {
                CleanPodPolicy::All => true,
                CleanPodPolicy::Running => is_active(u),
                CleanPodPolicy::None => false,
            })
            .collect();
        let exited: Vec<&Unit> = units
            .iter()
            .filter(|u| !u.is_terminating() && !doomed.iter().any(|d| d.name == u.name))
            .filter(|u| job.status.is_failed() && is_failed_exit(job, u))
            .collect();
        let doomed_records: Vec<&DiscoveryRecord> = records
            .iter()
            .filter(|r| !r.is_terminating())
            .filter(|r| match policy {
                CleanPodPolicy::All => true,
                CleanPodPolicy::Running => doomed.iter().any(|u| u.name == r.name),
                CleanPodPolicy::None => false,
            })
            .collect();

        if !doomed.is_empty() {
            info!(
                policy = ?policy,
                units = doomed.len(),
                "Cleaning up units of finished job"
            );
        }
        let mut failures = self
            .delete_all(job, doomed.into_iter(), doomed_records.into_iter())
            .await;
        failures.extend(self.delete_units(job, exited.into_iter()).await);
        reset_active(job);
        failures
    }

    async fn delete_all<'a>(
        &self,
        job: &Job,
        units: impl Iterator<Item = &'a Unit>,
        records: impl Iterator<Item = &'a DiscoveryRecord>,
    ) -> Vec<FailedOperation> {
        let mut failures = self.delete_units(job, units).await;
        let record_calls = join_all(records.filter(|r| !r.is_terminating()).map(|record| async move {
            (record.name.clone(), self.control.delete_record(job, record).await)
        }))
        .await;
        failures.extend(untracked_failures("delete record", record_calls));
        failures
    }

    /// Delete units outside of expectation tracking.
    async fn delete_units<'a>(
        &self,
        job: &Job,
        units: impl Iterator<Item = &'a Unit>,
    ) -> Vec<FailedOperation> {
        let calls = join_all(units.filter(|u| !u.is_terminating()).map(|unit| async move {
            (unit.name.clone(), self.control.delete_unit(job, unit).await)
        }))
        .await;
        untracked_failures("delete unit", calls)
    }
}

fn untracked_failures(
    operation: &'static str,
    results: Vec<(String, Result<(), crate::error::ControlError>)>,
) -> Vec<FailedOperation> {
    results
        .into_iter()
        .filter_map(|(name, result)| match result {
            Err(error) if !error.is_not_found() => Some(FailedOperation {
                operation,
                name,
                error,
            }),
            _ => None,
        })
        .collect()
}

fn partition<T, F>(items: Vec<T>, role_of: F) -> std::collections::BTreeMap<ReplicaType, Vec<T>>
where
    F: Fn(&T) -> Option<ReplicaType>,
{
    let mut by_role = std::collections::BTreeMap::<ReplicaType, Vec<T>>::new();
    for item in items {
        if let Some(role) = role_of(&item) {
            by_role.entry(role).or_default().push(item);
        }
    }
    by_role
}

fn is_active(unit: &Unit) -> bool {
    matches!(unit.phase(), UnitPhase::Pending | UnitPhase::Running)
}

/// A failed unit of an `ExitCode` role, which the controller deletes itself.
fn is_failed_exit(job: &Job, unit: &Unit) -> bool {
    unit.phase() == UnitPhase::Failed
        && unit
            .replica_type()
            .and_then(|role| job.spec.replica_specs.get(&role))
            .is_some_and(|spec| spec.restart_policy == RestartPolicy::ExitCode)
}

fn reset_active(job: &mut Job) {
    for status in job.status.replica_statuses.values_mut() {
        status.active = 0;
    }
}

/// Reject specs units cannot be built from.
fn validate(job: &Job) -> Result<(), String> {
    if job.spec.replica_specs.is_empty() {
        return Err("no replica specs".to_string());
    }
    if job.has_role(ReplicaType::Chief) && job.has_role(ReplicaType::Master) {
        return Err("chief and master are mutually exclusive".to_string());
    }
    for (role, spec) in &job.spec.replica_specs {
        spec.validate().map_err(|e| format!("{role}: {e}"))?;
    }
    Ok(())
}

fn exceeded_limit(
    job: &Job,
    units: &[Unit],
    now: chrono::DateTime<Utc>,
) -> Option<(&'static str, String)> {
    let key = job.key();
    if status::past_backoff_limit(job, units) {
        return Some((
            reasons::BACKOFF_LIMIT_EXCEEDED,
            format!("TFJob {key} has failed because it has reached the specified backoff limit"),
        ));
    }
    if status::past_active_deadline(job, now) {
        return Some((
            reasons::DEADLINE_EXCEEDED,
            format!("TFJob {key} has failed because it was active longer than specified deadline"),
        ));
    }
    None
}
