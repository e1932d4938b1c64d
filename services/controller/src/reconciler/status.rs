//! Completion and condition state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::RoleObservation;
use crate::model::{
    reasons, Job, JobConditionType, ReplicaType, RestartPolicy, SuccessPolicy, Unit, UnitPhase,
};

/// Verdict of the state machine for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Verdict {
    Pending,
    Running,
    Restarting,
    Succeeded,
    Failed,
}

/// Whether the primary role finished successfully.
///
/// A chief or master primary needs every replica succeeded. A worker primary
/// needs ordinal 0 succeeded, or every worker under the `AllWorkers` policy.
pub fn is_primary_completed(job: &Job, observations: &[RoleObservation]) -> bool {
    let Some(primary) = job.primary_role() else {
        return false;
    };
    let Some(obs) = observations.iter().find(|o| o.role == primary) else {
        return false;
    };

    let all_succeeded = obs.replicas > 0 && obs.status.succeeded >= obs.replicas;
    match primary {
        ReplicaType::Worker if job.spec.success_policy == SuccessPolicy::Default => {
            obs.ordinal_zero_phase == Some(UnitPhase::Succeeded)
        }
        _ => all_succeeded,
    }
}

/// Whether in-place restarts of running units reached the backoff limit.
///
/// Only units of `OnFailure`/`Always` roles that are still pending or running
/// count. A limit of zero trips on the first restart.
pub fn past_backoff_limit(job: &Job, units: &[Unit]) -> bool {
    let Some(limit) = job.spec.run_policy.backoff_limit else {
        return false;
    };

    let restarts: i32 = units
        .iter()
        .filter(|u| matches!(u.phase(), UnitPhase::Pending | UnitPhase::Running))
        .filter(|u| {
            u.replica_type()
                .and_then(|role| job.spec.replica_specs.get(&role))
                .is_some_and(|spec| spec.restart_policy.restarts_in_place())
        })
        .map(Unit::restart_count)
        .sum();

    if limit == 0 {
        restarts > 0
    } else {
        restarts >= limit
    }
}

/// Whether the job ran longer than its active deadline.
pub fn past_active_deadline(job: &Job, now: DateTime<Utc>) -> bool {
    match (job.spec.run_policy.active_deadline_seconds, job.status.start_time) {
        (Some(deadline), Some(start)) => (now - start).num_seconds() > deadline,
        _ => false,
    }
}

/// Delay until the active deadline of a started job.
pub fn deadline_requeue(job: &Job, now: DateTime<Utc>) -> Option<Duration> {
    let deadline = job.spec.run_policy.active_deadline_seconds?;
    let start = job.status.start_time?;
    let remaining = start + chrono::Duration::seconds(deadline) - now;
    Some(remaining.to_std().unwrap_or(Duration::ZERO))
}

/// Fold role observations into the job status.
pub(super) fn apply_observations(
    job: &mut Job,
    observations: &[RoleObservation],
    now: DateTime<Utc>,
) -> Verdict {
    for obs in observations {
        job.status.replica_statuses.insert(obs.role, obs.status);
    }

    let running = observations.iter().any(|o| o.status.active > 0);
    if running && job.status.start_time.is_none() {
        job.status.start_time = Some(now);
    }

    let key = job.key();
    if let Some(message) = failure_message(job, observations) {
        job.status
            .update_conditions_at(JobConditionType::Failed, reasons::JOB_FAILED, message, now);
        job.status.completion_time.get_or_insert(now);
        return Verdict::Failed;
    }

    if is_primary_completed(job, observations) {
        job.status.update_conditions_at(
            JobConditionType::Succeeded,
            reasons::JOB_SUCCEEDED,
            format!("TFJob {key} successfully completed."),
            now,
        );
        job.status.completion_time.get_or_insert(now);
        return Verdict::Succeeded;
    }

    if let Some(obs) = observations.iter().find(|o| o.restarting) {
        job.status.update_conditions_at(
            JobConditionType::Restarting,
            reasons::JOB_RESTARTING,
            format!(
                "TFJob {key} is restarting because a {} replica failed with a retryable exit code.",
                obs.role
            ),
            now,
        );
        return Verdict::Restarting;
    }

    if running {
        job.status.update_conditions_at(
            JobConditionType::Running,
            reasons::JOB_RUNNING,
            format!("TFJob {key} is running."),
            now,
        );
        return Verdict::Running;
    }

    Verdict::Pending
}

fn failure_message(job: &Job, observations: &[RoleObservation]) -> Option<String> {
    let key = job.key();
    if let Some(message) = observations.iter().find_map(|o| o.permanent_failure.as_ref()) {
        return Some(format!("TFJob {key} has failed: {message}."));
    }

    let primary = job.primary_role();
    observations
        .iter()
        .filter(|o| o.restart_policy != RestartPolicy::ExitCode && o.status.failed > 0)
        .find(|o| {
            let primary_unit_failed = match primary {
                Some(ReplicaType::Worker) if o.role == ReplicaType::Worker => {
                    o.ordinal_zero_phase == Some(UnitPhase::Failed)
                }
                Some(p) => p == o.role && p != ReplicaType::Worker,
                None => false,
            };
            o.status.failed >= o.replicas || primary_unit_failed
        })
        .map(|o| {
            format!(
                "TFJob {key} has failed because {} {} replica(s) failed.",
                o.status.failed, o.role
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        JobSpec, NativeRestartPolicy, ReplicaSpec, ReplicaStatus, UnitStatus, UnitTemplate,
        labels, ContainerStatus,
    };
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn job(roles: &[(ReplicaType, i32, RestartPolicy)]) -> Job {
        let mut spec = JobSpec::default();
        for (role, replicas, policy) in roles {
            spec.replica_specs.insert(
                *role,
                ReplicaSpec::new(*replicas, UnitTemplate::with_image("tf:2"))
                    .with_restart_policy(*policy),
            );
        }
        Job::new("default", "mnist", spec)
    }

    fn obs(
        role: ReplicaType,
        replicas: i32,
        (active, succeeded, failed): (i32, i32, i32),
        ordinal_zero_phase: Option<UnitPhase>,
    ) -> RoleObservation {
        RoleObservation {
            role,
            replicas,
            restart_policy: RestartPolicy::Never,
            status: ReplicaStatus {
                active,
                succeeded,
                failed,
            },
            ordinal_zero_phase,
            restarting: false,
            permanent_failure: None,
            undeleted_failures: Vec::new(),
            creates: 0,
            deletes: 0,
            failures: Vec::new(),
        }
    }

    fn unit(role: ReplicaType, phase: UnitPhase, restarts: i32) -> Unit {
        Unit {
            name: format!("mnist-{role}-0"),
            namespace: "default".to_string(),
            labels: BTreeMap::from([(labels::REPLICA_TYPE.to_string(), role.to_string())]),
            owner: None,
            restart_policy: NativeRestartPolicy::OnFailure,
            containers: Vec::new(),
            status: UnitStatus {
                phase,
                container_statuses: vec![ContainerStatus {
                    name: "tensorflow".to_string(),
                    exit_code: None,
                    restart_count: restarts,
                }],
            },
            deletion_timestamp: None,
        }
    }

    #[test]
    fn test_chief_drives_completion() {
        let job = job(&[
            (ReplicaType::Chief, 1, RestartPolicy::Never),
            (ReplicaType::Worker, 2, RestartPolicy::Never),
        ]);

        let workers_done_chief_running = [
            obs(ReplicaType::Worker, 2, (0, 2, 0), Some(UnitPhase::Succeeded)),
            obs(ReplicaType::Chief, 1, (1, 0, 0), Some(UnitPhase::Running)),
        ];
        assert!(!is_primary_completed(&job, &workers_done_chief_running));

        let chief_done = [
            obs(ReplicaType::Worker, 2, (2, 0, 0), Some(UnitPhase::Running)),
            obs(ReplicaType::Chief, 1, (0, 1, 0), Some(UnitPhase::Succeeded)),
        ];
        assert!(is_primary_completed(&job, &chief_done));
    }

    #[test]
    fn test_worker_primary_needs_ordinal_zero() {
        let mut job = job(&[(ReplicaType::Worker, 3, RestartPolicy::Never)]);

        let w1_done = [obs(ReplicaType::Worker, 3, (2, 1, 0), Some(UnitPhase::Running))];
        assert!(!is_primary_completed(&job, &w1_done));

        let w0_done = [obs(ReplicaType::Worker, 3, (2, 1, 0), Some(UnitPhase::Succeeded))];
        assert!(is_primary_completed(&job, &w0_done));

        job.spec.success_policy = SuccessPolicy::AllWorkers;
        assert!(!is_primary_completed(&job, &w0_done));
        let all_done = [obs(ReplicaType::Worker, 3, (0, 3, 0), Some(UnitPhase::Succeeded))];
        assert!(is_primary_completed(&job, &all_done));
    }

    #[test]
    fn test_ps_only_never_completes() {
        let job = job(&[(ReplicaType::ParameterServer, 1, RestartPolicy::Never)]);
        let done = [obs(ReplicaType::ParameterServer, 1, (0, 1, 0), Some(UnitPhase::Succeeded))];
        assert!(!is_primary_completed(&job, &done));
    }

    #[rstest]
    // One of two workers failed, but not ordinal 0.
    #[case((1, 0, 1), Some(UnitPhase::Running), false)]
    // Ordinal 0 is the primary unit.
    #[case((1, 0, 1), Some(UnitPhase::Failed), true)]
    // Every replica failed.
    #[case((0, 0, 2), Some(UnitPhase::Failed), true)]
    #[case((2, 0, 0), Some(UnitPhase::Running), false)]
    fn test_worker_failure_rule(
        #[case] counts: (i32, i32, i32),
        #[case] ordinal_zero: Option<UnitPhase>,
        #[case] failed: bool,
    ) {
        let mut job = job(&[(ReplicaType::Worker, 2, RestartPolicy::Never)]);
        let observations = [obs(ReplicaType::Worker, 2, counts, ordinal_zero)];
        let verdict = apply_observations(&mut job, &observations, Utc::now());
        assert_eq!(verdict == Verdict::Failed, failed);
        assert_eq!(job.status.is_failed(), failed);
    }

    #[test]
    fn test_exit_code_role_ignores_failed_counter() {
        let mut job = job(&[(ReplicaType::Worker, 1, RestartPolicy::ExitCode)]);
        let mut o = obs(ReplicaType::Worker, 1, (0, 0, 1), Some(UnitPhase::Failed));
        o.restart_policy = RestartPolicy::ExitCode;
        o.restarting = true;

        let verdict = apply_observations(&mut job, &[o], Utc::now());
        assert_eq!(verdict, Verdict::Restarting);
        assert!(job.status.has_condition(JobConditionType::Restarting));
        assert!(!job.status.is_failed());
    }

    #[test]
    fn test_permanent_failure_fails_job() {
        let mut job = job(&[(ReplicaType::Worker, 1, RestartPolicy::ExitCode)]);
        let mut o = obs(ReplicaType::Worker, 1, (0, 0, 1), Some(UnitPhase::Failed));
        o.restart_policy = RestartPolicy::ExitCode;
        o.permanent_failure = Some("unit default/mnist-worker-0 exited with permanent code 1".into());

        let now = Utc::now();
        assert_eq!(apply_observations(&mut job, &[o], now), Verdict::Failed);
        let failed = job.status.condition(JobConditionType::Failed).unwrap();
        assert_eq!(failed.reason, reasons::JOB_FAILED);
        assert!(failed.message.contains("permanent code 1"));
        assert_eq!(job.status.completion_time, Some(now));
    }

    #[test]
    fn test_start_time_set_once() {
        let mut job = job(&[(ReplicaType::Worker, 1, RestartPolicy::Never)]);
        let t0 = Utc::now();
        let running = [obs(ReplicaType::Worker, 1, (1, 0, 0), Some(UnitPhase::Running))];

        assert_eq!(apply_observations(&mut job, &running, t0), Verdict::Running);
        apply_observations(&mut job, &running, t0 + chrono::Duration::seconds(30));
        assert_eq!(job.status.start_time, Some(t0));
    }

    #[test]
    fn test_pending_sets_nothing() {
        let mut job = job(&[(ReplicaType::Worker, 1, RestartPolicy::Never)]);
        let pending = [obs(ReplicaType::Worker, 1, (0, 0, 0), Some(UnitPhase::Pending))];
        assert_eq!(apply_observations(&mut job, &pending, Utc::now()), Verdict::Pending);
        assert!(job.status.conditions.is_empty());
        assert!(job.status.start_time.is_none());
    }

    #[rstest]
    #[case(None, 5, false)]
    #[case(Some(0), 0, false)]
    #[case(Some(0), 1, true)]
    #[case(Some(3), 2, false)]
    #[case(Some(3), 3, true)]
    fn test_backoff_limit(#[case] limit: Option<i32>, #[case] restarts: i32, #[case] past: bool) {
        let mut job = job(&[(ReplicaType::Worker, 1, RestartPolicy::OnFailure)]);
        job.spec.run_policy.backoff_limit = limit;
        let units = [unit(ReplicaType::Worker, UnitPhase::Running, restarts)];
        assert_eq!(past_backoff_limit(&job, &units), past);
    }

    #[test]
    fn test_backoff_ignores_never_roles_and_finished_units() {
        let mut job = job(&[
            (ReplicaType::Worker, 1, RestartPolicy::Never),
            (ReplicaType::ParameterServer, 1, RestartPolicy::OnFailure),
        ]);
        job.spec.run_policy.backoff_limit = Some(1);

        let units = [
            unit(ReplicaType::Worker, UnitPhase::Running, 4),
            unit(ReplicaType::ParameterServer, UnitPhase::Failed, 4),
        ];
        assert!(!past_backoff_limit(&job, &units));
    }

    #[test]
    fn test_active_deadline() {
        let mut job = job(&[(ReplicaType::Worker, 1, RestartPolicy::Never)]);
        let start = Utc::now();
        job.spec.run_policy.active_deadline_seconds = Some(60);
        assert!(!past_active_deadline(&job, start));

        job.status.start_time = Some(start);
        assert!(!past_active_deadline(&job, start + chrono::Duration::seconds(60)));
        assert!(past_active_deadline(&job, start + chrono::Duration::seconds(61)));

        assert_eq!(
            deadline_requeue(&job, start + chrono::Duration::seconds(20)),
            Some(Duration::from_secs(40))
        );
        assert_eq!(
            deadline_requeue(&job, start + chrono::Duration::seconds(90)),
            Some(Duration::ZERO)
        );
    }
}
