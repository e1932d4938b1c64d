//! Job status and condition bookkeeping.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ReplicaType;

/// Condition reasons written by the controller.
pub mod reasons {
    pub const JOB_CREATED: &str = "JobCreated";
    pub const JOB_RUNNING: &str = "JobRunning";
    pub const JOB_RESTARTING: &str = "JobRestarting";
    pub const JOB_SUCCEEDED: &str = "JobSucceeded";
    pub const JOB_FAILED: &str = "JobFailed";
    pub const BACKOFF_LIMIT_EXCEEDED: &str = "BackoffLimitExceeded";
    pub const DEADLINE_EXCEEDED: &str = "DeadlineExceeded";
    pub const INVALID_REPLICA_SPEC: &str = "InvalidReplicaSpec";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobConditionType {
    Created,
    Running,
    Restarting,
    Succeeded,
    Failed,
}

impl JobConditionType {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobConditionType::Succeeded | JobConditionType::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub condition_type: JobConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_update_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
}

/// Observed unit counts of one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaStatus {
    #[serde(default)]
    pub active: i32,
    #[serde(default)]
    pub succeeded: i32,
    #[serde(default)]
    pub failed: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub conditions: Vec<JobCondition>,

    #[serde(default)]
    pub replica_statuses: BTreeMap<ReplicaType, ReplicaStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn condition(&self, condition_type: JobConditionType) -> Option<&JobCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Whether a condition of this type is present with status True.
    pub fn has_condition(&self, condition_type: JobConditionType) -> bool {
        self.condition(condition_type)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    pub fn is_succeeded(&self) -> bool {
        self.has_condition(JobConditionType::Succeeded)
    }

    pub fn is_failed(&self) -> bool {
        self.has_condition(JobConditionType::Failed)
    }

    pub fn is_finished(&self) -> bool {
        self.is_succeeded() || self.is_failed()
    }

    pub fn replica_status(&self, role: ReplicaType) -> ReplicaStatus {
        self.replica_statuses.get(&role).copied().unwrap_or_default()
    }

    /// Record a True condition of `condition_type`.
    pub fn update_conditions(
        &mut self,
        condition_type: JobConditionType,
        reason: &str,
        message: impl Into<String>,
    ) {
        self.update_conditions_at(condition_type, reason, message, Utc::now());
    }

    /// Record a True condition with an explicit timestamp.
    ///
    /// Frozen once Failed is present. Re-inserting the same type, status and
    /// reason is a no-op. The previous entry of the type is dropped and the new
    /// one appended; its transition time is kept when only the reason changed.
    /// Running and Restarting replace each other, and a terminal condition turns
    /// an existing Running entry False.
    pub fn update_conditions_at(
        &mut self,
        condition_type: JobConditionType,
        reason: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        if self.is_failed() {
            return;
        }

        let status = ConditionStatus::True;
        let mut last_transition_time = now;
        if let Some(current) = self.condition(condition_type) {
            if current.status == status && current.reason == reason {
                return;
            }
            if current.status == status {
                last_transition_time = current.last_transition_time;
            }
        }

        let mut conditions: Vec<JobCondition> = std::mem::take(&mut self.conditions)
            .into_iter()
            .filter(|c| !replaces(condition_type, c.condition_type))
            .collect();

        if condition_type.is_terminal() {
            for c in conditions
                .iter_mut()
                .filter(|c| c.condition_type == JobConditionType::Running)
            {
                c.status = ConditionStatus::False;
            }
        }

        conditions.push(JobCondition {
            condition_type,
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_update_time: now,
            last_transition_time,
        });
        self.conditions = conditions;
    }
}

fn replaces(incoming: JobConditionType, existing: JobConditionType) -> bool {
    use JobConditionType::{Restarting, Running};

    incoming == existing
        || (incoming == Running && existing == Restarting)
        || (incoming == Restarting && existing == Running)
}
