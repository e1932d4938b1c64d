//! Workload units and discovery records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Container, Job, NativeRestartPolicy, OwnerReference, ReplicaType, DEFAULT_CONTAINER_NAME};

/// Label keys stamped on every unit and record.
pub mod labels {
    pub const GROUP_NAME: &str = "group-name";
    pub const JOB_NAME: &str = "job-name";
    pub const REPLICA_TYPE: &str = "replica-type";
    pub const REPLICA_INDEX: &str = "replica-index";
    pub const JOB_ROLE: &str = "job-role";

    /// Value of the `group-name` label.
    pub const GROUP_NAME_VALUE: &str = "tfop.dev";

    /// Value of the `job-role` label on the master unit.
    pub const MASTER: &str = "master";
}

/// Name shared by the unit and discovery record of one ordinal.
pub fn general_name(job_name: &str, role: ReplicaType, index: i32) -> String {
    format!("{job_name}-{}-{index}", role.as_str())
}

/// Labels identifying every object of a job.
pub fn job_labels(job_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::GROUP_NAME.to_string(), labels::GROUP_NAME_VALUE.to_string()),
        (labels::JOB_NAME.to_string(), job_name.replace('/', "-")),
    ])
}

/// Labels identifying the object of one role ordinal.
pub fn replica_labels(job: &Job, role: ReplicaType, index: i32) -> BTreeMap<String, String> {
    let mut labels = job_labels(job.name());
    labels.insert(labels::REPLICA_TYPE.to_string(), role.as_str().to_string());
    labels.insert(labels::REPLICA_INDEX.to_string(), index.to_string());
    if job.is_master_role(role, index) {
        labels.insert(labels::JOB_ROLE.to_string(), labels::MASTER.to_string());
    }
    labels
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum UnitPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl UnitPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitPhase::Succeeded | UnitPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,

    /// Exit code of the last termination, if the container terminated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default)]
    pub restart_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnitStatus {
    #[serde(default)]
    pub phase: UnitPhase,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

/// One running instance of a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub owner: Option<OwnerReference>,
    #[serde(default)]
    pub restart_policy: NativeRestartPolicy,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl Unit {
    pub fn replica_type(&self) -> Option<ReplicaType> {
        self.labels
            .get(labels::REPLICA_TYPE)
            .and_then(|s| s.parse().ok())
    }

    /// Ordinal from the `replica-index` label; `None` when missing or invalid.
    pub fn replica_index(&self) -> Option<i32> {
        parse_index(&self.labels)
    }

    pub fn phase(&self) -> UnitPhase {
        self.status.phase
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Exit code of the default container, if it terminated.
    pub fn exit_code(&self) -> Option<i32> {
        self.status
            .container_statuses
            .iter()
            .find(|c| c.name == DEFAULT_CONTAINER_NAME)
            .and_then(|c| c.exit_code)
    }

    /// Sum of restart counts over all containers.
    pub fn restart_count(&self) -> i32 {
        self.status
            .container_statuses
            .iter()
            .map(|c| c.restart_count)
            .sum()
    }

    /// Value of an environment entry in the default container.
    pub fn env(&self, name: &str) -> Option<&str> {
        self.containers
            .iter()
            .find(|c| c.name == DEFAULT_CONTAINER_NAME)
            .and_then(|c| c.env.iter().find(|e| e.name == name))
            .map(|e| e.value.as_str())
    }
}

/// Headless network record giving a unit a stable address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub owner: Option<OwnerReference>,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl DiscoveryRecord {
    pub fn replica_type(&self) -> Option<ReplicaType> {
        self.labels
            .get(labels::REPLICA_TYPE)
            .and_then(|s| s.parse().ok())
    }

    pub fn replica_index(&self) -> Option<i32> {
        parse_index(&self.labels)
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

fn parse_index(labels: &BTreeMap<String, String>) -> Option<i32> {
    labels
        .get(labels::REPLICA_INDEX)
        .and_then(|s| s.parse::<i32>().ok())
        .filter(|i| *i >= 0)
}
