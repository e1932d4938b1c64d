//! Training job resource.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tfop_events::ObjectRef;
use uuid::Uuid;

use super::JobStatus;

/// API version stamped into owner references.
pub const API_VERSION: &str = "tfop.dev/v1";

/// Kind of the job resource.
pub const KIND: &str = "TFJob";

/// Container that receives the rendezvous document and reports the exit code.
pub const DEFAULT_CONTAINER_NAME: &str = "tensorflow";

/// Name of the container port used for peer addresses.
pub const DEFAULT_PORT_NAME: &str = "tfjob-port";

/// Peer port used when the template does not declare one.
pub const DEFAULT_PORT: i32 = 2222;

// =============================================================================
// Roles
// =============================================================================

/// Functional category of a training process.
///
/// Declaration order is reconciliation priority: parameter servers come up
/// before workers, workers before the chief/master, evaluators last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaType {
    #[serde(rename = "ps")]
    ParameterServer,
    Worker,
    Chief,
    Master,
    Evaluator,
}

impl ReplicaType {
    /// All roles in reconciliation priority order.
    pub const ALL: [ReplicaType; 5] = [
        ReplicaType::ParameterServer,
        ReplicaType::Worker,
        ReplicaType::Chief,
        ReplicaType::Master,
        ReplicaType::Evaluator,
    ];

    /// Lowercase wire name, used in labels, unit names and the rendezvous document.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaType::ParameterServer => "ps",
            ReplicaType::Worker => "worker",
            ReplicaType::Chief => "chief",
            ReplicaType::Master => "master",
            ReplicaType::Evaluator => "evaluator",
        }
    }
}

impl std::fmt::Display for ReplicaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ps" => Ok(ReplicaType::ParameterServer),
            "worker" => Ok(ReplicaType::Worker),
            "chief" => Ok(ReplicaType::Chief),
            "master" => Ok(ReplicaType::Master),
            "evaluator" => Ok(ReplicaType::Evaluator),
            other => Err(format!("unknown replica type '{other}'")),
        }
    }
}

// =============================================================================
// Policies
// =============================================================================

/// Restart policy declared on a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    #[default]
    Never,
    /// The controller inspects the exit code and decides whether to recreate.
    ExitCode,
}

/// Restart policy understood by the orchestration platform itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NativeRestartPolicy {
    Always,
    OnFailure,
    #[default]
    Never,
}

impl RestartPolicy {
    /// Translate to the platform policy.
    ///
    /// `ExitCode` maps to `Never`: the platform must not restart the unit in
    /// place, because the controller decides after reading the exit code.
    pub fn to_native(self) -> NativeRestartPolicy {
        match self {
            RestartPolicy::Always => NativeRestartPolicy::Always,
            RestartPolicy::OnFailure => NativeRestartPolicy::OnFailure,
            RestartPolicy::Never | RestartPolicy::ExitCode => NativeRestartPolicy::Never,
        }
    }

    /// Policies under which the platform restarts containers in place.
    pub fn restarts_in_place(self) -> bool {
        matches!(self, RestartPolicy::Always | RestartPolicy::OnFailure)
    }
}

/// Which units to delete once the job is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CleanPodPolicy {
    /// Delete units that are still pending or running.
    #[default]
    Running,
    /// Delete every unit.
    All,
    /// Keep everything.
    None,
}

/// Job-wide restart, deadline and cleanup policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunPolicy {
    #[serde(default)]
    pub clean_pod_policy: CleanPodPolicy,

    /// Maximum seconds the job may run after it started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    /// Maximum total in-place container restarts before the job fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
}

/// When a worker-only job counts as succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SuccessPolicy {
    /// Worker 0 succeeded.
    #[default]
    Default,
    /// Every worker succeeded.
    AllWorkers,
}

// =============================================================================
// Templates
// =============================================================================

/// Environment entry of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Named container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub name: String,
    pub container_port: i32,
}

/// A container of a unit template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
}

impl Container {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            args: Vec::new(),
            env: Vec::new(),
            ports: Vec::new(),
        }
    }
}

/// What to launch for each unit of a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UnitTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

impl UnitTemplate {
    /// Template with a single default container running `image`.
    pub fn with_image(image: impl Into<String>) -> Self {
        Self {
            labels: BTreeMap::new(),
            containers: vec![Container::new(DEFAULT_CONTAINER_NAME, image)],
        }
    }

    /// Port peers use to reach units of this template.
    pub fn port(&self) -> i32 {
        self.containers
            .iter()
            .filter(|c| c.name == DEFAULT_CONTAINER_NAME)
            .flat_map(|c| c.ports.iter())
            .find(|p| p.name == DEFAULT_PORT_NAME)
            .map_or(DEFAULT_PORT, |p| p.container_port)
    }
}

/// Desired state of one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSpec {
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    pub template: UnitTemplate,

    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

fn default_replicas() -> i32 {
    1
}

impl ReplicaSpec {
    pub fn new(replicas: i32, template: UnitTemplate) -> Self {
        Self {
            replicas,
            template,
            restart_policy: RestartPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Check that units can be built from this spec.
    pub fn validate(&self) -> Result<(), String> {
        if self.replicas < 0 {
            return Err(format!("replicas must not be negative, got {}", self.replicas));
        }
        if self.template.containers.is_empty() {
            return Err("template has no containers".to_string());
        }
        if !self
            .template
            .containers
            .iter()
            .any(|c| c.name == DEFAULT_CONTAINER_NAME)
        {
            return Err(format!(
                "template has no container named '{DEFAULT_CONTAINER_NAME}'"
            ));
        }
        if self.template.containers.iter().any(|c| c.image.is_empty()) {
            return Err("template has a container without an image".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Job
// =============================================================================

/// Desired state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobSpec {
    pub replica_specs: BTreeMap<ReplicaType, ReplicaSpec>,

    #[serde(default)]
    pub run_policy: RunPolicy,

    #[serde(default)]
    pub success_policy: SuccessPolicy,

    /// Allow the worker count to change while training is running.
    #[serde(default)]
    pub enable_dynamic_worker: bool,
}

/// Identity and bookkeeping of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: Uuid,

    /// Bumped by the store on every write; used for optimistic updates.
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// Reference from a unit or record back to the job controlling it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: Uuid,
    pub controller: bool,
    pub block_owner_deletion: bool,
}

/// Namespace-qualified job name, the unit of work on the queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl JobKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for JobKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(format!("invalid job key '{s}', expected namespace/name")),
        }
    }
}

/// A distributed training job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
    #[serde(default)]
    pub status: JobStatus,
}

impl Job {
    /// A fresh job with a new uid and empty status.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: JobSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                uid: Uuid::new_v4(),
                resource_version: 0,
                deletion_timestamp: None,
            },
            spec,
            status: JobStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Desired replicas of `role`, zero when the role is absent.
    pub fn replicas(&self, role: ReplicaType) -> i32 {
        self.spec
            .replica_specs
            .get(&role)
            .map_or(0, |spec| spec.replicas.max(0))
    }

    pub fn has_role(&self, role: ReplicaType) -> bool {
        self.spec.replica_specs.contains_key(&role)
    }

    pub fn has_chief_or_master(&self) -> bool {
        self.has_role(ReplicaType::Chief) || self.has_role(ReplicaType::Master)
    }

    /// Role whose success completes the job: Chief, else Master, else Worker.
    pub fn primary_role(&self) -> Option<ReplicaType> {
        [ReplicaType::Chief, ReplicaType::Master, ReplicaType::Worker]
            .into_iter()
            .find(|role| self.has_role(*role))
    }

    /// Whether the unit `role`/`index` plays the master role.
    ///
    /// With a chief or master present that role is master; otherwise worker 0 is.
    pub fn is_master_role(&self, role: ReplicaType, index: i32) -> bool {
        if self.has_chief_or_master() {
            return matches!(role, ReplicaType::Chief | ReplicaType::Master);
        }
        role == ReplicaType::Worker && index == 0
    }

    /// Whether units need the rendezvous document to find their peers.
    pub fn is_distributed(&self) -> bool {
        let total: i32 = self
            .spec
            .replica_specs
            .values()
            .map(|spec| spec.replicas.max(0))
            .sum();
        total > 1 || self.has_role(ReplicaType::Chief)
    }

    /// Controller owner reference stamped on every unit and record.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid,
            controller: true,
            block_owner_deletion: true,
        }
    }

    /// Reference used when recording events about this job.
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(KIND, &self.metadata.namespace, &self.metadata.name)
            .with_uid(self.metadata.uid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn job(roles: &[(ReplicaType, i32)]) -> Job {
        let mut spec = JobSpec::default();
        for (role, replicas) in roles {
            spec.replica_specs.insert(
                *role,
                ReplicaSpec::new(*replicas, UnitTemplate::with_image("tf:2")),
            );
        }
        Job::new("default", "mnist", spec)
    }

    #[rstest]
    #[case(&[(ReplicaType::Worker, 1)], false)]
    #[case(&[(ReplicaType::Worker, 1), (ReplicaType::ParameterServer, 1)], true)]
    #[case(&[(ReplicaType::Worker, 0), (ReplicaType::ParameterServer, 1)], false)]
    #[case(&[(ReplicaType::Worker, 1), (ReplicaType::Chief, 1)], true)]
    #[case(&[(ReplicaType::Chief, 1)], true)]
    #[case(&[(ReplicaType::Worker, 3)], true)]
    fn test_is_distributed(#[case] roles: &[(ReplicaType, i32)], #[case] expected: bool) {
        assert_eq!(job(roles).is_distributed(), expected);
    }

    #[rstest]
    #[case(RestartPolicy::ExitCode, NativeRestartPolicy::Never)]
    #[case(RestartPolicy::Never, NativeRestartPolicy::Never)]
    #[case(RestartPolicy::Always, NativeRestartPolicy::Always)]
    #[case(RestartPolicy::OnFailure, NativeRestartPolicy::OnFailure)]
    fn test_restart_policy_translation(
        #[case] declared: RestartPolicy,
        #[case] expected: NativeRestartPolicy,
    ) {
        assert_eq!(declared.to_native(), expected);
    }

    #[test]
    fn test_primary_role_precedence() {
        assert_eq!(
            job(&[(ReplicaType::Worker, 2), (ReplicaType::Chief, 1)]).primary_role(),
            Some(ReplicaType::Chief)
        );
        assert_eq!(
            job(&[(ReplicaType::Worker, 2), (ReplicaType::Master, 1)]).primary_role(),
            Some(ReplicaType::Master)
        );
        assert_eq!(
            job(&[(ReplicaType::Worker, 2), (ReplicaType::ParameterServer, 1)]).primary_role(),
            Some(ReplicaType::Worker)
        );
        assert_eq!(job(&[(ReplicaType::ParameterServer, 1)]).primary_role(), None);
    }

    #[test]
    fn test_master_role() {
        let worker_only = job(&[(ReplicaType::Worker, 2)]);
        assert!(worker_only.is_master_role(ReplicaType::Worker, 0));
        assert!(!worker_only.is_master_role(ReplicaType::Worker, 1));

        let with_chief = job(&[(ReplicaType::Worker, 2), (ReplicaType::Chief, 1)]);
        assert!(with_chief.is_master_role(ReplicaType::Chief, 0));
        assert!(!with_chief.is_master_role(ReplicaType::Worker, 0));
    }

    #[test]
    fn test_replica_type_order_is_priority() {
        let mut roles = vec![
            ReplicaType::Evaluator,
            ReplicaType::Chief,
            ReplicaType::Worker,
            ReplicaType::ParameterServer,
        ];
        roles.sort();
        assert_eq!(
            roles,
            vec![
                ReplicaType::ParameterServer,
                ReplicaType::Worker,
                ReplicaType::Chief,
                ReplicaType::Evaluator,
            ]
        );
    }

    #[test]
    fn test_job_key_parse() {
        let key: JobKey = "ns1/mnist".parse().unwrap();
        assert_eq!(key, JobKey::new("ns1", "mnist"));
        assert_eq!(key.to_string(), "ns1/mnist");
        assert!("mnist".parse::<JobKey>().is_err());
        assert!("a/b/c".parse::<JobKey>().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_default_container() {
        let mut spec = ReplicaSpec::new(1, UnitTemplate::with_image("tf:2"));
        assert!(spec.validate().is_ok());

        spec.template.containers[0].name = "sidecar".to_string();
        assert!(spec.validate().unwrap_err().contains("tensorflow"));

        spec.template.containers.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_template_port_override() {
        let mut template = UnitTemplate::with_image("tf:2");
        assert_eq!(template.port(), DEFAULT_PORT);

        template.containers[0].ports.push(ContainerPort {
            name: DEFAULT_PORT_NAME.to_string(),
            container_port: 3333,
        });
        assert_eq!(template.port(), 3333);
    }

    #[test]
    fn test_replica_spec_deserialize_defaults() {
        let spec: ReplicaSpec = serde_json::from_value(serde_json::json!({
            "template": {"containers": [{"name": "tensorflow", "image": "tf:2"}]}
        }))
        .unwrap();
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.restart_policy, RestartPolicy::Never);
    }
}
