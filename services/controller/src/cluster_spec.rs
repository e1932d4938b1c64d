//! Rendezvous document builder.
//!
//! Every unit of a distributed job receives a `TF_CONFIG` environment entry
//! describing the addresses of its peers and its own position among them.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::{Job, ReplicaType};

/// Environment entry holding the rendezvous document.
pub const ENV_TF_CONFIG: &str = "TF_CONFIG";

#[derive(Debug, Serialize)]
struct RendezvousDocument {
    cluster: BTreeMap<&'static str, RoleAddresses>,
    task: TaskSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    environment: Option<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RoleAddresses {
    Dense(Vec<String>),
    Sparse(BTreeMap<i32, String>),
}

#[derive(Debug, Serialize)]
struct TaskSpec {
    #[serde(rename = "type")]
    role: &'static str,
    index: i32,
}

/// Builds rendezvous documents for units of a job.
#[derive(Debug, Clone, Default)]
pub struct ClusterSpecBuilder {
    domain: Option<String>,
}

impl ClusterSpecBuilder {
    /// `domain` is appended to every peer address when set and non-empty.
    pub fn new(domain: Option<String>) -> Self {
        Self {
            domain: domain.filter(|d| !d.is_empty()),
        }
    }

    /// Stable address of the unit `role`/`index`.
    pub fn address(&self, job: &Job, role: ReplicaType, index: i32, port: i32) -> String {
        let host = format!(
            "{}-{}-{}.{}.svc",
            job.name(),
            role.as_str(),
            index,
            job.namespace()
        );
        match &self.domain {
            Some(domain) => format!("{host}.{domain}:{port}"),
            None => format!("{host}:{port}"),
        }
    }

    /// Rendezvous JSON for the unit `role`/`index`; `None` for jobs that are not distributed.
    pub fn build(
        &self,
        job: &Job,
        role: ReplicaType,
        index: i32,
    ) -> Result<Option<String>, serde_json::Error> {
        if !job.is_distributed() {
            return Ok(None);
        }

        let sparse = job.spec.enable_dynamic_worker;
        let mut cluster = BTreeMap::new();
        for (rtype, spec) in &job.spec.replica_specs {
            if spec.replicas <= 0 {
                continue;
            }
            let port = spec.template.port();

            if sparse && *rtype == ReplicaType::Worker {
                // Dynamic workers only learn their own address; peers join and leave.
                if role == ReplicaType::Worker {
                    let own = BTreeMap::from([(index, self.address(job, *rtype, index, port))]);
                    cluster.insert(rtype.as_str(), RoleAddresses::Sparse(own));
                }
                continue;
            }

            let addresses = (0..spec.replicas)
                .map(|i| self.address(job, *rtype, i, port))
                .collect();
            cluster.insert(rtype.as_str(), RoleAddresses::Dense(addresses));
        }

        let document = RendezvousDocument {
            cluster,
            task: TaskSpec {
                role: role.as_str(),
                index,
            },
            environment: (!sparse).then_some("cloud"),
        };
        serde_json::to_string(&document).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerPort, JobSpec, ReplicaSpec, UnitTemplate, DEFAULT_PORT_NAME};

    fn job(roles: &[(ReplicaType, i32)]) -> Job {
        let mut spec = JobSpec::default();
        for (role, replicas) in roles {
            spec.replica_specs.insert(
                *role,
                ReplicaSpec::new(*replicas, UnitTemplate::with_image("tf:2")),
            );
        }
        Job::new("ns2", "dist", spec)
    }

    #[test]
    fn test_worker_and_ps_with_domain() {
        let job = job(&[(ReplicaType::Worker, 1), (ReplicaType::ParameterServer, 1)]);
        let builder = ClusterSpecBuilder::new(Some("tf.training.org".to_string()));

        let doc = builder.build(&job, ReplicaType::Worker, 0).unwrap().unwrap();
        assert_eq!(
            doc,
            r#"{"cluster":{"ps":["dist-ps-0.ns2.svc.tf.training.org:2222"],"worker":["dist-worker-0.ns2.svc.tf.training.org:2222"]},"task":{"type":"worker","index":0},"environment":"cloud"}"#
        );
    }

    #[test]
    fn test_without_domain() {
        let job = job(&[(ReplicaType::Worker, 2), (ReplicaType::ParameterServer, 1)]);
        let doc = ClusterSpecBuilder::new(Some(String::new()))
            .build(&job, ReplicaType::ParameterServer, 0)
            .unwrap()
            .unwrap();
        assert_eq!(
            doc,
            r#"{"cluster":{"ps":["dist-ps-0.ns2.svc:2222"],"worker":["dist-worker-0.ns2.svc:2222","dist-worker-1.ns2.svc:2222"]},"task":{"type":"ps","index":0},"environment":"cloud"}"#
        );
    }

    #[test]
    fn test_single_worker_gets_nothing() {
        let job = job(&[(ReplicaType::Worker, 1)]);
        assert!(ClusterSpecBuilder::default()
            .build(&job, ReplicaType::Worker, 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_zero_replica_roles_are_omitted() {
        let job = job(&[
            (ReplicaType::Worker, 2),
            (ReplicaType::Evaluator, 0),
        ]);
        let doc = ClusterSpecBuilder::default()
            .build(&job, ReplicaType::Worker, 1)
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert!(value["cluster"].get("evaluator").is_none());
        assert_eq!(value["task"]["index"], 1);
    }

    #[test]
    fn test_custom_port() {
        let mut job = job(&[(ReplicaType::Worker, 2)]);
        if let Some(spec) = job.spec.replica_specs.get_mut(&ReplicaType::Worker) {
            spec.template.containers[0].ports.push(ContainerPort {
                name: DEFAULT_PORT_NAME.to_string(),
                container_port: 4000,
            });
        }
        let doc = ClusterSpecBuilder::default()
            .build(&job, ReplicaType::Worker, 0)
            .unwrap()
            .unwrap();
        assert!(doc.contains("dist-worker-1.ns2.svc:4000"));
    }

    #[test]
    fn test_sparse_document_for_dynamic_workers() {
        let mut job = job(&[(ReplicaType::Worker, 3), (ReplicaType::ParameterServer, 1)]);
        job.spec.enable_dynamic_worker = true;
        let builder = ClusterSpecBuilder::default();

        let doc = builder.build(&job, ReplicaType::Worker, 1).unwrap().unwrap();
        assert_eq!(
            doc,
            r#"{"cluster":{"ps":["dist-ps-0.ns2.svc:2222"],"worker":{"1":"dist-worker-1.ns2.svc:2222"}},"task":{"type":"worker","index":1}}"#
        );

        let ps_doc = builder
            .build(&job, ReplicaType::ParameterServer, 0)
            .unwrap()
            .unwrap();
        assert_eq!(
            ps_doc,
            r#"{"cluster":{"ps":["dist-ps-0.ns2.svc:2222"]},"task":{"type":"ps","index":0}}"#
        );
    }
}
