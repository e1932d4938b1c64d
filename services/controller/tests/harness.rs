//! Test harness for controller integration tests.
//!
//! Wires a controller to an in-memory cluster and feeds notifications to the
//! handler synchronously, so a test decides exactly when observations land.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tfop_controller::config::Config;
use tfop_controller::error::ControllerResult;
use tfop_controller::model::{
    Job, JobKey, JobSpec, ReplicaSpec, ReplicaType, RestartPolicy, UnitPhase, UnitTemplate,
};
use tfop_controller::reconciler::{ExpectationKey, JobExpectations};
use tfop_controller::store::{ClusterApi, ClusterEvent, InMemoryCluster};
use tfop_controller::Controller;
use tfop_events::MemoryRecorder;
use tokio::sync::broadcast;

pub const NAMESPACE: &str = "default";

pub struct Harness {
    pub cluster: Arc<InMemoryCluster>,
    pub recorder: Arc<MemoryRecorder>,
    pub controller: Controller,
    events: broadcast::Receiver<ClusterEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let cluster = Arc::new(InMemoryCluster::new());
        let recorder = Arc::new(MemoryRecorder::new());
        let events = cluster.subscribe();
        let controller = Controller::new(cluster.clone(), recorder.clone(), config);
        Self {
            cluster,
            recorder,
            controller,
            events,
        }
    }

    pub fn submit(&self, job: Job) -> JobKey {
        self.cluster.submit_job(job).unwrap().key()
    }

    /// Deliver every pending notification to the handler.
    pub async fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.controller.handler().handle(&event).await;
        }
    }

    /// One reconciliation pass, without delivering notifications first.
    pub async fn sync_raw(&self, key: &JobKey) -> ControllerResult<Option<Duration>> {
        self.controller.reconciler().sync_job(key).await
    }

    /// Deliver notifications, run one pass, deliver what it caused.
    pub async fn sync(&mut self, key: &JobKey) -> ControllerResult<Option<Duration>> {
        self.drain().await;
        let result = self.sync_raw(key).await;
        self.drain().await;
        result
    }

    pub fn job(&self, key: &JobKey) -> Job {
        self.cluster.job(key).unwrap()
    }

    pub fn expectations(&self) -> &Arc<JobExpectations> {
        self.controller.reconciler().expectations()
    }

    pub fn unit_names(&self) -> Vec<String> {
        self.cluster.unit_names(NAMESPACE)
    }

    pub fn set_phase(&self, name: &str, phase: UnitPhase) {
        self.cluster.set_unit_phase(NAMESPACE, name, phase).unwrap();
    }

    /// Move every unit of the namespace to Running.
    pub fn run_all(&self) {
        for name in self.unit_names() {
            self.set_phase(&name, UnitPhase::Running);
        }
    }

    pub async fn units_of(&self, key: &JobKey) -> usize {
        self.cluster
            .list_units(&key.namespace, &key.name)
            .await
            .unwrap()
            .len()
    }

    pub fn unit_adds(&self, key: &JobKey, role: ReplicaType) -> u64 {
        self.expectations()
            .get(&ExpectationKey::units(key, role))
            .map_or(0, |c| c.adds)
    }
}

/// Job `name` in the default namespace with the given roles.
pub fn job_with(name: &str, roles: &[(ReplicaType, i32, RestartPolicy)]) -> Job {
    let mut spec = JobSpec::default();
    for (role, replicas, policy) in roles {
        spec.replica_specs.insert(
            *role,
            ReplicaSpec::new(*replicas, UnitTemplate::with_image("tensorflow/tensorflow:2.15"))
                .with_restart_policy(*policy),
        );
    }
    Job::new(NAMESPACE, name, spec)
}

pub fn workers(name: &str, replicas: i32) -> Job {
    job_with(name, &[(ReplicaType::Worker, replicas, RestartPolicy::Never)])
}
