//! End-to-end tests: the full controller loop against the in-memory cluster.

mod harness;

use std::sync::Arc;
use std::time::Duration;

use harness::{workers, NAMESPACE};
use tfop_controller::config::Config;
use tfop_controller::model::{JobConditionType, JobKey, UnitPhase};
use tfop_controller::store::{ClusterApi, InMemoryCluster};
use tfop_controller::Controller;
use tfop_events::MemoryRecorder;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    if tokio::time::timeout(WAIT, poll).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}

fn start(cluster: &Arc<InMemoryCluster>, threads: usize) -> (watch::Sender<bool>, JoinHandle<()>) {
    let config = Config {
        threads,
        ..Config::default()
    };
    let controller = Controller::new(cluster.clone(), Arc::new(MemoryRecorder::new()), config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(controller.run(shutdown_rx));
    (shutdown_tx, handle)
}

async fn stop(shutdown: watch::Sender<bool>, handle: JoinHandle<()>) {
    shutdown.send(true).unwrap();
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("controller stops on shutdown")
        .unwrap();
}

fn has_condition(cluster: &InMemoryCluster, key: &JobKey, condition: JobConditionType) -> bool {
    cluster
        .job(key)
        .is_some_and(|job| job.status.has_condition(condition))
}

#[tokio::test]
async fn test_existing_job_runs_to_completion() {
    let cluster = Arc::new(InMemoryCluster::new());
    let key = cluster.submit_job(workers("mnist", 2)).unwrap().key();
    let (shutdown, handle) = start(&cluster, 2);

    eventually("units to be created", || {
        cluster.unit_names(NAMESPACE).len() == 2
    })
    .await;
    assert_eq!(cluster.record_names(NAMESPACE).len(), 2);

    for name in cluster.unit_names(NAMESPACE) {
        cluster
            .set_unit_phase(NAMESPACE, &name, UnitPhase::Running)
            .unwrap();
    }
    eventually("job to run", || {
        has_condition(&cluster, &key, JobConditionType::Running)
    })
    .await;

    cluster.terminate_unit(NAMESPACE, "mnist-worker-0", 0).unwrap();
    eventually("job to succeed", || {
        has_condition(&cluster, &key, JobConditionType::Succeeded)
    })
    .await;

    // Default clean pod policy removes the worker that is still running.
    eventually("running worker cleanup", || {
        cluster.unit_names(NAMESPACE) == vec!["mnist-worker-0"]
    })
    .await;

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn test_job_submitted_while_running_is_picked_up() {
    let cluster = Arc::new(InMemoryCluster::new());
    let (shutdown, handle) = start(&cluster, 1);

    let key = cluster.submit_job(workers("late", 3)).unwrap().key();
    eventually("units to be created", || {
        cluster.unit_names(NAMESPACE).len() == 3
    })
    .await;
    eventually("created condition", || {
        has_condition(&cluster, &key, JobConditionType::Created)
    })
    .await;

    // Removing the job garbage-collects its units.
    cluster.remove_job(&key).unwrap();
    eventually("garbage collection", || {
        cluster.unit_names(NAMESPACE).is_empty()
    })
    .await;

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn test_lost_unit_is_replaced() {
    let cluster = Arc::new(InMemoryCluster::new());
    let key = cluster.submit_job(workers("mnist", 2)).unwrap().key();
    let (shutdown, handle) = start(&cluster, 1);

    eventually("units to be created", || {
        cluster.unit_names(NAMESPACE).len() == 2
    })
    .await;
    eventually("created condition", || {
        has_condition(&cluster, &key, JobConditionType::Created)
    })
    .await;

    cluster.delete_unit(NAMESPACE, "mnist-worker-1").await.unwrap();
    eventually("replacement unit", || {
        cluster.unit(NAMESPACE, "mnist-worker-1").is_some()
    })
    .await;

    stop(shutdown, handle).await;
}
