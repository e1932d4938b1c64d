//! tfop controller
//!
//! Development binary: runs the controller against an in-memory cluster,
//! optionally seeded with a job manifest.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tfop_controller::config::Config;
use tfop_controller::model::{Job, JobSpec};
use tfop_controller::store::InMemoryCluster;
use tfop_controller::Controller;
use tfop_events::LogRecorder;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Job submitted at startup from `TFOP_JOB_MANIFEST`.
#[derive(Debug, Deserialize)]
struct JobManifest {
    #[serde(default = "default_namespace")]
    namespace: String,
    name: String,
    spec: JobSpec,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn load_manifest(path: &str) -> Result<Job> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read job manifest {path}"))?;
    let manifest: JobManifest = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse job manifest {path}"))?;
    Ok(Job::new(manifest.namespace, manifest.name, manifest.spec))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        threads = config.threads,
        cluster_domain = config.cluster_domain.as_deref().unwrap_or(""),
        resync_secs = config.resync_interval.as_secs(),
        "Configuration loaded"
    );

    let cluster = Arc::new(InMemoryCluster::new());
    if let Some(path) = &config.job_manifest {
        let job = load_manifest(path)?;
        let job = cluster.submit_job(job)?;
        info!(job = %job.key(), "Submitted job manifest");
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller = Controller::new(cluster, Arc::new(LogRecorder), config);
    let controller_handle = tokio::spawn(controller.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Err(e) = controller_handle.await {
        error!(error = %e, "Controller task panicked");
    }

    info!("tfop controller stopped");
    Ok(())
}
