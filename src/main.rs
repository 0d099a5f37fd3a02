//! Workload Backup Kubernetes Operator
//!
//! Main entry point for the operator. Sets up the Kubernetes client,
//! starts one controller per watched kind, and runs them until shutdown.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::ReplicationController;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use workload_backup_operator::{
    config::Options,
    controllers::{self, Context, PolicyTarget},
    metrics,
    reconcilers::rbac,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    info!("Starting Workload Backup Operator");

    let options = Options::from_env()?;
    info!(
        image = %options.sidecar_image_ref(),
        enable_rbac = options.enable_rbac,
        workers_per_kind = options.workers_per_kind,
        max_num_requeues = options.max_num_requeues,
        "Loaded options"
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    if options.enable_rbac {
        rbac::ensure_sidecar_cluster_role(&client).await?;
    }

    let shutdown = CancellationToken::new();

    // Create shared context
    let policies = Arc::new(controllers::policy_collection(&client, &options));
    let metrics_port = options.metrics_port;
    let context = Arc::new(Context::new(
        client.clone(),
        options,
        policies.cache().clone(),
        shutdown.clone(),
    ));

    let replication_controllers =
        Arc::new(controllers::workload_collection::<ReplicationController>(&context));
    let replica_sets = Arc::new(controllers::workload_collection::<ReplicaSet>(&context));
    let deployments = Arc::new(controllers::workload_collection::<Deployment>(&context));
    let daemon_sets = Arc::new(controllers::workload_collection::<DaemonSet>(&context));
    let stateful_sets = Arc::new(controllers::workload_collection::<StatefulSet>(&context));
    let targets: Vec<Arc<dyn PolicyTarget>> = vec![
        replication_controllers.clone(),
        replica_sets.clone(),
        deployments.clone(),
        daemon_sets.clone(),
        stateful_sets.clone(),
    ];

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(metrics_port));
    info!("Metrics server starting on port {}", metrics_port);
    metrics::OPERATOR_HEALTH.set(1.0);

    // Run all controllers concurrently
    let workload_controllers = async {
        let (rc, rs, deploy, ds, sts) = tokio::join!(
            controllers::run_workload_controller(
                replication_controllers,
                context.clone(),
                shutdown.clone()
            ),
            controllers::run_workload_controller(replica_sets, context.clone(), shutdown.clone()),
            controllers::run_workload_controller(deployments, context.clone(), shutdown.clone()),
            controllers::run_workload_controller(daemon_sets, context.clone(), shutdown.clone()),
            controllers::run_workload_controller(stateful_sets, context.clone(), shutdown.clone()),
        );
        [rc, rs, deploy, ds, sts]
    };
    let policy_controller =
        controllers::run_policy_controller(policies, targets, context.clone(), shutdown.clone());
    let job_controller = controllers::run_job_controller(context.clone(), shutdown.clone());
    let recovery_controller = controllers::run_recovery_controller(context.clone());

    // Handle graceful shutdown: workers stop taking keys and pending
    // readiness waits are interrupted
    let watchdog = async {
        tokio::select! {
            _ = metrics_handle => {
                error!("Metrics server exited unexpectedly");
            }
            _ = shutdown_signal() => {
                info!("Received shutdown signal, stopping operator");
            }
        }
        shutdown.cancel();
    };

    let (workload_results, policy_result, job_result, (), ()) = tokio::join!(
        workload_controllers,
        policy_controller,
        job_controller,
        recovery_controller,
        watchdog
    );

    for result in workload_results {
        if let Err(e) = result {
            error!(error = %e, "Workload controller failed");
        }
    }
    if let Err(e) = policy_result {
        error!(error = %e, "BackupPolicy controller failed");
    }
    if let Err(e) = job_result {
        error!(error = %e, "Job controller failed");
    }

    metrics::OPERATOR_HEALTH.set(0.0);
    info!("Workload Backup Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
