//! Recovery controller
//!
//! Watches Recovery resources and the restore jobs they own, until the
//! operator-wide shutdown token fires.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        watcher::Config as WatcherConfig,
    },
    Api, ResourceExt,
};
use tracing::{error, info, instrument, warn};

use crate::controllers::Context;
use crate::crd::{Recovery, RecoveryPhase};
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::{jobs::JOB_SELECTOR, recovery as recovery_reconciler};

/// Run the Recovery controller
pub async fn run(context: Arc<Context>) {
    let api: Api<Recovery> = Api::all(context.client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("Recovery CRD not installed: {}", e);
        return;
    }

    info!("Starting Recovery controller");

    let jobs: Api<Job> = Api::all(context.client.clone());
    let shutdown = context.shutdown.clone();
    Controller::new(api, WatcherConfig::default())
        .owns(jobs, WatcherConfig::default().labels(JOB_SELECTOR))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled Recovery"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS.with_label_values(&["Recovery"]).inc();
                }
            }
        })
        .await;
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<Recovery>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&["Recovery"])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&["Recovery"]).inc();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let generation = obj.metadata.generation.unwrap_or(0);

    // Check if we've already processed this generation
    if let Some(status) = &obj.status {
        if status.observed_generation == Some(generation) {
            match status.phase {
                Some(phase) if phase.is_finished() => return Ok(Action::await_change()),
                Some(RecoveryPhase::Running) => {
                    return recovery_reconciler::monitor(&obj, &ctx.client).await;
                }
                _ => {}
            }
        }
    }

    // Validate the spec
    if let Err(e) = recovery_reconciler::validate(&obj) {
        warn!(error = %e, "Validation failed");
        recovery_reconciler::update_status_failed(&obj, &ctx.client, &namespace, &e.to_string())
            .await?;
        return Ok(Action::requeue(Duration::from_secs(300)));
    }

    recovery_reconciler::execute(&obj, &ctx.client, &ctx.options).await
}

/// Error policy for the controller
fn error_policy(obj: Arc<Recovery>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    error!(
        name = %name,
        error = %error,
        "Reconciliation failed, scheduling retry"
    );

    let requeue_duration = match error {
        Error::Kube(_) => Duration::from_secs(30),
        Error::SecretNotFound(_) => Duration::from_secs(60),
        e if e.is_terminal() => Duration::from_secs(300),
        _ => Duration::from_secs(30),
    };

    Action::requeue(requeue_duration)
}
