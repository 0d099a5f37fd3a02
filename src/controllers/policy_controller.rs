//! BackupPolicy controller
//!
//! Policies are not mutated here. A policy change is fanned out to the work
//! queues of every workload it may affect, and the workload reconcilers
//! take it from there.

use std::sync::Arc;

use kube::{runtime::watcher::Config as WatcherConfig, Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Options;
use crate::controllers::Context;
use crate::crd::BackupPolicy;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::policy;
use crate::runtime::{object_key, run_workers, split_key, WatchedCollection};
use crate::workloads::Workload;

/// A set of workloads that reacts to policy changes
pub trait PolicyTarget: Send + Sync {
    /// Enqueue every workload the change of policy `namespace/name` may
    /// affect; `policy` is `None` once the policy is deleted. Returns the
    /// number of enqueued keys.
    fn enqueue_affected(&self, namespace: &str, name: &str, policy: Option<&BackupPolicy>) -> usize;
}

impl<K: Workload> PolicyTarget for WatchedCollection<K> {
    fn enqueue_affected(&self, namespace: &str, name: &str, policy: Option<&BackupPolicy>) -> usize {
        let mut enqueued = 0;
        for workload in self.list_namespace(namespace) {
            if policy::is_affected_by(workload.as_ref(), name, policy) {
                self.queue().add(object_key(workload.as_ref()));
                enqueued += 1;
            }
        }
        enqueued
    }
}

/// Build the watched collection of BackupPolicies
pub fn collection(client: &Client, options: &Options) -> WatchedCollection<BackupPolicy> {
    WatchedCollection::new(
        "BackupPolicy",
        Api::all(client.clone()),
        WatcherConfig::default(),
        options.rate_limiter(),
    )
}

fn fan_out(
    policies: &WatchedCollection<BackupPolicy>,
    targets: &[Arc<dyn PolicyTarget>],
    key: &str,
) -> Result<()> {
    let (namespace, name) = split_key(key)?;
    let namespace = namespace.ok_or_else(|| Error::InvalidKey(key.to_string()))?;
    let current = policies.get(key)?;

    match current.as_deref() {
        Some(policy) => {
            if let Err(e) = policy::validate(policy) {
                warn!(namespace, name, error = %e, "BackupPolicy is invalid");
            }
            debug!(namespace, name, "Sync/Add/Update for BackupPolicy");
        }
        None => info!(namespace, name, "BackupPolicy deleted"),
    }

    let enqueued: usize = targets
        .iter()
        .map(|target| target.enqueue_affected(namespace, name, current.as_deref()))
        .sum();
    debug!(namespace, name, enqueued, "Enqueued affected workloads");
    Ok(())
}

/// Run the BackupPolicy controller until `shutdown` fires
pub async fn run(
    policies: Arc<WatchedCollection<BackupPolicy>>,
    targets: Vec<Arc<dyn PolicyTarget>>,
    ctx: Arc<Context>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Starting BackupPolicy controller");
    metrics::expect_sync();

    let watch = policies.run(shutdown);
    let workers = async {
        if let Err(e) = policies.wait_until_synced().await {
            error!(error = %e, "BackupPolicy cache did not sync");
            return;
        }
        metrics::mark_synced();

        let reconcile = |key: String| {
            let policies = policies.clone();
            let targets = &targets;
            async move { fan_out(&policies, targets, &key) }
        };
        run_workers(
            "BackupPolicy",
            policies.queue().clone(),
            ctx.options.workers_per_kind,
            ctx.options.max_num_requeues,
            reconcile,
        )
        .await;
    };

    let (result, ()) = tokio::join!(watch, workers);
    info!("BackupPolicy controller stopped");
    result
}
