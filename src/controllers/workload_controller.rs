//! Workload controller
//!
//! Watches one workload kind and reconciles every changed workload.

use std::sync::Arc;

use kube::runtime::watcher::Config as WatcherConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::controllers::Context;
use crate::error::Result;
use crate::metrics;
use crate::reconcilers::workload as workload_reconciler;
use crate::runtime::{run_workers, WatchedCollection};
use crate::workloads::Workload;

/// Build the watched collection of workload kind `K`
pub fn collection<K: Workload>(ctx: &Context) -> WatchedCollection<K> {
    WatchedCollection::new(
        K::KIND.as_str(),
        kube::Api::all(ctx.client.clone()),
        WatcherConfig::default(),
        ctx.options.rate_limiter(),
    )
}

/// Run the controller of workload kind `K` until `shutdown` fires
pub async fn run<K: Workload>(
    collection: Arc<WatchedCollection<K>>,
    ctx: Arc<Context>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(kind = %K::KIND, "Starting workload controller");
    metrics::expect_sync();

    let watch = collection.run(shutdown);
    let workers = async {
        if let Err(e) = collection.wait_until_synced().await {
            error!(kind = %K::KIND, error = %e, "Cache did not sync");
            return;
        }
        // Reconciling against an empty policy cache would strip every sidecar
        if let Err(e) = ctx.policies.wait_until_ready().await {
            error!(kind = %K::KIND, error = %e, "BackupPolicy cache did not sync");
            return;
        }
        metrics::mark_synced();

        let reconcile = |key: String| {
            let collection = collection.clone();
            let ctx = ctx.clone();
            async move { workload_reconciler::reconcile(&ctx, &collection, &key).await }
        };
        run_workers(
            K::KIND.as_str(),
            collection.queue().clone(),
            ctx.options.workers_per_kind,
            ctx.options.max_num_requeues,
            reconcile,
        )
        .await;
    };

    let (result, ()) = tokio::join!(watch, workers);
    info!(kind = %K::KIND, "Workload controller stopped");
    result
}
