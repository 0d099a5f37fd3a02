//! Job controller
//!
//! Watches the jobs the operator labels as its own and collects succeeded ones.

use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use kube::{runtime::watcher::Config as WatcherConfig, Api};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::controllers::Context;
use crate::error::Result;
use crate::metrics;
use crate::reconcilers::jobs;
use crate::runtime::{run_workers, WatchedCollection};

/// Run the job controller until `shutdown` fires
pub async fn run(ctx: Arc<Context>, shutdown: CancellationToken) -> Result<()> {
    let collection = WatchedCollection::<Job>::new(
        "Job",
        Api::all(ctx.client.clone()),
        WatcherConfig::default().labels(jobs::JOB_SELECTOR),
        ctx.options.rate_limiter(),
    );

    info!(selector = jobs::JOB_SELECTOR, "Starting job controller");
    metrics::expect_sync();

    let watch = collection.run(shutdown);
    let workers = async {
        if let Err(e) = collection.wait_until_synced().await {
            error!(error = %e, "Job cache did not sync");
            return;
        }
        metrics::mark_synced();

        let reconcile = |key: String| {
            let (client, collection) = (&ctx.client, &collection);
            async move { jobs::collect(client, collection, &key).await }
        };
        run_workers(
            "Job",
            collection.queue().clone(),
            ctx.options.workers_per_kind,
            ctx.options.max_num_requeues,
            reconcile,
        )
        .await;
    };

    let (result, ()) = tokio::join!(watch, workers);
    info!("Job controller stopped");
    result
}
