//! Job garbage collection
//!
//! Jobs the operator creates are one-shot. Succeeded jobs are deleted along
//! with their pods; failed jobs stay around for inspection.

use k8s_openapi::api::batch::v1::Job;
use kube::{
    api::{DeleteParams, PropagationPolicy},
    Api, Client,
};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::runtime::{split_key, WatchedCollection};

/// Label selector of the jobs the collector watches
pub const JOB_SELECTOR: &str = "app=workload-backup";

/// Whether `job` has completed successfully and can be deleted
pub fn should_collect(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .is_some_and(|succeeded| succeeded > 0)
}

/// Collect the job stored under `key` if it has succeeded
pub async fn collect(client: &Client, jobs: &WatchedCollection<Job>, key: &str) -> Result<()> {
    let Some(job) = jobs.get(key)? else {
        warn!(key, "Job does not exist anymore");
        return Ok(());
    };
    debug!(key, "Sync/Add/Update for Job");

    if !should_collect(&job) {
        return Ok(());
    }

    let (namespace, name) = split_key(key)?;
    let namespace = namespace.ok_or_else(|| Error::InvalidKey(key.to_string()))?;
    let api: Api<Job> = Api::namespaced(client.clone(), namespace);
    let params = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    };

    info!(namespace, name, "Deleting succeeded job");
    match api.delete(name, &params).await {
        Ok(_) => {
            metrics::JOBS_COLLECTED.with_label_values(&[namespace]).inc();
            info!(namespace, name, "Deleted job");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
