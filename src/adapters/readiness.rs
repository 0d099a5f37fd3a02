//! Readiness barriers
//!
//! A mutation of a workload is complete only once its controller has rolled
//! the new template out and the pods reflect it.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{DeleteParams, ListParams},
    core::Selector,
    Api, Client, ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::reconcilers::injection::pod_has_backup_container;
use crate::workloads::Workload;

/// How barriers poll the API server
#[derive(Clone, Debug)]
pub struct Barrier {
    pub poll_interval: Duration,
    pub timeout: Option<Duration>,
    /// Process shutdown; a pending wait then fails with a transient error
    pub shutdown: CancellationToken,
}

impl Barrier {
    async fn run<F, Fut>(&self, what: &str, mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let poll = async {
            loop {
                if check().await? {
                    return Ok(());
                }
                debug!(barrier = %what, "Not ready yet");
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        let bounded = async {
            match self.timeout {
                Some(timeout) => tokio::time::timeout(timeout, poll)
                    .await
                    .map_err(|_| Error::readiness(format!("timed out waiting for {}", what)))?,
                None => poll.await,
            }
        };

        tokio::select! {
            result = bounded => result,
            _ = self.shutdown.cancelled() => {
                Err(Error::readiness(format!("shutting down while waiting for {}", what)))
            }
        }
    }
}

/// Wait until the workload's controller reports the template rollout complete
pub async fn wait_until_rollout_complete<K: Workload>(
    api: &Api<K>,
    name: &str,
    barrier: &Barrier,
) -> Result<()> {
    let what = format!("{} {} rollout", K::KIND, name);
    barrier
        .run(&what, move || async move {
            let current = api
                .get_opt(name)
                .await?
                .ok_or_else(|| Error::readiness(format!("{} {} disappeared", K::KIND, name)))?;
            Ok::<_, Error>(current.rollout_complete())
        })
        .await
}

/// Wait until every pod under `selector` runs the backup container.
///
/// With `recycle`, pods still lacking it are deleted on every poll so their
/// controller recreates them from the new template.
pub async fn wait_until_sidecar_added(
    client: &Client,
    namespace: &str,
    selector: &LabelSelector,
    recycle: bool,
    barrier: &Barrier,
) -> Result<()> {
    wait_for_pods(client, namespace, selector, true, recycle, barrier).await
}

/// Wait until no pod under `selector` runs the backup container.
///
/// With `recycle`, pods still carrying it are deleted on every poll.
pub async fn wait_until_sidecar_removed(
    client: &Client,
    namespace: &str,
    selector: &LabelSelector,
    recycle: bool,
    barrier: &Barrier,
) -> Result<()> {
    wait_for_pods(client, namespace, selector, false, recycle, barrier).await
}

/// Pods whose backup container presence differs from `present`
pub fn stale_pods(pods: &[Pod], present: bool) -> Vec<&Pod> {
    pods.iter()
        .filter(|pod| pod_has_backup_container(pod) != present)
        .collect()
}

/// Names of the stale pods that are not terminating yet
pub fn pods_to_recycle(stale: &[&Pod]) -> Vec<String> {
    stale
        .iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .map(|pod| pod.name_any())
        .collect()
}

async fn wait_for_pods(
    client: &Client,
    namespace: &str,
    selector: &LabelSelector,
    present: bool,
    recycle: bool,
    barrier: &Barrier,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let parsed = Selector::try_from(selector.clone())
        .map_err(|e| Error::validation(format!("Invalid workload selector: {}", e)))?;
    let params = ListParams::default().labels_from(&parsed);
    let (pods, params) = (&pods, &params);
    let what = if present {
        format!("backup container on pods in {}", namespace)
    } else {
        format!("backup container removal from pods in {}", namespace)
    };

    barrier
        .run(&what, move || async move {
            let list = pods.list(params).await?;
            let stale = stale_pods(&list.items, present);
            if stale.is_empty() {
                return Ok(true);
            }
            if recycle {
                for name in pods_to_recycle(&stale) {
                    delete_pod(pods, &name).await?;
                }
            }
            Ok::<_, Error>(false)
        })
        .await
}

async fn delete_pod(pods: &Api<Pod>, name: &str) -> Result<()> {
    match pods.delete(name, &DeleteParams::background()).await {
        Ok(_) => {
            info!(pod = %name, "Deleted pod running an outdated template");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
