//! Leader lock cleanup
//!
//! The injected containers elect one pod per workload to run the backup
//! cycle, using a ConfigMap as the lock. The operator never takes the lock;
//! it only deletes it once the workload or its sidecar is gone.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{api::DeleteParams, Api, Client};
use tracing::{info, warn};

use crate::workloads::WorkloadReference;

/// Delete the leader lock of `workload`. Failures are logged, not returned:
/// a leftover lock is harmless and is reused if the workload comes back.
pub async fn delete_configmap_lock(client: &Client, workload: &WorkloadReference) {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &workload.namespace);
    let name = workload.lock_name();
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => info!(lock = %name, workload = %workload, "Deleted leader lock"),
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => warn!(lock = %name, workload = %workload, error = %e, "Failed to delete leader lock"),
    }
}
