//! Custom Resource Definitions for the Workload Backup Operator

mod backup_policy;
mod recovery;

pub use backup_policy::*;
pub use recovery::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Vec<String> {
    vec![
        serde_yaml::to_string(&BackupPolicy::crd()).unwrap(),
        serde_yaml::to_string(&Recovery::crd()).unwrap(),
    ]
}
