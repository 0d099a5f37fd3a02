//! Recovery Custom Resource Definition

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{BackendSpec, Condition, LocalSpec};
use crate::workloads::WorkloadKind;

/// Recovery resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "backup.oso.sh",
    version = "v1alpha1",
    kind = "Recovery",
    plural = "recoveries",
    singular = "recovery",
    shortname = "rec",
    namespaced,
    status = "RecoveryStatus",
    printcolumn = r#"{"name": "Workload", "type": "string", "jsonPath": ".spec.workload.name"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySpec {
    /// Workload whose backups are restored
    pub workload: WorkloadRef,

    /// Backend holding the backups
    pub backend: BackendSpec,

    /// Paths to restore (empty = every backed up path)
    #[serde(default)]
    pub paths: Vec<String>,

    /// Volumes the restored data is written to
    pub recovered_volumes: Vec<LocalSpec>,

    /// Node to run on, for host-local data (DaemonSet workloads)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Pod ordinal whose backup is restored (StatefulSet workloads)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_ordinal: Option<String>,
}

/// Workload reference local to the Recovery's namespace
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub name: String,
}

/// Recovery lifecycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RecoveryPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RecoveryPhase {
    pub fn is_finished(&self) -> bool {
        matches!(self, RecoveryPhase::Succeeded | RecoveryPhase::Failed)
    }
}

/// Recovery status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStatus {
    /// Current phase
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RecoveryPhase>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Name of the restore Job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    /// Start time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Completion time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Observed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
