//! BackupPolicy Custom Resource Definition

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, PersistentVolumeClaimVolumeSource, ResourceRequirements, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// BackupPolicy resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "backup.oso.sh",
    version = "v1alpha1",
    kind = "BackupPolicy",
    plural = "backuppolicies",
    singular = "backuppolicy",
    shortname = "bp",
    namespaced,
    status = "BackupPolicyStatus",
    printcolumn = r#"{"name": "Mode", "type": "string", "jsonPath": ".spec.mode"}"#,
    printcolumn = r#"{"name": "Schedule", "type": "string", "jsonPath": ".spec.schedule"}"#,
    printcolumn = r#"{"name": "Backups", "type": "integer", "jsonPath": ".status.backupCount"}"#,
    printcolumn = r#"{"name": "Last Backup", "type": "string", "jsonPath": ".status.lastBackupTime"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicySpec {
    /// Selects the workloads (by pod template labels) this policy applies to
    pub selector: LabelSelector,

    /// Cron schedule of the backup cycle
    pub schedule: String,

    /// How the backup container runs alongside the workload
    #[serde(default)]
    pub mode: BackupMode,

    /// Paths to back up
    #[serde(default)]
    pub file_groups: Vec<FileGroup>,

    /// Backend the backup container writes to
    pub backend: BackendSpec,

    /// Workload volumes mounted into the backup container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    /// Compute resources of the backup container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Backup container placement
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// Sidecar container running for the life of the pod
    #[default]
    Online,
    /// Init container running a single backup pass per pod start
    Offline,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Online => "online",
            BackupMode::Offline => "offline",
        }
    }
}

/// A path backed up as one snapshot series
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileGroup {
    /// Absolute path inside the backup container
    pub path: String,

    /// Tags attached to snapshots of this path
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Backend specification
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    /// Secret holding repository credentials, in the workload's namespace
    pub storage_secret_name: String,

    /// Volume local to the pod
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalSpec>,

    /// S3 compatible object store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<ObjectStoreSpec>,

    /// Google Cloud Storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcs: Option<ObjectStoreSpec>,

    /// Azure Blob storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azure: Option<ObjectStoreSpec>,
}

/// Object store location
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStoreSpec {
    /// Bucket or container name
    pub bucket: String,

    /// Custom endpoint (for MinIO, Ceph, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Path prefix within the bucket
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// A volume mounted into the backup or restore container
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalSpec {
    /// Mount path inside the container
    pub mount_path: String,

    /// Sub-path within the volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,

    /// Host directory backing the volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,

    /// PVC backing the volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_name: Option<String>,
}

impl LocalSpec {
    /// Build the pod volume named `name` for this spec
    pub fn to_volume(&self, name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            host_path: self.host_path.as_ref().map(|path| HostPathVolumeSource {
                path: path.clone(),
                type_: None,
            }),
            persistent_volume_claim: self.claim_name.as_ref().map(|claim| {
                PersistentVolumeClaimVolumeSource {
                    claim_name: claim.clone(),
                    read_only: None,
                }
            }),
            ..Default::default()
        }
    }

    /// Build the container mount of the volume named `name`
    pub fn to_volume_mount(&self, name: &str) -> VolumeMount {
        VolumeMount {
            name: name.to_string(),
            mount_path: self.mount_path.clone(),
            sub_path: self.sub_path.clone(),
            ..Default::default()
        }
    }
}

/// BackupPolicy status, written by the backup containers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicyStatus {
    /// Number of successful backups
    #[serde(default)]
    pub backup_count: i64,

    /// Number of failed backups
    #[serde(default)]
    pub failure_count: i64,

    /// First backup timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_backup_time: Option<DateTime<Utc>>,

    /// Last backup timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup_time: Option<DateTime<Utc>>,

    /// Duration of the last backup (e.g. "1m3s")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup_duration: Option<String>,
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Reason for the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
