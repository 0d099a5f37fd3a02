//! Recovery reconciler
//!
//! Handles the business logic for restore requests including:
//! - Spec validation
//! - Restore job creation
//! - Outcome tracking from the job status

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Patch, PatchParams, PostParams},
    runtime::controller::Action,
    Api, Client, Resource, ResourceExt,
};
use serde_json::json;
use tracing::{debug, info, warn};

use super::policy::{validate_backend, validate_local};
use super::rbac::{self, APP_LABEL_VALUE};
use crate::adapters::secrets;
use crate::config::Options;
use crate::crd::{Recovery, RecoveryPhase};
use crate::error::{Error, Result};
use crate::metrics;
use crate::workloads::WorkloadKind;

const FIELD_MANAGER: &str = "workload-backup-operator";
const RECOVERED_VOLUME_PREFIX: &str = "recovered";
const RESTORE_BACKOFF_LIMIT: i32 = 3;

/// Name of the restore job of `recovery`
pub fn job_name(recovery: &Recovery) -> String {
    format!("recover-{}", recovery.name_any())
}

/// Validate the Recovery spec
pub fn validate(recovery: &Recovery) -> Result<()> {
    let spec = &recovery.spec;

    if spec.workload.name.is_empty() {
        return Err(Error::validation("Target workload name must be specified"));
    }

    validate_backend(&spec.backend)?;

    if spec.recovered_volumes.is_empty() {
        return Err(Error::validation(
            "At least one recovered volume must be specified",
        ));
    }
    for volume in &spec.recovered_volumes {
        validate_local(volume)?;
    }

    if let Some(path) = spec.paths.iter().find(|p| !p.starts_with('/')) {
        return Err(Error::validation(format!(
            "Recovery path '{}' must be absolute",
            path
        )));
    }

    match spec.workload.kind {
        WorkloadKind::StatefulSet if spec.pod_ordinal.is_none() => Err(Error::validation(
            "StatefulSet recoveries must specify podOrdinal",
        )),
        WorkloadKind::DaemonSet if spec.node_name.is_none() => Err(Error::validation(
            "DaemonSet recoveries must specify nodeName",
        )),
        _ => Ok(()),
    }
}

/// Build the one-shot restore job of `recovery`
pub fn build_job(recovery: &Recovery, options: &Options) -> Result<Job> {
    let spec = &recovery.spec;
    let name = job_name(recovery);
    let owner = recovery
        .controller_owner_ref(&())
        .ok_or_else(|| Error::config("Recovery has no uid and cannot own a job"))?;

    let mut volumes: Vec<Volume> = Vec::new();
    let mut mounts: Vec<VolumeMount> = Vec::new();
    for (i, local) in spec.recovered_volumes.iter().enumerate() {
        let volume_name = format!("{}-{}", RECOVERED_VOLUME_PREFIX, i);
        volumes.push(local.to_volume(&volume_name));
        mounts.push(local.to_volume_mount(&volume_name));
    }
    if let Some(local) = &spec.backend.local {
        volumes.push(local.to_volume(super::injection::LOCAL_VOLUME));
        mounts.push(local.to_volume_mount(super::injection::LOCAL_VOLUME));
    }

    let mut args = vec![
        "recover".to_string(),
        format!("--recovery-name={}", recovery.name_any()),
        format!("--workload-kind={}", spec.workload.kind),
        format!("--workload-name={}", spec.workload.name),
        format!("--image-tag={}", options.sidecar_image_tag),
    ];
    if let Some(ordinal) = &spec.pod_ordinal {
        args.push(format!("--pod-ordinal={}", ordinal));
    }
    args.extend(spec.paths.iter().map(|p| format!("--path={}", p)));

    let labels = [("app".to_string(), APP_LABEL_VALUE.to_string())]
        .into_iter()
        .collect();

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: recovery.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(RESTORE_BACKOFF_LIMIT),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: super::injection::BACKUP_CONTAINER.to_string(),
                        image: Some(options.sidecar_image_ref()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        args: Some(args),
                        env: Some(vec![EnvVar {
                            name: "BACKEND_SECRET".to_string(),
                            value: Some(spec.backend.storage_secret_name.clone()),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(mounts),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    restart_policy: Some("Never".to_string()),
                    node_name: spec.node_name.clone(),
                    service_account_name: options.enable_rbac.then(|| name.clone()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Outcome of a restore job, if it has finished
pub fn job_outcome(job: &Job) -> Option<RecoveryPhase> {
    let status = job.status.as_ref()?;
    if status.succeeded.unwrap_or(0) > 0 {
        return Some(RecoveryPhase::Succeeded);
    }
    let backoff_limit = job
        .spec
        .as_ref()
        .and_then(|s| s.backoff_limit)
        .unwrap_or(6);
    if status.failed.unwrap_or(0) > backoff_limit {
        return Some(RecoveryPhase::Failed);
    }
    None
}

/// Create the restore job and mark the recovery running
pub async fn execute(recovery: &Recovery, client: &Client, options: &Options) -> Result<Action> {
    let name = recovery.name_any();
    let namespace = recovery.namespace().unwrap_or_else(|| "default".to_string());

    secrets::ensure_backend_secret(
        client,
        &namespace,
        &recovery.spec.backend.storage_secret_name,
        &format!("Recovery {}/{}", namespace, name),
    )
    .await?;

    let jobs: Api<Job> = Api::namespaced(client.clone(), &namespace);
    let job_name = job_name(recovery);
    let job = match jobs.get_opt(&job_name).await? {
        Some(job) => job,
        None => {
            info!(name = %name, job = %job_name, "Creating restore job");
            jobs.create(&PostParams::default(), &build_job(recovery, options)?)
                .await?
        }
    };

    if options.enable_rbac {
        let owner = job
            .owner_ref(&())
            .ok_or_else(|| Error::config(format!("Job {} has no uid", job_name)))?;
        rbac::ensure_recovery_rbac(client, &namespace, &job_name, owner).await?;
    }

    let api: Api<Recovery> = Api::namespaced(client.clone(), &namespace);
    let running_status = json!({
        "status": {
            "phase": RecoveryPhase::Running,
            "message": "Restore job running",
            "jobName": job_name,
            "startTime": Utc::now(),
            "observedGeneration": recovery.metadata.generation,
        }
    });
    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(running_status))
        .await?;

    metrics::RECOVERIES_TOTAL
        .with_label_values(&["started", &namespace])
        .inc();

    Ok(Action::requeue(Duration::from_secs(30)))
}

/// Track the restore job of a running recovery
pub async fn monitor(recovery: &Recovery, client: &Client) -> Result<Action> {
    let name = recovery.name_any();
    let namespace = recovery.namespace().unwrap_or_else(|| "default".to_string());
    let job_name = recovery
        .status
        .as_ref()
        .and_then(|s| s.job_name.clone())
        .unwrap_or_else(|| job_name(recovery));

    let jobs: Api<Job> = Api::namespaced(client.clone(), &namespace);
    let Some(job) = jobs.get_opt(&job_name).await? else {
        debug!(name = %name, job = %job_name, "Restore job gone, waiting for the restore worker to report");
        return Ok(Action::await_change());
    };

    match job_outcome(&job) {
        Some(RecoveryPhase::Succeeded) => {
            update_status_finished(
                recovery,
                client,
                &namespace,
                RecoveryPhase::Succeeded,
                "Restore completed successfully",
            )
            .await?;
            Ok(Action::await_change())
        }
        Some(phase) => {
            let message = format!("Restore job {} exhausted its retries", job_name);
            warn!(name = %name, job = %job_name, "Restore job failed");
            update_status_finished(recovery, client, &namespace, phase, &message).await?;
            Ok(Action::await_change())
        }
        None => Ok(Action::requeue(Duration::from_secs(30))),
    }
}

/// Record the final phase of a recovery
pub async fn update_status_finished(
    recovery: &Recovery,
    client: &Client,
    namespace: &str,
    phase: RecoveryPhase,
    message: &str,
) -> Result<()> {
    let name = recovery.name_any();
    let api: Api<Recovery> = Api::namespaced(client.clone(), namespace);
    let succeeded = phase == RecoveryPhase::Succeeded;
    let (ready, reason) = if succeeded {
        ("True", "RecoverySucceeded")
    } else {
        ("False", "RecoveryFailed")
    };

    let status = json!({
        "status": {
            "phase": phase,
            "message": message,
            "completionTime": Utc::now(),
            "observedGeneration": recovery.metadata.generation,
            "conditions": [{
                "type": "Ready",
                "status": ready,
                "lastTransitionTime": Utc::now(),
                "reason": reason,
                "message": message
            }]
        }
    });
    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(status))
        .await?;

    let outcome = if succeeded { "success" } else { "failure" };
    metrics::RECOVERIES_TOTAL
        .with_label_values(&[outcome, namespace])
        .inc();
    info!(name = %name, outcome, "Recovery finished");
    Ok(())
}

/// Update status to failed after a validation error
pub async fn update_status_failed(
    recovery: &Recovery,
    client: &Client,
    namespace: &str,
    error_message: &str,
) -> Result<()> {
    let name = recovery.name_any();
    let api: Api<Recovery> = Api::namespaced(client.clone(), namespace);

    let status = json!({
        "status": {
            "phase": RecoveryPhase::Failed,
            "message": error_message,
            "observedGeneration": recovery.metadata.generation,
            "conditions": [{
                "type": "Ready",
                "status": "False",
                "lastTransitionTime": Utc::now(),
                "reason": "ValidationFailed",
                "message": error_message
            }]
        }
    });
    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(status))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::batch::v1::JobStatus;

    use super::*;
    use crate::crd::{BackendSpec, LocalSpec, ObjectStoreSpec, RecoverySpec, WorkloadRef};

    fn recovery(kind: WorkloadKind) -> Recovery {
        let mut recovery = Recovery::new(
            "restore-web",
            RecoverySpec {
                workload: WorkloadRef {
                    kind,
                    name: "web".to_string(),
                },
                backend: BackendSpec {
                    storage_secret_name: "repo-creds".to_string(),
                    gcs: Some(ObjectStoreSpec {
                        bucket: "backups".to_string(),
                        endpoint: None,
                        prefix: Some("prod".to_string()),
                    }),
                    ..Default::default()
                },
                paths: vec!["/data".to_string()],
                recovered_volumes: vec![LocalSpec {
                    mount_path: "/data".to_string(),
                    sub_path: None,
                    host_path: None,
                    claim_name: Some("web-data".to_string()),
                }],
                node_name: None,
                pod_ordinal: None,
            },
        );
        recovery.metadata.namespace = Some("default".to_string());
        recovery.metadata.uid = Some("uid-rec".to_string());
        recovery
    }

    #[test]
    fn validation_requires_kind_specific_fields() {
        assert!(validate(&recovery(WorkloadKind::Deployment)).is_ok());
        assert!(validate(&recovery(WorkloadKind::StatefulSet)).is_err());
        assert!(validate(&recovery(WorkloadKind::DaemonSet)).is_err());

        let mut sts = recovery(WorkloadKind::StatefulSet);
        sts.spec.pod_ordinal = Some("0".to_string());
        assert!(validate(&sts).is_ok());
    }

    #[test]
    fn validation_rejects_relative_paths_and_missing_volumes() {
        let mut relative = recovery(WorkloadKind::Deployment);
        relative.spec.paths = vec!["data".to_string()];
        assert!(validate(&relative).is_err());

        let mut no_volumes = recovery(WorkloadKind::Deployment);
        no_volumes.spec.recovered_volumes.clear();
        assert!(validate(&no_volumes).is_err());
    }

    #[test]
    fn job_is_labelled_and_owned() {
        let job = build_job(&recovery(WorkloadKind::Deployment), &Options::default()).unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("recover-restore-web"));
        assert_eq!(job.metadata.labels.as_ref().unwrap()["app"], APP_LABEL_VALUE);

        let owners = job.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].kind, "Recovery");
        assert_eq!(owners[0].uid, "uid-rec");

        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("recover-restore-web"));
        assert_eq!(pod.volumes.unwrap().len(), 1);
        assert!(pod.containers[0]
            .args
            .as_ref()
            .unwrap()
            .contains(&"--path=/data".to_string()));
    }

    #[test]
    fn job_without_uid_owner_is_rejected() {
        let mut rec = recovery(WorkloadKind::Deployment);
        rec.metadata.uid = None;
        assert!(build_job(&rec, &Options::default()).is_err());
    }

    #[test]
    fn job_outcome_follows_status() {
        let mut job = build_job(&recovery(WorkloadKind::Deployment), &Options::default()).unwrap();
        assert_eq!(job_outcome(&job), None);

        job.status = Some(JobStatus {
            failed: Some(RESTORE_BACKOFF_LIMIT),
            ..Default::default()
        });
        assert_eq!(job_outcome(&job), None);

        job.status = Some(JobStatus {
            failed: Some(RESTORE_BACKOFF_LIMIT + 1),
            ..Default::default()
        });
        assert_eq!(job_outcome(&job), Some(RecoveryPhase::Failed));

        job.status = Some(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        assert_eq!(job_outcome(&job), Some(RecoveryPhase::Succeeded));
    }
}
