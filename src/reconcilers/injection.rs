//! Pod template mutations
//!
//! Everything here is pure: the reconciler derives the desired object with
//! these functions and writes it in a single call. Injected elements are
//! matched by well-known name, so user edits to other containers and
//! volumes are preserved.

use k8s_openapi::api::core::v1::{
    Container, DownwardAPIVolumeFile, DownwardAPIVolumeSource, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ObjectFieldSelector, Pod, PodTemplateSpec, Volume, VolumeMount,
};
use kube::ResourceExt;

use super::policy::{
    pop_initializer, to_be_initialized_by_self, LAST_APPLIED_CONFIGURATION, VERSION_TAG,
};
use crate::config::Options;
use crate::crd::{BackupMode, BackupPolicy};
use crate::error::Result;
use crate::workloads::{Workload, WorkloadReference};

/// Name of the injected sidecar or init container
pub const BACKUP_CONTAINER: &str = "backup-agent";
/// Scratch space of the backup container
pub const SCRATCH_VOLUME: &str = "backup-scratchdir";
/// Downward API volume exposing pod labels
pub const PODINFO_VOLUME: &str = "backup-podinfo";
/// Volume of a local backend
pub const LOCAL_VOLUME: &str = "backup-local";

const SCRATCH_MOUNT_PATH: &str = "/tmp";
const PODINFO_MOUNT_PATH: &str = "/etc/podinfo";

/// Insert `container`, replacing any container with the same name
pub fn upsert_container(containers: &mut Vec<Container>, container: Container) {
    match containers.iter_mut().find(|c| c.name == container.name) {
        Some(existing) => *existing = container,
        None => containers.push(container),
    }
}

/// Remove every container named `name`
pub fn remove_container(containers: &mut Vec<Container>, name: &str) {
    containers.retain(|c| c.name != name);
}

/// Insert `volume`, replacing any volume with the same name
pub fn upsert_volume(volumes: &mut Vec<Volume>, volume: Volume) {
    match volumes.iter_mut().find(|v| v.name == volume.name) {
        Some(existing) => *existing = volume,
        None => volumes.push(volume),
    }
}

/// Remove every volume named `name`
pub fn remove_volume(volumes: &mut Vec<Volume>, name: &str) {
    volumes.retain(|v| v.name != name);
}

pub fn scratch_volume() -> Volume {
    Volume {
        name: SCRATCH_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

pub fn podinfo_volume() -> Volume {
    Volume {
        name: PODINFO_VOLUME.to_string(),
        downward_api: Some(DownwardAPIVolumeSource {
            items: Some(vec![DownwardAPIVolumeFile {
                path: "labels".to_string(),
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.labels".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn backup_volume_mounts(policy: &BackupPolicy) -> Vec<VolumeMount> {
    let mut mounts = vec![
        VolumeMount {
            name: SCRATCH_VOLUME.to_string(),
            mount_path: SCRATCH_MOUNT_PATH.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: PODINFO_VOLUME.to_string(),
            mount_path: PODINFO_MOUNT_PATH.to_string(),
            ..Default::default()
        },
    ];
    if let Some(local) = &policy.spec.backend.local {
        mounts.push(local.to_volume_mount(LOCAL_VOLUME));
    }
    mounts.extend(policy.spec.volume_mounts.iter().cloned());
    mounts
}

/// Build the backup container for `policy`: a long-running scheduler in
/// online mode, a single backup pass in offline mode.
///
/// `cleanup_service_account` is passed to offline containers, which spawn
/// auxiliary cleanup jobs under that identity.
pub fn backup_container(
    policy: &BackupPolicy,
    options: &Options,
    workload: &WorkloadReference,
    cleanup_service_account: Option<&str>,
) -> Container {
    let command = match policy.spec.mode {
        BackupMode::Online => "schedule",
        BackupMode::Offline => "backup",
    };
    let mut args = vec![
        command.to_string(),
        format!("--policy-name={}", policy.name_any()),
        format!("--workload-kind={}", workload.kind),
        format!("--workload-name={}", workload.name),
        format!("--image-tag={}", options.sidecar_image_tag),
        format!("--podinfo-dir={}", PODINFO_MOUNT_PATH),
        format!("--scratch-dir={}", SCRATCH_MOUNT_PATH),
    ];
    if let Some(sa) = cleanup_service_account {
        args.push(format!("--cleanup-service-account={}", sa));
    }

    Container {
        name: BACKUP_CONTAINER.to_string(),
        image: Some(options.sidecar_image_ref()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(args),
        env: Some(vec![
            field_env("NODE_NAME", "spec.nodeName"),
            field_env("POD_NAME", "metadata.name"),
            field_env("POD_NAMESPACE", "metadata.namespace"),
        ]),
        volume_mounts: Some(backup_volume_mounts(policy)),
        resources: policy.spec.resources.clone(),
        ..Default::default()
    }
}

fn normalize<T>(list: Vec<T>) -> Option<Vec<T>> {
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

/// Upsert the backup container and its volumes into `template`.
///
/// The container lands in `containers` (online) or `initContainers`
/// (offline) and is removed from the other list, so at most one backup
/// container exists at any time.
pub fn inject_into_template(
    template: &mut PodTemplateSpec,
    old: Option<&BackupPolicy>,
    new: &BackupPolicy,
    container: Container,
) {
    let spec = template.spec.get_or_insert_with(Default::default);

    let mut init_containers = spec.init_containers.take().unwrap_or_default();
    match new.spec.mode {
        BackupMode::Online => {
            remove_container(&mut init_containers, BACKUP_CONTAINER);
            upsert_container(&mut spec.containers, container);
        }
        BackupMode::Offline => {
            remove_container(&mut spec.containers, BACKUP_CONTAINER);
            upsert_container(&mut init_containers, container);
        }
    }
    spec.init_containers = normalize(init_containers);

    let mut volumes = spec.volumes.take().unwrap_or_default();
    upsert_volume(&mut volumes, scratch_volume());
    upsert_volume(&mut volumes, podinfo_volume());
    match &new.spec.backend.local {
        Some(local) => upsert_volume(&mut volumes, local.to_volume(LOCAL_VOLUME)),
        None => {
            if old.is_some_and(|old| old.spec.backend.local.is_some()) {
                remove_volume(&mut volumes, LOCAL_VOLUME);
            }
        }
    }
    spec.volumes = normalize(volumes);
}

/// Strip the backup container and every injected volume from `template`
pub fn remove_from_template(template: &mut PodTemplateSpec, old: &BackupPolicy) {
    let Some(spec) = template.spec.as_mut() else {
        return;
    };

    remove_container(&mut spec.containers, BACKUP_CONTAINER);
    let mut init_containers = spec.init_containers.take().unwrap_or_default();
    remove_container(&mut init_containers, BACKUP_CONTAINER);
    spec.init_containers = normalize(init_containers);

    let mut volumes = spec.volumes.take().unwrap_or_default();
    remove_volume(&mut volumes, SCRATCH_VOLUME);
    remove_volume(&mut volumes, PODINFO_VOLUME);
    if old.spec.backend.local.is_some() {
        remove_volume(&mut volumes, LOCAL_VOLUME);
    }
    spec.volumes = normalize(volumes);
}

/// Derive the injected form of `obj`: template mutated, applied
/// configuration and version tag recorded, own pending initializer popped.
pub fn apply_injection<K: Workload>(
    mut obj: K,
    old: Option<&BackupPolicy>,
    new: &BackupPolicy,
    container: Container,
    snapshot: String,
    version_tag: &str,
) -> K {
    if to_be_initialized_by_self(obj.meta()) {
        pop_initializer(obj.meta_mut());
    }
    inject_into_template(obj.template_mut(), old, new, container);

    let annotations = obj.annotations_mut();
    annotations.insert(LAST_APPLIED_CONFIGURATION.to_string(), snapshot);
    annotations.insert(VERSION_TAG.to_string(), version_tag.to_string());
    obj
}

/// Derive the stripped form of `obj`
pub fn apply_removal<K: Workload>(mut obj: K, old: &BackupPolicy) -> K {
    remove_from_template(obj.template_mut(), old);
    if let Some(annotations) = obj.meta_mut().annotations.as_mut() {
        annotations.remove(LAST_APPLIED_CONFIGURATION);
        annotations.remove(VERSION_TAG);
        if annotations.is_empty() {
            obj.meta_mut().annotations = None;
        }
    }
    obj
}

/// Derive `obj` with its own pending initializer popped
pub fn apply_initializer_release<K: Workload>(mut obj: K) -> K {
    if to_be_initialized_by_self(obj.meta()) {
        pop_initializer(obj.meta_mut());
    }
    obj
}

/// Whether a running pod carries the backup container, as sidecar or init container
pub fn pod_has_backup_container(pod: &Pod) -> bool {
    pod.spec.as_ref().is_some_and(|spec| {
        spec.containers.iter().any(|c| c.name == BACKUP_CONTAINER)
            || spec
                .init_containers
                .as_ref()
                .is_some_and(|init| init.iter().any(|c| c.name == BACKUP_CONTAINER))
    })
}

/// Build everything an injection needs from `new` and derive the injected object
pub fn injected<K: Workload>(
    obj: K,
    old: Option<&BackupPolicy>,
    new: &BackupPolicy,
    options: &Options,
    cleanup_service_account: Option<&str>,
) -> Result<K> {
    let reference = obj.reference();
    let container = backup_container(new, options, &reference, cleanup_service_account);
    let snapshot = super::policy::applied_snapshot(new)?;
    Ok(apply_injection(
        obj,
        old,
        new,
        container,
        snapshot,
        &options.sidecar_image_tag,
    ))
}
