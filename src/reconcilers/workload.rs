//! Workload reconciler
//!
//! Converges one workload towards the policy that currently selects it.
//! The decision is taken by [`policy::plan`]; this module carries it out
//! against the API server and waits until the data plane reflects it.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Api, ResourceExt};
use tracing::{debug, info, warn};

use super::injection;
use super::policy::{self, Plan, PolicyLister};
use super::rbac;
use crate::adapters::{lock, patch_object, readiness, secrets, Verb};
use crate::controllers::Context;
use crate::crd::{BackupMode, BackupPolicy};
use crate::error::{Error, Result};
use crate::metrics;
use crate::runtime::{split_key, WatchedCollection};
use crate::workloads::{Workload, WorkloadReference};

/// Reconcile the workload stored under `key`
pub async fn reconcile<K: Workload>(
    ctx: &Context,
    collection: &WatchedCollection<K>,
    key: &str,
) -> Result<()> {
    let (namespace, name) = split_key(key)?;
    let namespace = namespace.ok_or_else(|| Error::InvalidKey(key.to_string()))?;

    let Some(workload) = collection.get(key)? else {
        warn!(kind = %K::KIND, key, "Workload does not exist anymore");
        let reference = WorkloadReference::new(K::KIND, namespace, name);
        lock::delete_configmap_lock(&ctx.client, &reference).await;
        return Ok(());
    };
    debug!(kind = %K::KIND, key, "Sync/Add/Update for workload");

    let reference = workload.reference();
    let applied = policy::applied_policy(workload.annotations())?;
    let desired = ctx
        .policies
        .find_matching_policy(&reference, &workload.template_labels())?;

    match policy::plan(workload.as_ref(), applied, desired)? {
        Plan::WaitForPeer => {
            debug!(workload = %reference, "Waiting for a peer initializer");
            Ok(())
        }
        Plan::NoOp => Ok(()),
        Plan::ReleaseInitializer => release_initializer(ctx, &workload).await,
        Plan::Inject { old, new } => ensure_sidecar(ctx, &workload, old.as_ref(), &new).await,
        Plan::Remove { old } => ensure_sidecar_deleted(ctx, &workload, &old).await,
    }
}

fn owner_reference<K: Workload>(workload: &K) -> Result<OwnerReference> {
    workload.owner_ref(&()).ok_or_else(|| {
        Error::config(format!(
            "{} has no uid and cannot own RBAC objects",
            workload.reference()
        ))
    })
}

fn record(kind: &str, operation: &str) {
    metrics::SIDECAR_OPERATIONS
        .with_label_values(&[kind, operation])
        .inc();
}

async fn release_initializer<K: Workload>(ctx: &Context, workload: &Arc<K>) -> Result<()> {
    let reference = workload.reference();
    let api: Api<K> = Api::namespaced(ctx.client.clone(), &reference.namespace);
    let (_, verb) = patch_object(&api, workload.as_ref(), injection::apply_initializer_release).await?;
    if verb == Verb::Patched {
        info!(workload = %reference, "Removed pending initializer");
        record(K::KIND.as_str(), "release-initializer");
    }
    Ok(())
}

/// Inject or update the backup container of `workload` for `new`
async fn ensure_sidecar<K: Workload>(
    ctx: &Context,
    workload: &Arc<K>,
    old: Option<&BackupPolicy>,
    new: &BackupPolicy,
) -> Result<()> {
    let reference = workload.reference();
    let namespace = reference.namespace.as_str();

    secrets::ensure_backend_secret(
        &ctx.client,
        namespace,
        &new.spec.backend.storage_secret_name,
        &format!("BackupPolicy {}/{}", namespace, new.name_any()),
    )
    .await?;

    let mut cleanup_service_account = None;
    if ctx.options.enable_rbac {
        let owner = owner_reference(workload.as_ref())?;
        let service_account = workload
            .template()
            .and_then(|t| t.spec.as_ref())
            .and_then(|s| s.service_account_name.clone())
            .filter(|sa| !sa.is_empty())
            .unwrap_or_else(|| "default".to_string());
        rbac::ensure_sidecar_role_binding(
            &ctx.client,
            namespace,
            &reference.name,
            owner.clone(),
            &service_account,
        )
        .await?;

        if new.spec.mode == BackupMode::Offline {
            rbac::ensure_cleanup_rbac(&ctx.client, namespace, &reference.name, owner).await?;
            cleanup_service_account = Some(rbac::cleanup_service_account_name(&reference.name));
        }
    }

    let desired = injection::injected(
        (**workload).clone(),
        old,
        new,
        &ctx.options,
        cleanup_service_account.as_deref(),
    )?;
    let api: Api<K> = Api::namespaced(ctx.client.clone(), namespace);
    let (patched, verb) = patch_object(&api, workload.as_ref(), |_| desired).await?;
    match verb {
        Verb::Unchanged => debug!(workload = %reference, "Backup container already in place"),
        _ => {
            info!(
                workload = %reference,
                policy = %new.name_any(),
                mode = new.spec.mode.as_str(),
                "Injected backup container"
            );
            record(K::KIND.as_str(), "inject");
        }
    }

    let barrier = ctx.barrier();
    let recycle = !patched.recreates_pods_on_template_change();
    readiness::wait_until_rollout_complete(&api, &reference.name, &barrier).await?;
    if let Some(selector) = patched.selector() {
        readiness::wait_until_sidecar_added(&ctx.client, namespace, &selector, recycle, &barrier)
            .await?;
    }
    info!(workload = %reference, "Backup container running on all pods");
    Ok(())
}

/// Strip the backup container `old` left on `workload`
async fn ensure_sidecar_deleted<K: Workload>(
    ctx: &Context,
    workload: &Arc<K>,
    old: &BackupPolicy,
) -> Result<()> {
    let reference = workload.reference();
    let namespace = reference.namespace.as_str();

    if ctx.options.enable_rbac {
        rbac::ensure_sidecar_role_binding_deleted(&ctx.client, namespace, &reference.name).await?;
    }

    let api: Api<K> = Api::namespaced(ctx.client.clone(), namespace);
    let (patched, verb) =
        patch_object(&api, workload.as_ref(), |obj| injection::apply_removal(obj, old)).await?;
    if verb != Verb::Unchanged {
        info!(workload = %reference, policy = %old.name_any(), "Removed backup container");
        record(K::KIND.as_str(), "remove");
    }

    let barrier = ctx.barrier();
    let recycle = !patched.recreates_pods_on_template_change();
    readiness::wait_until_rollout_complete(&api, &reference.name, &barrier).await?;
    if let Some(selector) = patched.selector() {
        readiness::wait_until_sidecar_removed(&ctx.client, namespace, &selector, recycle, &barrier)
            .await?;
    }
    lock::delete_configmap_lock(&ctx.client, &reference).await;
    Ok(())
}
