//! RBAC objects backing injected containers and restore jobs
//!
//! One shared ClusterRole grants what a backup container needs. Each
//! workload binds it to its service account through a RoleBinding owned by
//! the workload, so removing the workload removes the binding.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{api::DeleteParams, Api, Client};
use tracing::{debug, info};

use crate::adapters::{ensure_label, ensure_object, ensure_owner_reference, Verb};
use crate::error::Result;

/// Shared ClusterRole bound by every backup container
pub const SIDECAR_CLUSTER_ROLE: &str = "workload-backup-sidecar";
/// Namespaced Role used by auxiliary cleanup jobs of offline backups
pub const CLEANUP_ROLE: &str = "workload-backup-cleanup";
/// `app` label value on every object the operator creates
pub const APP_LABEL_VALUE: &str = "workload-backup";

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(api_groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn service_account_subject(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        api_group: None,
    }
}

/// Name of the RoleBinding granting the sidecar role to a workload
pub fn sidecar_role_binding_name(workload: &str) -> String {
    format!("{}-{}", workload, SIDECAR_CLUSTER_ROLE)
}

/// Name of the service account used by cleanup jobs of a workload
pub fn cleanup_service_account_name(workload: &str) -> String {
    format!("{}-backup-cleanup", workload)
}

/// Desired state of the shared sidecar ClusterRole
pub fn sidecar_cluster_role(mut role: ClusterRole) -> ClusterRole {
    ensure_label(&mut role.metadata, "app", APP_LABEL_VALUE);
    role.rules = Some(vec![
        rule(&["backup.oso.sh"], &["*"], &["*"]),
        rule(
            &["apps"],
            &["deployments", "statefulsets", "daemonsets", "replicasets"],
            &["get"],
        ),
        rule(&[""], &["replicationcontrollers", "secrets"], &["get"]),
        rule(&[""], &["configmaps"], &["create", "update", "get"]),
        rule(&[""], &["events"], &["create"]),
        rule(&["batch"], &["jobs"], &["create"]),
        rule(
            &[RBAC_GROUP],
            &["clusterroles", "roles", "rolebindings"],
            &["get", "create"],
        ),
        rule(&[""], &["serviceaccounts"], &["get", "create"]),
    ]);
    role
}

/// Desired state of a per-workload binding of the sidecar ClusterRole
pub fn sidecar_role_binding(
    mut binding: RoleBinding,
    owner: OwnerReference,
    namespace: &str,
    service_account: &str,
) -> RoleBinding {
    binding.metadata.namespace = Some(namespace.to_string());
    ensure_owner_reference(&mut binding.metadata, owner);
    ensure_label(&mut binding.metadata, "app", APP_LABEL_VALUE);
    binding.role_ref = RoleRef {
        api_group: RBAC_GROUP.to_string(),
        kind: "ClusterRole".to_string(),
        name: SIDECAR_CLUSTER_ROLE.to_string(),
    };
    binding.subjects = Some(vec![service_account_subject(service_account, namespace)]);
    binding
}

/// Desired state of the pod cleanup Role
pub fn cleanup_role(mut role: Role, owner: OwnerReference, namespace: &str) -> Role {
    role.metadata.namespace = Some(namespace.to_string());
    ensure_owner_reference(&mut role.metadata, owner);
    ensure_label(&mut role.metadata, "app", APP_LABEL_VALUE);
    role.rules = Some(vec![rule(
        &[""],
        &["pods"],
        &["get", "list", "delete", "deletecollection"],
    )]);
    role
}

fn owned_service_account(
    mut sa: ServiceAccount,
    owner: OwnerReference,
    namespace: &str,
) -> ServiceAccount {
    sa.metadata.namespace = Some(namespace.to_string());
    ensure_owner_reference(&mut sa.metadata, owner);
    ensure_label(&mut sa.metadata, "app", APP_LABEL_VALUE);
    sa
}

fn owned_role_binding(
    mut binding: RoleBinding,
    owner: OwnerReference,
    namespace: &str,
    role_ref: RoleRef,
    service_account: &str,
) -> RoleBinding {
    binding.metadata.namespace = Some(namespace.to_string());
    ensure_owner_reference(&mut binding.metadata, owner);
    ensure_label(&mut binding.metadata, "app", APP_LABEL_VALUE);
    binding.role_ref = role_ref;
    binding.subjects = Some(vec![service_account_subject(service_account, namespace)]);
    binding
}

fn log_verb(kind: &str, namespace: Option<&str>, name: &str, verb: Verb) {
    match verb {
        Verb::Unchanged => debug!(kind, namespace, name, "RBAC object up to date"),
        Verb::Created => info!(kind, namespace, name, "Created RBAC object"),
        Verb::Patched => info!(kind, namespace, name, "Patched RBAC object"),
    }
}

/// Create or update the shared sidecar ClusterRole
pub async fn ensure_sidecar_cluster_role(client: &Client) -> Result<()> {
    let api: Api<ClusterRole> = Api::all(client.clone());
    let (_, verb) = ensure_object(&api, SIDECAR_CLUSTER_ROLE, sidecar_cluster_role).await?;
    log_verb("ClusterRole", None, SIDECAR_CLUSTER_ROLE, verb);
    Ok(())
}

/// Bind the sidecar ClusterRole to the service account of a workload
pub async fn ensure_sidecar_role_binding(
    client: &Client,
    namespace: &str,
    workload: &str,
    owner: OwnerReference,
    service_account: &str,
) -> Result<()> {
    let api: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    let name = sidecar_role_binding_name(workload);
    let (_, verb) = ensure_object(&api, &name, |binding| {
        sidecar_role_binding(binding, owner, namespace, service_account)
    })
    .await?;
    log_verb("RoleBinding", Some(namespace), &name, verb);
    Ok(())
}

/// Delete the sidecar RoleBinding of a workload; a missing binding is not an error
pub async fn ensure_sidecar_role_binding_deleted(
    client: &Client,
    namespace: &str,
    workload: &str,
) -> Result<()> {
    let api: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    let name = sidecar_role_binding_name(workload);
    info!(namespace, name = %name, "Deleting RoleBinding");
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Ensure the ServiceAccount, Role and RoleBinding used by cleanup jobs of
/// an offline workload, all owned by that workload
pub async fn ensure_cleanup_rbac(
    client: &Client,
    namespace: &str,
    workload: &str,
    owner: OwnerReference,
) -> Result<()> {
    let roles: Api<Role> = Api::namespaced(client.clone(), namespace);
    let (_, verb) = ensure_object(&roles, CLEANUP_ROLE, |role| {
        cleanup_role(role, owner.clone(), namespace)
    })
    .await?;
    log_verb("Role", Some(namespace), CLEANUP_ROLE, verb);

    let name = cleanup_service_account_name(workload);
    let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let (_, verb) = ensure_object(&accounts, &name, |sa| {
        owned_service_account(sa, owner.clone(), namespace)
    })
    .await?;
    log_verb("ServiceAccount", Some(namespace), &name, verb);

    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    let role_ref = RoleRef {
        api_group: RBAC_GROUP.to_string(),
        kind: "Role".to_string(),
        name: CLEANUP_ROLE.to_string(),
    };
    let (_, verb) = ensure_object(&bindings, &name, |binding| {
        owned_role_binding(binding, owner, namespace, role_ref, &name)
    })
    .await?;
    log_verb("RoleBinding", Some(namespace), &name, verb);
    Ok(())
}

/// Ensure the ServiceAccount and RoleBinding a restore job runs under. Both
/// are named after the job and owned by it.
pub async fn ensure_recovery_rbac(
    client: &Client,
    namespace: &str,
    job_name: &str,
    owner: OwnerReference,
) -> Result<()> {
    let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let (_, verb) = ensure_object(&accounts, job_name, |sa| {
        owned_service_account(sa, owner.clone(), namespace)
    })
    .await?;
    log_verb("ServiceAccount", Some(namespace), job_name, verb);

    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    let role_ref = RoleRef {
        api_group: RBAC_GROUP.to_string(),
        kind: "ClusterRole".to_string(),
        name: SIDECAR_CLUSTER_ROLE.to_string(),
    };
    let (_, verb) = ensure_object(&bindings, job_name, |binding| {
        owned_role_binding(binding, owner, namespace, role_ref, job_name)
    })
    .await?;
    log_verb("RoleBinding", Some(namespace), job_name, verb);
    Ok(())
}
