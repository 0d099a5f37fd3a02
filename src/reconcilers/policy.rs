//! Policy resolution and the reconcile decision
//!
//! A workload carries the policy it was last reconciled against in an
//! annotation. [`plan`] compares that snapshot with the policy currently
//! selecting the workload and decides what, if anything, has to change.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{Selector, SelectorExt};
use kube::runtime::reflector::Store;
use kube::ResourceExt;

use crate::crd::{BackendSpec, BackupMode, BackupPolicy, LocalSpec};
use crate::error::{Error, Result};
use crate::workloads::{Workload, WorkloadReference};

/// JSON snapshot of the policy last applied to a workload
pub const LAST_APPLIED_CONFIGURATION: &str = "backup.oso.sh/last-applied-configuration";
/// Sidecar image tag last applied to a workload
pub const VERSION_TAG: &str = "backup.oso.sh/tag";
/// Comma separated initializers that still have to process a workload; the
/// head of the list is whose turn it is
pub const PENDING_INITIALIZERS: &str = "backup.oso.sh/pending-initializers";
/// Our own entry in [`PENDING_INITIALIZERS`]
pub const INITIALIZER_NAME: &str = "backup.oso.sh";

/// Parse the applied-policy snapshot from workload annotations.
///
/// A snapshot that does not parse is a terminal validation error.
pub fn applied_policy(annotations: &BTreeMap<String, String>) -> Result<Option<BackupPolicy>> {
    match annotations.get(LAST_APPLIED_CONFIGURATION) {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw).map(Some).map_err(|e| {
            Error::validation(format!(
                "Annotation {} is not a valid BackupPolicy: {}",
                LAST_APPLIED_CONFIGURATION, e
            ))
        }),
        _ => Ok(None),
    }
}

/// Serialize the identity and spec of `policy` for the applied annotation.
/// Status and server-populated metadata are left out.
pub fn applied_snapshot(policy: &BackupPolicy) -> Result<String> {
    let mut snapshot = BackupPolicy::new(&policy.name_any(), policy.spec.clone());
    snapshot.metadata.namespace = policy.namespace();
    Ok(serde_json::to_string(&snapshot)?)
}

/// Semantic equality of two optional policies: same name, namespace and spec
pub fn policies_equal(a: Option<&BackupPolicy>, b: Option<&BackupPolicy>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            a.name_any() == b.name_any()
                && a.namespace() == b.namespace()
                && serde_json::to_value(&a.spec).ok() == serde_json::to_value(&b.spec).ok()
        }
        _ => false,
    }
}

/// Whether `policy` selects pods labelled `labels` in `namespace`.
/// An empty or unparseable selector selects nothing.
pub fn selects(policy: &BackupPolicy, namespace: &str, labels: &BTreeMap<String, String>) -> bool {
    if policy.namespace().as_deref() != Some(namespace) {
        return false;
    }
    let selector = &policy.spec.selector;
    if selector.match_labels.as_ref().map_or(true, |m| m.is_empty())
        && selector.match_expressions.as_ref().map_or(true, |e| e.is_empty())
    {
        return false;
    }
    match Selector::try_from(selector.clone()) {
        Ok(parsed) => parsed.matches(labels),
        Err(_) => false,
    }
}

/// Resolve the single policy selecting a workload.
///
/// More than one match is an error: the operator refuses to guess.
pub fn find_matching_policy<I>(
    policies: I,
    workload: &WorkloadReference,
    labels: &BTreeMap<String, String>,
) -> Result<Option<Arc<BackupPolicy>>>
where
    I: IntoIterator<Item = Arc<BackupPolicy>>,
{
    let mut matches: Vec<Arc<BackupPolicy>> = policies
        .into_iter()
        .filter(|p| selects(p, &workload.namespace, labels))
        .collect();

    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        _ => {
            let mut names: Vec<String> = matches.iter().map(|p| p.name_any()).collect();
            names.sort();
            Err(Error::AmbiguousPolicy {
                workload: workload.to_string(),
                policies: names,
            })
        }
    }
}

/// Whether a change of policy `name` (now `policy`, `None` once deleted)
/// may change the desired state of `workload`: the policy selects it, or
/// it is the policy last applied to it.
pub fn is_affected_by<K: Workload>(workload: &K, name: &str, policy: Option<&BackupPolicy>) -> bool {
    let namespace = workload.namespace().unwrap_or_default();
    let selected = policy.is_some_and(|p| selects(p, &namespace, &workload.template_labels()));
    selected
        || applied_policy(workload.annotations())
            .ok()
            .flatten()
            .is_some_and(|applied| applied.name_any() == name)
}

/// Source of the policies known to the operator
pub trait PolicyLister {
    fn list_policies(&self) -> Vec<Arc<BackupPolicy>>;

    fn find_matching_policy(
        &self,
        workload: &WorkloadReference,
        labels: &BTreeMap<String, String>,
    ) -> Result<Option<Arc<BackupPolicy>>> {
        find_matching_policy(self.list_policies(), workload, labels)
    }
}

impl PolicyLister for Store<BackupPolicy> {
    fn list_policies(&self) -> Vec<Arc<BackupPolicy>> {
        self.state()
    }
}

impl PolicyLister for Vec<Arc<BackupPolicy>> {
    fn list_policies(&self) -> Vec<Arc<BackupPolicy>> {
        self.clone()
    }
}

/// Validate a BackupPolicy before it is applied to any workload
pub fn validate(policy: &BackupPolicy) -> Result<()> {
    let name = policy.name_any();
    let spec = &policy.spec;

    let selector = &spec.selector;
    if selector.match_labels.as_ref().map_or(true, |m| m.is_empty())
        && selector.match_expressions.as_ref().map_or(true, |e| e.is_empty())
    {
        return Err(Error::validation(format!(
            "BackupPolicy {} has an empty selector",
            name
        )));
    }
    Selector::try_from(selector.clone()).map_err(|e| {
        Error::validation(format!("BackupPolicy {} has an invalid selector: {}", name, e))
    })?;

    cron::Schedule::from_str(&spec.schedule).map_err(|e| {
        Error::validation(format!(
            "BackupPolicy {} has an invalid schedule '{}': {}",
            name, spec.schedule, e
        ))
    })?;

    validate_backend(&spec.backend).map_err(|e| match e {
        Error::Validation(msg) => Error::validation(format!("BackupPolicy {}: {}", name, msg)),
        other => other,
    })?;

    for group in &spec.file_groups {
        if !group.path.starts_with('/') {
            return Err(Error::validation(format!(
                "BackupPolicy {} backs up relative path '{}'",
                name, group.path
            )));
        }
    }

    Ok(())
}

/// Validate a backend: a secret name and exactly one storage location
pub fn validate_backend(backend: &BackendSpec) -> Result<()> {
    if backend.storage_secret_name.is_empty() {
        return Err(Error::validation("missing repository secret name"));
    }

    let locations = [
        backend.local.is_some(),
        backend.s3.is_some(),
        backend.gcs.is_some(),
        backend.azure.is_some(),
    ]
    .into_iter()
    .filter(|set| *set)
    .count();
    if locations != 1 {
        return Err(Error::validation(format!(
            "backend must set exactly one of local, s3, gcs or azure (found {})",
            locations
        )));
    }

    if let Some(local) = &backend.local {
        validate_local(local)?;
    }
    for store in [&backend.s3, &backend.gcs, &backend.azure].into_iter().flatten() {
        if store.bucket.is_empty() {
            return Err(Error::validation("object store backend is missing a bucket"));
        }
    }
    Ok(())
}

/// Validate a local volume: a mount path and exactly one volume source
pub fn validate_local(local: &LocalSpec) -> Result<()> {
    if local.mount_path.is_empty() {
        return Err(Error::validation("local volume is missing a mountPath"));
    }
    match (&local.host_path, &local.claim_name) {
        (Some(_), None) | (None, Some(_)) => Ok(()),
        _ => Err(Error::validation(
            "local volume must set exactly one of hostPath or claimName",
        )),
    }
}

fn pending_initializers(meta: &ObjectMeta) -> Vec<String> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(PENDING_INITIALIZERS))
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Whether a peer initializer has to process the object before us
pub fn to_be_initialized_by_peer(meta: &ObjectMeta) -> bool {
    pending_initializers(meta)
        .first()
        .is_some_and(|head| head != INITIALIZER_NAME)
}

/// Whether it is our turn to initialize the object
pub fn to_be_initialized_by_self(meta: &ObjectMeta) -> bool {
    pending_initializers(meta)
        .first()
        .is_some_and(|head| head == INITIALIZER_NAME)
}

/// Remove our entry from the head of the pending initializers
pub fn pop_initializer(meta: &mut ObjectMeta) {
    let mut pending = pending_initializers(meta);
    if pending.first().map(String::as_str) != Some(INITIALIZER_NAME) {
        return;
    }
    pending.remove(0);

    let Some(annotations) = meta.annotations.as_mut() else {
        return;
    };
    if pending.is_empty() {
        annotations.remove(PENDING_INITIALIZERS);
    } else {
        annotations.insert(PENDING_INITIALIZERS.to_string(), pending.join(","));
    }
    if annotations.is_empty() {
        meta.annotations = None;
    }
}

/// What the workload reconciler has to do
#[derive(Clone, Debug)]
pub enum Plan {
    /// A peer initializer has not processed the workload yet
    WaitForPeer,
    /// Applied and desired policy agree
    NoOp,
    /// Nothing to change except our pending initializer entry
    ReleaseInitializer,
    /// Inject or update the backup container
    Inject {
        old: Option<BackupPolicy>,
        new: Arc<BackupPolicy>,
    },
    /// Strip the backup container left by `old`
    Remove { old: BackupPolicy },
}

/// Decide how to bring `workload` from its `applied` policy to `desired`
pub fn plan<K: Workload>(
    workload: &K,
    applied: Option<BackupPolicy>,
    desired: Option<Arc<BackupPolicy>>,
) -> Result<Plan> {
    if to_be_initialized_by_peer(workload.meta()) {
        return Ok(Plan::WaitForPeer);
    }

    if policies_equal(applied.as_ref(), desired.as_deref()) {
        if to_be_initialized_by_self(workload.meta()) {
            return Ok(Plan::ReleaseInitializer);
        }
        return Ok(Plan::NoOp);
    }

    match (desired, applied) {
        (Some(new), old) => {
            validate(&new)?;
            if new.spec.mode == BackupMode::Offline && workload.replicas().unwrap_or(1) > 1 {
                return Err(Error::precondition(format!(
                    "{} has {} replicas; offline backup requires at most one",
                    workload.reference(),
                    workload.replicas().unwrap_or(1)
                )));
            }
            Ok(Plan::Inject { old, new })
        }
        (None, Some(old)) => Ok(Plan::Remove { old }),
        (None, None) => Ok(Plan::NoOp),
    }
}
