//! Create-or-update of arbitrary Kubernetes objects
//!
//! Updates are full replaces (PUT) of the mutated object. Every write carries
//! the `resourceVersion` of the object it was derived from, so a concurrent
//! change surfaces as a 409 conflict (retried through the work queue) instead
//! of being overwritten.

use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{api::PostParams, Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};

/// What [`ensure_object`] or [`patch_object`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Unchanged,
    Created,
    Patched,
}

/// Apply `mutate` to the live object named `name` and write the result, or
/// create the object from `mutate(default)` if it does not exist.
pub async fn ensure_object<K, F>(api: &Api<K>, name: &str, mutate: F) -> Result<(K, Verb)>
where
    K: Resource + Clone + Default + Serialize + DeserializeOwned + Debug,
    F: FnOnce(K) -> K,
{
    match api.get_opt(name).await? {
        Some(current) => patch_object(api, &current, mutate).await,
        None => {
            let mut fresh = K::default();
            fresh.meta_mut().name = Some(name.to_string());
            let desired = mutate(fresh);
            debug!(name = %name, "Creating object");
            let created = api.create(&PostParams::default(), &desired).await?;
            Ok((created, Verb::Created))
        }
    }
}

/// Whether `desired` differs from `current` once both are serialized
pub fn needs_write<K: Serialize>(current: &K, desired: &K) -> Result<bool> {
    Ok(serde_json::to_value(desired)? != serde_json::to_value(current)?)
}

/// Apply `mutate` to `current` and replace the live object with the result
/// if anything changed.
///
/// Issues no API call when the mutation is a no-op.
pub async fn patch_object<K, F>(api: &Api<K>, current: &K, mutate: F) -> Result<(K, Verb)>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
    F: FnOnce(K) -> K,
{
    let desired = mutate(current.clone());
    if !needs_write(current, &desired)? {
        return Ok((current.clone(), Verb::Unchanged));
    }

    let name = current.name_any();
    if desired.meta().resource_version.is_none() {
        return Err(Error::config(format!(
            "Refusing to write {} without a resourceVersion",
            name
        )));
    }

    debug!(name = %name, "Replacing object");
    let patched = api.replace(&name, &PostParams::default(), &desired).await?;
    Ok((patched, Verb::Patched))
}

/// Add `owner` to the owner references of `meta`, replacing an entry with
/// the same UID
pub fn ensure_owner_reference(meta: &mut ObjectMeta, owner: OwnerReference) {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    match refs.iter_mut().find(|r| r.uid == owner.uid) {
        Some(existing) => *existing = owner,
        None => refs.push(owner),
    }
}

/// Set `key=value` in the labels of `meta`
pub fn ensure_label(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.labels
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
}
