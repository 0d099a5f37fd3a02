//! Workload kinds the operator can attach a backup sidecar to
//!
//! The reconcile algorithm is written once against [`Workload`]; each kind
//! supplies access to its pod template, its pod selector, its replica count
//! and its rollout state.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::str::FromStr;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{PodTemplateSpec, ReplicationController};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Closed set of supported workload kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum WorkloadKind {
    ReplicationController,
    ReplicaSet,
    Deployment,
    DaemonSet,
    StatefulSet,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 5] = [
        WorkloadKind::ReplicationController,
        WorkloadKind::ReplicaSet,
        WorkloadKind::Deployment,
        WorkloadKind::DaemonSet,
        WorkloadKind::StatefulSet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::ReplicationController => "ReplicationController",
            WorkloadKind::ReplicaSet => "ReplicaSet",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::StatefulSet => "StatefulSet",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        WorkloadKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::validation(format!("Unsupported workload kind '{}'", s)))
    }
}

/// Kind-independent identity of a workload
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkloadReference {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl WorkloadReference {
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Name of the ConfigMap the sidecars of this workload use as leader lock
    pub fn lock_name(&self) -> String {
        format!("lock-{}-{}", self.kind.as_str().to_lowercase(), self.name)
    }
}

impl fmt::Display for WorkloadReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A namespaced object that manages pods through a pod template
pub trait Workload:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const KIND: WorkloadKind;

    fn template(&self) -> Option<&PodTemplateSpec>;

    fn template_mut(&mut self) -> &mut PodTemplateSpec;

    /// Selector of the pods this workload manages
    fn selector(&self) -> Option<LabelSelector>;

    /// Desired replica count; `None` for kinds without one (DaemonSet)
    fn replicas(&self) -> Option<i32>;

    /// Whether the controller of this workload has observed the latest
    /// template and finished rolling it out
    fn rollout_complete(&self) -> bool;

    /// Whether the controller replaces running pods after a template change.
    /// When it does not, pods created from an older template have to be
    /// deleted to pick the change up.
    fn recreates_pods_on_template_change(&self) -> bool {
        true
    }

    fn template_labels(&self) -> BTreeMap<String, String> {
        self.template()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default()
    }

    fn reference(&self) -> WorkloadReference {
        WorkloadReference::new(
            Self::KIND,
            self.namespace().unwrap_or_default(),
            self.name_any(),
        )
    }
}

/// Update strategy under which pods pick up a new template only when deleted
const ON_DELETE: &str = "OnDelete";

fn generation_observed(generation: Option<i64>, observed: Option<i64>) -> bool {
    match (generation, observed) {
        (Some(generation), Some(observed)) => observed >= generation,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

impl Workload for ReplicationController {
    const KIND: WorkloadKind = WorkloadKind::ReplicationController;

    fn recreates_pods_on_template_change(&self) -> bool {
        false
    }

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().and_then(|s| s.template.as_ref())
    }

    fn template_mut(&mut self) -> &mut PodTemplateSpec {
        self.spec
            .get_or_insert_with(Default::default)
            .template
            .get_or_insert_with(Default::default)
    }

    fn selector(&self) -> Option<LabelSelector> {
        let labels = self.spec.as_ref().and_then(|s| s.selector.clone())?;
        Some(LabelSelector {
            match_labels: Some(labels),
            ..Default::default()
        })
    }

    fn replicas(&self) -> Option<i32> {
        Some(self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1))
    }

    fn rollout_complete(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        generation_observed(self.metadata.generation, status.observed_generation)
            && status.ready_replicas.unwrap_or(0) >= self.replicas().unwrap_or(1)
    }
}

impl Workload for ReplicaSet {
    const KIND: WorkloadKind = WorkloadKind::ReplicaSet;

    fn recreates_pods_on_template_change(&self) -> bool {
        false
    }

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().and_then(|s| s.template.as_ref())
    }

    fn template_mut(&mut self) -> &mut PodTemplateSpec {
        self.spec
            .get_or_insert_with(Default::default)
            .template
            .get_or_insert_with(Default::default)
    }

    fn selector(&self) -> Option<LabelSelector> {
        self.spec.as_ref().map(|s| s.selector.clone())
    }

    fn replicas(&self) -> Option<i32> {
        Some(self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1))
    }

    fn rollout_complete(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        generation_observed(self.metadata.generation, status.observed_generation)
            && status.ready_replicas.unwrap_or(0) >= self.replicas().unwrap_or(1)
    }
}

impl Workload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn template_mut(&mut self) -> &mut PodTemplateSpec {
        &mut self.spec.get_or_insert_with(Default::default).template
    }

    fn selector(&self) -> Option<LabelSelector> {
        self.spec.as_ref().map(|s| s.selector.clone())
    }

    fn replicas(&self) -> Option<i32> {
        Some(self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1))
    }

    fn rollout_complete(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        let replicas = self.replicas().unwrap_or(1);
        generation_observed(self.metadata.generation, status.observed_generation)
            && status.updated_replicas.unwrap_or(0) >= replicas
            && status.replicas.unwrap_or(0) <= status.updated_replicas.unwrap_or(0)
            && status.available_replicas.unwrap_or(0) >= replicas
    }
}

impl Workload for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn template_mut(&mut self) -> &mut PodTemplateSpec {
        &mut self.spec.get_or_insert_with(Default::default).template
    }

    fn selector(&self) -> Option<LabelSelector> {
        self.spec.as_ref().map(|s| s.selector.clone())
    }

    fn replicas(&self) -> Option<i32> {
        None
    }

    fn rollout_complete(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        generation_observed(self.metadata.generation, status.observed_generation)
            && status.updated_number_scheduled.unwrap_or(0) >= status.desired_number_scheduled
            && status.number_ready >= status.desired_number_scheduled
    }

    fn recreates_pods_on_template_change(&self) -> bool {
        let strategy = self
            .spec
            .as_ref()
            .and_then(|s| s.update_strategy.as_ref())
            .and_then(|s| s.type_.as_deref());
        strategy != Some(ON_DELETE)
    }
}

impl Workload for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn template_mut(&mut self) -> &mut PodTemplateSpec {
        &mut self.spec.get_or_insert_with(Default::default).template
    }

    fn selector(&self) -> Option<LabelSelector> {
        self.spec.as_ref().map(|s| s.selector.clone())
    }

    fn replicas(&self) -> Option<i32> {
        Some(self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1))
    }

    fn rollout_complete(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        let replicas = self.replicas().unwrap_or(1);
        generation_observed(self.metadata.generation, status.observed_generation)
            && status.updated_replicas.unwrap_or(0) >= replicas
            && status.ready_replicas.unwrap_or(0) >= replicas
    }

    fn recreates_pods_on_template_change(&self) -> bool {
        let strategy = self
            .spec
            .as_ref()
            .and_then(|s| s.update_strategy.as_ref())
            .and_then(|s| s.type_.as_deref());
        strategy != Some(ON_DELETE)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::{
        DaemonSetSpec, DaemonSetStatus, DaemonSetUpdateStrategy, DeploymentSpec, DeploymentStatus,
        StatefulSetSpec, StatefulSetUpdateStrategy,
    };
    use k8s_openapi::api::core::v1::{ReplicationControllerSpec, ReplicationControllerStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn meta(generation: i64) -> ObjectMeta {
        ObjectMeta {
            name: Some("app".to_string()),
            namespace: Some("default".to_string()),
            generation: Some(generation),
            ..Default::default()
        }
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("deployment".parse::<WorkloadKind>().unwrap(), WorkloadKind::Deployment);
        assert_eq!("StatefulSet".parse::<WorkloadKind>().unwrap(), WorkloadKind::StatefulSet);
        assert!("CronJob".parse::<WorkloadKind>().is_err());
    }

    #[test]
    fn lock_name_is_derived_from_kind_and_name() {
        let reference = WorkloadReference::new(WorkloadKind::Deployment, "default", "app");
        assert_eq!(reference.lock_name(), "lock-deployment-app");
    }

    #[test]
    fn rc_selector_becomes_match_labels() {
        let rc = ReplicationController {
            metadata: meta(1),
            spec: Some(ReplicationControllerSpec {
                selector: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                ..Default::default()
            }),
            ..Default::default()
        };
        let selector = rc.selector().unwrap();
        assert_eq!(
            selector.match_labels.unwrap().get("app").map(String::as_str),
            Some("web")
        );
        assert_eq!(rc.replicas(), Some(1));
    }

    #[test]
    fn rc_rollout_waits_for_ready_replicas() {
        let mut rc = ReplicationController {
            metadata: meta(2),
            spec: Some(ReplicationControllerSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: Some(ReplicationControllerStatus {
                observed_generation: Some(2),
                ready_replicas: Some(1),
                replicas: 2,
                ..Default::default()
            }),
        };
        assert!(!rc.rollout_complete());

        if let Some(status) = rc.status.as_mut() {
            status.ready_replicas = Some(2);
        }
        assert!(rc.rollout_complete());
    }

    #[test]
    fn deployment_rollout_requires_observed_generation() {
        let deployment = Deployment {
            metadata: meta(3),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(2),
                replicas: Some(1),
                updated_replicas: Some(1),
                available_replicas: Some(1),
                ..Default::default()
            }),
        };
        assert!(!deployment.rollout_complete());
    }

    #[test]
    fn daemonset_has_no_replica_count() {
        let ds = DaemonSet {
            metadata: meta(1),
            spec: Some(DaemonSetSpec::default()),
            status: Some(DaemonSetStatus {
                observed_generation: Some(1),
                desired_number_scheduled: 3,
                updated_number_scheduled: Some(3),
                number_ready: 3,
                ..Default::default()
            }),
        };
        assert_eq!(ds.replicas(), None);
        assert!(ds.rollout_complete());
    }

    #[test]
    fn only_rolling_controllers_recreate_pods() {
        assert!(!ReplicationController::default().recreates_pods_on_template_change());
        assert!(!ReplicaSet::default().recreates_pods_on_template_change());
        assert!(Deployment::default().recreates_pods_on_template_change());
        assert!(DaemonSet::default().recreates_pods_on_template_change());
        assert!(StatefulSet::default().recreates_pods_on_template_change());

        let on_delete_ds = DaemonSet {
            spec: Some(DaemonSetSpec {
                update_strategy: Some(DaemonSetUpdateStrategy {
                    type_: Some("OnDelete".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!on_delete_ds.recreates_pods_on_template_change());

        let on_delete_sts = StatefulSet {
            spec: Some(StatefulSetSpec {
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("OnDelete".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!on_delete_sts.recreates_pods_on_template_change());
    }

    #[test]
    fn template_mut_creates_missing_template() {
        let mut rs = ReplicaSet::default();
        rs.template_mut().metadata = Some(ObjectMeta {
            labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
            ..Default::default()
        });
        assert_eq!(rs.template_labels().get("app").map(String::as_str), Some("web"));
    }
}
