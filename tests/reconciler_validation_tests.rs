//! Integration tests for reconciler decision and validation logic
//!
//! These tests drive the public reconciler API with in-memory objects and
//! verify policy resolution, the reconcile plan, validation and job
//! collection without a cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{
    Container, PodSpec, PodTemplateSpec, ReplicationController, ReplicationControllerSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use kube::ResourceExt;
use workload_backup_operator::adapters::needs_write;
use workload_backup_operator::config::Options;
use workload_backup_operator::crd::{
    BackendSpec, BackupMode, BackupPolicy, BackupPolicySpec, FileGroup, LocalSpec,
    ObjectStoreSpec, Recovery, RecoverySpec, WorkloadRef,
};
use workload_backup_operator::reconcilers::injection::{self, BACKUP_CONTAINER};
use workload_backup_operator::reconcilers::policy::{
    self, Plan, PolicyLister, LAST_APPLIED_CONFIGURATION, VERSION_TAG,
};
use workload_backup_operator::reconcilers::{jobs, recovery};
use workload_backup_operator::workloads::{Workload, WorkloadKind, WorkloadReference};
use workload_backup_operator::Error;

// ============================================================================
// Test Helpers
// ============================================================================

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn default_metadata(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("default".to_string()),
        resource_version: Some("1".to_string()),
        uid: Some(format!("uid-{}", name)),
        ..Default::default()
    }
}

fn s3_backend() -> BackendSpec {
    BackendSpec {
        storage_secret_name: "repo-creds".to_string(),
        s3: Some(ObjectStoreSpec {
            bucket: "backups".to_string(),
            endpoint: Some("http://minio:9000".to_string()),
            prefix: None,
        }),
        ..Default::default()
    }
}

fn valid_policy_spec(app: &str) -> BackupPolicySpec {
    BackupPolicySpec {
        selector: LabelSelector {
            match_labels: Some(labels(&[("app", app)])),
            ..Default::default()
        },
        // cron crate uses 6 or 7 fields: sec min hour day_of_month month day_of_week [year]
        schedule: "0 0 */6 * * *".to_string(),
        mode: BackupMode::Online,
        file_groups: vec![FileGroup {
            path: "/var/lib/data".to_string(),
            tags: vec!["data".to_string()],
        }],
        backend: s3_backend(),
        volume_mounts: vec![],
        resources: None,
    }
}

fn create_policy(name: &str, spec: BackupPolicySpec) -> BackupPolicy {
    BackupPolicy {
        metadata: default_metadata(name),
        spec,
        status: None,
    }
}

fn pod_template(app: &str) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels(&[("app", app)])),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                image: Some("busybox".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

fn create_rc(name: &str, app: &str, replicas: i32) -> ReplicationController {
    ReplicationController {
        metadata: default_metadata(name),
        spec: Some(ReplicationControllerSpec {
            replicas: Some(replicas),
            selector: Some(labels(&[("app", app)])),
            template: Some(pod_template(app)),
            ..Default::default()
        }),
        status: None,
    }
}

fn create_statefulset(name: &str, app: &str, replicas: i32) -> StatefulSet {
    StatefulSet {
        metadata: default_metadata(name),
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels(&[("app", app)])),
                ..Default::default()
            },
            template: pod_template(app),
            ..Default::default()
        }),
        status: None,
    }
}

fn resolve<K: Workload>(
    lister: &impl PolicyLister,
    workload: &K,
) -> Result<Option<Arc<BackupPolicy>>, Error> {
    lister.find_matching_policy(&workload.reference(), &workload.template_labels())
}

/// Run one reconcile decision and apply its pod template mutation in memory
fn converge<K: Workload>(lister: &impl PolicyLister, workload: K) -> Result<(K, bool), Error> {
    let applied = policy::applied_policy(workload.annotations())?;
    let desired = resolve(lister, &workload)?;
    match policy::plan(&workload, applied, desired)? {
        Plan::NoOp | Plan::WaitForPeer => Ok((workload, false)),
        Plan::ReleaseInitializer => Ok((injection::apply_initializer_release(workload), true)),
        Plan::Inject { old, new } => {
            let injected = injection::injected(workload, old.as_ref(), &new, &Options::default(), None)?;
            Ok((injected, true))
        }
        Plan::Remove { old } => Ok((injection::apply_removal(workload, &old), true)),
    }
}

fn backup_containers(template: &PodTemplateSpec) -> usize {
    let spec = template.spec.as_ref().unwrap();
    spec.containers
        .iter()
        .chain(spec.init_containers.iter().flatten())
        .filter(|c| c.name == BACKUP_CONTAINER)
        .count()
}

// ============================================================================
// Policy Resolution Tests
// ============================================================================

#[test]
fn resolution_picks_the_single_matching_policy() {
    let lister = vec![
        Arc::new(create_policy("web-backup", valid_policy_spec("web"))),
        Arc::new(create_policy("db-backup", valid_policy_spec("db"))),
    ];
    let found = resolve(&lister, &create_rc("web", "web", 1)).unwrap().unwrap();
    assert_eq!(found.metadata.name.as_deref(), Some("web-backup"));
}

#[test]
fn resolution_supports_match_expressions() {
    let mut spec = valid_policy_spec("unused");
    spec.selector = LabelSelector {
        match_expressions: Some(vec![LabelSelectorRequirement {
            key: "app".to_string(),
            operator: "In".to_string(),
            values: Some(vec!["web".to_string(), "api".to_string()]),
        }]),
        ..Default::default()
    };
    let lister = vec![Arc::new(create_policy("frontends", spec))];

    assert!(resolve(&lister, &create_rc("web", "web", 1)).unwrap().is_some());
    assert!(resolve(&lister, &create_rc("db", "db", 1)).unwrap().is_none());
}

#[test]
fn resolution_refuses_ambiguous_matches() {
    let lister = vec![
        Arc::new(create_policy("hourly", valid_policy_spec("web"))),
        Arc::new(create_policy("nightly", valid_policy_spec("web"))),
    ];
    let err = resolve(&lister, &create_rc("web", "web", 1)).unwrap_err();
    assert!(matches!(err, Error::AmbiguousPolicy { .. }));
    assert!(err.is_terminal());
    assert!(err.to_string().contains("ReplicationController default/web"));
}

// ============================================================================
// Reconcile Plan Tests
// ============================================================================

#[test]
fn second_reconcile_of_unchanged_pair_is_a_noop() {
    let lister = vec![Arc::new(create_policy("web-backup", valid_policy_spec("web")))];

    let (once, changed) = converge(&lister, create_rc("web", "web", 1)).unwrap();
    assert!(changed);
    let (twice, changed) = converge(&lister, once.clone()).unwrap();
    assert!(!changed);
    assert_eq!(once, twice);
    assert!(!needs_write(&once, &twice).unwrap(), "second pass issues no write");
    assert_eq!(backup_containers(twice.template().unwrap()), 1);
}

#[test]
fn reinjecting_the_applied_policy_writes_nothing() {
    let lister = vec![Arc::new(create_policy("web-backup", valid_policy_spec("web")))];
    let (once, _) = converge(&lister, create_rc("web", "web", 1)).unwrap();

    let applied = policy::applied_policy(once.annotations()).unwrap();
    let again = injection::injected(
        once.clone(),
        applied.as_ref(),
        &lister[0],
        &Options::default(),
        None,
    )
    .unwrap();
    assert!(!needs_write(&once, &again).unwrap());
}

#[test]
fn policy_spec_change_is_reapplied() {
    let mut lister = vec![Arc::new(create_policy("web-backup", valid_policy_spec("web")))];
    let (injected, _) = converge(&lister, create_rc("web", "web", 1)).unwrap();

    let mut spec = valid_policy_spec("web");
    spec.schedule = "0 30 1 * * *".to_string();
    lister = vec![Arc::new(create_policy("web-backup", spec))];

    let (updated, changed) = converge(&lister, injected).unwrap();
    assert!(changed);
    assert_eq!(backup_containers(updated.template().unwrap()), 1);
    let applied = policy::applied_policy(updated.annotations()).unwrap().unwrap();
    assert_eq!(applied.spec.schedule, "0 30 1 * * *");
}

#[test]
fn relabelled_workload_has_sidecar_removed() {
    let lister = vec![Arc::new(create_policy("web-backup", valid_policy_spec("web")))];
    let original = create_rc("web", "web", 1);
    let (mut injected, _) = converge(&lister, original.clone()).unwrap();

    injected.template_mut().metadata = Some(ObjectMeta {
        labels: Some(labels(&[("app", "web-v2")])),
        ..Default::default()
    });

    let (removed, changed) = converge(&lister, injected).unwrap();
    assert!(changed);
    assert_eq!(backup_containers(removed.template().unwrap()), 0);
    assert!(!removed.annotations().contains_key(LAST_APPLIED_CONFIGURATION));
    assert!(!removed.annotations().contains_key(VERSION_TAG));
    assert_eq!(
        removed.template().unwrap().spec.as_ref().unwrap().volumes,
        original.template().unwrap().spec.as_ref().unwrap().volumes
    );
}

#[test]
fn deleted_policy_leads_to_removal() {
    let lister = vec![Arc::new(create_policy("web-backup", valid_policy_spec("web")))];
    let (injected, _) = converge(&lister, create_rc("web", "web", 1)).unwrap();

    let empty: Vec<Arc<BackupPolicy>> = vec![];
    let (removed, changed) = converge(&empty, injected).unwrap();
    assert!(changed);
    assert_eq!(backup_containers(removed.template().unwrap()), 0);
}

#[test]
fn unselected_workload_is_left_alone() {
    let lister = vec![Arc::new(create_policy("db-backup", valid_policy_spec("db")))];
    let original = create_rc("web", "web", 1);
    let (after, changed) = converge(&lister, original.clone()).unwrap();
    assert!(!changed);
    assert_eq!(after, original);
}

#[test]
fn offline_policy_with_two_replicas_is_rejected() {
    let mut spec = valid_policy_spec("db");
    spec.mode = BackupMode::Offline;
    let lister = vec![Arc::new(create_policy("db-backup", spec))];

    let err = converge(&lister, create_statefulset("db", "db", 2)).unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));
    assert!(err.is_terminal());
}

#[test]
fn offline_policy_on_single_replica_uses_init_container() {
    let mut spec = valid_policy_spec("db");
    spec.mode = BackupMode::Offline;
    let lister = vec![Arc::new(create_policy("db-backup", spec))];

    let (injected, _) = converge(&lister, create_statefulset("db", "db", 1)).unwrap();
    let pod = injected.template().unwrap().spec.as_ref().unwrap();
    assert_eq!(pod.containers.len(), 1);
    assert_eq!(pod.init_containers.as_ref().unwrap()[0].name, BACKUP_CONTAINER);
}

#[test]
fn offline_policy_on_daemonset_is_allowed() {
    let mut spec = valid_policy_spec("agent");
    spec.mode = BackupMode::Offline;
    let lister = vec![Arc::new(create_policy("agent-backup", spec))];

    let daemon_set = DaemonSet {
        metadata: default_metadata("agent"),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels(&[("app", "agent")])),
                ..Default::default()
            },
            template: pod_template("agent"),
            ..Default::default()
        }),
        status: None,
    };
    let (injected, changed) = converge(&lister, daemon_set).unwrap();
    assert!(changed);
    assert_eq!(backup_containers(injected.template().unwrap()), 1);
}

#[test]
fn invalid_policy_is_a_terminal_error() {
    let mut spec = valid_policy_spec("web");
    spec.schedule = "every night".to_string();
    let lister = vec![Arc::new(create_policy("web-backup", spec))];

    let err = converge(&lister, create_rc("web", "web", 1)).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(err.is_terminal());
}

// ============================================================================
// BackupPolicy Validation Tests
// ============================================================================

#[test]
fn policy_valid_spec_passes_validation() {
    assert!(policy::validate(&create_policy("ok", valid_policy_spec("web"))).is_ok());
}

#[test]
fn policy_empty_selector_fails_validation() {
    let mut spec = valid_policy_spec("web");
    spec.selector = LabelSelector::default();
    assert!(policy::validate(&create_policy("p", spec)).is_err());
}

#[test]
fn policy_local_backend_requires_single_source() {
    let mut spec = valid_policy_spec("web");
    spec.backend = BackendSpec {
        storage_secret_name: "repo-creds".to_string(),
        local: Some(LocalSpec {
            mount_path: "/repo".to_string(),
            sub_path: None,
            host_path: None,
            claim_name: None,
        }),
        ..Default::default()
    };
    assert!(policy::validate(&create_policy("p", spec.clone())).is_err());

    if let Some(local) = spec.backend.local.as_mut() {
        local.claim_name = Some("repo-pvc".to_string());
    }
    assert!(policy::validate(&create_policy("p", spec)).is_ok());
}

#[test]
fn policy_missing_secret_fails_validation() {
    let mut spec = valid_policy_spec("web");
    spec.backend.storage_secret_name = String::new();
    let err = policy::validate(&create_policy("p", spec)).unwrap_err();
    assert!(err.to_string().contains("secret"));
}

// ============================================================================
// Recovery Validation Tests
// ============================================================================

fn valid_recovery_spec() -> RecoverySpec {
    RecoverySpec {
        workload: WorkloadRef {
            kind: WorkloadKind::ReplicationController,
            name: "web".to_string(),
        },
        backend: s3_backend(),
        paths: vec!["/var/lib/data".to_string()],
        recovered_volumes: vec![LocalSpec {
            mount_path: "/var/lib/data".to_string(),
            sub_path: None,
            host_path: Some("/mnt/restore".to_string()),
            claim_name: None,
        }],
        node_name: None,
        pod_ordinal: None,
    }
}

fn create_recovery(spec: RecoverySpec) -> Recovery {
    Recovery {
        metadata: default_metadata("test-recovery"),
        spec,
        status: None,
    }
}

#[test]
fn recovery_valid_spec_passes_validation() {
    assert!(recovery::validate(&create_recovery(valid_recovery_spec())).is_ok());
}

#[test]
fn recovery_empty_workload_name_fails_validation() {
    let mut spec = valid_recovery_spec();
    spec.workload.name = String::new();
    assert!(recovery::validate(&create_recovery(spec)).is_err());
}

#[test]
fn recovery_daemonset_requires_node_name() {
    let mut spec = valid_recovery_spec();
    spec.workload.kind = WorkloadKind::DaemonSet;
    assert!(recovery::validate(&create_recovery(spec.clone())).is_err());

    spec.node_name = Some("node-1".to_string());
    assert!(recovery::validate(&create_recovery(spec)).is_ok());
}

#[test]
fn recovery_job_is_collectable_by_the_job_collector() {
    let job = recovery::build_job(&create_recovery(valid_recovery_spec()), &Options::default())
        .unwrap();
    let labels = job.metadata.labels.unwrap();
    let (key, value) = jobs::JOB_SELECTOR.split_once('=').unwrap();
    assert_eq!(labels.get(key).map(String::as_str), Some(value));
}

// ============================================================================
// Job Collection Tests
// ============================================================================

#[test]
fn only_succeeded_jobs_are_collected() {
    let job = |succeeded: i32, failed: i32| Job {
        status: Some(JobStatus {
            succeeded: Some(succeeded),
            failed: Some(failed),
            ..Default::default()
        }),
        ..Default::default()
    };

    let collected: Vec<bool> = [job(0, 0), job(1, 0), job(0, 4), job(2, 1)]
        .iter()
        .map(jobs::should_collect)
        .collect();
    assert_eq!(collected, vec![false, true, false, true]);
}

// ============================================================================
// Workload Identity Tests
// ============================================================================

#[test]
fn lock_name_is_derived_from_kind_and_name() {
    let reference = WorkloadReference::new(WorkloadKind::StatefulSet, "default", "db");
    assert_eq!(reference.lock_name(), "lock-statefulset-db");
    assert_eq!(create_statefulset("db", "db", 1).reference(), reference);
}
