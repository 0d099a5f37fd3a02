//! Controllers wiring watched collections to reconcilers
//!
//! Workloads, policies and jobs each run a watched collection with its own
//! work queue and worker pool. Recoveries use a kube-runtime `Controller`.

mod job_controller;
mod policy_controller;
mod recovery_controller;
mod workload_controller;

pub use job_controller::run as run_job_controller;
pub use policy_controller::{
    collection as policy_collection, run as run_policy_controller, PolicyTarget,
};
pub use recovery_controller::run as run_recovery_controller;
pub use workload_controller::{collection as workload_collection, run as run_workload_controller};

use kube::{runtime::reflector::Store, Client};
use tokio_util::sync::CancellationToken;

use crate::adapters::Barrier;
use crate::config::Options;
use crate::crd::BackupPolicy;

/// Shared context for all controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Operator options
    pub options: Options,
    /// Cached BackupPolicies, read when resolving the policy of a workload
    pub policies: Store<BackupPolicy>,
    /// Cancelled once the operator starts shutting down
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Client,
        options: Options,
        policies: Store<BackupPolicy>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            options,
            policies,
            shutdown,
        }
    }

    /// Readiness barrier configured from the options
    pub fn barrier(&self) -> Barrier {
        Barrier {
            poll_interval: self.options.readiness_poll_interval,
            timeout: self.options.readiness_timeout,
            shutdown: self.shutdown.clone(),
        }
    }
}
