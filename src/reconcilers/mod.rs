//! Reconcilers for workloads, policies, jobs and recoveries
//!
//! This module contains the business logic the controllers drive:
//! - Resolving the policy that selects a workload and planning the change
//! - Injecting and removing the backup container
//! - Maintaining the RBAC objects backup containers and restore jobs run under
//! - Collecting succeeded jobs
//! - Running recoveries

pub mod injection;
pub mod jobs;
pub mod policy;
pub mod rbac;
pub mod recovery;
pub mod workload;
