//! Workload Backup Kubernetes Operator
//!
//! This operator attaches backup sidecars to existing workloads by mutating
//! their pod templates according to `BackupPolicy` resources, and runs
//! one-shot restore Jobs for `Recovery` resources.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod runtime;
pub mod workloads;

pub use error::{Error, Result};
