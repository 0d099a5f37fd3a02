//! Adapters over the Kubernetes API
//!
//! Small, reusable operations the reconcilers compose:
//! - Create-or-update with optimistic concurrency
//! - Backend secret lookup
//! - Readiness barriers
//! - Leader lock cleanup

pub mod lock;
pub mod objects;
pub mod readiness;
pub mod secrets;

pub use objects::{
    ensure_label, ensure_object, ensure_owner_reference, needs_write, patch_object, Verb,
};
pub use readiness::Barrier;
