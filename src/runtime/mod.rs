//! Watch-queue-reconcile plumbing
//!
//! Each watched kind gets a [`WatchedCollection`]: a reflector-backed cache
//! feeding a deduplicating, rate-limited [`WorkQueue`] of `namespace/name`
//! keys, drained by the bounded worker loop in [`worker`].

mod collection;
mod rate_limiter;
mod work_queue;
pub mod worker;

pub use collection::{object_key, split_key, KeyFeed, WatchedCollection};
pub use rate_limiter::RateLimiter;
pub use work_queue::WorkQueue;
pub use worker::{run_worker, run_workers};
