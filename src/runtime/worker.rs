//! Bounded retry worker loop

use std::future::Future;

use tracing::{error, warn};

use super::WorkQueue;
use crate::error::{Error, Result};
use crate::metrics;

/// Report a key that will not be retried automatically.
///
/// Emitted once per drop; the key is reconciled again only when a new
/// change event enqueues it.
pub fn report_dropped(kind: &str, key: &str, err: &Error) {
    error!(kind = kind, key = %key, error = %err, "Dropping key out of the queue");
    metrics::DROPPED_KEYS.with_label_values(&[kind]).inc();
}

/// Process one key. Returns `false` once the queue has shut down.
pub async fn process_next<F, Fut>(
    kind: &str,
    queue: &WorkQueue,
    max_num_requeues: u32,
    reconcile: &F,
) -> bool
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let Some(key) = queue.get().await else {
        return false;
    };

    let timer = metrics::RECONCILE_DURATION
        .with_label_values(&[kind])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[kind]).inc();
    let result = reconcile(key.clone()).await;
    timer.observe_duration();

    match result {
        Ok(()) => queue.forget(&key),
        Err(e) => {
            metrics::RECONCILIATION_ERRORS.with_label_values(&[kind]).inc();
            if e.is_terminal() {
                queue.forget(&key);
                report_dropped(kind, &key, &e);
            } else if queue.num_requeues(&key) < max_num_requeues {
                warn!(kind = kind, key = %key, error = %e, "Reconcile failed, requeueing");
                metrics::REQUEUES.with_label_values(&[kind]).inc();
                queue.add_rate_limited(key.clone());
            } else {
                queue.forget(&key);
                report_dropped(kind, &key, &e);
            }
        }
    }

    queue.done(&key);
    true
}

/// Drain `queue` until it shuts down. A single failing key never stops the loop.
pub async fn run_worker<F, Fut>(kind: &str, queue: WorkQueue, max_num_requeues: u32, reconcile: F)
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    while process_next(kind, &queue, max_num_requeues, &reconcile).await {}
}

/// Run `workers` concurrent loops over the same queue
pub async fn run_workers<F, Fut>(
    kind: &str,
    queue: WorkQueue,
    workers: usize,
    max_num_requeues: u32,
    reconcile: F,
) where
    F: Fn(String) -> Fut + Clone,
    Fut: Future<Output = Result<()>>,
{
    let loops = (0..workers.max(1))
        .map(|_| run_worker(kind, queue.clone(), max_num_requeues, reconcile.clone()));
    futures::future::join_all(loops).await;
}
