//! Deduplicating, rate-limited FIFO of resource keys

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::RateLimiter;

/// A work queue of `namespace/name` keys.
///
/// - A key added while already pending collapses into the pending entry.
/// - A key handed out by [`WorkQueue::get`] is not handed out again until
///   [`WorkQueue::done`] is called for it; re-adds in the meantime are
///   parked and dispatched on `done`. This gives at most one in-flight
///   reconcile per key even with several workers.
/// - [`WorkQueue::add_rate_limited`] re-adds a key after the rate limiter's
///   backoff for it; [`WorkQueue::forget`] clears that history.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    limiter: RateLimiter,
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

impl WorkQueue {
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                limiter,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark `key` as needing processing
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Re-add `key` once its backoff has elapsed
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        if self.is_shutting_down() {
            return;
        }
        let key = key.into();
        let delay = self.shared.limiter.when(&key);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Number of rate-limited re-adds of `key` since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.shared.limiter.num_requeues(key)
    }

    /// Clear the retry history of `key`
    pub fn forget(&self, key: &str) {
        self.shared.limiter.forget(key);
    }

    /// Wait for the next key. Returns `None` once the queue is shut down;
    /// keys still pending at that point are not handed out.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.shared.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as finished. A re-add that arrived while it was being
    /// processed is dispatched now.
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn queue() -> WorkQueue {
        WorkQueue::new(RateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn pending_duplicates_collapse() {
        let queue = queue();
        queue.add("default/app");
        queue.add("default/app");
        queue.add("default/other");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("default/app"));
        assert_eq!(queue.get().await.as_deref(), Some("default/other"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn in_flight_key_is_not_redispatched_until_done() {
        let queue = queue();
        queue.add("default/app");
        let key = queue.get().await.unwrap();

        queue.add("default/app");
        assert!(queue.is_empty(), "re-add must wait for done");

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("default/app"));
    }

    #[tokio::test]
    async fn done_without_readd_drops_key() {
        let queue = queue();
        queue.add("default/app");
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_workers() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("default/app");
        assert!(queue.is_empty(), "adds after shutdown are ignored");
    }

    #[tokio::test]
    async fn shutdown_stops_handing_out_the_backlog() {
        let queue = queue();
        queue.add("default/app");
        queue.add("default/other");
        queue.shutdown();
        assert_eq!(queue.get().await, None);

        queue.add_rate_limited("default/app");
        assert_eq!(queue.num_requeues("default/app"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_arrives_after_backoff() {
        let queue = queue();
        queue.add_rate_limited("default/app");
        assert_eq!(queue.num_requeues("default/app"), 1);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.len(), 1);

        queue.forget("default/app");
        assert_eq!(queue.num_requeues("default/app"), 0);
    }
}
