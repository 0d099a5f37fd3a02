//! Per-key exponential backoff

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Exponential per-item failure rate limiter.
///
/// Every call to [`RateLimiter::when`] for a key doubles that key's delay,
/// starting at `base_delay` and capped at `max_delay`. [`RateLimiter::forget`]
/// resets the history.
#[derive(Debug)]
pub struct RateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl RateLimiter {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a requeue of `key` and return how long to wait before it is re-added
    pub fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);

        // 2^31 * base already exceeds any sane max_delay
        let factor = 1u32.checked_shl(exponent.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Number of times `key` has been requeued since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.get(key).copied().unwrap_or(0)
    }

    /// Clear the failure history of `key`
    pub fn forget(&self, key: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.remove(key);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_failure() {
        let limiter = RateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        assert_eq!(limiter.when("a"), Duration::from_millis(5));
        assert_eq!(limiter.when("a"), Duration::from_millis(10));
        assert_eq!(limiter.when("a"), Duration::from_millis(20));
        assert_eq!(limiter.num_requeues("a"), 3);

        // independent history per key
        assert_eq!(limiter.when("b"), Duration::from_millis(5));
    }

    #[test]
    fn delay_is_capped() {
        let limiter = RateLimiter::new(Duration::from_secs(1), Duration::from_secs(4));
        let delays: Vec<_> = (0..40).map(|_| limiter.when("k")).collect();
        assert_eq!(delays[2], Duration::from_secs(4));
        assert_eq!(delays[39], Duration::from_secs(4));
    }

    #[test]
    fn forget_resets_history() {
        let limiter = RateLimiter::default();
        limiter.when("k");
        limiter.when("k");
        limiter.forget("k");
        assert_eq!(limiter.num_requeues("k"), 0);
        assert_eq!(limiter.when("k"), Duration::from_millis(5));
    }
}
