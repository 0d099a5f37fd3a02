//! Operator options, read from the environment at start-up

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::runtime::RateLimiter;

/// Default sidecar image repository
pub const DEFAULT_SIDECAR_IMAGE: &str = "osodevops/workload-backup-agent";

/// Runtime options shared by all controllers
#[derive(Clone, Debug)]
pub struct Options {
    /// Image repository of the injected container
    pub sidecar_image: String,
    /// Image tag of the injected container, also written to the version annotation
    pub sidecar_image_tag: String,
    /// Create RBAC objects for injected sidecars
    pub enable_rbac: bool,
    /// Retry bound for transient reconcile failures
    pub max_num_requeues: u32,
    /// Worker pool size per watched kind
    pub workers_per_kind: usize,
    /// First backoff delay of a failing key
    pub queue_base_delay: Duration,
    /// Upper bound of the per-key backoff
    pub queue_max_delay: Duration,
    /// Poll interval of readiness barriers
    pub readiness_poll_interval: Duration,
    /// Optional upper bound on a readiness barrier
    pub readiness_timeout: Option<Duration>,
    /// Port of the metrics server
    pub metrics_port: u16,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sidecar_image: DEFAULT_SIDECAR_IMAGE.to_string(),
            sidecar_image_tag: env!("CARGO_PKG_VERSION").to_string(),
            enable_rbac: true,
            max_num_requeues: 5,
            workers_per_kind: 1,
            queue_base_delay: Duration::from_millis(5),
            queue_max_delay: Duration::from_secs(1000),
            readiness_poll_interval: Duration::from_secs(2),
            readiness_timeout: None,
            metrics_port: 8080,
        }
    }
}

impl Options {
    /// Load options from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load options through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let readiness_timeout = match lookup("READINESS_TIMEOUT_SECS") {
            Some(raw) => Some(Duration::from_secs(parse_value("READINESS_TIMEOUT_SECS", &raw)?)),
            None => None,
        };

        let options = Self {
            sidecar_image: lookup("SIDECAR_IMAGE").unwrap_or(defaults.sidecar_image),
            sidecar_image_tag: lookup("SIDECAR_IMAGE_TAG").unwrap_or(defaults.sidecar_image_tag),
            enable_rbac: parse_or(&lookup, "ENABLE_RBAC", defaults.enable_rbac)?,
            max_num_requeues: parse_or(&lookup, "MAX_NUM_REQUEUES", defaults.max_num_requeues)?,
            workers_per_kind: parse_or(&lookup, "WORKERS_PER_KIND", defaults.workers_per_kind)?,
            queue_base_delay: Duration::from_millis(parse_or(&lookup, "QUEUE_BASE_DELAY_MS", 5)?),
            queue_max_delay: Duration::from_secs(parse_or(&lookup, "QUEUE_MAX_DELAY_SECS", 1000)?),
            readiness_poll_interval: Duration::from_secs(parse_or(&lookup, "READINESS_POLL_SECS", 2)?),
            readiness_timeout,
            metrics_port: parse_or(&lookup, "METRICS_PORT", defaults.metrics_port)?,
        };

        if options.workers_per_kind == 0 {
            return Err(Error::config("WORKERS_PER_KIND must be at least 1"));
        }
        if options.readiness_poll_interval.is_zero() {
            return Err(Error::config("READINESS_POLL_SECS must be at least 1"));
        }

        Ok(options)
    }

    /// Full image reference of the injected container
    pub fn sidecar_image_ref(&self) -> String {
        format!("{}:{}", self.sidecar_image, self.sidecar_image_tag)
    }

    /// Rate limiter used by every work queue
    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.queue_base_delay, self.queue_max_delay)
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => parse_value(name, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::config(format!("Invalid value '{}' for {}: {}", raw, name, e)))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let options = Options::from_lookup(lookup_from(&[])).unwrap();
        assert!(options.enable_rbac);
        assert_eq!(options.max_num_requeues, 5);
        assert_eq!(options.workers_per_kind, 1);
        assert_eq!(options.readiness_timeout, None);
        assert_eq!(options.metrics_port, 8080);
    }

    #[test]
    fn overrides_are_parsed() {
        let options = Options::from_lookup(lookup_from(&[
            ("SIDECAR_IMAGE", "registry.local/agent"),
            ("SIDECAR_IMAGE_TAG", "1.2.3"),
            ("ENABLE_RBAC", "false"),
            ("MAX_NUM_REQUEUES", "2"),
            ("READINESS_TIMEOUT_SECS", "600"),
        ]))
        .unwrap();

        assert_eq!(options.sidecar_image_ref(), "registry.local/agent:1.2.3");
        assert!(!options.enable_rbac);
        assert_eq!(options.max_num_requeues, 2);
        assert_eq!(options.readiness_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Options::from_lookup(lookup_from(&[("MAX_NUM_REQUEUES", "many")])).unwrap_err();
        assert!(err.to_string().contains("MAX_NUM_REQUEUES"));

        let err = Options::from_lookup(lookup_from(&[("WORKERS_PER_KIND", "0")])).unwrap_err();
        assert!(err.to_string().contains("WORKERS_PER_KIND"));
    }
}
