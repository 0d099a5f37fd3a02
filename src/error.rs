//! Error types for the Workload Backup Operator

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// A structural misconfiguration that retrying cannot fix
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Secret not found
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// More than one policy selects the same workload
    #[error("Workload {workload} is selected by more than one BackupPolicy: {policies:?}")]
    AmbiguousPolicy {
        workload: String,
        policies: Vec<String>,
    },

    /// Malformed work queue key
    #[error("Invalid resource key: {0}")]
    InvalidKey(String),

    /// Readiness barrier failed or timed out
    #[error("Readiness wait failed: {0}")]
    Readiness(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    /// Create a readiness error
    pub fn readiness(msg: impl Into<String>) -> Self {
        Error::Readiness(msg.into())
    }

    /// Terminal errors are dropped from the work queue without retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::Precondition(_)
                | Error::SecretNotFound(_)
                | Error::AmbiguousPolicy { .. }
                | Error::InvalidKey(_)
        )
    }

    /// Whether the API server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Whether the API server rejected a write on a stale resourceVersion
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn precondition_failures_are_terminal() {
        assert!(Error::precondition("offline with 2 replicas").is_terminal());
        assert!(Error::SecretNotFound("default/creds".to_string()).is_terminal());
        assert!(Error::AmbiguousPolicy {
            workload: "default/app".to_string(),
            policies: vec!["a".to_string(), "b".to_string()],
        }
        .is_terminal());
    }

    #[test]
    fn api_and_readiness_failures_are_transient() {
        assert!(!api_error(409).is_terminal());
        assert!(!api_error(500).is_terminal());
        assert!(!Error::readiness("rollout stalled").is_terminal());
    }

    #[test]
    fn api_codes_are_classified() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(404).is_conflict());
        assert!(api_error(409).is_conflict());
        assert!(!Error::config("x").is_not_found());
    }
}
