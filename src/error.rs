//! Error types for the hosted cluster operator
//!
//! Errors carry enough structure for the controller's error policy to decide
//! how to retry. Store-level failures (404, 409) are mapped into dedicated
//! variants at the client boundary so reconcilers never inspect HTTP codes.

use thiserror::Error;

use crate::endpoint::ProbeError;

/// Main error type for reconciliation operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error that is neither a 404 nor a 409
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The requested object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g. "Secret", "AKSClusterConfig")
        kind: String,
        /// Resource name
        name: String,
    },

    /// A dependency this reconciler relies on is not installed or ready yet
    #[error("not yet available: {0}")]
    NotYetAvailable(String),

    /// Optimistic concurrency failure, another writer updated the object first
    #[error("conflict writing {kind} {name}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// No tunnel session exists for a cluster that must be reached through one
    #[error("cluster agent for {0} is not connected")]
    AgentDisconnected(String),

    /// A call against the downstream cluster failed
    #[error("cluster probe failed: {0}")]
    Probe(#[from] ProbeError),

    /// Invalid cluster record content
    #[error("validation error: {0}")]
    Validation(String),

    /// A structural invariant of the records does not hold; retrying will not fix it
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error for the given kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error for the given kind and name
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a not-yet-available error with the given message
    pub fn not_yet_available(msg: impl Into<String>) -> Self {
        Self::NotYetAvailable(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an invariant violation error with the given message
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Map a kube error for a specific object, turning 404 and 409 into
    /// [`Error::NotFound`] and [`Error::Conflict`].
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ref ae) if ae.code == 404 => Self::not_found(kind, name),
            kube::Error::Api(ref ae) if ae.code == 409 => Self::conflict(kind, name),
            other => Self::Kube(other),
        }
    }

    /// True for [`Error::NotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for [`Error::Conflict`]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error is worth retrying without a change to the record
    ///
    /// Validation, invariant and serialization errors require a spec fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(source) => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::NotFound { .. } => true,
            Error::NotYetAvailable(_) => true,
            Error::Conflict { .. } => true,
            Error::AgentDisconnected(_) => true,
            Error::Probe(_) => true,
            Error::Validation(_) => false,
            Error::InvariantViolation(_) => false,
            Error::Serialization(_) => false,
            Error::Internal(_) => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ProbeErrorKind;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    /// Story: the store boundary turns HTTP status codes into domain errors
    ///
    /// Reconcilers branch on "absent" and "someone else wrote first" without
    /// ever looking at status codes.
    #[test]
    fn story_store_errors_are_classified_at_the_boundary() {
        let err = Error::from_kube(api_error(404), "Secret", "ca");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Secret ca not found");

        let err = Error::from_kube(api_error(409), "ManagedCluster", "prod");
        assert!(err.is_conflict());
        assert!(err.is_retryable());

        let err = Error::from_kube(api_error(500), "ManagedCluster", "prod");
        assert!(matches!(err, Error::Kube(_)));
        assert!(err.is_retryable());
    }

    /// Story: only errors that a retry can fix are retryable
    #[test]
    fn story_retry_classification() {
        assert!(Error::not_yet_available("crd missing").is_retryable());
        assert!(Error::AgentDisconnected("c1".to_string()).is_retryable());
        assert!(Error::from(ProbeError::new(ProbeErrorKind::Other, "reset")).is_retryable());

        assert!(!Error::validation("two provider configs").is_retryable());
        assert!(!Error::invariant("cluster has no uid").is_retryable());
        assert!(!Error::serialization("bad spec").is_retryable());
        assert!(!Error::from_kube(api_error(422), "Secret", "s").is_retryable());
    }

    #[test]
    fn test_serde_errors_convert_to_serialization() {
        let err: Error = serde_json::from_str::<u32>("not a number")
            .map_err(Error::from)
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
