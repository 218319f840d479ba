//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior and the
//! reconcile control-flow sentinels.

use std::time::Duration;
use thiserror::Error;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A sub-reconciler chose to skip its object; callers treat this as
    /// success.
    #[error("reconcile ignored")]
    CrudIgnore,

    /// Hard stop: surfaces to the top reconciler and aborts the whole pass.
    #[error("reconcile aborted")]
    CrudAbort,

    /// Data loss detected on a host's volumes. Not a failure by itself: it
    /// forces StatefulSet recreation and table re-migration.
    #[error("data loss detected: {0}")]
    DataLoss(String),

    /// Error from the ClickHouse schemer
    #[error("schemer error: {0}")]
    Schemer(String),

    /// A poll predicate did not succeed within its deadline
    #[error("poll timed out: {0}")]
    PollTimeout(String),

    /// Operator pod identity env vars are absent; fatal only for the
    /// self-labeler.
    #[error("operator pod not specified")]
    OperatorPodNotSpecified,

    /// Self-labeling failed on a specific resource of the owner chain
    #[error("failed to label {0}")]
    LabelResource(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Whether this is the skip sentinel.
    pub fn is_ignore(&self) -> bool {
        matches!(self, Error::CrudIgnore)
    }

    /// Whether this is the hard-abort sentinel.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::CrudAbort)
    }

    /// Whether this is the data-loss signal.
    pub fn is_data_loss(&self) -> bool {
        matches!(self, Error::DataLoss(_))
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Schemer(_) | Error::PollTimeout(_) => true,
            _ => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(300)
        }
    }
}

/// Classify a raw kube error as not-found.
pub fn is_not_found_kube(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_classification() {
        assert!(Error::CrudIgnore.is_ignore());
        assert!(!Error::CrudIgnore.is_abort());
        assert!(Error::CrudAbort.is_abort());
        assert!(Error::DataLoss("pvc data-chi-x-0-0".to_string()).is_data_loss());
        assert!(!Error::CrudAbort.is_data_loss());
    }

    #[test]
    fn test_sentinels_are_not_retryable() {
        assert!(!Error::CrudIgnore.is_retryable());
        assert!(!Error::CrudAbort.is_retryable());
        assert!(!Error::DataLoss("x".to_string()).is_retryable());
    }

    #[test]
    fn test_schemer_errors_are_retryable() {
        let err = Error::Schemer("connection refused".to_string());
        assert!(err.is_retryable());
        assert_eq!(err.requeue_after(), Duration::from_secs(30));
    }
}
