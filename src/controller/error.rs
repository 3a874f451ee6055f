//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;

use thiserror::Error;

use crate::client::{GatewayError, WorkloadError};

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Elasticsearch administrative API error
    #[error("Elasticsearch error: {0}")]
    Gateway(#[from] GatewayError),

    /// Workload provider error
    #[error("Workload error: {0}")]
    Workload(#[from] WorkloadError),

    /// A bounded wait expired
    #[error("Timed out after {duration:?} waiting for {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Optimistic concurrency conflict that survived all retries
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
            || matches!(self, Error::Workload(WorkloadError::Kube(kube::Error::Api(e))) if e.code == 404)
    }

    /// Check if this error indicates an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 409,
            Error::Workload(WorkloadError::Kube(kube::Error::Api(e))) => e.code == 409,
            _ => false,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) | Error::Workload(WorkloadError::Kube(e)) => {
                // Retry on conflicts, network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err)
                        if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Workload(_) => true,
            // The cluster may be mid-restart; retry
            Error::Gateway(_) => true,
            Error::Transient(_) | Error::Timeout { .. } | Error::Conflict(_) => true,
            Error::Validation(_) | Error::Permanent(_) | Error::MissingField(_) => false,
            Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        self.requeue_after_with_retry_count(0)
    }

    /// Requeue duration with exponential backoff: 5s doubling up to 300s.
    pub fn requeue_after_with_retry_count(&self, retry_count: u32) -> Duration {
        if !self.is_retryable() {
            return Duration::from_secs(300);
        }
        let base: u64 = 5;
        let factor = 1u64.checked_shl(retry_count.min(16)).unwrap_or(u64::MAX);
        Duration::from_secs(base.saturating_mul(factor).min(300))
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
