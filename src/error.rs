//! Central error types for the ClickHouse operator
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use thiserror::Error;

/// Central error type for the ClickHouse operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Installation spec failed normalization
    #[error("Normalization error: {0}")]
    NormalizationError(String),

    /// Installation spec validation error
    #[error("Installation validation error: {0}")]
    ValidationError(String),

    /// Finalizer-related error during teardown
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Operator configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Resource not found in the cluster
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// SQL-side operation against a ClickHouse host failed
    #[error("Schema operation failed on {host}: {message}")]
    SchemaError { host: String, message: String },

    /// HTTP request error (from reqwest)
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Check if this error type should trigger a retry
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_) | Error::HttpError(_) | Error::SchemaError { .. }
        )
    }

    /// True when the underlying cause is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => e.code == 404,
            Error::NotFound { .. } => true,
            _ => false,
        }
    }

    /// Convert to a human-readable message for status updates
    pub fn status_message(&self) -> String {
        match self {
            Error::KubeError(e) => format!("Kubernetes error: {}", e),
            Error::ValidationError(msg) => format!("Validation failed: {}", msg),
            Error::NormalizationError(msg) => format!("Normalization failed: {}", msg),
            Error::SchemaError { host, message } => {
                format!("Schema operation on {} failed: {}", host, message)
            }
            _ => self.to_string(),
        }
    }
}
