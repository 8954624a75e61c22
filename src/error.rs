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

    /// Create collided with an existing object
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// A referenced resource could not be resolved
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bounded poll ran out of time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Work abandoned because the operator is shutting down
    #[error("Cancelled: {0}")]
    Cancelled(String),

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

    /// Create a resolution error
    pub fn resolution(msg: impl Into<String>) -> Self {
        Error::Resolution(msg.into())
    }

    /// True for a create that hit an existing object
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// True for a missing object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Map a raw API error, turning 404 and 409 into their own variants.
    pub fn from_api(err: kube::Error, what: impl Into<String>) -> Self {
        match err {
            kube::Error::Api(api_err) if api_err.code == 404 => Error::NotFound(what.into()),
            kube::Error::Api(api_err) if api_err.code == 409 && api_err.reason == "AlreadyExists" => {
                Error::AlreadyExists(what.into())
            }
            other => Error::Kube(other),
        }
    }

    /// Short label used for metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::AlreadyExists(_) => "already_exists",
            Error::NotFound(_) => "not_found",
            Error::Validation(_) => "validation",
            Error::Resolution(_) => "resolution",
            Error::Config(_) => "config",
            Error::Timeout(_) => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Serialization(_) => "serialization",
        }
    }
}
