//! Error types for the AuthCluster operator

use std::time::Duration;

use thiserror::Error;

/// Main error type for operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An API call did not complete within its deadline
    #[error("{operation} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// An object returned by the API server lacks a required field
    #[error("missing field: {0}")]
    MissingField(String),
}

/// How the reconciler should react to an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad spec: terminal until the user edits the resource
    Validation,
    /// Network or server failure: retry with exponential backoff
    Transient,
    /// Stale resourceVersion on write: re-fetch and retry immediately
    Conflict,
    /// Create raced with another writer: the existing object wins
    AlreadyExists,
    /// Object is gone: benign for deletes and parent lookups
    NotFound,
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a missing-field error
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }

    /// Build an API error as the server would report it.
    ///
    /// Used by in-memory clients to reproduce API server failure modes.
    pub fn api(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: message.into(),
            reason: reason.into(),
            code,
        }))
    }

    /// HTTP status code when this is an API server response
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Self::Kube(kube::Error::Api(e)) => Some(e.code),
            _ => None,
        }
    }

    fn api_reason(&self) -> Option<&str> {
        match self {
            Self::Kube(kube::Error::Api(e)) => Some(e.reason.as_str()),
            _ => None,
        }
    }

    /// Classify this error for the reconciler
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Kube(kube::Error::Api(e)) => match (e.code, e.reason.as_str()) {
                (404, _) => ErrorKind::NotFound,
                (409, "AlreadyExists") => ErrorKind::AlreadyExists,
                (409, _) => ErrorKind::Conflict,
                _ => ErrorKind::Transient,
            },
            _ => ErrorKind::Transient,
        }
    }

    /// True when a create lost a race with another writer
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// True when the target object does not exist
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// True when a write used a stale resourceVersion
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// True when the error should be retried with backoff
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Short machine-readable reason for status conditions
    pub fn reason(&self) -> &str {
        match self {
            Self::Validation(_) => "ValidationFailed",
            Self::Timeout { .. } => "Timeout",
            Self::Serialization(_) => "SerializationFailed",
            Self::MissingField(_) => "MissingField",
            Self::Kube(_) => self.api_reason().unwrap_or("KubernetesError"),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
