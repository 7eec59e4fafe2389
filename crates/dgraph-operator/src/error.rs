//! Error types for the Dgraph Kubernetes Operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Optimistic concurrency retries ran out
    #[error("Update of {kind}/{name} still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted {
        kind: String,
        name: String,
        attempts: u32,
    },

    /// The API server rejected the names of the custom resource definition
    #[error("Name conflict for CustomResourceDefinition {name}: {message}")]
    NameConflict { name: String, message: String },

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Leadership was lost while the controller was running
    #[error("Leadership lost: {0}")]
    LeadershipLost(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Whether retrying soon can succeed without the user changing anything
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::Timeout(_)
                | OperatorError::ConflictRetriesExhausted { .. }
        )
    }

    /// HTTP status code of the underlying API error, if any
    pub fn api_code(&self) -> Option<u16> {
        match self {
            OperatorError::KubeError(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    /// Optimistic concurrency failure (409 Conflict) on an update
    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::KubeError(kube::Error::Api(resp))
            if resp.code == 409 && resp.reason == "Conflict")
    }

    /// The object was created concurrently by someone else
    pub fn is_already_exists(&self) -> bool {
        matches!(self, OperatorError::KubeError(kube::Error::Api(resp))
            if resp.code == 409 && resp.reason == "AlreadyExists")
    }
}

/// Build an API error the way the API server reports it
#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("simulated {}", reason),
        reason: reason.to_string(),
        code,
    }))
}
