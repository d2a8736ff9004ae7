use thiserror::Error;

use crate::status::StatusCode;

/// Core error type for the Tributary engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Flow not found
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Flow definition not found
    #[error("Flow definition not found: {0}")]
    FlowDefinitionNotFound(String),

    /// Structural problem in a flow definition or trigger
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Payload shape or kind mismatch
    #[error("Payload error: {0}")]
    PayloadError(String),

    /// Invalid flow state transition
    #[error("Flow execution error: {0}")]
    FlowExecutionError(String),

    /// Repository or signal history error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    IOError(String),

    /// Work was cancelled cooperatively
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// The status code reported for this error at the run boundary
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::ValidationError(_) | CoreError::PayloadError(_) => {
                StatusCode::InvalidArgument
            }
            CoreError::FlowNotFound(_) | CoreError::FlowDefinitionNotFound(_) => {
                StatusCode::NotFound
            }
            CoreError::FlowExecutionError(_) => StatusCode::FailedPrecondition,
            CoreError::Cancelled(_) => StatusCode::Cancelled,
            CoreError::StateStoreError(_)
            | CoreError::SerializationError(_)
            | CoreError::ConfigurationError(_)
            | CoreError::IOError(_)
            | CoreError::Other(_) => StatusCode::Internal,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::IOError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
