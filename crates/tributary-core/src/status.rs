//! Status envelope returned by actions and by flow runs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome code of an action invocation or a flow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// Completed successfully
    Ok,
    /// Stopped cooperatively before completion
    Cancelled,
    /// Failed for an unclassified reason
    Unknown,
    /// Caller supplied something malformed
    InvalidArgument,
    /// A referenced entity does not exist
    NotFound,
    /// The system is not in a state that allows the operation
    FailedPrecondition,
    /// A quota or budget was exhausted
    ResourceExhausted,
    /// The operation is not implemented
    Unimplemented,
    /// Internal invariant or infrastructure failure
    Internal,
}

impl StatusCode {
    /// Whether this code represents success
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    /// Whether an action failing with this code may be invoked again
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            StatusCode::Ok
                | StatusCode::Cancelled
                | StatusCode::InvalidArgument
                | StatusCode::Unimplemented
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A status code, an optional message and zero or more contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status<T> {
    /// Outcome code
    pub code: StatusCode,

    /// Human readable message, usually set for failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Produced contents
    #[serde(default = "Vec::new")]
    pub contents: Vec<T>,
}

impl<T> Status<T> {
    /// Successful status carrying a single content item
    pub fn ok(content: T) -> Self {
        Self {
            code: StatusCode::Ok,
            message: None,
            contents: vec![content],
        }
    }

    /// Failed status without contents
    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            contents: Vec::new(),
        }
    }

    /// Failed status that still carries contents
    pub fn error_with(code: StatusCode, message: impl Into<String>, content: T) -> Self {
        Self {
            code,
            message: Some(message.into()),
            contents: vec![content],
        }
    }

    /// Whether the code is [`StatusCode::Ok`]
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Consume the status and return its first content item
    pub fn into_content(self) -> Option<T> {
        self.contents.into_iter().next()
    }

    /// Map the contents while keeping code and message
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Status<U> {
        Status {
            code: self.code,
            message: self.message,
            contents: self.contents.into_iter().map(f).collect(),
        }
    }
}

impl<T> From<crate::CoreError> for Status<T> {
    fn from(err: crate::CoreError) -> Self {
        Status::error(err.status_code(), err.to_string())
    }
}
