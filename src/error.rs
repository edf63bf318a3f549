//! Hub error vocabulary
//!
//! Every per-message failure maps onto one of these kinds; the wire code is
//! what participants see in the `error` reply. Internal errors never crash
//! the process, they are logged and the operation is aborted.

use thiserror::Error;

/// Error kinds surfaced to participants as inline `error` replies.
#[derive(Debug, Error)]
pub enum HubError {
    /// Missing or invalid field in an inbound message.
    #[error("{0}")]
    Validation(String),

    /// Referenced entity does not exist or is offline.
    #[error("{0}")]
    NotFound(String),

    /// Agent used a service outside its manifest allow-list.
    #[error("{0}")]
    Unauthorized(String),

    /// Target's connection was missing at dispatch time.
    #[error("{0}")]
    Unreachable(String),

    /// A pending response deadline expired.
    #[error("timed out waiting for response")]
    Timeout,

    /// Unknown message type.
    #[error("Unsupported message type: {0}")]
    Unsupported(String),

    /// The hub is shutting down.
    #[error("endpoint shutting down")]
    Shutdown,

    /// Bug or unexpected state; logged with full context, replied generically.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HubError {
    /// Wire code for the `error` reply.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::Validation(_) => "VALIDATION",
            HubError::NotFound(_) => "NOT_FOUND",
            HubError::Unauthorized(_) => "UNAUTHORIZED",
            HubError::Unreachable(_) => "UNREACHABLE",
            HubError::Timeout => "TIMEOUT",
            HubError::Unsupported(_) => "UNSUPPORTED",
            HubError::Shutdown => "SHUTDOWN",
            HubError::Internal(_) => "INTERNAL",
        }
    }

    /// Message text for the `error` reply.
    ///
    /// Internal errors are not leaked to participants.
    pub fn wire_message(&self) -> String {
        match self {
            HubError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Convenience for the common "missing required field" case.
    pub fn missing_field(field: &str) -> Self {
        HubError::Validation(format!("missing required field: {field}"))
    }
}

pub type HubResult<T> = Result<T, HubError>;
