//! Shared error type for core operations.

use thiserror::Error;

/// Errors raised while parsing or validating playbooks and events.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Playbook document failed to parse.
    #[error("playbook parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Playbook failed registration-time validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown event type outside the fixed vocabulary.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// Unknown status value.
    #[error("unknown status: {0}")]
    UnknownStatus(String),
}
