//! API error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use noetl_core::CoreError;
use noetl_storage::StoreError;

use crate::engine::scheduler::SchedulerError;

/// Errors surfaced to API clients.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CatalogNotFound(m) => Self::NotFound(m),
            StoreError::ExecutionNotFound(id) => Self::NotFound(format!("execution {id}")),
            StoreError::CommandNotFound(id) => Self::NotFound(format!("command {id}")),
            StoreError::Conflict(m) => Self::Conflict(m),
            StoreError::LeaseLost { command_id, .. } => {
                Self::Conflict(format!("lease lost for command {command_id}"))
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Store(s) => s.into(),
            SchedulerError::Core(c) => c.into(),
            SchedulerError::PlaybookNotFound(p) => Self::NotFound(format!("playbook {p}")),
            SchedulerError::ExecutionNotFound(id) => Self::NotFound(format!("execution {id}")),
            SchedulerError::AlreadyTerminal(id) => {
                Self::Conflict(format!("execution {id} is already terminal"))
            }
            SchedulerError::Engine(e) => Self::Internal(e.to_string()),
        }
    }
}
