//! Execution start handler.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct RunPlaybookRequest {
    pub path: String,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    /// Deep-merge parameters into the workload instead of replacing keys.
    #[serde(default)]
    pub merge: bool,
    /// Set by the `playbook` tool when spawning a child execution.
    #[serde(default)]
    pub parent_execution_id: Option<String>,
    #[serde(default)]
    pub parent_step: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunPlaybookResponse {
    pub execution_id: String,
    pub status: String,
}

/// POST /api/run/playbook
pub async fn run_playbook(
    State(state): State<AppState>,
    Json(request): Json<RunPlaybookRequest>,
) -> Result<Json<RunPlaybookResponse>, ApiError> {
    let parent = match (&request.parent_execution_id, &request.parent_step) {
        (Some(id), Some(step)) => {
            let id: i64 = id
                .parse()
                .map_err(|_| ApiError::Validation("invalid parent_execution_id".to_string()))?;
            Some((id, step.clone()))
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err(ApiError::Validation(
                "parent_execution_id and parent_step go together".to_string(),
            ))
        }
        (None, None) => None,
    };

    let execution_id = state
        .scheduler
        .start_execution(
            &request.path,
            request.version,
            request.parameters,
            request.merge,
            parent,
        )
        .await?;

    Ok(Json(RunPlaybookResponse {
        execution_id: execution_id.to_string(),
        status: "RUNNING".to_string(),
    }))
}
