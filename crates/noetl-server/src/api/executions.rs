//! Execution handlers: list, detail, status, cancel.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use noetl_core::Status;
use noetl_storage::{EventStore, ExecutionFilter};

use super::{ApiError, AppState};
use crate::services::executions::{self, ExecutionDetail, ExecutionStatusView};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub path: String,
    pub version: i64,
    pub status: Status,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
}

/// GET /api/executions
pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ExecutionSummary>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(Status::parse)
        .transpose()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let records = state
        .scheduler
        .store()
        .list_executions(&ExecutionFilter {
            path: query.path,
            status,
            limit: query.limit,
            offset: query.offset,
        })
        .await?;

    Ok(Json(
        records
            .into_iter()
            .map(|r| ExecutionSummary {
                execution_id: r.execution_id.to_string(),
                path: r.path,
                version: r.version,
                status: r.status,
                started_at: r.started_at,
                ended_at: r.ended_at,
                parent_execution_id: r.parent_execution_id.map(|id| id.to_string()),
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct DetailQuery {
    /// Event cursor; events strictly after this id are returned.
    #[serde(default)]
    pub after_event_id: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

fn parse_execution_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::Validation(format!("invalid execution id '{raw}'")))
}

/// GET /api/executions/{id}
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DetailQuery>,
) -> Result<Json<ExecutionDetail>, ApiError> {
    let execution_id = parse_execution_id(&id)?;
    let store = state.scheduler.store();
    let record = store
        .get_execution(execution_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("execution {execution_id}")))?;

    let detail = executions::detail(
        store.as_ref(),
        &record,
        query.after_event_id.unwrap_or(0),
        query.limit.unwrap_or(200).clamp(1, 1000),
    )
    .await?;

    Ok(Json(detail))
}

/// GET /api/executions/{id}/status
pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionStatusView>, ApiError> {
    let execution_id = parse_execution_id(&id)?;
    let store = state.scheduler.store();
    let record = store
        .get_execution(execution_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("execution {execution_id}")))?;

    let view = executions::status(store.as_ref(), &record).await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize, Default)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub execution_id: String,
    pub status: Status,
}

/// POST /api/executions/{id}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<CancelResponse>, ApiError> {
    let execution_id = parse_execution_id(&id)?;
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "client request".to_string());

    state.scheduler.cancel_execution(execution_id, &reason).await?;

    Ok(Json(CancelResponse {
        execution_id: execution_id.to_string(),
        status: Status::Cancelled,
    }))
}
