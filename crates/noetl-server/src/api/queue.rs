//! Worker/queue protocol handlers.
//!
//! Claims, heartbeats, and completions mutate the queue and mirror the
//! command lifecycle into the event log.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::debug;

use noetl_core::event::EventError;
use noetl_core::{Event, EventType, Status};
use noetl_storage::{ClaimedCommand, HeartbeatAck, QueueStore};

use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub worker_id: String,
    pub pool: String,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default)]
    pub lease_ms: Option<i64>,
}

fn default_max_items() -> usize {
    1
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub commands: Vec<ClaimedCommand>,
}

/// POST /api/queue/claim
pub async fn claim(
    State(state): State<AppState>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let lease_ms = request
        .lease_ms
        .unwrap_or(state.scheduler.config().default_lease.as_millis() as i64);

    let commands = state
        .scheduler
        .store()
        .claim(&request.worker_id, &request.pool, request.max_items, lease_ms)
        .await?;

    for command in &commands {
        let mut event = Event::new(
            state.scheduler.next_id(),
            command.execution_id,
            EventType::CommandClaimed,
            &command.node_id,
            Status::Running,
        )
        .with_attempt(command.step_attempt);
        event.worker_id = Some(request.worker_id.clone());
        event.meta = Some(serde_json::json!({
            "command_id": command.command_id.to_string(),
            "delivery": command.attempts,
        }));
        // Duplicate claims after a reclaim are deduplicated here; the
        // queue row is the authority on ownership.
        let _ = state.scheduler.ingest(event).await;
    }

    debug!(
        worker_id = %request.worker_id,
        pool = %request.pool,
        count = commands.len(),
        "claim served"
    );
    Ok(Json(ClaimResponse { commands }))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub command_id: i64,
    pub worker_id: String,
    #[serde(default)]
    pub extend_ms: Option<i64>,
}

/// POST /api/queue/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatAck>, ApiError> {
    let extend_ms = request
        .extend_ms
        .unwrap_or(state.scheduler.config().default_lease.as_millis() as i64);

    let ack = state
        .scheduler
        .store()
        .heartbeat(request.command_id, &request.worker_id, extend_ms)
        .await?;
    Ok(Json(ack))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub command_id: i64,
    pub worker_id: String,
    pub execution_id: String,
    pub node_id: String,
    #[serde(default)]
    pub attempt: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub status: &'static str,
}

/// POST /api/queue/complete
pub async fn complete(
    State(state): State<AppState>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let execution_id: i64 = request
        .execution_id
        .parse()
        .map_err(|_| ApiError::Validation("invalid execution_id".to_string()))?;

    state
        .scheduler
        .store()
        .complete(request.command_id, &request.worker_id)
        .await?;

    let mut event = Event::new(
        state.scheduler.next_id(),
        execution_id,
        EventType::CommandCompleted,
        &request.node_id,
        Status::Completed,
    );
    event.worker_id = Some(request.worker_id);
    event.attempt = request.attempt;
    event.meta = Some(serde_json::json!({
        "command_id": request.command_id.to_string(),
    }));
    let _ = state.scheduler.ingest(event).await;

    Ok(Json(AckResponse { status: "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub command_id: i64,
    pub worker_id: String,
    pub execution_id: String,
    pub node_id: String,
    pub error: String,
    #[serde(default)]
    pub attempt: Option<i32>,
}

/// POST /api/queue/fail
pub async fn fail(
    State(state): State<AppState>,
    Json(request): Json<FailRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let execution_id: i64 = request
        .execution_id
        .parse()
        .map_err(|_| ApiError::Validation("invalid execution_id".to_string()))?;

    state
        .scheduler
        .store()
        .fail(request.command_id, &request.worker_id, &request.error)
        .await?;

    let mut event = Event::new(
        state.scheduler.next_id(),
        execution_id,
        EventType::CommandFailed,
        &request.node_id,
        Status::Failed,
    );
    event.worker_id = Some(request.worker_id);
    event.attempt = request.attempt;
    event.error = Some(EventError::new("tool", request.error));
    let _ = state.scheduler.ingest(event).await;

    Ok(Json(AckResponse { status: "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub command_id: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/queue/release
pub async fn release(
    State(state): State<AppState>,
    Json(request): Json<ReleaseRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    state
        .scheduler
        .store()
        .release(
            request.command_id,
            request.reason.as_deref().unwrap_or("released"),
        )
        .await?;
    Ok(Json(AckResponse { status: "ok" }))
}
