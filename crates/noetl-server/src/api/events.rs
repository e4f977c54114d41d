//! Event ingestion and the SSE stream.

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

use noetl_core::event::EventError;
use noetl_core::{Event, EventType, Status};

use super::sanitize::sanitize;
use super::{ApiError, AppState};

/// Worker event report.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    /// Execution id as a decimal string (i64 range exceeds JS numbers).
    pub execution_id: String,
    pub event_type: String,
    pub node_id: String,
    pub status: String,
    #[serde(default)]
    pub event_id: Option<i64>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<EventError>,
    #[serde(default)]
    pub loop_id: Option<String>,
    #[serde(default)]
    pub current_index: Option<i64>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub attempt: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
    pub event_id: String,
    pub duplicate: bool,
}

/// POST /api/events
///
/// Validates the event type against the fixed vocabulary, stamps a
/// server-side id and timestamp when missing, sanitizes payloads, and
/// appends idempotently.
pub async fn ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    let execution_id: i64 = request
        .execution_id
        .parse()
        .map_err(|_| ApiError::Validation("invalid execution_id".to_string()))?;

    let event_type = EventType::parse(&request.event_type)
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    let status =
        Status::parse(&request.status).map_err(|e| ApiError::Validation(e.to_string()))?;

    let mut event = Event::new(
        request.event_id.unwrap_or(0),
        execution_id,
        event_type,
        &request.node_id,
        status,
    );
    event.context = request.context.as_ref().map(sanitize);
    event.result = request.result.as_ref().map(sanitize);
    event.meta = request.meta.as_ref().map(sanitize);
    event.error = request.error;
    event.loop_id = request.loop_id;
    event.current_index = request.current_index;
    event.worker_id = request.worker_id;
    event.attempt = request.attempt;

    let (event_id, duplicate) = state.scheduler.ingest(event).await?;

    debug!(execution_id, event_id, duplicate, "event ingested");
    Ok(Json(IngestResponse {
        status: "ok",
        event_id: event_id.to_string(),
        duplicate,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Opaque session token; authentication is handled upstream.
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    /// Restrict the stream to one execution.
    #[serde(default)]
    pub execution_id: Option<String>,
}

/// GET /events?session_token=...&client_id=...
///
/// Server-sent events: every ingested event as a JSON frame.
pub async fn stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, BroadcastStreamRecvError>>> {
    let filter: Option<i64> = query.execution_id.and_then(|id| id.parse().ok());
    debug!(client_id = ?query.client_id, ?filter, "sse client connected");

    let receiver = state.scheduler.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(move |item| match item {
        Ok(event) => {
            if let Some(wanted) = filter {
                if event.execution_id != wanted {
                    return None;
                }
            }
            let data = serde_json::to_string(&event).ok()?;
            Some(Ok(SseEvent::default()
                .event(event.event_type.as_str())
                .data(data)))
        }
        Err(lagged) => Some(Err(lagged)),
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
