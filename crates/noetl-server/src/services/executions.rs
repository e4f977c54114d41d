//! Execution queries: detail, status, and progress derivation.

use serde::{Deserialize, Serialize};

use noetl_core::{Event, EventType, Status};
use noetl_storage::{EventStore, ExecutionRecord, StoreError};

/// Execution detail with a page of events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetail {
    pub execution_id: String,
    pub path: String,
    pub version: i64,
    pub status: Status,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    pub events: Vec<Event>,
    /// Cursor for the next page; absent when this page is the last.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_after_event_id: Option<i64>,
}

/// Step-count progress, derived from the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub total_steps: i64,
    pub completed_steps: i64,
    pub running_steps: i64,
    pub failed_steps: i64,
}

/// Summary status answer for polling clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusView {
    pub execution_id: String,
    pub status: Status,
    pub completed: bool,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub progress: ExecutionProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build the detail view with one page of events.
pub async fn detail<S>(
    store: &S,
    record: &ExecutionRecord,
    after_event_id: i64,
    limit: i64,
) -> Result<ExecutionDetail, StoreError>
where
    S: EventStore + ?Sized,
{
    let events = store
        .load_events_page(record.execution_id, after_event_id, limit)
        .await?;
    let next_after_event_id = if events.len() as i64 == limit {
        events.last().map(|e| e.event_id)
    } else {
        None
    };

    Ok(ExecutionDetail {
        execution_id: record.execution_id.to_string(),
        path: record.path.clone(),
        version: record.version,
        status: record.status,
        started_at: record.started_at,
        ended_at: record.ended_at,
        parent_execution_id: record.parent_execution_id.map(|id| id.to_string()),
        events,
        next_after_event_id,
    })
}

/// Derive the status view from the full event log.
pub async fn status<S>(
    store: &S,
    record: &ExecutionRecord,
) -> Result<ExecutionStatusView, StoreError>
where
    S: EventStore + ?Sized,
{
    let events = store.load_events(record.execution_id).await?;
    Ok(status_from_events(record, &events))
}

pub fn status_from_events(record: &ExecutionRecord, events: &[Event]) -> ExecutionStatusView {
    use std::collections::BTreeMap;

    let mut step_status: BTreeMap<&str, Status> = BTreeMap::new();
    let mut current_step = None;
    let mut result = None;
    let mut error = None;

    for event in events {
        match event.event_type {
            EventType::StepEnter => {
                step_status.insert(&event.node_id, Status::Started);
                current_step = Some(event.node_name.clone());
            }
            EventType::StepExit | EventType::LoopCompleted => {
                step_status.insert(&event.node_id, event.status);
            }
            EventType::ActionError => {
                if let Some(e) = &event.error {
                    error = Some(e.message.clone());
                }
            }
            EventType::PlaybookCompleted => {
                result = event.result.clone();
                if let Some(e) = &event.error {
                    error = Some(e.message.clone());
                }
            }
            _ => {}
        }
    }

    // Settle failed steps that never produced an exit event.
    for event in events {
        if event.event_type == EventType::ActionError && event.status == Status::Failed {
            step_status.entry(&event.node_id).or_insert(Status::Failed);
        }
    }

    let total = step_status.len() as i64;
    let completed = step_status
        .values()
        .filter(|s| **s == Status::Completed)
        .count() as i64;
    let failed = step_status
        .values()
        .filter(|s| **s == Status::Failed)
        .count() as i64;
    let running = step_status
        .values()
        .filter(|s| !s.is_terminal())
        .count() as i64;

    ExecutionStatusView {
        execution_id: record.execution_id.to_string(),
        status: record.status,
        completed: record.status == Status::Completed,
        failed: record.status == Status::Failed,
        current_step,
        progress: ExecutionProgress {
            total_steps: total,
            completed_steps: completed,
            running_steps: running,
            failed_steps: failed,
        },
        result,
        error,
    }
}
