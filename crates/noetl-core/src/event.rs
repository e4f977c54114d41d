//! The append-only event model.
//!
//! Every fact about an execution is an [`Event`] row keyed by
//! `(execution_id, event_id)`. Event types form a fixed vocabulary;
//! ingestion rejects anything outside it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Fixed vocabulary of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "playbook.initialized")]
    PlaybookInitialized,
    #[serde(rename = "playbook.completed")]
    PlaybookCompleted,
    #[serde(rename = "workflow.initialized")]
    WorkflowInitialized,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "command.issued")]
    CommandIssued,
    #[serde(rename = "command.claimed")]
    CommandClaimed,
    #[serde(rename = "command.completed")]
    CommandCompleted,
    #[serde(rename = "command.failed")]
    CommandFailed,
    #[serde(rename = "step.enter")]
    StepEnter,
    #[serde(rename = "step.exit")]
    StepExit,
    #[serde(rename = "action.completed")]
    ActionCompleted,
    #[serde(rename = "action.error")]
    ActionError,
    #[serde(rename = "loop.iteration")]
    LoopIteration,
    #[serde(rename = "loop.completed")]
    LoopCompleted,
    #[serde(rename = "sink.executed")]
    SinkExecuted,
    #[serde(rename = "sink.failed")]
    SinkFailed,
    #[serde(rename = "execution.cancelled")]
    ExecutionCancelled,
}

impl EventType {
    /// All members of the vocabulary, for validation and docs.
    pub const ALL: [EventType; 17] = [
        Self::PlaybookInitialized,
        Self::PlaybookCompleted,
        Self::WorkflowInitialized,
        Self::WorkflowCompleted,
        Self::CommandIssued,
        Self::CommandClaimed,
        Self::CommandCompleted,
        Self::CommandFailed,
        Self::StepEnter,
        Self::StepExit,
        Self::ActionCompleted,
        Self::ActionError,
        Self::LoopIteration,
        Self::LoopCompleted,
        Self::SinkExecuted,
        Self::SinkFailed,
        Self::ExecutionCancelled,
    ];

    /// Wire name (dotted form).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlaybookInitialized => "playbook.initialized",
            Self::PlaybookCompleted => "playbook.completed",
            Self::WorkflowInitialized => "workflow.initialized",
            Self::WorkflowCompleted => "workflow.completed",
            Self::CommandIssued => "command.issued",
            Self::CommandClaimed => "command.claimed",
            Self::CommandCompleted => "command.completed",
            Self::CommandFailed => "command.failed",
            Self::StepEnter => "step.enter",
            Self::StepExit => "step.exit",
            Self::ActionCompleted => "action.completed",
            Self::ActionError => "action.error",
            Self::LoopIteration => "loop.iteration",
            Self::LoopCompleted => "loop.completed",
            Self::SinkExecuted => "sink.executed",
            Self::SinkFailed => "sink.failed",
            Self::ExecutionCancelled => "execution.cancelled",
        }
    }

    /// Parse a wire name, rejecting anything outside the vocabulary.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| CoreError::UnknownEventType(s.to_string()))
    }

    /// Whether this event ends the whole execution.
    pub fn is_execution_terminal(&self) -> bool {
        matches!(self, Self::PlaybookCompleted | Self::ExecutionCancelled)
    }

    /// Whether this event is a terminal fact about a single step attempt.
    pub fn is_step_terminal(&self) -> bool {
        matches!(
            self,
            Self::StepExit | Self::ActionCompleted | Self::ActionError
        )
    }

    /// Events scoped to one queued command; deduplicated by
    /// `(execution_id, node_id, event_type, attempt)` at ingestion.
    pub fn is_command_scoped(&self) -> bool {
        matches!(
            self,
            Self::CommandClaimed
                | Self::CommandCompleted
                | Self::CommandFailed
                | Self::StepEnter
                | Self::StepExit
                | Self::ActionCompleted
                | Self::ActionError
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status values carried on events and executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Initialized,
    Pending,
    Running,
    Started,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Started => "STARTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "INITIALIZED" => Ok(Self::Initialized),
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "STARTED" => Ok(Self::Started),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }

    /// Whether the status is terminal for an execution or step.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error payload attached to failure events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventError {
    /// Error kind from the taxonomy: template, tool, transport, timeout,
    /// validation, cancelled.
    pub kind: String,
    pub message: String,
    /// Truncated diagnostic trace, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl EventError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }
}

/// One row in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: i64,
    pub execution_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<i64>,
    pub event_type: EventType,
    /// Step instance identifier; embeds the iterator index for loop
    /// iterations (`fetch[2]`) and the sink index for sink commands.
    pub node_id: String,
    /// Declared step name (iterator index stripped).
    pub node_name: String,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<i32>,
}

impl Event {
    /// Minimal constructor; optional fields start empty.
    pub fn new(
        event_id: i64,
        execution_id: i64,
        event_type: EventType,
        node_id: impl Into<String>,
        status: Status,
    ) -> Self {
        let node_id = node_id.into();
        let node_name = base_node_name(&node_id).to_string();
        Self {
            event_id,
            execution_id,
            parent_event_id: None,
            parent_execution_id: None,
            event_type,
            node_id,
            node_name,
            status,
            timestamp: Utc::now(),
            context: None,
            result: None,
            meta: None,
            error: None,
            loop_id: None,
            current_index: None,
            worker_id: None,
            attempt: None,
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_error(mut self, error: EventError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_loop(mut self, loop_id: impl Into<String>, index: i64) -> Self {
        self.loop_id = Some(loop_id.into());
        self.current_index = Some(index);
        self
    }

    pub fn with_attempt(mut self, attempt: i32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// Strip a trailing iterator/sink suffix from a node id:
/// `fetch[2]` -> `fetch`, `fetch:sink[0]` -> `fetch`.
pub fn base_node_name(node_id: &str) -> &str {
    let end = node_id
        .find(":sink[")
        .or_else(|| node_id.find('['))
        .unwrap_or(node_id.len());
    &node_id[..end]
}

/// Build the node id for one loop iteration.
pub fn loop_node_id(step: &str, index: usize) -> String {
    format!("{step}[{index}]")
}

/// Build the node id for one sink command of a step.
pub fn sink_node_id(step: &str, index: usize) -> String {
    format!("{step}:sink[{index}]")
}

/// Extract the iterator index from a loop node id, if present.
pub fn loop_index(node_id: &str) -> Option<usize> {
    let open = node_id.find('[')?;
    let close = node_id.rfind(']')?;
    node_id.get(open + 1..close)?.parse().ok()
}
