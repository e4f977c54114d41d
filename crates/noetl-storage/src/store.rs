//! Store trait definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use noetl_core::{Event, Status};

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Catalog entry not found.
    #[error("catalog entry not found: {0}")]
    CatalogNotFound(String),

    /// Execution not found.
    #[error("execution not found: {0}")]
    ExecutionNotFound(i64),

    /// Command not found.
    #[error("command not found: {0}")]
    CommandNotFound(i64),

    /// Registering an already-registered `(path, version)`.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Lease no longer owned by the caller.
    #[error("lease lost for command {command_id} (worker {worker_id})")]
    LeaseLost { command_id: i64, worker_id: String },

    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Catalog entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogKind {
    Playbook,
    Credential,
}

impl CatalogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Playbook => "playbook",
            Self::Credential => "credential",
        }
    }
}

/// A new catalog registration.
#[derive(Debug, Clone)]
pub struct NewCatalogEntry {
    pub kind: CatalogKind,
    pub path: String,
    /// Explicit version; `None` allocates `max(version) + 1`.
    pub version: Option<i64>,
    pub content: String,
    pub content_hash: String,
}

/// A stored catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub kind: CatalogKind,
    pub path: String,
    pub version: i64,
    pub content: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Execution index row, derived from the event log but kept for lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: i64,
    pub path: String,
    pub version: i64,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_step: Option<String>,
}

/// Filter for listing executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub path: Option<String>,
    pub status: Option<Status>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Queue row lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Leased,
    Done,
    Failed,
    Cancelled,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Leased => "LEASED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "LEASED" => Some(Self::Leased),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A command to enqueue.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub command_id: i64,
    pub execution_id: i64,
    pub node_id: String,
    /// Tool kind the worker dispatches on (`http`, `shell`, ...).
    pub action: String,
    /// Rendered, frozen context the worker renders spec/args against.
    pub context: serde_json::Value,
    pub priority: i32,
    pub max_attempts: i32,
    /// 1-based step attempt this command represents (retries increment).
    pub step_attempt: i32,
    /// Worker pool routing key.
    pub pool: String,
    /// Earliest claimable instant (retry backoff lands here).
    pub available_at: DateTime<Utc>,
    pub timeout_ms: Option<i64>,
}

/// A command handed to a worker under lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedCommand {
    pub command_id: i64,
    pub execution_id: i64,
    pub node_id: String,
    pub action: String,
    pub context: serde_json::Value,
    pub step_attempt: i32,
    /// Delivery count including this claim.
    pub attempts: i32,
    pub max_attempts: i32,
    pub timeout_ms: Option<i64>,
    pub lease_until: DateTime<Utc>,
}

/// Heartbeat outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Whether the lease was extended.
    pub accepted: bool,
    /// Whether the execution was cancelled and the worker should stop.
    pub cancel_requested: bool,
}

/// Versioned, immutable playbook and credential definitions.
#[async_trait]
pub trait CatalogStore: Send + Sync + 'static {
    /// Register a new entry. Allocates the next version when none is
    /// given; registering an existing `(path, version)` is a conflict.
    async fn register(&self, entry: NewCatalogEntry) -> Result<CatalogEntry, StoreError>;

    /// Fetch an entry; `None` version resolves to the latest.
    async fn fetch(
        &self,
        kind: CatalogKind,
        path: &str,
        version: Option<i64>,
    ) -> Result<Option<CatalogEntry>, StoreError>;

    /// List entries of a kind (latest version per path).
    async fn list(&self, kind: CatalogKind) -> Result<Vec<CatalogEntry>, StoreError>;
}

/// The append-only event log and execution index.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    async fn get_execution(&self, execution_id: i64)
        -> Result<Option<ExecutionRecord>, StoreError>;

    async fn update_execution_status(
        &self,
        execution_id: i64,
        status: Status,
    ) -> Result<(), StoreError>;

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Non-terminal children of an execution, for cancellation cascade.
    async fn child_executions(
        &self,
        parent_execution_id: i64,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Append one event. Returns `false` when the event was deduplicated
    /// (same `(execution_id, event_id)`, or same
    /// `(execution_id, node_id, event_type, attempt)` for command-scoped
    /// events).
    async fn append_event(&self, event: &Event) -> Result<bool, StoreError>;

    /// All events of an execution in `event_id` order.
    async fn load_events(&self, execution_id: i64) -> Result<Vec<Event>, StoreError>;

    /// Page of events after a cursor.
    async fn load_events_page(
        &self,
        execution_id: i64,
        after_event_id: i64,
        limit: i64,
    ) -> Result<Vec<Event>, StoreError>;
}

/// Durable, leased command queue.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Insert a `PENDING` row. Idempotent on `command_id`.
    async fn enqueue(&self, command: &NewCommand) -> Result<(), StoreError>;

    /// Claim up to `max_items` claimable rows for a pool, atomically
    /// moving them to `LEASED`. Claims are serializable against other
    /// claimers; priority wins, then `available_at` FIFO.
    async fn claim(
        &self,
        worker_id: &str,
        pool: &str,
        max_items: usize,
        lease_ms: i64,
    ) -> Result<Vec<ClaimedCommand>, StoreError>;

    /// Extend the lease iff the caller still owns it.
    async fn heartbeat(
        &self,
        command_id: i64,
        worker_id: &str,
        extend_ms: i64,
    ) -> Result<HeartbeatAck, StoreError>;

    /// Terminal success. Idempotent on duplicate completion by the owner;
    /// rejects completion after the lease moved on.
    async fn complete(&self, command_id: i64, worker_id: &str) -> Result<(), StoreError>;

    /// Terminal failure of this command. Step-level retries are issued by
    /// the scheduler as fresh commands; crashed deliveries come back via
    /// `reap`, not `fail`.
    async fn fail(&self, command_id: i64, worker_id: &str, error: &str)
        -> Result<(), StoreError>;

    /// Return a row to `PENDING` for another worker.
    async fn release(&self, command_id: i64, reason: &str) -> Result<(), StoreError>;

    /// Cancel every open command of an execution; returns how many.
    async fn cancel_execution(&self, execution_id: i64) -> Result<usize, StoreError>;

    /// Re-open rows whose lease expired without a heartbeat; returns the
    /// reclaimed command ids.
    async fn reap(&self) -> Result<Vec<i64>, StoreError>;

    /// Open (pending + leased) depth for a pool, for backpressure.
    async fn depth(&self, pool: &str) -> Result<u64, StoreError>;

    /// Whether an open command already exists for this node, to keep
    /// issuance idempotent across evaluations.
    async fn has_open_command(
        &self,
        execution_id: i64,
        node_id: &str,
    ) -> Result<bool, StoreError>;
}
