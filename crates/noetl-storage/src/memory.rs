//! In-memory implementation of the store traits.
//!
//! Mirrors the PostgreSQL semantics for tests and single-process runs.
//! All maps live behind `parking_lot` locks; lock scopes are kept short
//! so async callers never hold one across an await.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;

use noetl_core::{Event, Status};

use super::store::*;

#[derive(Debug, Clone)]
struct QueueRow {
    command: NewCommand,
    status: CommandStatus,
    attempts: i32,
    worker_id: Option<String>,
    lease_until: Option<chrono::DateTime<chrono::Utc>>,
    last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    reclaim_count: i32,
    last_error: Option<String>,
}

/// In-memory store. Cheap to clone handles via `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    catalog: RwLock<Vec<CatalogEntry>>,
    executions: RwLock<HashMap<i64, ExecutionRecord>>,
    events: RwLock<HashMap<i64, Vec<Event>>>,
    queue: RwLock<HashMap<i64, QueueRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open queue rows (tests).
    pub fn open_commands(&self) -> usize {
        self.queue
            .read()
            .values()
            .filter(|r| matches!(r.status, CommandStatus::Pending | CommandStatus::Leased))
            .count()
    }

    /// Total events across executions (tests).
    pub fn event_count(&self) -> usize {
        self.events.read().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn register(&self, entry: NewCatalogEntry) -> Result<CatalogEntry, StoreError> {
        let mut catalog = self.catalog.write();

        let latest = catalog
            .iter()
            .filter(|e| e.kind == entry.kind && e.path == entry.path)
            .map(|e| e.version)
            .max();

        let version = match entry.version {
            Some(v) => {
                if catalog
                    .iter()
                    .any(|e| e.kind == entry.kind && e.path == entry.path && e.version == v)
                {
                    return Err(StoreError::Conflict(format!(
                        "{} '{}' version {} already registered",
                        entry.kind.as_str(),
                        entry.path,
                        v
                    )));
                }
                v
            }
            None => latest.map(|v| v + 1).unwrap_or(1),
        };

        let stored = CatalogEntry {
            kind: entry.kind,
            path: entry.path,
            version,
            content: entry.content,
            content_hash: entry.content_hash,
            created_at: Utc::now(),
        };
        catalog.push(stored.clone());
        Ok(stored)
    }

    async fn fetch(
        &self,
        kind: CatalogKind,
        path: &str,
        version: Option<i64>,
    ) -> Result<Option<CatalogEntry>, StoreError> {
        let catalog = self.catalog.read();
        let mut candidates: Vec<&CatalogEntry> = catalog
            .iter()
            .filter(|e| e.kind == kind && e.path == path)
            .collect();
        candidates.sort_by_key(|e| e.version);

        Ok(match version {
            Some(v) => candidates.iter().find(|e| e.version == v).cloned().cloned(),
            None => candidates.last().cloned().cloned(),
        })
    }

    async fn list(&self, kind: CatalogKind) -> Result<Vec<CatalogEntry>, StoreError> {
        let catalog = self.catalog.read();
        let mut latest: HashMap<&str, &CatalogEntry> = HashMap::new();
        for entry in catalog.iter().filter(|e| e.kind == kind) {
            let keep = latest
                .get(entry.path.as_str())
                .map(|e| entry.version > e.version)
                .unwrap_or(true);
            if keep {
                latest.insert(entry.path.as_str(), entry);
            }
        }
        let mut out: Vec<CatalogEntry> = latest.into_values().cloned().collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.executions
            .write()
            .insert(record.execution_id, record.clone());
        self.events.write().entry(record.execution_id).or_default();
        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: i64,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.executions.read().get(&execution_id).cloned())
    }

    async fn update_execution_status(
        &self,
        execution_id: i64,
        status: Status,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        let record = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        record.status = status;
        if status.is_terminal() && record.ended_at.is_none() {
            record.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let executions = self.executions.read();
        let mut out: Vec<ExecutionRecord> = executions
            .values()
            .filter(|e| {
                filter
                    .path
                    .as_ref()
                    .map(|p| e.path.contains(p.as_str()))
                    .unwrap_or(true)
                    && filter.status.map(|s| e.status == s).unwrap_or(true)
            })
            .cloned()
            .collect();
        out.sort_by_key(|e| std::cmp::Reverse(e.execution_id));

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.unwrap_or(50).clamp(1, 500) as usize;
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }

    async fn child_executions(
        &self,
        parent_execution_id: i64,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let executions = self.executions.read();
        let mut out: Vec<ExecutionRecord> = executions
            .values()
            .filter(|e| {
                e.parent_execution_id == Some(parent_execution_id) && !e.status.is_terminal()
            })
            .cloned()
            .collect();
        out.sort_by_key(|e| e.execution_id);
        Ok(out)
    }

    async fn append_event(&self, event: &Event) -> Result<bool, StoreError> {
        let mut events = self.events.write();
        let log = events.entry(event.execution_id).or_default();

        if log.iter().any(|e| e.event_id == event.event_id) {
            return Ok(false);
        }
        if event.event_type.is_command_scoped() {
            let duplicate = log.iter().any(|e| {
                e.event_type == event.event_type
                    && e.node_id == event.node_id
                    && e.attempt == event.attempt
            });
            if duplicate {
                return Ok(false);
            }
        }

        log.push(event.clone());
        log.sort_by_key(|e| e.event_id);
        Ok(true)
    }

    async fn load_events(&self, execution_id: i64) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .events
            .read()
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn load_events_page(
        &self,
        execution_id: i64,
        after_event_id: i64,
        limit: i64,
    ) -> Result<Vec<Event>, StoreError> {
        let events = self.events.read();
        Ok(events
            .get(&execution_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.event_id > after_event_id)
                    .take(limit.max(0) as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, command: &NewCommand) -> Result<(), StoreError> {
        let mut queue = self.queue.write();
        queue.entry(command.command_id).or_insert_with(|| QueueRow {
            command: command.clone(),
            status: CommandStatus::Pending,
            attempts: 0,
            worker_id: None,
            lease_until: None,
            last_heartbeat: None,
            reclaim_count: 0,
            last_error: None,
        });
        Ok(())
    }

    async fn claim(
        &self,
        worker_id: &str,
        pool: &str,
        max_items: usize,
        lease_ms: i64,
    ) -> Result<Vec<ClaimedCommand>, StoreError> {
        let now = Utc::now();
        let mut queue = self.queue.write();

        let mut claimable: Vec<i64> = queue
            .values()
            .filter(|r| {
                r.command.pool == pool
                    && r.command.available_at <= now
                    && (r.status == CommandStatus::Pending
                        || (r.status == CommandStatus::Leased
                            && r.lease_until.map(|t| t < now).unwrap_or(true)))
            })
            .map(|r| r.command.command_id)
            .collect();

        claimable.sort_by_key(|id| {
            let row = &queue[id];
            (
                std::cmp::Reverse(row.command.priority),
                row.command.available_at,
                row.command.command_id,
            )
        });
        claimable.truncate(max_items);

        let lease_until = now + Duration::milliseconds(lease_ms);
        let mut claimed = Vec::with_capacity(claimable.len());
        for id in claimable {
            let row = queue.get_mut(&id).expect("row disappeared during claim");
            if row.status == CommandStatus::Leased {
                row.reclaim_count += 1;
            }
            row.status = CommandStatus::Leased;
            row.attempts += 1;
            row.worker_id = Some(worker_id.to_string());
            row.lease_until = Some(lease_until);
            row.last_heartbeat = Some(now);

            claimed.push(ClaimedCommand {
                command_id: id,
                execution_id: row.command.execution_id,
                node_id: row.command.node_id.clone(),
                action: row.command.action.clone(),
                context: row.command.context.clone(),
                step_attempt: row.command.step_attempt,
                attempts: row.attempts,
                max_attempts: row.command.max_attempts,
                timeout_ms: row.command.timeout_ms,
                lease_until,
            });
        }
        Ok(claimed)
    }

    async fn heartbeat(
        &self,
        command_id: i64,
        worker_id: &str,
        extend_ms: i64,
    ) -> Result<HeartbeatAck, StoreError> {
        let now = Utc::now();
        let mut queue = self.queue.write();
        let row = queue
            .get_mut(&command_id)
            .ok_or(StoreError::CommandNotFound(command_id))?;

        if row.status == CommandStatus::Cancelled {
            return Ok(HeartbeatAck {
                accepted: false,
                cancel_requested: true,
            });
        }

        let owned = row.status == CommandStatus::Leased
            && row.worker_id.as_deref() == Some(worker_id);
        if !owned {
            return Ok(HeartbeatAck {
                accepted: false,
                cancel_requested: false,
            });
        }

        row.lease_until = Some(now + Duration::milliseconds(extend_ms));
        row.last_heartbeat = Some(now);
        Ok(HeartbeatAck {
            accepted: true,
            cancel_requested: false,
        })
    }

    async fn complete(&self, command_id: i64, worker_id: &str) -> Result<(), StoreError> {
        let mut queue = self.queue.write();
        let row = queue
            .get_mut(&command_id)
            .ok_or(StoreError::CommandNotFound(command_id))?;

        match row.status {
            CommandStatus::Done if row.worker_id.as_deref() == Some(worker_id) => Ok(()),
            CommandStatus::Leased if row.worker_id.as_deref() == Some(worker_id) => {
                row.status = CommandStatus::Done;
                Ok(())
            }
            CommandStatus::Cancelled => Ok(()),
            _ => Err(StoreError::LeaseLost {
                command_id,
                worker_id: worker_id.to_string(),
            }),
        }
    }

    async fn fail(
        &self,
        command_id: i64,
        worker_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut queue = self.queue.write();
        let row = queue
            .get_mut(&command_id)
            .ok_or(StoreError::CommandNotFound(command_id))?;

        if row.status != CommandStatus::Leased || row.worker_id.as_deref() != Some(worker_id) {
            return Err(StoreError::LeaseLost {
                command_id,
                worker_id: worker_id.to_string(),
            });
        }

        row.last_error = Some(error.to_string());
        row.status = CommandStatus::Failed;
        Ok(())
    }

    async fn release(&self, command_id: i64, reason: &str) -> Result<(), StoreError> {
        let mut queue = self.queue.write();
        let row = queue
            .get_mut(&command_id)
            .ok_or(StoreError::CommandNotFound(command_id))?;

        if matches!(row.status, CommandStatus::Pending | CommandStatus::Leased) {
            row.status = CommandStatus::Pending;
            row.worker_id = None;
            row.lease_until = None;
            row.last_error = Some(reason.to_string());
        }
        Ok(())
    }

    async fn cancel_execution(&self, execution_id: i64) -> Result<usize, StoreError> {
        let mut queue = self.queue.write();
        let mut count = 0;
        for row in queue.values_mut() {
            if row.command.execution_id == execution_id
                && matches!(row.status, CommandStatus::Pending | CommandStatus::Leased)
            {
                row.status = CommandStatus::Cancelled;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn reap(&self) -> Result<Vec<i64>, StoreError> {
        let now = Utc::now();
        let mut queue = self.queue.write();
        let mut reclaimed = Vec::new();
        for row in queue.values_mut() {
            if row.status == CommandStatus::Leased
                && row.lease_until.map(|t| t < now).unwrap_or(true)
            {
                row.status = CommandStatus::Pending;
                row.worker_id = None;
                row.lease_until = None;
                row.reclaim_count += 1;
                reclaimed.push(row.command.command_id);
            }
        }
        reclaimed.sort_unstable();
        Ok(reclaimed)
    }

    async fn depth(&self, pool: &str) -> Result<u64, StoreError> {
        Ok(self
            .queue
            .read()
            .values()
            .filter(|r| {
                r.command.pool == pool
                    && matches!(r.status, CommandStatus::Pending | CommandStatus::Leased)
            })
            .count() as u64)
    }

    async fn has_open_command(
        &self,
        execution_id: i64,
        node_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.queue.read().values().any(|r| {
            r.command.execution_id == execution_id
                && r.command.node_id == node_id
                && matches!(r.status, CommandStatus::Pending | CommandStatus::Leased)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noetl_core::EventType;
    use serde_json::json;

    fn command(id: i64, node: &str, priority: i32) -> NewCommand {
        NewCommand {
            command_id: id,
            execution_id: 100,
            node_id: node.to_string(),
            action: "http".to_string(),
            context: json!({}),
            priority,
            max_attempts: 3,
            step_attempt: 1,
            pool: "cpu".to_string(),
            available_at: Utc::now(),
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn test_catalog_version_allocation_and_conflict() {
        let store = MemoryStore::new();
        let entry = |version| NewCatalogEntry {
            kind: CatalogKind::Playbook,
            path: "demo/flow".to_string(),
            version,
            content: "workflow: []".to_string(),
            content_hash: "abc".to_string(),
        };

        let v1 = store.register(entry(None)).await.unwrap();
        assert_eq!(v1.version, 1);
        let v2 = store.register(entry(None)).await.unwrap();
        assert_eq!(v2.version, 2);

        let err = store.register(entry(Some(2))).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let latest = store
            .fetch(CatalogKind::Playbook, "demo/flow", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.version, 2);
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_availability() {
        let store = MemoryStore::new();
        store.enqueue(&command(1, "low", 0)).await.unwrap();
        store.enqueue(&command(2, "high", 5)).await.unwrap();
        store.enqueue(&command(3, "mid", 1)).await.unwrap();

        let claimed = store.claim("w1", "cpu", 10, 30_000).await.unwrap();
        let order: Vec<&str> = claimed.iter().map(|c| c.node_id.as_str()).collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryStore::new();
        store.enqueue(&command(1, "a", 0)).await.unwrap();

        let first = store.claim("w1", "cpu", 10, 30_000).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = store.claim("w2", "cpu", 10, 30_000).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let store = MemoryStore::new();
        store.enqueue(&command(1, "a", 0)).await.unwrap();

        // Negative lease expires immediately.
        let first = store.claim("w1", "cpu", 10, -1_000).await.unwrap();
        assert_eq!(first.len(), 1);

        let reclaimed = store.reap().await.unwrap();
        assert_eq!(reclaimed, vec![1]);

        let second = store.claim("w2", "cpu", 10, 30_000).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attempts, 2);

        // The first worker's completion attempt is rejected.
        let err = store.complete(1, "w1").await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost { .. }));
        store.complete(1, "w2").await.unwrap();
    }

    #[tokio::test]
    async fn test_complete_is_idempotent_for_owner() {
        let store = MemoryStore::new();
        store.enqueue(&command(1, "a", 0)).await.unwrap();
        store.claim("w1", "cpu", 1, 30_000).await.unwrap();

        store.complete(1, "w1").await.unwrap();
        store.complete(1, "w1").await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_ownership() {
        let store = MemoryStore::new();
        store.enqueue(&command(1, "a", 0)).await.unwrap();
        store.claim("w1", "cpu", 1, 30_000).await.unwrap();

        let ack = store.heartbeat(1, "w1", 30_000).await.unwrap();
        assert!(ack.accepted);

        let ack = store.heartbeat(1, "w2", 30_000).await.unwrap();
        assert!(!ack.accepted);
    }

    #[tokio::test]
    async fn test_cancel_execution_flags_heartbeat() {
        let store = MemoryStore::new();
        store.enqueue(&command(1, "a", 0)).await.unwrap();
        store.claim("w1", "cpu", 1, 30_000).await.unwrap();

        let cancelled = store.cancel_execution(100).await.unwrap();
        assert_eq!(cancelled, 1);

        let ack = store.heartbeat(1, "w1", 30_000).await.unwrap();
        assert!(!ack.accepted);
        assert!(ack.cancel_requested);

        // Completion after cancellation is tolerated silently.
        store.complete(1, "w1").await.unwrap();
    }

    #[tokio::test]
    async fn test_backoff_availability_respected() {
        let store = MemoryStore::new();
        let mut cmd = command(1, "a", 0);
        cmd.available_at = Utc::now() + Duration::seconds(60);
        store.enqueue(&cmd).await.unwrap();

        let claimed = store.claim("w1", "cpu", 10, 30_000).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_event_dedup_by_event_id_and_scope() {
        let store = MemoryStore::new();
        let mut event = Event::new(10, 100, EventType::StepEnter, "start", Status::Started);
        event.attempt = Some(1);

        assert!(store.append_event(&event).await.unwrap());
        // Same event id: duplicate.
        assert!(!store.append_event(&event).await.unwrap());

        // Different event id, same (node, type, attempt): duplicate.
        let mut dup = event.clone();
        dup.event_id = 11;
        assert!(!store.append_event(&dup).await.unwrap());

        // Next attempt is a fresh fact.
        let mut next = event.clone();
        next.event_id = 12;
        next.attempt = Some(2);
        assert!(store.append_event(&next).await.unwrap());
    }

    #[tokio::test]
    async fn test_pool_routing() {
        let store = MemoryStore::new();
        let mut gpu = command(1, "train", 0);
        gpu.pool = "gpu".to_string();
        store.enqueue(&gpu).await.unwrap();
        store.enqueue(&command(2, "fetch", 0)).await.unwrap();

        let cpu_claims = store.claim("w1", "cpu", 10, 30_000).await.unwrap();
        assert_eq!(cpu_claims.len(), 1);
        assert_eq!(cpu_claims[0].node_id, "fetch");

        assert_eq!(store.depth("gpu").await.unwrap(), 1);
    }
}
