//! PostgreSQL implementation of the store traits.
//!
//! Queue claiming uses `FOR UPDATE SKIP LOCKED` so concurrent claimers
//! never contend on the same rows; event appends rely on the primary key
//! and an in-transaction existence check for idempotency.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use noetl_core::{Event, EventType, Status};

use super::store::*;

/// PostgreSQL-backed store. Cheap to clone; wraps a connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event, StoreError> {
    let event_type: String = row.get("event_type");
    let status: String = row.get("status");
    let error_json: Option<serde_json::Value> = row.get("error");

    Ok(Event {
        event_id: row.get("event_id"),
        execution_id: row.get("execution_id"),
        parent_event_id: row.get("parent_event_id"),
        parent_execution_id: row.get("parent_execution_id"),
        event_type: EventType::parse(&event_type)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        node_id: row.get("node_id"),
        node_name: row.get("node_name"),
        status: Status::parse(&status).map_err(|e| StoreError::Serialization(e.to_string()))?,
        timestamp: row.get("created_at"),
        context: row.get("context"),
        result: row.get("result"),
        meta: row.get("meta"),
        error: error_json.and_then(|v| serde_json::from_value(v).ok()),
        loop_id: row.get("loop_id"),
        current_index: row.get("current_index"),
        worker_id: row.get("worker_id"),
        attempt: row.get("attempt"),
    })
}

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<ExecutionRecord, StoreError> {
    let status: String = row.get("status");
    Ok(ExecutionRecord {
        execution_id: row.get("execution_id"),
        path: row.get("path"),
        version: row.get("version"),
        status: Status::parse(&status).map_err(|e| StoreError::Serialization(e.to_string()))?,
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        parent_execution_id: row.get("parent_execution_id"),
        parent_step: row.get("parent_step"),
    })
}

fn row_to_catalog(row: &sqlx::postgres::PgRow) -> CatalogEntry {
    let kind: String = row.get("kind");
    CatalogEntry {
        kind: if kind == "credential" {
            CatalogKind::Credential
        } else {
            CatalogKind::Playbook
        },
        path: row.get("path"),
        version: row.get("version"),
        content: row.get("content"),
        content_hash: row.get("content_hash"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl CatalogStore for PostgresStore {
    #[instrument(skip(self, entry), fields(path = %entry.path))]
    async fn register(&self, entry: NewCatalogEntry) -> Result<CatalogEntry, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Lock the newest row of this path so concurrent registrations
        // serialize on version allocation.
        let latest: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT version FROM noetl_catalog
            WHERE kind = $1 AND path = $2
            ORDER BY version DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(entry.kind.as_str())
        .bind(&entry.path)
        .fetch_optional(&mut *tx)
        .await?;

        let version = match entry.version {
            Some(v) => {
                if latest.map(|l| v <= l).unwrap_or(false) {
                    let exists: bool = sqlx::query_scalar(
                        "SELECT EXISTS(SELECT 1 FROM noetl_catalog WHERE kind = $1 AND path = $2 AND version = $3)",
                    )
                    .bind(entry.kind.as_str())
                    .bind(&entry.path)
                    .bind(v)
                    .fetch_one(&mut *tx)
                    .await?;
                    if exists {
                        return Err(StoreError::Conflict(format!(
                            "{} '{}' version {} already registered",
                            entry.kind.as_str(),
                            entry.path,
                            v
                        )));
                    }
                }
                v
            }
            None => latest.map(|l| l + 1).unwrap_or(1),
        };

        let created_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO noetl_catalog (kind, path, version, content, content_hash)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING created_at
            "#,
        )
        .bind(entry.kind.as_str())
        .bind(&entry.path)
        .bind(version)
        .bind(&entry.content)
        .bind(&entry.content_hash)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(path = %entry.path, version, "registered catalog entry");
        Ok(CatalogEntry {
            kind: entry.kind,
            path: entry.path,
            version,
            content: entry.content,
            content_hash: entry.content_hash,
            created_at,
        })
    }

    #[instrument(skip(self))]
    async fn fetch(
        &self,
        kind: CatalogKind,
        path: &str,
        version: Option<i64>,
    ) -> Result<Option<CatalogEntry>, StoreError> {
        let row = match version {
            Some(v) => {
                sqlx::query(
                    r#"
                    SELECT kind, path, version, content, content_hash, created_at
                    FROM noetl_catalog
                    WHERE kind = $1 AND path = $2 AND version = $3
                    "#,
                )
                .bind(kind.as_str())
                .bind(path)
                .bind(v)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT kind, path, version, content, content_hash, created_at
                    FROM noetl_catalog
                    WHERE kind = $1 AND path = $2
                    ORDER BY version DESC
                    LIMIT 1
                    "#,
                )
                .bind(kind.as_str())
                .bind(path)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(row.map(|r| row_to_catalog(&r)))
    }

    #[instrument(skip(self))]
    async fn list(&self, kind: CatalogKind) -> Result<Vec<CatalogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (path)
                   kind, path, version, content, content_hash, created_at
            FROM noetl_catalog
            WHERE kind = $1
            ORDER BY path, version DESC
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_catalog).collect())
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    #[instrument(skip(self, record), fields(execution_id = record.execution_id))]
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO noetl_execution (
                execution_id, path, version, status, started_at,
                ended_at, parent_execution_id, parent_step
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (execution_id) DO NOTHING
            "#,
        )
        .bind(record.execution_id)
        .bind(&record.path)
        .bind(record.version)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.parent_execution_id)
        .bind(&record.parent_step)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_execution(
        &self,
        execution_id: i64,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT execution_id, path, version, status, started_at,
                   ended_at, parent_execution_id, parent_step
            FROM noetl_execution
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_execution(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn update_execution_status(
        &self,
        execution_id: i64,
        status: Status,
    ) -> Result<(), StoreError> {
        let ended_at = status.is_terminal().then(Utc::now);
        let result = sqlx::query(
            r#"
            UPDATE noetl_execution
            SET status = $2, ended_at = COALESCE(ended_at, $3)
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(status.as_str())
        .bind(ended_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(execution_id));
        }
        Ok(())
    }

    #[instrument(skip(self, filter))]
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let limit = filter.limit.unwrap_or(50).clamp(1, 500);
        let offset = filter.offset.unwrap_or(0).max(0);

        let rows = sqlx::query(
            r#"
            SELECT execution_id, path, version, status, started_at,
                   ended_at, parent_execution_id, parent_step
            FROM noetl_execution
            WHERE ($1::TEXT IS NULL OR path LIKE $1)
              AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY execution_id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.path.as_ref().map(|p| format!("%{p}%")))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_execution).collect()
    }

    #[instrument(skip(self))]
    async fn child_executions(
        &self,
        parent_execution_id: i64,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, path, version, status, started_at,
                   ended_at, parent_execution_id, parent_step
            FROM noetl_execution
            WHERE parent_execution_id = $1
              AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            ORDER BY execution_id
            "#,
        )
        .bind(parent_execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_execution).collect()
    }

    #[instrument(skip(self, event), fields(execution_id = event.execution_id, event_type = %event.event_type))]
    async fn append_event(&self, event: &Event) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        if event.event_type.is_command_scoped() {
            let duplicate: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS(
                    SELECT 1 FROM noetl_event
                    WHERE execution_id = $1 AND node_id = $2
                      AND event_type = $3 AND attempt IS NOT DISTINCT FROM $4
                )
                "#,
            )
            .bind(event.execution_id)
            .bind(&event.node_id)
            .bind(event.event_type.as_str())
            .bind(event.attempt)
            .fetch_one(&mut *tx)
            .await?;

            if duplicate {
                return Ok(false);
            }
        }

        let error_json = event
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO noetl_event (
                execution_id, event_id, parent_event_id, parent_execution_id,
                event_type, node_id, node_name, status, created_at,
                context, result, meta, error, loop_id, current_index,
                worker_id, attempt
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (execution_id, event_id) DO NOTHING
            "#,
        )
        .bind(event.execution_id)
        .bind(event.event_id)
        .bind(event.parent_event_id)
        .bind(event.parent_execution_id)
        .bind(event.event_type.as_str())
        .bind(&event.node_id)
        .bind(&event.node_name)
        .bind(event.status.as_str())
        .bind(event.timestamp)
        .bind(&event.context)
        .bind(&event.result)
        .bind(&event.meta)
        .bind(&error_json)
        .bind(&event.loop_id)
        .bind(event.current_index)
        .bind(&event.worker_id)
        .bind(event.attempt)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn load_events(&self, execution_id: i64) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, event_id, parent_event_id, parent_execution_id,
                   event_type, node_id, node_name, status, created_at,
                   context, result, meta, error, loop_id, current_index,
                   worker_id, attempt
            FROM noetl_event
            WHERE execution_id = $1
            ORDER BY event_id
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to load events: {e}");
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(row_to_event).collect()
    }

    #[instrument(skip(self))]
    async fn load_events_page(
        &self,
        execution_id: i64,
        after_event_id: i64,
        limit: i64,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, event_id, parent_event_id, parent_execution_id,
                   event_type, node_id, node_name, status, created_at,
                   context, result, meta, error, loop_id, current_index,
                   worker_id, attempt
            FROM noetl_event
            WHERE execution_id = $1 AND event_id > $2
            ORDER BY event_id
            LIMIT $3
            "#,
        )
        .bind(execution_id)
        .bind(after_event_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }
}

#[async_trait]
impl QueueStore for PostgresStore {
    #[instrument(skip(self, command), fields(command_id = command.command_id, node_id = %command.node_id))]
    async fn enqueue(&self, command: &NewCommand) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO noetl_queue (
                command_id, execution_id, node_id, action, context,
                priority, max_attempts, step_attempt, pool, available_at, timeout_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (command_id) DO NOTHING
            "#,
        )
        .bind(command.command_id)
        .bind(command.execution_id)
        .bind(&command.node_id)
        .bind(&command.action)
        .bind(&command.context)
        .bind(command.priority)
        .bind(command.max_attempts)
        .bind(command.step_attempt)
        .bind(&command.pool)
        .bind(command.available_at)
        .bind(command.timeout_ms)
        .execute(&self.pool)
        .await?;

        debug!(command_id = command.command_id, "enqueued command");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        worker_id: &str,
        pool: &str,
        max_items: usize,
        lease_ms: i64,
    ) -> Result<Vec<ClaimedCommand>, StoreError> {
        // SKIP LOCKED keeps concurrent claimers from serializing on the
        // same rows; the CTE + UPDATE pair is atomic.
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT command_id
                FROM noetl_queue
                WHERE pool = $1
                  AND available_at <= NOW()
                  AND (status = 'PENDING'
                       OR (status = 'LEASED' AND lease_until < NOW()))
                ORDER BY priority DESC, available_at, command_id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE noetl_queue q
            SET status = 'LEASED',
                worker_id = $3,
                lease_until = NOW() + ($4::BIGINT * INTERVAL '1 millisecond'),
                last_heartbeat = NOW(),
                attempts = q.attempts + 1,
                reclaim_count = q.reclaim_count
                    + CASE WHEN q.status = 'LEASED' THEN 1 ELSE 0 END
            FROM claimable c
            WHERE q.command_id = c.command_id
            RETURNING q.command_id, q.execution_id, q.node_id, q.action, q.context,
                      q.step_attempt, q.attempts, q.max_attempts, q.timeout_ms, q.lease_until
            "#,
        )
        .bind(pool)
        .bind(max_items as i64)
        .bind(worker_id)
        .bind(lease_ms)
        .fetch_all(&self.pool)
        .await?;

        let claimed: Vec<ClaimedCommand> = rows
            .iter()
            .map(|row| ClaimedCommand {
                command_id: row.get("command_id"),
                execution_id: row.get("execution_id"),
                node_id: row.get("node_id"),
                action: row.get("action"),
                context: row.get("context"),
                step_attempt: row.get("step_attempt"),
                attempts: row.get("attempts"),
                max_attempts: row.get("max_attempts"),
                timeout_ms: row.get("timeout_ms"),
                lease_until: row.get("lease_until"),
            })
            .collect();

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed commands");
        }
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn heartbeat(
        &self,
        command_id: i64,
        worker_id: &str,
        extend_ms: i64,
    ) -> Result<HeartbeatAck, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE noetl_queue
            SET lease_until = NOW() + ($3::BIGINT * INTERVAL '1 millisecond'),
                last_heartbeat = NOW()
            WHERE command_id = $1 AND worker_id = $2 AND status = 'LEASED'
            "#,
        )
        .bind(command_id)
        .bind(worker_id)
        .bind(extend_ms)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(HeartbeatAck {
                accepted: true,
                cancel_requested: false,
            });
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM noetl_queue WHERE command_id = $1")
                .bind(command_id)
                .fetch_optional(&self.pool)
                .await?;

        match status.as_deref() {
            Some("CANCELLED") => Ok(HeartbeatAck {
                accepted: false,
                cancel_requested: true,
            }),
            Some(_) => Ok(HeartbeatAck {
                accepted: false,
                cancel_requested: false,
            }),
            None => Err(StoreError::CommandNotFound(command_id)),
        }
    }

    #[instrument(skip(self))]
    async fn complete(&self, command_id: i64, worker_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE noetl_queue
            SET status = 'DONE'
            WHERE command_id = $1 AND worker_id = $2
              AND status IN ('LEASED', 'DONE')
            "#,
        )
        .bind(command_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM noetl_queue WHERE command_id = $1")
                .bind(command_id)
                .fetch_optional(&self.pool)
                .await?;

        match status.as_deref() {
            Some("CANCELLED") => Ok(()),
            Some(_) => Err(StoreError::LeaseLost {
                command_id,
                worker_id: worker_id.to_string(),
            }),
            None => Err(StoreError::CommandNotFound(command_id)),
        }
    }

    #[instrument(skip(self, error))]
    async fn fail(
        &self,
        command_id: i64,
        worker_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE noetl_queue
            SET status = 'FAILED', last_error = $3
            WHERE command_id = $1 AND worker_id = $2 AND status = 'LEASED'
            "#,
        )
        .bind(command_id)
        .bind(worker_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost {
                command_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn release(&self, command_id: i64, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE noetl_queue
            SET status = 'PENDING', worker_id = NULL, lease_until = NULL, last_error = $2
            WHERE command_id = $1 AND status IN ('PENDING', 'LEASED')
            "#,
        )
        .bind(command_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_execution(&self, execution_id: i64) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE noetl_queue
            SET status = 'CANCELLED'
            WHERE execution_id = $1 AND status IN ('PENDING', 'LEASED')
            "#,
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self))]
    async fn reap(&self) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE noetl_queue
            SET status = 'PENDING', worker_id = NULL, lease_until = NULL,
                reclaim_count = reclaim_count + 1
            WHERE status = 'LEASED' AND lease_until < NOW()
            RETURNING command_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("command_id")).collect())
    }

    #[instrument(skip(self))]
    async fn depth(&self, pool: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM noetl_queue
            WHERE pool = $1 AND status IN ('PENDING', 'LEASED')
            "#,
        )
        .bind(pool)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    #[instrument(skip(self))]
    async fn has_open_command(
        &self,
        execution_id: i64,
        node_id: &str,
    ) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM noetl_queue
                WHERE execution_id = $1 AND node_id = $2
                  AND status IN ('PENDING', 'LEASED')
            )
            "#,
        )
        .bind(execution_id)
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}
