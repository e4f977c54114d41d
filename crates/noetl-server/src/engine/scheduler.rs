//! The scheduler service.
//!
//! Wraps the pure [`Orchestrator`] with storage, id allocation, and
//! per-execution serialization. One scheduler instance owns the
//! executions of its shard; evaluation for a single execution is
//! serialized through a keyed mutex so command issuance is race-free.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use noetl_core::event::EventError;
use noetl_core::{
    validate_playbook, CoreError, Event, EventType, Playbook, SnowflakeGenerator, Status,
};
use noetl_storage::{
    CatalogKind, CatalogStore, EventStore, ExecutionFilter, ExecutionRecord, NewCommand,
    QueueStore, StoreError,
};

use super::orchestrator::{Completion, EngineError, EventDraft, Orchestrator};
use crate::config::ServerConfig;

/// Scheduler failures.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("playbook not found: {0}")]
    PlaybookNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(i64),

    #[error("execution {0} is already terminal")]
    AlreadyTerminal(i64),
}

/// Upper bound on evaluate-persist rounds per trigger; each round only
/// runs when the previous one changed the log, so this is a backstop
/// against authoring mistakes, not a scheduling knob.
const MAX_EVAL_ROUNDS: usize = 16;

pub struct Scheduler<S: ?Sized> {
    store: Arc<S>,
    orchestrator: Orchestrator,
    ids: Arc<SnowflakeGenerator>,
    locks: DashMap<i64, Arc<tokio::sync::Mutex<()>>>,
    events_tx: broadcast::Sender<Event>,
    config: ServerConfig,
}

impl<S> Scheduler<S>
where
    S: noetl_storage::Store + ?Sized,
{
    pub fn new(store: Arc<S>, config: ServerConfig) -> Self {
        let (events_tx, _) = broadcast::channel(4096);
        Self {
            store,
            orchestrator: Orchestrator::new(config.default_pool.clone()),
            ids: Arc::new(SnowflakeGenerator::new(config.node_id)),
            locks: DashMap::new(),
            events_tx,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn next_id(&self) -> i64 {
        self.ids.next_id()
    }

    /// Subscribe to the live event stream (SSE fan-out).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    fn lock_for(&self, execution_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(execution_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Start a new execution of a registered playbook.
    #[instrument(skip(self, parameters))]
    pub async fn start_execution(
        &self,
        path: &str,
        version: Option<i64>,
        parameters: Option<Value>,
        merge: bool,
        parent: Option<(i64, String)>,
    ) -> Result<i64, SchedulerError> {
        let entry = self
            .store
            .fetch(CatalogKind::Playbook, path, version)
            .await?
            .ok_or_else(|| SchedulerError::PlaybookNotFound(path.to_string()))?;

        let playbook = Playbook::from_yaml(&entry.content)?;
        validate_playbook(&playbook)?;

        let workload = merged_workload(playbook.workload.as_ref(), parameters.as_ref(), merge);
        let execution_id = self.ids.next_id();
        let (parent_execution_id, parent_step) = match parent {
            Some((id, step)) => (Some(id), Some(step)),
            None => (None, None),
        };

        self.store
            .create_execution(&ExecutionRecord {
                execution_id,
                path: entry.path.clone(),
                version: entry.version,
                status: Status::Running,
                started_at: Utc::now(),
                ended_at: None,
                parent_execution_id,
                parent_step: parent_step.clone(),
            })
            .await?;

        let mut init = Event::new(
            self.ids.next_id(),
            execution_id,
            EventType::PlaybookInitialized,
            "playbook",
            Status::Initialized,
        )
        .with_context(json!({
            "workload": workload,
            "path": entry.path,
            "version": entry.version,
        }));
        init.parent_execution_id = parent_execution_id;
        if let Some(step) = &parent_step {
            init.meta = Some(json!({ "parent_step": step }));
        }
        self.append_and_broadcast(&init).await?;

        info!(execution_id, path = %entry.path, version = entry.version, "execution started");

        self.evaluate_execution(execution_id).await?;
        Ok(execution_id)
    }

    /// Ingest one externally produced event (worker reports). Stamps the
    /// id and timestamp when missing, appends idempotently, and runs the
    /// scheduler when the event is actionable.
    #[instrument(skip(self, event), fields(execution_id = event.execution_id, event_type = %event.event_type))]
    pub async fn ingest(&self, mut event: Event) -> Result<(i64, bool), SchedulerError> {
        let record = self
            .store
            .get_execution(event.execution_id)
            .await?
            .ok_or(SchedulerError::ExecutionNotFound(event.execution_id))?;

        if event.event_id == 0 {
            event.event_id = self.ids.next_id();
        }

        let appended = self.append_and_broadcast(&event).await?;

        if appended && is_actionable(event.event_type) && !record.status.is_terminal() {
            self.evaluate_execution(event.execution_id).await?;
        }

        // A finished child wakes its parent so the waiting step observes
        // the terminal state promptly.
        if appended
            && event.event_type == EventType::PlaybookCompleted
            && record.parent_execution_id.is_some()
        {
            if let Some(parent_id) = record.parent_execution_id {
                if let Err(e) = self.evaluate_execution(parent_id).await {
                    warn!(parent_id, "parent re-evaluation failed: {e}");
                }
            }
        }

        Ok((event.event_id, !appended))
    }

    /// Cancel an execution: stop issuing, cancel queued commands, settle
    /// never-claimed steps, cascade to children.
    #[instrument(skip(self))]
    pub async fn cancel_execution(
        &self,
        execution_id: i64,
        reason: &str,
    ) -> Result<(), SchedulerError> {
        let record = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(SchedulerError::ExecutionNotFound(execution_id))?;
        if record.status.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal(execution_id));
        }

        let playbook = self.load_playbook(&record).await?;
        let events = self.store.load_events(execution_id).await?;
        let proj = super::Projection::fold(&playbook, &events, self.orchestrator.renderer());

        let cancel = Event::new(
            self.ids.next_id(),
            execution_id,
            EventType::ExecutionCancelled,
            "playbook",
            Status::Cancelled,
        )
        .with_meta(json!({ "reason": reason }));
        self.append_and_broadcast(&cancel).await?;

        let released = self.store.cancel_execution(execution_id).await?;
        debug!(execution_id, released, "cancelled queued commands");

        // Steps whose command was never claimed have no worker to report
        // a terminal state; settle them here. Claimed steps report back
        // or are settled by the tick sweep after the lease window.
        for (node_id, entry) in &proj.steps {
            if !entry.is_terminal() && entry.status == Status::Pending {
                self.append_cancelled_exit(execution_id, node_id, entry.attempts)
                    .await?;
            }
        }

        // Open sink commands were cancelled on the queue; settle their
        // log state so the execution can finalize.
        for (node_id, sink) in &proj.sinks {
            if sink.status.is_none() {
                let event = Event::new(
                    self.ids.next_id(),
                    execution_id,
                    EventType::SinkFailed,
                    node_id,
                    Status::Cancelled,
                )
                .with_error(EventError::new("cancelled", "execution cancelled"));
                self.append_and_broadcast(&event).await?;
            }
        }

        for child in self.store.child_executions(execution_id).await? {
            let child_id = child.execution_id;
            if let Err(e) =
                Box::pin(self.cancel_execution(child_id, "parent cancelled")).await
            {
                warn!(child_id, "child cancellation failed: {e}");
            }
        }

        self.evaluate_execution(execution_id).await?;
        Ok(())
    }

    async fn append_cancelled_exit(
        &self,
        execution_id: i64,
        node_id: &str,
        attempts: i32,
    ) -> Result<(), SchedulerError> {
        let event = Event::new(
            self.ids.next_id(),
            execution_id,
            EventType::StepExit,
            node_id,
            Status::Cancelled,
        )
        .with_attempt(attempts.max(1));
        self.append_and_broadcast(&event).await?;
        Ok(())
    }

    /// Run the orchestrator for one execution until it is quiescent.
    #[instrument(skip(self))]
    pub async fn evaluate_execution(&self, execution_id: i64) -> Result<(), SchedulerError> {
        if !self.config.owns_execution(execution_id) {
            debug!(execution_id, "not owned by this shard, skipping");
            return Ok(());
        }

        let lock = self.lock_for(execution_id);
        let _guard = lock.lock().await;

        let record = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(SchedulerError::ExecutionNotFound(execution_id))?;
        if record.status.is_terminal() {
            return Ok(());
        }
        let playbook = self.load_playbook(&record).await?;

        for _round in 0..MAX_EVAL_ROUNDS {
            let events = self.store.load_events(execution_id).await?;
            let outcome = self.orchestrator.evaluate(&playbook, &events)?;

            let mut progressed = false;

            for draft in &outcome.events {
                if self.persist_draft(execution_id, draft).await? {
                    progressed = true;
                }
            }

            for request in &outcome.commands {
                if self.issue_command(execution_id, request).await? {
                    progressed = true;
                }
            }

            if let Some(completion) = &outcome.completion {
                self.finalize(execution_id, completion).await?;
                return Ok(());
            }

            if !progressed {
                return Ok(());
            }
        }

        warn!(execution_id, "evaluation did not quiesce, deferring to next trigger");
        Ok(())
    }

    async fn persist_draft(
        &self,
        execution_id: i64,
        draft: &EventDraft,
    ) -> Result<bool, SchedulerError> {
        let mut event = Event::new(
            self.ids.next_id(),
            execution_id,
            draft.event_type,
            &draft.node_id,
            draft.status,
        );
        event.context = draft.context.clone();
        event.result = draft.result.clone();
        event.meta = draft.meta.clone();
        event.error = draft.error.clone();
        event.loop_id = draft.loop_id.clone();
        event.current_index = draft.current_index;
        event.attempt = draft.attempt;

        Ok(self.append_and_broadcast(&event).await?)
    }

    async fn issue_command(
        &self,
        execution_id: i64,
        request: &super::orchestrator::CommandRequest,
    ) -> Result<bool, SchedulerError> {
        if self.store.has_open_command(execution_id, &request.node_id).await? {
            return Ok(false);
        }

        let depth = self.store.depth(&request.pool).await?;
        if depth >= self.config.max_queue_depth {
            warn!(
                pool = %request.pool,
                depth,
                "queue depth exceeded, deferring issuance"
            );
            return Ok(false);
        }

        let command_id = self.ids.next_id();

        let mut issued = Event::new(
            self.ids.next_id(),
            execution_id,
            EventType::CommandIssued,
            &request.node_id,
            Status::Pending,
        )
        .with_context(request.payload.clone())
        .with_attempt(request.step_attempt);
        issued.meta = merge_meta(request.meta.clone(), command_id);
        issued.loop_id = request.loop_id.clone();
        issued.current_index = request.current_index;

        if !self.append_and_broadcast(&issued).await? {
            // Another evaluation already issued this attempt.
            return Ok(false);
        }

        self.store
            .enqueue(&NewCommand {
                command_id,
                execution_id,
                node_id: request.node_id.clone(),
                action: request.action.clone(),
                context: request.payload.clone(),
                priority: request.priority,
                max_attempts: self.config.default_max_attempts,
                step_attempt: request.step_attempt,
                pool: request.pool.clone(),
                available_at: Utc::now()
                    + chrono::Duration::milliseconds(request.delay.as_millis() as i64),
                timeout_ms: request.timeout_ms,
            })
            .await?;

        debug!(
            execution_id,
            node_id = %request.node_id,
            command_id,
            attempt = request.step_attempt,
            "issued command"
        );
        Ok(true)
    }

    async fn finalize(
        &self,
        execution_id: i64,
        completion: &Completion,
    ) -> Result<(), SchedulerError> {
        if completion.status != Status::Cancelled {
            let mut wf = Event::new(
                self.ids.next_id(),
                execution_id,
                EventType::WorkflowCompleted,
                "workflow",
                completion.status,
            );
            if let Some(message) = &completion.error {
                wf.error = Some(EventError::new("tool", message.clone()));
            }
            self.append_and_broadcast(&wf).await?;
        }

        let mut pb = Event::new(
            self.ids.next_id(),
            execution_id,
            EventType::PlaybookCompleted,
            "playbook",
            completion.status,
        );
        if let Some(message) = &completion.error {
            pb.error = Some(EventError::new("tool", message.clone()));
            pb.result = Some(json!({ "failed_steps": completion.failed_steps }));
        }
        self.append_and_broadcast(&pb).await?;

        self.store
            .update_execution_status(execution_id, completion.status)
            .await?;

        info!(execution_id, status = %completion.status, "execution finalized");
        Ok(())
    }

    /// Periodic maintenance: reap expired leases, settle cancelled
    /// executions past their grace window, and nudge stuck executions.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<(), SchedulerError> {
        let reclaimed = self.store.reap().await?;
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "reclaimed expired leases");
        }

        let running = self
            .store
            .list_executions(&ExecutionFilter {
                status: Some(Status::Running),
                limit: Some(500),
                ..Default::default()
            })
            .await?;

        for record in running {
            let execution_id = record.execution_id;
            if !self.config.owns_execution(execution_id) {
                continue;
            }
            if let Err(e) = self.sweep_execution(&record).await {
                error!(execution_id, "tick sweep failed: {e}");
            }
        }

        Ok(())
    }

    async fn sweep_execution(&self, record: &ExecutionRecord) -> Result<(), SchedulerError> {
        let execution_id = record.execution_id;
        let playbook = self.load_playbook(record).await?;
        let events = self.store.load_events(execution_id).await?;
        let proj = super::Projection::fold(&playbook, &events, self.orchestrator.renderer());

        // A cancelled execution whose workers never reported back gets
        // its in-flight steps settled once the lease window has passed.
        if proj.cancelled {
            let grace_over = proj
                .cancelled_at
                .map(|t| {
                    Utc::now() - t
                        > chrono::Duration::milliseconds(
                            self.config.default_lease.as_millis() as i64
                        )
                })
                .unwrap_or(true);
            if grace_over {
                for (node_id, entry) in &proj.steps {
                    if !entry.is_terminal() {
                        self.append_cancelled_exit(execution_id, node_id, entry.attempts)
                            .await?;
                    }
                }
            }
        }

        self.evaluate_execution(execution_id).await
    }

    async fn load_playbook(&self, record: &ExecutionRecord) -> Result<Playbook, SchedulerError> {
        let entry = self
            .store
            .fetch(CatalogKind::Playbook, &record.path, Some(record.version))
            .await?
            .ok_or_else(|| SchedulerError::PlaybookNotFound(record.path.clone()))?;
        Ok(Playbook::from_yaml(&entry.content)?)
    }

    async fn append_and_broadcast(&self, event: &Event) -> Result<bool, StoreError> {
        let appended = self.store.append_event(event).await?;
        if appended {
            let _ = self.events_tx.send(event.clone());
        }
        Ok(appended)
    }
}

/// Events that advance the scheduler; progress markers are log-only.
fn is_actionable(event_type: EventType) -> bool {
    matches!(
        event_type,
        EventType::StepExit
            | EventType::ActionCompleted
            | EventType::ActionError
            | EventType::SinkExecuted
            | EventType::SinkFailed
            | EventType::LoopCompleted
    )
}

fn merge_meta(meta: Option<Value>, command_id: i64) -> Option<Value> {
    let mut base = meta.unwrap_or_else(|| json!({}));
    if let Some(obj) = base.as_object_mut() {
        obj.insert("command_id".to_string(), json!(command_id.to_string()));
    }
    Some(base)
}

/// Combine the registered workload with run parameters. `merge` requests
/// a recursive merge; otherwise parameter keys replace workload keys.
fn merged_workload(base: Option<&Value>, parameters: Option<&Value>, merge: bool) -> Value {
    let mut result = base.cloned().unwrap_or_else(|| json!({}));
    let Some(params) = parameters else {
        return result;
    };

    match (result.as_object_mut(), params.as_object()) {
        (Some(out), Some(overlay)) => {
            for (k, v) in overlay {
                if merge {
                    deep_merge(out.entry(k.clone()).or_insert(Value::Null), v);
                } else {
                    out.insert(k.clone(), v.clone());
                }
            }
            result
        }
        _ => params.clone(),
    }
}

fn deep_merge(target: &mut Value, overlay: &Value) {
    match (target.as_object_mut(), overlay.as_object()) {
        (Some(t), Some(o)) => {
            for (k, v) in o {
                deep_merge(t.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        _ => *target = overlay.clone(),
    }
}
