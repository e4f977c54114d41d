//! The worker loop: claim, heartbeat, execute, report.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, instrument, warn};

use noetl_core::event::{base_node_name, loop_index, EventError};
use noetl_core::{Event, EventType, Status};
use noetl_storage::ClaimedCommand;
use noetl_template::Renderer;

use crate::cache::TtlCache;
use crate::client::{ApiClient, ClientError};
use crate::config::WorkerConfig;
use crate::tools::{ToolError, ToolErrorKind, ToolRegistry};

/// Worker runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Signals from the heartbeat loop to the executing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseSignal {
    Alive,
    /// The execution was cancelled; stop best-effort and report.
    Cancelled,
    /// The lease is gone; discard the result entirely.
    Lost,
}

/// Shared pieces each in-flight command execution needs.
struct WorkerShared {
    config: WorkerConfig,
    client: ApiClient,
    registry: ToolRegistry,
    renderer: Renderer,
    credentials: TtlCache,
}

/// The worker runtime. `run` blocks until shutdown.
pub struct Worker {
    shared: Arc<WorkerShared>,
    active: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        let client = ApiClient::new(&config.server_url);
        let registry = ToolRegistry::builtin(client.clone());
        let credentials = TtlCache::new(config.credential_ttl);
        let capacity = config.capacity;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            shared: Arc::new(WorkerShared {
                config,
                client,
                registry,
                renderer: Renderer::new(),
                credentials,
            }),
            active: Arc::new(Semaphore::new(capacity)),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Request a graceful stop: no new claims, in-flight commands finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Claim-and-execute until shutdown. Polling backs off adaptively
    /// when the queue is idle and snaps back once work shows up.
    #[instrument(skip(self), fields(worker_id = %self.shared.config.worker_id))]
    pub async fn run(&self) -> Result<(), WorkerError> {
        let config = &self.shared.config;
        info!(
            pool = %config.pool,
            runtime = %config.runtime,
            capacity = config.capacity,
            tools = ?self.shared.registry.names(),
            "worker started"
        );

        let mut interval = config.poll_min;
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let slots = self.active.available_permits();
            if slots == 0 {
                if wait_or_shutdown(&mut shutdown_rx, interval).await {
                    break;
                }
                continue;
            }

            let claimed = match self
                .shared
                .client
                .claim(
                    &config.worker_id,
                    &config.pool,
                    slots,
                    config.lease.as_millis() as i64,
                )
                .await
            {
                Ok(commands) => commands,
                Err(e) => {
                    warn!("claim failed: {e}");
                    interval = bump(interval, config.poll_max);
                    if wait_or_shutdown(&mut shutdown_rx, interval).await {
                        break;
                    }
                    continue;
                }
            };

            if claimed.is_empty() {
                interval = bump(interval, config.poll_max);
            } else {
                interval = config.poll_min;
                debug!(count = claimed.len(), "claimed commands");
                for command in claimed {
                    let permit = self
                        .active
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore closed");
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        execute_command(shared, command).await;
                        drop(permit);
                    });
                }
            }

            if wait_or_shutdown(&mut shutdown_rx, interval).await {
                break;
            }
        }

        // Drain: wait for in-flight commands.
        let _ = self
            .active
            .acquire_many(self.shared.config.capacity as u32)
            .await;
        info!("worker stopped");
        Ok(())
    }
}

fn bump(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Sleep for `interval`, returning true when shutdown was signalled.
async fn wait_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        _ = shutdown_rx.changed() => true,
    }
}

fn command_event(
    command: &ClaimedCommand,
    worker_id: &str,
    event_type: EventType,
    status: Status,
) -> Event {
    let mut event = Event::new(0, command.execution_id, event_type, &command.node_id, status);
    event.attempt = Some(command.step_attempt);
    event.worker_id = Some(worker_id.to_string());
    if let Some(index) = loop_index(&command.node_id) {
        if !command.node_id.contains(":sink[") {
            event.current_index = Some(index as i64);
            event.loop_id = Some(base_node_name(&command.node_id).to_string());
        }
    }
    event
}

/// Run one claimed command to a report.
#[instrument(skip(shared, command), fields(
    execution_id = command.execution_id,
    node_id = %command.node_id,
    attempt = command.step_attempt,
))]
async fn execute_command(shared: Arc<WorkerShared>, command: ClaimedCommand) {
    let worker_id = shared.config.worker_id.clone();
    let is_sink = command.node_id.contains(":sink[");

    let tool_spec = command.context.get("tool").cloned().unwrap_or(json!({}));
    let render_context = command
        .context
        .get("render_context")
        .cloned()
        .unwrap_or(json!({}));
    let kind = tool_spec
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("noop")
        .to_string();

    // Heartbeat for the duration of the execution.
    let (lease_tx, lease_rx) = watch::channel(LeaseSignal::Alive);
    let heartbeat = spawn_heartbeat(Arc::clone(&shared), &command, lease_tx);

    let outcome = run_tool(
        &shared,
        &command,
        &kind,
        &tool_spec,
        &render_context,
        is_sink,
        lease_rx,
    )
    .await;

    heartbeat.abort();

    match outcome {
        RunOutcome::Success(result) => {
            report_success(&shared, &command, &worker_id, is_sink, result).await;
        }
        RunOutcome::Failure(error) => {
            report_failure(&shared, &command, &worker_id, is_sink, error).await;
        }
        RunOutcome::Cancelled => {
            let event = command_event(
                &command,
                &worker_id,
                EventType::StepExit,
                Status::Cancelled,
            );
            if let Err(e) = shared.client.post_event(&event).await {
                warn!("cancel report failed: {e}");
            }
            let _ = shared.client.complete(&command, &worker_id).await;
        }
        RunOutcome::LeaseLost => {
            // Someone else owns the command now; discard everything.
            warn!("lease lost mid-execution, discarding result");
        }
    }
}

enum RunOutcome {
    Success(Value),
    Failure(ToolError),
    Cancelled,
    LeaseLost,
}

async fn run_tool(
    shared: &Arc<WorkerShared>,
    command: &ClaimedCommand,
    kind: &str,
    tool_spec: &Value,
    render_context: &Value,
    is_sink: bool,
    mut lease_rx: watch::Receiver<LeaseSignal>,
) -> RunOutcome {
    // Resolve credentials before rendering so templated specs can read
    // them under `credentials.<alias>`.
    let credentials = match resolve_credentials(shared, tool_spec).await {
        Ok(c) => c,
        Err(e) => return RunOutcome::Failure(e),
    };
    let mut context = render_context.as_object().cloned().unwrap_or_default();
    context.insert("credentials".to_string(), credentials.clone());
    let context = Value::Object(context);

    let raw_spec = tool_spec.get("spec").cloned().unwrap_or(json!({}));
    let raw_args = tool_spec.get("args").cloned().unwrap_or(json!({}));

    let spec = match shared.renderer.render_deep(&raw_spec, &context) {
        Ok(v) => v,
        Err(e) => {
            return RunOutcome::Failure(ToolError::new(
                ToolErrorKind::Template,
                format!("spec render: {e}"),
            ))
        }
    };
    let args = match shared.renderer.render_deep(&raw_args, &context) {
        Ok(v) => v,
        Err(e) => {
            return RunOutcome::Failure(ToolError::new(
                ToolErrorKind::Template,
                format!("args render: {e}"),
            ))
        }
    };

    let Some(tool) = shared.registry.get(kind) else {
        return RunOutcome::Failure(ToolError::tool(format!("unknown tool kind '{kind}'")));
    };

    if !is_sink {
        let enter = command_event(
            command,
            &shared.config.worker_id,
            EventType::StepEnter,
            Status::Started,
        );
        if let Err(e) = shared.client.post_event(&enter).await {
            warn!("step.enter report failed: {e}");
        }
    }

    let timeout = command
        .timeout_ms
        .or_else(|| tool_spec.get("timeout_ms").and_then(Value::as_i64))
        .map(|ms| Duration::from_millis(ms.max(0) as u64));

    let call = crate::tools::ToolCall {
        spec: &spec,
        args: &args,
        credentials: &credentials,
        context: &context,
        execution_id: command.execution_id,
        node_id: &command.node_id,
    };
    let execution = tool.execute(call);

    let result = tokio::select! {
        result = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, execution).await {
                    Ok(inner) => inner,
                    Err(_) => Err(ToolError::new(
                        ToolErrorKind::Timeout,
                        format!("tool '{kind}' exceeded {}ms", limit.as_millis()),
                    )),
                },
                None => execution.await,
            }
        } => result,
        signal = watch_lease(&mut lease_rx) => {
            return match signal {
                LeaseSignal::Cancelled => RunOutcome::Cancelled,
                _ => RunOutcome::LeaseLost,
            };
        }
    };

    match result {
        Ok(value) => RunOutcome::Success(value),
        Err(e) => RunOutcome::Failure(e),
    }
}

async fn watch_lease(lease_rx: &mut watch::Receiver<LeaseSignal>) -> LeaseSignal {
    loop {
        if lease_rx.changed().await.is_err() {
            // Sender gone without a signal: keep executing.
            std::future::pending::<()>().await;
        }
        let signal = *lease_rx.borrow();
        if signal != LeaseSignal::Alive {
            return signal;
        }
    }
}

fn spawn_heartbeat(
    shared: Arc<WorkerShared>,
    command: &ClaimedCommand,
    lease_tx: watch::Sender<LeaseSignal>,
) -> tokio::task::JoinHandle<()> {
    let command_id = command.command_id;
    let worker_id = shared.config.worker_id.clone();
    let interval = shared.config.heartbeat_interval;
    let lease_ms = shared.config.lease.as_millis() as i64;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            match shared.client.heartbeat(command_id, &worker_id, lease_ms).await {
                Ok(ack) if ack.accepted => continue,
                Ok(ack) if ack.cancel_requested => {
                    debug!(command_id, "cancellation observed via heartbeat");
                    let _ = lease_tx.send(LeaseSignal::Cancelled);
                    break;
                }
                Ok(_) => {
                    warn!(command_id, "heartbeat rejected, lease lost");
                    let _ = lease_tx.send(LeaseSignal::Lost);
                    break;
                }
                Err(e) => {
                    // Transport hiccups are retried on the next tick; the
                    // lease is long relative to the heartbeat interval.
                    debug!(command_id, "heartbeat transport error: {e}");
                }
            }
        }
    })
}

async fn resolve_credentials(
    shared: &Arc<WorkerShared>,
    tool_spec: &Value,
) -> Result<Value, ToolError> {
    let mut resolved = Map::new();

    let mut names: Vec<String> = Vec::new();
    if let Some(spec) = tool_spec.get("spec") {
        if let Some(name) = spec.get("auth").and_then(Value::as_str) {
            names.push(name.to_string());
        }
        if let Some(map) = spec.get("credentials").and_then(Value::as_object) {
            for value in map.values() {
                if let Some(name) = value.as_str() {
                    names.push(name.to_string());
                }
            }
        }
    }

    for name in names {
        let data = match shared.credentials.get(&name) {
            Some(cached) => cached,
            None => {
                let fetched = shared
                    .client
                    .fetch_credential(&name)
                    .await
                    .map_err(|e| match e {
                        ClientError::Transport(m) => ToolError::transport(m),
                        ClientError::Rejected { message, .. } => ToolError::tool(format!(
                            "credential '{name}' unavailable: {message}"
                        )),
                    })?;
                let data = fetched.get("data").cloned().unwrap_or(Value::Null);
                shared.credentials.put(name.clone(), data.clone());
                data
            }
        };
        resolved.insert(name, data);
    }

    Ok(Value::Object(resolved))
}

async fn report_success(
    shared: &Arc<WorkerShared>,
    command: &ClaimedCommand,
    worker_id: &str,
    is_sink: bool,
    result: Value,
) {
    // A sub-playbook result names its child execution; the linkage rides
    // on the terminal event's meta, exactly once per child.
    let child_meta = result
        .get("child_execution_id")
        .and_then(Value::as_str)
        .map(|id| json!({ "child_execution_id": id }));

    if is_sink {
        let event = command_event(command, worker_id, EventType::SinkExecuted, Status::Completed)
            .with_result(result);
        if let Err(e) = shared.client.post_event(&event).await {
            warn!("sink.executed report failed: {e}");
        }
    } else {
        let completed = command_event(
            command,
            worker_id,
            EventType::ActionCompleted,
            Status::Completed,
        )
        .with_result(result.clone());
        if let Err(e) = shared.client.post_event(&completed).await {
            warn!("action.completed report failed: {e}");
        }

        let mut exit = command_event(command, worker_id, EventType::StepExit, Status::Completed)
            .with_result(result);
        if let Some(meta) = child_meta {
            exit = exit.with_meta(meta);
        }
        if let Err(e) = shared.client.post_event(&exit).await {
            warn!("step.exit report failed: {e}");
        }
    }

    match shared.client.complete(command, worker_id).await {
        Ok(()) => {}
        Err(ClientError::Rejected { status: 409, .. }) => {
            // Lease moved on; the server already deduplicates our events.
            warn!(command_id = command.command_id, "completion rejected, lease lost");
        }
        Err(e) => warn!("queue completion failed: {e}"),
    }
}

async fn report_failure(
    shared: &Arc<WorkerShared>,
    command: &ClaimedCommand,
    worker_id: &str,
    is_sink: bool,
    error: ToolError,
) {
    let event_type = if is_sink {
        EventType::SinkFailed
    } else {
        EventType::ActionError
    };
    let event = command_event(command, worker_id, event_type, Status::Failed)
        .with_error(EventError::new(error.kind.as_str(), error.message.clone()));
    if let Err(e) = shared.client.post_event(&event).await {
        warn!("error report failed: {e}");
    }

    if let Err(e) = shared
        .client
        .fail(command, worker_id, &error.to_string())
        .await
    {
        warn!("queue failure report failed: {e}");
    }
}
