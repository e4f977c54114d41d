//! Workflow orchestration.
//!
//! [`Orchestrator::evaluate`] inspects the event log of one execution and
//! decides what happens next: which commands to issue, which derived
//! events to append, and whether the workflow is finished. It holds no
//! mutable state of its own; everything it needs is refolded from the
//! events, so any scheduler instance can pick up an execution after a
//! crash.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use noetl_core::event::{loop_node_id, sink_node_id, EventError};
use noetl_core::{Event, EventType, Playbook, Status, Step, START_STEP};
use noetl_template::{gate_refs, Renderer, TemplateError};

use super::projection::Projection;

/// Orchestration failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// A derived event the scheduler should append. The scheduler stamps
/// `event_id`, `execution_id`, and the timestamp.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: EventType,
    pub node_id: String,
    pub status: Status,
    pub context: Option<Value>,
    pub result: Option<Value>,
    pub meta: Option<Value>,
    pub error: Option<EventError>,
    pub loop_id: Option<String>,
    pub current_index: Option<i64>,
    pub attempt: Option<i32>,
}

impl EventDraft {
    pub fn new(event_type: EventType, node_id: impl Into<String>, status: Status) -> Self {
        Self {
            event_type,
            node_id: node_id.into(),
            status,
            context: None,
            result: None,
            meta: None,
            error: None,
            loop_id: None,
            current_index: None,
            attempt: None,
        }
    }
}

/// A command the scheduler should enqueue (plus its `command.issued`
/// event). `payload` is what the worker receives:
/// `{"tool": {...}, "render_context": {...}}`.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub node_id: String,
    pub action: String,
    pub payload: Value,
    pub pool: String,
    pub priority: i32,
    pub step_attempt: i32,
    pub timeout_ms: Option<i64>,
    /// Backoff before the command becomes claimable.
    pub delay: Duration,
    pub meta: Option<Value>,
    pub loop_id: Option<String>,
    pub current_index: Option<i64>,
}

/// Terminal outcome of the workflow.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: Status,
    pub error: Option<String>,
    pub failed_steps: Vec<String>,
}

/// A call whose gate evaluated false, indexed by the step ids its gate
/// reads so qualifying terminal events re-evaluate it.
#[derive(Debug, Clone)]
pub struct ParkedCall {
    pub step: String,
    pub refs: HashSet<String>,
}

/// Result of one evaluation pass.
#[derive(Debug, Default)]
pub struct EvalOutcome {
    pub commands: Vec<CommandRequest>,
    pub events: Vec<EventDraft>,
    pub completion: Option<Completion>,
    pub parked: Vec<ParkedCall>,
}

impl Default for Completion {
    fn default() -> Self {
        Self {
            status: Status::Completed,
            error: None,
            failed_steps: vec![],
        }
    }
}

/// The orchestrator. Shared per scheduler instance.
pub struct Orchestrator {
    renderer: Renderer,
    default_pool: String,
}

impl Orchestrator {
    pub fn new(default_pool: impl Into<String>) -> Self {
        Self {
            renderer: Renderer::new(),
            default_pool: default_pool.into(),
        }
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// Evaluate an execution and decide the next actions.
    ///
    /// Called after every actionable ingested event and on scheduler
    /// ticks. Re-entrant: issuing decisions are deduplicated against the
    /// event log, so evaluating twice in a row is harmless.
    pub fn evaluate(
        &self,
        playbook: &Playbook,
        events: &[Event],
    ) -> Result<EvalOutcome, EngineError> {
        let proj = Projection::fold(playbook, events, &self.renderer);
        let mut out = EvalOutcome::default();

        if proj.playbook_completed {
            return Ok(out);
        }

        if proj.cancelled {
            if !proj.has_inflight_work() {
                out.completion = Some(Completion {
                    status: Status::Cancelled,
                    error: None,
                    failed_steps: vec![],
                });
            }
            return Ok(out);
        }

        if !proj.workflow_initialized {
            out.events.push(EventDraft::new(
                EventType::WorkflowInitialized,
                "workflow",
                Status::Initialized,
            ));
        }

        let context = proj.build_context(playbook);

        self.plan_retries(playbook, events, &proj, &mut out);
        self.plan_calls(playbook, &proj, &context, &mut out)?;
        self.continue_loops(playbook, &proj, &mut out)?;
        self.plan_sinks(playbook, &proj, &context, &mut out)?;

        if out.commands.is_empty() && out.events.is_empty() && !proj.has_inflight_work() {
            out.completion = self.check_completion(playbook, &proj);
        }

        Ok(out)
    }

    /// Issue fresh commands for steps whose latest attempt failed with a
    /// retryable error.
    fn plan_retries(
        &self,
        playbook: &Playbook,
        events: &[Event],
        proj: &Projection,
        out: &mut EvalOutcome,
    ) {
        for (node_id, entry) in &proj.steps {
            if entry.is_terminal() || entry.attempts == 0 {
                continue;
            }
            let Some(err_attempt) = entry.last_error_attempt else {
                continue;
            };
            if err_attempt != entry.attempts {
                continue;
            }

            let Some(step) = playbook.get_step(noetl_core::event::base_node_name(node_id)) else {
                continue;
            };
            let Some(retry) = step.tool.as_ref().and_then(|t| t.retry.as_ref()) else {
                continue;
            };

            // The fold left the step in flight, so this error is
            // retryable and attempts remain.
            let next_attempt = entry.attempts + 1;
            let Some(prev) = last_issued_payload(events, node_id) else {
                continue;
            };

            let payload = if retry.rebind {
                rebind_payload(&self.renderer, playbook, proj, node_id, &prev)
                    .unwrap_or_else(|e| {
                        warn!(%node_id, "rebind failed, reusing frozen context: {e}");
                        prev.clone()
                    })
            } else {
                prev.clone()
            };

            let jitter = if retry.jitter_ms > 0 {
                rand::thread_rng().gen_range(0..=retry.jitter_ms)
            } else {
                0
            };

            debug!(%node_id, next_attempt, "scheduling retry");
            out.commands.push(CommandRequest {
                node_id: node_id.clone(),
                action: step
                    .tool
                    .as_ref()
                    .map(|t| t.kind.clone())
                    .unwrap_or_else(|| "noop".to_string()),
                payload,
                pool: self.pool_for(step),
                priority: 0,
                step_attempt: next_attempt,
                timeout_ms: step.tool.as_ref().and_then(|t| t.timeout_ms).map(|t| t as i64),
                delay: Duration::from_millis(retry.backoff_ms + jitter),
                meta: None,
                loop_id: proj
                    .loops
                    .iter()
                    .find(|(name, _)| node_id.starts_with(&format!("{name}[")))
                    .map(|(_, f)| f.loop_id.clone()),
                current_index: noetl_core::event::loop_index(node_id).map(|i| i as i64),
            });
        }
    }

    /// Route calls: the initial `start` call plus `next` edges out of
    /// every successfully completed step.
    fn plan_calls(
        &self,
        playbook: &Playbook,
        proj: &Projection,
        context: &Value,
        out: &mut EvalOutcome,
    ) -> Result<(), EngineError> {
        let mut calls: Vec<String> = Vec::new();

        if !proj.steps.contains_key(START_STEP) && !proj.loops.contains_key(START_STEP) {
            calls.push(START_STEP.to_string());
        }

        for completed in proj.completed_steps(playbook) {
            let step = playbook
                .get_step(&completed)
                .ok_or_else(|| EngineError::UnknownStep(completed.clone()))?;
            let Some(edges) = &step.next else { continue };

            // Edges evaluate in order; the first match routes. A matched
            // edge may fan out to several targets.
            for edge in edges {
                let matched = match &edge.when {
                    Some(expr) => self.renderer.eval_bool(expr, context).unwrap_or_else(|e| {
                        warn!(step = %completed, "edge condition failed: {e}");
                        false
                    }),
                    None => true,
                };
                if matched {
                    for target in edge.step.targets() {
                        calls.push(target.to_string());
                    }
                    break;
                }
            }
        }

        let mut seen = HashSet::new();
        for target in calls {
            if !seen.insert(target.clone()) {
                continue;
            }
            // Completed (or otherwise terminal) steps ignore further
            // calls; in-flight steps are not re-entered.
            if proj.is_step_terminal(&target)
                || proj.steps.contains_key(&target)
                || proj.loops.contains_key(&target)
            {
                continue;
            }

            let step = playbook
                .get_step(&target)
                .ok_or_else(|| EngineError::UnknownStep(target.clone()))?;

            let gate_open = self
                .renderer
                .eval_bool(step.when_expr(), context)
                .unwrap_or_else(|e| {
                    warn!(step = %target, "gate evaluation failed, parking: {e}");
                    false
                });

            if !gate_open {
                out.parked.push(ParkedCall {
                    step: target,
                    refs: gate_refs(step.when_expr()),
                });
                continue;
            }

            self.fire_step(playbook, step, proj, context, out)?;
        }

        Ok(())
    }

    /// Issue the command(s) for a step whose gate is open.
    fn fire_step(
        &self,
        _playbook: &Playbook,
        step: &Step,
        _proj: &Projection,
        context: &Value,
        out: &mut EvalOutcome,
    ) -> Result<(), EngineError> {
        // Apply bind: later entries may reference earlier ones.
        let mut bind_rendered = Map::new();
        if let Some(bind) = &step.bind {
            for (name, template) in bind {
                let layered = merge_context(context, &bind_rendered);
                match self.renderer.render_deep(template, &layered) {
                    Ok(v) => {
                        bind_rendered.insert(name.clone(), v);
                    }
                    Err(e) => {
                        self.plan_failure(step, &format!("bind '{name}': {e}"), out);
                        return Ok(());
                    }
                }
            }
        }
        let step_context = merge_context(context, &bind_rendered);
        let bind_meta = (!bind_rendered.is_empty())
            .then(|| json!({ "bind": Value::Object(bind_rendered.clone()) }));

        if let Some(loop_spec) = &step.loop_spec {
            let items = match self.renderer.eval_sequence(&loop_spec.in_expr, &step_context) {
                Ok(items) => items,
                Err(e) => {
                    self.plan_failure(step, &format!("loop iterator: {e}"), out);
                    return Ok(());
                }
            };
            let total = items.len();

            if total == 0 {
                let mut draft =
                    EventDraft::new(EventType::LoopCompleted, &step.step, Status::Completed);
                draft.result = Some(json!({"data": {"count": 0, "results": []}}));
                draft.loop_id = Some(step.step.clone());
                out.events.push(draft);
                return Ok(());
            }

            let parallelism = loop_spec
                .parallelism
                .map(|p| p as usize)
                .unwrap_or(total)
                .max(1);

            for (index, element) in items.iter().enumerate() {
                let node_id = loop_node_id(&step.step, index);
                let mut iteration =
                    EventDraft::new(EventType::LoopIteration, &node_id, Status::Pending);
                iteration.context = Some(json!({ "element": element }));
                iteration.loop_id = Some(step.step.clone());
                iteration.current_index = Some(index as i64);
                let mut meta = json!({ "total": total });
                if let Some(bind) = &bind_meta {
                    meta["bind"] = bind["bind"].clone();
                }
                iteration.meta = Some(meta);
                out.events.push(iteration);

                if index < parallelism {
                    out.commands.push(self.iteration_command(
                        step,
                        &step_context,
                        index,
                        total,
                        element,
                    ));
                }
            }
            return Ok(());
        }

        out.commands.push(CommandRequest {
            node_id: step.step.clone(),
            action: tool_kind(step),
            payload: command_payload(step, &step_context),
            pool: self.pool_for(step),
            priority: 0,
            step_attempt: 1,
            timeout_ms: step.tool.as_ref().and_then(|t| t.timeout_ms).map(|t| t as i64),
            delay: Duration::ZERO,
            meta: bind_meta,
            loop_id: None,
            current_index: None,
        });
        Ok(())
    }

    fn iteration_command(
        &self,
        step: &Step,
        step_context: &Value,
        index: usize,
        total: usize,
        element: &Value,
    ) -> CommandRequest {
        let loop_spec = step.loop_spec.as_ref().expect("iteration of non-loop step");
        let mut scope = Map::new();
        scope.insert(loop_spec.iterator.clone(), element.clone());
        scope.insert("current_index".to_string(), json!(index));
        let iter_context = merge_context(step_context, &scope);

        CommandRequest {
            node_id: loop_node_id(&step.step, index),
            action: tool_kind(step),
            payload: command_payload(step, &iter_context),
            pool: self.pool_for(step),
            priority: 0,
            step_attempt: 1,
            timeout_ms: step.tool.as_ref().and_then(|t| t.timeout_ms).map(|t| t as i64),
            delay: Duration::ZERO,
            meta: Some(json!({ "total": total })),
            loop_id: Some(step.step.clone()),
            current_index: Some(index as i64),
        }
    }

    /// Planning-time failure (bind render, iterator evaluation). Recorded
    /// as a non-retryable `action.error` so the fold settles the step.
    fn plan_failure(&self, step: &Step, message: &str, out: &mut EvalOutcome) {
        warn!(step = %step.step, "planning failure: {message}");
        let mut draft = EventDraft::new(EventType::ActionError, &step.step, Status::Failed);
        draft.error = Some(EventError::new("validation", message));
        draft.attempt = Some(1);
        out.events.push(draft);
    }

    /// Keep open loops moving: issue deferred iterations within the
    /// parallelism cap and close frames once every index is terminal.
    fn continue_loops(
        &self,
        playbook: &Playbook,
        proj: &Projection,
        out: &mut EvalOutcome,
    ) -> Result<(), EngineError> {
        for (name, frame) in &proj.loops {
            if frame.closed || frame.total == 0 {
                continue;
            }
            let Some(step) = playbook.get_step(name) else {
                continue;
            };

            if frame.all_terminal() {
                let failed = frame.failed_count();
                let status = if failed > 0 {
                    Status::Failed
                } else {
                    Status::Completed
                };
                let mut draft = EventDraft::new(EventType::LoopCompleted, name, status);
                draft.result = Some(json!({
                    "data": {
                        "count": frame.total,
                        "results": frame.ordered_results(),
                    }
                }));
                draft.loop_id = Some(frame.loop_id.clone());
                if failed > 0 {
                    draft.error = Some(EventError::new(
                        "tool",
                        format!("{failed} of {} iterations failed", frame.total),
                    ));
                }
                out.events.push(draft);
                continue;
            }

            let parallelism = step
                .loop_spec
                .as_ref()
                .and_then(|l| l.parallelism)
                .map(|p| p as usize)
                .unwrap_or(frame.total)
                .max(1);

            let outstanding = (0..frame.total as i64)
                .filter(|i| {
                    let node = loop_node_id(name, *i as usize);
                    proj.steps
                        .get(&node)
                        .map(|e| !e.is_terminal())
                        .unwrap_or(false)
                })
                .count();

            if outstanding >= parallelism {
                continue;
            }

            let mut slots = parallelism - outstanding;
            let context = proj.build_context(playbook);
            for index in 0..frame.total as i64 {
                if slots == 0 {
                    break;
                }
                let node = loop_node_id(name, index as usize);
                if proj.steps.contains_key(&node) {
                    continue;
                }
                let Some(element) = frame.elements.get(&index) else {
                    continue;
                };
                out.commands.push(self.iteration_command(
                    step,
                    &context,
                    index as usize,
                    frame.total,
                    element,
                ));
                slots -= 1;
            }
        }
        Ok(())
    }

    /// Issue sink commands for completed steps that declare sinks.
    fn plan_sinks(
        &self,
        playbook: &Playbook,
        proj: &Projection,
        context: &Value,
        out: &mut EvalOutcome,
    ) -> Result<(), EngineError> {
        for step in &playbook.workflow {
            if !proj.is_step_completed(&step.step) {
                continue;
            }
            let Some(sinks) = step
                .tool
                .as_ref()
                .and_then(|t| t.result.as_ref())
                .and_then(|r| r.sink.as_ref())
            else {
                continue;
            };

            let raw = proj
                .steps
                .get(&step.step)
                .and_then(|e| e.result.clone())
                .unwrap_or(Value::Null);
            let pick = step
                .tool
                .as_ref()
                .and_then(|t| t.result.as_ref())
                .and_then(|r| r.pick.as_ref());
            let value = match pick {
                Some(expr) => self
                    .renderer
                    .eval_expr(expr, &json!({ "raw": raw.clone() }))
                    .unwrap_or(raw),
                None => raw,
            };

            for (index, sink) in sinks.iter().enumerate() {
                let node_id = sink_node_id(&step.step, index);
                if proj.sinks.contains_key(&node_id) {
                    continue;
                }

                let mut scope = Map::new();
                scope.insert("out".to_string(), value.clone());
                let sink_context = merge_context(context, &scope);

                out.commands.push(CommandRequest {
                    node_id,
                    action: sink.kind.clone(),
                    payload: json!({
                        "tool": { "kind": sink.kind, "spec": sink.spec },
                        "render_context": sink_context,
                        "sink": true,
                    }),
                    pool: self.default_pool.clone(),
                    priority: 0,
                    step_attempt: 1,
                    timeout_ms: None,
                    delay: Duration::ZERO,
                    meta: Some(json!({ "sink": { "fail_parent": sink.fail_parent } })),
                    loop_id: None,
                    current_index: None,
                });
            }
        }
        Ok(())
    }

    /// Decide the workflow's terminal status once nothing is in flight.
    fn check_completion(&self, playbook: &Playbook, proj: &Projection) -> Option<Completion> {
        if !proj.workflow_initialized {
            return None;
        }

        let fatal_failures: Vec<String> = proj
            .failed_steps(playbook)
            .into_iter()
            .filter(|name| {
                !playbook
                    .get_step(name)
                    .and_then(|s| s.tool.as_ref())
                    .map(|t| t.continue_on_error)
                    .unwrap_or(false)
            })
            .collect();

        if !fatal_failures.is_empty() {
            return Some(Completion {
                status: Status::Failed,
                error: Some(format!("failed steps: {}", fatal_failures.join(", "))),
                failed_steps: fatal_failures,
            });
        }

        if proj.fatal_sink_failure() {
            return Some(Completion {
                status: Status::Failed,
                error: Some("sink failure with fail_parent".to_string()),
                failed_steps: vec![],
            });
        }

        // Nothing pending, nothing running, no open loop: done. Parked
        // gates can no longer change once nothing is in flight.
        Some(Completion::default())
    }

    fn pool_for(&self, step: &Step) -> String {
        step.tool
            .as_ref()
            .and_then(|t| t.spec.get("pool"))
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| self.default_pool.clone())
    }
}

fn tool_kind(step: &Step) -> String {
    step.tool
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_else(|| "noop".to_string())
}

/// The payload stored on the queue row and `command.issued` event.
fn command_payload(step: &Step, render_context: &Value) -> Value {
    let tool = step
        .tool
        .as_ref()
        .map(|t| {
            json!({
                "kind": t.kind,
                "spec": t.spec,
                "args": t.args,
                "timeout_ms": t.timeout_ms,
            })
        })
        .unwrap_or_else(|| json!({ "kind": "noop", "spec": {} }));

    json!({
        "tool": tool,
        "render_context": render_context,
    })
}

fn merge_context(base: &Value, overlay: &Map<String, Value>) -> Value {
    let mut merged = base.as_object().cloned().unwrap_or_default();
    for (k, v) in overlay {
        if k != noetl_core::STEP_NAMESPACE {
            merged.insert(k.clone(), v.clone());
        }
    }
    Value::Object(merged)
}

/// Payload of the most recent `command.issued` for a node, used to keep
/// retries rendering against frozen inputs.
fn last_issued_payload(events: &[Event], node_id: &str) -> Option<Value> {
    events
        .iter()
        .rev()
        .find(|e| e.event_type == EventType::CommandIssued && e.node_id == node_id)
        .and_then(|e| e.context.clone())
}

/// Re-render bind expressions for a retry that opted into `rebind`.
fn rebind_payload(
    renderer: &Renderer,
    playbook: &Playbook,
    proj: &Projection,
    node_id: &str,
    prev: &Value,
) -> Result<Value, TemplateError> {
    let base = noetl_core::event::base_node_name(node_id);
    let Some(step) = playbook.get_step(base) else {
        return Ok(prev.clone());
    };
    let Some(bind) = &step.bind else {
        return Ok(prev.clone());
    };

    let context = proj.build_context(playbook);
    let mut bind_rendered = Map::new();
    for (name, template) in bind {
        let layered = merge_context(&context, &bind_rendered);
        let value = renderer.render_deep(template, &layered)?;
        bind_rendered.insert(name.clone(), value);
    }

    let mut payload = prev.clone();
    if let Some(render_context) = payload.get_mut("render_context") {
        if let Some(obj) = render_context.as_object_mut() {
            for (k, v) in bind_rendered {
                obj.insert(k, v);
            }
        }
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_playbook() -> Playbook {
        Playbook::from_yaml(
            r#"
workflow:
  - step: start
    next:
      - step: test_step
  - step: test_step
    tool:
      kind: http
      spec: {url: "https://example.com"}
    next:
      - step: end
  - step: end
    next:
      - step: end_sink
  - step: end_sink
"#,
        )
        .unwrap()
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new("cpu")
    }

    fn init_events() -> Vec<Event> {
        vec![Event::new(
            1,
            900,
            EventType::PlaybookInitialized,
            "playbook",
            Status::Initialized,
        )
        .with_context(json!({"workload": {}, "path": "demo", "version": 1}))]
    }

    fn step_done(events: &mut Vec<Event>, id_base: i64, node: &str) {
        events.push(
            Event::new(id_base, 900, EventType::CommandIssued, node, Status::Pending)
                .with_attempt(1),
        );
        events.push(
            Event::new(id_base + 1, 900, EventType::StepEnter, node, Status::Started)
                .with_attempt(1),
        );
        events.push(
            Event::new(id_base + 2, 900, EventType::StepExit, node, Status::Completed)
                .with_result(json!({"ok": true}))
                .with_attempt(1),
        );
    }

    #[test]
    fn test_initial_evaluation_fires_start() {
        let orch = orchestrator();
        let out = orch.evaluate(&hello_playbook(), &init_events()).unwrap();

        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].event_type, EventType::WorkflowInitialized);
        assert_eq!(out.commands.len(), 1);
        assert_eq!(out.commands[0].node_id, "start");
        assert_eq!(out.commands[0].action, "noop");
        assert_eq!(out.commands[0].step_attempt, 1);
    }

    #[test]
    fn test_evaluation_is_idempotent_while_inflight() {
        let orch = orchestrator();
        let mut events = init_events();
        events.push(Event::new(
            2,
            900,
            EventType::WorkflowInitialized,
            "workflow",
            Status::Initialized,
        ));
        events.push(
            Event::new(3, 900, EventType::CommandIssued, "start", Status::Pending)
                .with_attempt(1),
        );

        let out = orch.evaluate(&hello_playbook(), &events).unwrap();
        assert!(out.commands.is_empty(), "no duplicate issuance");
        assert!(out.completion.is_none());
    }

    #[test]
    fn test_routing_after_completion() {
        let orch = orchestrator();
        let mut events = init_events();
        events.push(Event::new(
            2,
            900,
            EventType::WorkflowInitialized,
            "workflow",
            Status::Initialized,
        ));
        step_done(&mut events, 3, "start");

        let out = orch.evaluate(&hello_playbook(), &events).unwrap();
        assert_eq!(out.commands.len(), 1);
        assert_eq!(out.commands[0].node_id, "test_step");
        assert_eq!(out.commands[0].action, "http");
    }

    #[test]
    fn test_workflow_completion() {
        let orch = orchestrator();
        let mut events = init_events();
        events.push(Event::new(
            2,
            900,
            EventType::WorkflowInitialized,
            "workflow",
            Status::Initialized,
        ));
        step_done(&mut events, 10, "start");
        step_done(&mut events, 20, "test_step");
        step_done(&mut events, 30, "end");
        step_done(&mut events, 40, "end_sink");

        let out = orch.evaluate(&hello_playbook(), &events).unwrap();
        assert!(out.commands.is_empty());
        let completion = out.completion.expect("workflow should complete");
        assert_eq!(completion.status, Status::Completed);
    }

    #[test]
    fn test_gated_step_parks_until_dependency_done() {
        let playbook = Playbook::from_yaml(
            r#"
workflow:
  - step: start
    next:
      - step: [fetch_user, score_user]
  - step: fetch_user
    tool: {kind: http, spec: {url: "https://u"}}
    next:
      - step: join
  - step: score_user
    tool: {kind: http, spec: {url: "https://s"}}
    next:
      - step: join
  - step: join
    when: "{{ done('fetch_user') and ok('score_user') }}"
"#,
        )
        .unwrap();
        let orch = orchestrator();

        let mut events = init_events();
        events.push(Event::new(
            2,
            900,
            EventType::WorkflowInitialized,
            "workflow",
            Status::Initialized,
        ));
        step_done(&mut events, 10, "start");
        // fetch_user finishes quickly; score_user still running.
        step_done(&mut events, 20, "fetch_user");
        events.push(
            Event::new(30, 900, EventType::CommandIssued, "score_user", Status::Pending)
                .with_attempt(1),
        );
        events.push(
            Event::new(31, 900, EventType::StepEnter, "score_user", Status::Started)
                .with_attempt(1),
        );

        let out = orch.evaluate(&playbook, &events).unwrap();
        assert!(
            out.commands.is_empty(),
            "join must not fire before score_user completes"
        );
        assert_eq!(out.parked.len(), 1);
        assert_eq!(out.parked[0].step, "join");
        assert!(out.parked[0].refs.contains("score_user"));

        // score_user completes: the parked call re-evaluates and fires.
        step_done(&mut events, 40, "score_user");
        let out = orch.evaluate(&playbook, &events).unwrap();
        assert_eq!(out.commands.len(), 1);
        assert_eq!(out.commands[0].node_id, "join");
        assert!(out.parked.is_empty());
    }

    #[test]
    fn test_first_matching_edge_routes() {
        let playbook = Playbook::from_yaml(
            r#"
workload:
  value: 10
workflow:
  - step: start
    tool: {kind: noop, spec: {}}
    next:
      - step: high
        when: "{{ workload.value > 5 }}"
      - step: low
  - step: high
  - step: low
"#,
        )
        .unwrap();
        let orch = orchestrator();
        let mut events = vec![Event::new(
            1,
            900,
            EventType::PlaybookInitialized,
            "playbook",
            Status::Initialized,
        )
        .with_context(json!({"workload": {"value": 10}, "path": "demo", "version": 1}))];
        events.push(Event::new(
            2,
            900,
            EventType::WorkflowInitialized,
            "workflow",
            Status::Initialized,
        ));
        step_done(&mut events, 10, "start");

        let out = orch.evaluate(&playbook, &events).unwrap();
        let targets: Vec<&str> = out.commands.iter().map(|c| c.node_id.as_str()).collect();
        assert_eq!(targets, vec!["high"]);
    }

    #[test]
    fn test_loop_fan_out_and_close() {
        let playbook = Playbook::from_yaml(
            r#"
workload:
  cities: ["SFO", "JFK", "LAX"]
workflow:
  - step: start
    next:
      - step: city_loop
  - step: city_loop
    loop:
      in: "{{ workload.cities }}"
      as: city
      collect:
        into: city_results
    tool:
      kind: playbook
      spec: {path: "examples/weather"}
"#,
        )
        .unwrap();
        let orch = orchestrator();
        let mut events = vec![Event::new(
            1,
            900,
            EventType::PlaybookInitialized,
            "playbook",
            Status::Initialized,
        )
        .with_context(
            json!({"workload": {"cities": ["SFO", "JFK", "LAX"]}, "path": "demo", "version": 1}),
        )];
        events.push(Event::new(
            2,
            900,
            EventType::WorkflowInitialized,
            "workflow",
            Status::Initialized,
        ));
        step_done(&mut events, 10, "start");

        let out = orch.evaluate(&playbook, &events).unwrap();
        let iterations: Vec<&EventDraft> = out
            .events
            .iter()
            .filter(|e| e.event_type == EventType::LoopIteration)
            .collect();
        assert_eq!(iterations.len(), 3);
        assert_eq!(out.commands.len(), 3);
        assert_eq!(out.commands[0].node_id, "city_loop[0]");
        assert_eq!(
            out.commands[1].payload["render_context"]["city"],
            json!("JFK")
        );

        // Simulate iterations completing out of order, then expect close.
        for (event_id, (index, city)) in
            [(1i64, "JFK"), (0, "SFO"), (2, "LAX")].iter().enumerate()
        {
            let node = loop_node_id("city_loop", *index as usize);
            let mut iter_evt = Event::new(
                20 + event_id as i64,
                900,
                EventType::LoopIteration,
                &node,
                Status::Pending,
            )
            .with_loop("city_loop", *index)
            .with_meta(json!({"total": 3}));
            iter_evt.context = Some(json!({"element": city}));
            events.push(iter_evt);
        }
        for (offset, (index, city)) in
            [(1i64, "JFK"), (0, "SFO"), (2, "LAX")].iter().enumerate()
        {
            events.push(
                Event::new(
                    30 + offset as i64,
                    900,
                    EventType::StepExit,
                    &loop_node_id("city_loop", *index as usize),
                    Status::Completed,
                )
                .with_result(json!({"city": city}))
                .with_loop("city_loop", *index),
            );
        }

        let out = orch.evaluate(&playbook, &events).unwrap();
        let close: Vec<&EventDraft> = out
            .events
            .iter()
            .filter(|e| e.event_type == EventType::LoopCompleted)
            .collect();
        assert_eq!(close.len(), 1);
        let data = &close[0].result.as_ref().unwrap()["data"];
        assert_eq!(data["count"], 3);
        // Results in original element order despite completion order.
        assert_eq!(
            data["results"],
            json!([{"city": "SFO"}, {"city": "JFK"}, {"city": "LAX"}])
        );
    }

    #[test]
    fn test_loop_parallelism_caps_outstanding_commands() {
        let playbook = Playbook::from_yaml(
            r#"
workload:
  cities: ["A", "B", "C"]
workflow:
  - step: start
    next:
      - step: city_loop
  - step: city_loop
    loop:
      in: "{{ workload.cities }}"
      as: city
      parallelism: 1
    tool: {kind: noop, spec: {}}
"#,
        )
        .unwrap();
        let orch = orchestrator();
        let mut events = vec![Event::new(
            1,
            900,
            EventType::PlaybookInitialized,
            "playbook",
            Status::Initialized,
        )
        .with_context(json!({"workload": {"cities": ["A","B","C"]}, "path": "p", "version": 1}))];
        events.push(Event::new(
            2,
            900,
            EventType::WorkflowInitialized,
            "workflow",
            Status::Initialized,
        ));
        step_done(&mut events, 10, "start");

        let out = orch.evaluate(&playbook, &events).unwrap();
        assert_eq!(out.commands.len(), 1, "parallelism 1 issues one iteration");

        // Persist the iteration plan and first command, then finish it.
        for draft in &out.events {
            if draft.event_type != EventType::LoopIteration {
                continue;
            }
            let mut e = Event::new(
                100 + draft.current_index.unwrap(),
                900,
                EventType::LoopIteration,
                &draft.node_id,
                Status::Pending,
            );
            e.context = draft.context.clone();
            e.meta = draft.meta.clone();
            e.loop_id = draft.loop_id.clone();
            e.current_index = draft.current_index;
            events.push(e);
        }
        events.push(
            Event::new(110, 900, EventType::CommandIssued, "city_loop[0]", Status::Pending)
                .with_attempt(1)
                .with_loop("city_loop", 0),
        );
        events.push(
            Event::new(111, 900, EventType::StepExit, "city_loop[0]", Status::Completed)
                .with_result(json!("done-A"))
                .with_loop("city_loop", 0),
        );

        let out = orch.evaluate(&playbook, &events).unwrap();
        assert_eq!(out.commands.len(), 1, "one slot freed, one new iteration");
        assert_eq!(out.commands[0].node_id, "city_loop[1]");
        assert_eq!(out.commands[0].payload["render_context"]["city"], json!("B"));
    }

    #[test]
    fn test_retry_after_transient_error() {
        let playbook = Playbook::from_yaml(
            r#"
workflow:
  - step: start
    next:
      - step: flaky
  - step: flaky
    tool:
      kind: http
      spec: {url: "https://x"}
      retry:
        max_attempts: 3
        backoff_ms: 100
        on: [transport]
"#,
        )
        .unwrap();
        let orch = orchestrator();
        let mut events = init_events();
        events.push(Event::new(
            2,
            900,
            EventType::WorkflowInitialized,
            "workflow",
            Status::Initialized,
        ));
        step_done(&mut events, 10, "start");
        events.push(
            Event::new(20, 900, EventType::CommandIssued, "flaky", Status::Pending)
                .with_attempt(1)
                .with_context(json!({"tool": {"kind": "http", "spec": {"url": "https://x"}}, "render_context": {}})),
        );
        let mut err =
            Event::new(21, 900, EventType::ActionError, "flaky", Status::Failed).with_attempt(1);
        err.error = Some(EventError::new("transport", "reset"));
        events.push(err);

        let out = orch.evaluate(&playbook, &events).unwrap();
        assert_eq!(out.commands.len(), 1);
        let cmd = &out.commands[0];
        assert_eq!(cmd.node_id, "flaky");
        assert_eq!(cmd.step_attempt, 2);
        assert!(cmd.delay >= Duration::from_millis(100));
    }

    #[test]
    fn test_failed_step_fails_workflow() {
        let playbook = Playbook::from_yaml(
            r#"
workflow:
  - step: start
    next:
      - step: broken
  - step: broken
    tool: {kind: http, spec: {url: "https://x"}}
"#,
        )
        .unwrap();
        let orch = orchestrator();
        let mut events = init_events();
        events.push(Event::new(
            2,
            900,
            EventType::WorkflowInitialized,
            "workflow",
            Status::Initialized,
        ));
        step_done(&mut events, 10, "start");
        events.push(
            Event::new(20, 900, EventType::CommandIssued, "broken", Status::Pending)
                .with_attempt(1),
        );
        let mut err =
            Event::new(21, 900, EventType::ActionError, "broken", Status::Failed).with_attempt(1);
        err.error = Some(EventError::new("tool", "boom"));
        events.push(err);

        let out = orch.evaluate(&playbook, &events).unwrap();
        let completion = out.completion.expect("workflow should fail");
        assert_eq!(completion.status, Status::Failed);
        assert_eq!(completion.failed_steps, vec!["broken".to_string()]);
    }

    #[test]
    fn test_continue_on_error_completes_workflow() {
        let playbook = Playbook::from_yaml(
            r#"
workflow:
  - step: start
    next:
      - step: broken
  - step: broken
    tool:
      kind: http
      spec: {url: "https://x"}
      continue_on_error: true
"#,
        )
        .unwrap();
        let orch = orchestrator();
        let mut events = init_events();
        events.push(Event::new(
            2,
            900,
            EventType::WorkflowInitialized,
            "workflow",
            Status::Initialized,
        ));
        step_done(&mut events, 10, "start");
        events.push(
            Event::new(20, 900, EventType::CommandIssued, "broken", Status::Pending)
                .with_attempt(1),
        );
        let mut err =
            Event::new(21, 900, EventType::ActionError, "broken", Status::Failed).with_attempt(1);
        err.error = Some(EventError::new("tool", "boom"));
        events.push(err);

        let out = orch.evaluate(&playbook, &events).unwrap();
        let completion = out.completion.expect("workflow should complete");
        assert_eq!(completion.status, Status::Completed);
    }

    #[test]
    fn test_cancellation_stops_issuance() {
        let orch = orchestrator();
        let mut events = init_events();
        events.push(Event::new(
            2,
            900,
            EventType::WorkflowInitialized,
            "workflow",
            Status::Initialized,
        ));
        step_done(&mut events, 10, "start");
        events.push(Event::new(
            20,
            900,
            EventType::ExecutionCancelled,
            "playbook",
            Status::Cancelled,
        ));

        let out = orch.evaluate(&hello_playbook(), &events).unwrap();
        assert!(out.commands.is_empty(), "no issuance after cancellation");
        let completion = out.completion.expect("quiet execution finalizes");
        assert_eq!(completion.status, Status::Cancelled);
    }

    #[test]
    fn test_cancellation_waits_for_inflight_step() {
        let orch = orchestrator();
        let mut events = init_events();
        events.push(Event::new(
            2,
            900,
            EventType::WorkflowInitialized,
            "workflow",
            Status::Initialized,
        ));
        step_done(&mut events, 10, "start");
        events.push(
            Event::new(20, 900, EventType::CommandIssued, "test_step", Status::Pending)
                .with_attempt(1),
        );
        events.push(
            Event::new(21, 900, EventType::StepEnter, "test_step", Status::Started)
                .with_attempt(1),
        );
        events.push(Event::new(
            22,
            900,
            EventType::ExecutionCancelled,
            "playbook",
            Status::Cancelled,
        ));

        let out = orch.evaluate(&hello_playbook(), &events).unwrap();
        assert!(out.commands.is_empty());
        assert!(out.completion.is_none(), "waits for the in-flight step");

        // The in-flight step reports CANCELLED; now the run finalizes.
        events.push(
            Event::new(23, 900, EventType::StepExit, "test_step", Status::Cancelled)
                .with_attempt(1),
        );
        let out = orch.evaluate(&hello_playbook(), &events).unwrap();
        assert_eq!(out.completion.unwrap().status, Status::Cancelled);
    }

    #[test]
    fn test_sink_issued_after_step_completion() {
        let playbook = Playbook::from_yaml(
            r#"
workflow:
  - step: start
    next:
      - step: fetch
  - step: fetch
    tool:
      kind: http
      spec: {url: "https://x"}
      result:
        pick: "raw.body"
        sink:
          - kind: postgres
            spec: {table: results}
"#,
        )
        .unwrap();
        let orch = orchestrator();
        let mut events = init_events();
        events.push(Event::new(
            2,
            900,
            EventType::WorkflowInitialized,
            "workflow",
            Status::Initialized,
        ));
        step_done(&mut events, 10, "start");
        events.push(
            Event::new(20, 900, EventType::CommandIssued, "fetch", Status::Pending)
                .with_attempt(1),
        );
        events.push(
            Event::new(21, 900, EventType::StepExit, "fetch", Status::Completed)
                .with_result(json!({"body": {"rows": 2}}))
                .with_attempt(1),
        );

        let out = orch.evaluate(&playbook, &events).unwrap();
        let sink_cmds: Vec<&CommandRequest> = out
            .commands
            .iter()
            .filter(|c| c.node_id.contains(":sink["))
            .collect();
        assert_eq!(sink_cmds.len(), 1);
        assert_eq!(sink_cmds[0].node_id, "fetch:sink[0]");
        assert_eq!(sink_cmds[0].action, "postgres");
        assert_eq!(
            sink_cmds[0].payload["render_context"]["out"],
            json!({"rows": 2})
        );
    }
}
