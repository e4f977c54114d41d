//! Execution state reconstruction from events.
//!
//! [`Projection::fold`] is a pure function of `(playbook, events)`: any
//! two instances replaying the same `event_id`-ordered sequence derive
//! identical per-step status and context. The scheduler never keeps
//! state the fold cannot rebuild.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::warn;

use noetl_core::event::{base_node_name, EventError};
use noetl_core::{Event, EventType, Playbook, Status, Step};
use noetl_template::{ContextBuilder, Renderer};

/// Projected state of one step instance (a declared step, one loop
/// iteration, or a sink command).
#[derive(Debug, Clone)]
pub struct StepProjection {
    pub node_id: String,
    pub status: Status,
    pub result: Option<Value>,
    pub error: Option<EventError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Highest step attempt a command was issued for (1-based).
    pub attempts: i32,
    /// Attempt number of the latest `action.error`, if any.
    pub last_error_attempt: Option<i32>,
    pub last_error_kind: Option<String>,
}

impl StepProjection {
    fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: Status::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
            attempts: 0,
            last_error_attempt: None,
            last_error_kind: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Scheduler-side bookkeeping for one iterating step.
#[derive(Debug, Clone, Default)]
pub struct LoopFrame {
    pub loop_id: String,
    pub total: usize,
    /// Iterator elements keyed by `current_index`, captured at loop entry
    /// so late-issued iterations see the same values.
    pub elements: BTreeMap<i64, Value>,
    /// Element results keyed by `current_index`.
    pub results: BTreeMap<i64, Value>,
    /// Terminal status per planned index; `None` while in flight.
    pub statuses: BTreeMap<i64, Option<Status>>,
    pub closed: bool,
}

impl LoopFrame {
    pub fn all_terminal(&self) -> bool {
        self.total > 0
            && self.statuses.len() == self.total
            && self.statuses.values().all(Option::is_some)
    }

    pub fn failed_count(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| matches!(s, Some(Status::Failed)))
            .count()
    }

    /// Element results in original element order.
    pub fn ordered_results(&self) -> Vec<Value> {
        (0..self.total as i64)
            .map(|i| self.results.get(&i).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// State of a sink command.
#[derive(Debug, Clone)]
pub struct SinkState {
    pub status: Option<Status>,
    pub fail_parent: bool,
}

/// Full projected execution state.
#[derive(Debug, Clone)]
pub struct Projection {
    pub execution_id: i64,
    pub path: String,
    pub version: i64,
    pub status: Status,
    pub workload: Option<Value>,
    pub parent_execution_id: Option<i64>,
    /// Step instances keyed by node id.
    pub steps: BTreeMap<String, StepProjection>,
    /// Loop frames keyed by declared step name.
    pub loops: BTreeMap<String, LoopFrame>,
    /// Sink commands keyed by node id.
    pub sinks: BTreeMap<String, SinkState>,
    /// Execution-scoped variables: bind writes, result `as` targets,
    /// loop aggregates.
    pub vars: Map<String, Value>,
    pub workflow_initialized: bool,
    pub workflow_completed: bool,
    pub playbook_completed: bool,
    pub cancelled: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Projection {
    fn new(execution_id: i64) -> Self {
        Self {
            execution_id,
            path: String::new(),
            version: 0,
            status: Status::Initialized,
            workload: None,
            parent_execution_id: None,
            steps: BTreeMap::new(),
            loops: BTreeMap::new(),
            sinks: BTreeMap::new(),
            vars: Map::new(),
            workflow_initialized: false,
            workflow_completed: false,
            playbook_completed: false,
            cancelled: false,
            cancelled_at: None,
        }
    }

    /// Fold an ordered event sequence into a projection.
    pub fn fold(playbook: &Playbook, events: &[Event], renderer: &Renderer) -> Self {
        let execution_id = events.first().map(|e| e.execution_id).unwrap_or(0);
        let mut proj = Self::new(execution_id);
        for event in events {
            proj.apply(playbook, event, renderer);
        }
        proj
    }

    fn entry(&mut self, node_id: &str) -> &mut StepProjection {
        self.steps
            .entry(node_id.to_string())
            .or_insert_with(|| StepProjection::new(node_id))
    }

    fn apply(&mut self, playbook: &Playbook, event: &Event, renderer: &Renderer) {
        match event.event_type {
            EventType::PlaybookInitialized => {
                self.status = Status::Initialized;
                self.parent_execution_id = event.parent_execution_id;
                if let Some(ctx) = &event.context {
                    if let Some(workload) = ctx.get("workload") {
                        self.workload = Some(workload.clone());
                    }
                    if let Some(path) = ctx.get("path").and_then(Value::as_str) {
                        self.path = path.to_string();
                    }
                    if let Some(version) = ctx.get("version").and_then(Value::as_i64) {
                        self.version = version;
                    }
                }
            }
            EventType::WorkflowInitialized => {
                self.workflow_initialized = true;
                self.status = Status::Running;
            }
            EventType::CommandIssued => {
                if event.node_id.contains(":sink[") {
                    let fail_parent = event
                        .meta
                        .as_ref()
                        .and_then(|m| m.get("sink"))
                        .and_then(|s| s.get("fail_parent"))
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    self.sinks.insert(
                        event.node_id.clone(),
                        SinkState {
                            status: None,
                            fail_parent,
                        },
                    );
                    return;
                }

                let attempt = event.attempt.unwrap_or(1);
                let entry = self.entry(&event.node_id);
                if !entry.is_terminal() {
                    entry.status = Status::Pending;
                }
                entry.attempts = entry.attempts.max(attempt);

                // Rendered bind values ride on the issuing event so the
                // fold can rebuild the context without re-rendering
                // non-deterministic helpers.
                if event.current_index.is_none() {
                    if let Some(bind) = event
                        .meta
                        .as_ref()
                        .and_then(|m| m.get("bind"))
                        .and_then(Value::as_object)
                    {
                        for (k, v) in bind {
                            self.vars.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
            EventType::CommandClaimed => {
                if event.node_id.contains(":sink[") {
                    return;
                }
                let entry = self.entry(&event.node_id);
                if !entry.is_terminal() {
                    entry.status = Status::Running;
                }
            }
            EventType::StepEnter => {
                let timestamp = event.timestamp;
                let entry = self.entry(&event.node_id);
                if !entry.is_terminal() {
                    entry.status = Status::Started;
                }
                entry.started_at.get_or_insert(timestamp);
            }
            EventType::ActionCompleted => {
                let result = event.result.clone();
                let entry = self.entry(&event.node_id);
                entry.result = result.clone();
                if let (Some(loop_id), Some(index)) = (&event.loop_id, event.current_index) {
                    let base = base_node_name(&event.node_id).to_string();
                    let frame = self.loops.entry(base).or_default();
                    if frame.loop_id.is_empty() {
                        frame.loop_id = loop_id.clone();
                    }
                    if let Some(r) = result {
                        frame.results.insert(index, r);
                    }
                }
            }
            EventType::StepExit => {
                let already_succeeded = self
                    .steps
                    .get(&event.node_id)
                    .map(|e| e.status == Status::Completed)
                    .unwrap_or(false);
                if already_succeeded {
                    // At most one successful exit per node; later calls
                    // are no-ops.
                    return;
                }

                let timestamp = event.timestamp;
                let status = event.status;
                let result = event.result.clone();
                let entry = self.entry(&event.node_id);
                entry.status = status;
                entry.finished_at = Some(timestamp);
                if let Some(r) = &result {
                    entry.result = Some(r.clone());
                }
                let final_result = entry.result.clone();

                if let Some(index) = event.current_index {
                    let base = base_node_name(&event.node_id).to_string();
                    let frame = self.loops.entry(base).or_default();
                    frame.statuses.insert(index, Some(status));
                    if status == Status::Completed {
                        if let Some(r) = &final_result {
                            frame.results.insert(index, r.clone());
                        }
                    }
                } else if status == Status::Completed {
                    self.apply_result_directives(
                        playbook,
                        &event.node_id,
                        final_result.unwrap_or(Value::Null),
                        renderer,
                    );
                }
            }
            EventType::ActionError => {
                let attempt = event.attempt.unwrap_or(1);
                let error = event.error.clone();
                let kind = error
                    .as_ref()
                    .map(|e| e.kind.clone())
                    .unwrap_or_else(|| "tool".to_string());

                // An error with no issued command is a planning failure;
                // those never retry.
                let ever_issued = self
                    .steps
                    .get(&event.node_id)
                    .map(|e| e.attempts > 0)
                    .unwrap_or(false);
                let retry = playbook
                    .get_step(base_node_name(&event.node_id))
                    .and_then(|s| s.tool.as_ref())
                    .and_then(|t| t.retry.as_ref());
                let will_retry = ever_issued
                    && retry
                        .map(|r| r.matches(&kind) && (attempt as u32) < r.max_attempts)
                        .unwrap_or(false);

                let timestamp = event.timestamp;
                let entry = self.entry(&event.node_id);
                entry.error = error;
                entry.last_error_attempt = Some(attempt);
                entry.last_error_kind = Some(kind);

                if !will_retry && !entry.is_terminal() {
                    entry.status = Status::Failed;
                    entry.finished_at = Some(timestamp);
                    if let Some(index) = event.current_index {
                        let base = base_node_name(&event.node_id).to_string();
                        self.loops
                            .entry(base)
                            .or_default()
                            .statuses
                            .insert(index, Some(Status::Failed));
                    }
                }
            }
            EventType::LoopIteration => {
                let base = base_node_name(&event.node_id).to_string();
                let frame = self.loops.entry(base).or_default();
                if let Some(loop_id) = &event.loop_id {
                    frame.loop_id = loop_id.clone();
                }
                if let Some(total) = event
                    .meta
                    .as_ref()
                    .and_then(|m| m.get("total"))
                    .and_then(Value::as_u64)
                {
                    frame.total = frame.total.max(total as usize);
                }
                if let Some(index) = event.current_index {
                    frame.statuses.entry(index).or_insert(None);
                    if let Some(element) =
                        event.context.as_ref().and_then(|c| c.get("element"))
                    {
                        frame.elements.insert(index, element.clone());
                    }
                }

                // Loop-step binds ride on the iteration events; the loop
                // step itself never gets a base command.
                if let Some(bind) = event
                    .meta
                    .as_ref()
                    .and_then(|m| m.get("bind"))
                    .and_then(Value::as_object)
                {
                    for (k, v) in bind {
                        self.vars.insert(k.clone(), v.clone());
                    }
                }
            }
            EventType::LoopCompleted => {
                let step_name = event.node_name.clone();
                let status = event.status;
                let result = event.result.clone();

                if let Some(frame) = self.loops.get_mut(&step_name) {
                    frame.closed = true;
                }

                let entry = self.entry(&step_name);
                entry.status = status;
                entry.finished_at = Some(event.timestamp);
                entry.result = result.clone();

                // Aggregate lands in context under collect.into, or the
                // step's own name when no collect was declared.
                let results = result
                    .as_ref()
                    .and_then(|r| r.get("data"))
                    .and_then(|d| d.get("results"))
                    .cloned()
                    .unwrap_or(Value::Array(vec![]));
                let key = playbook
                    .get_step(&step_name)
                    .and_then(|s| s.loop_spec.as_ref())
                    .and_then(|l| l.collect.as_ref())
                    .map(|c| c.into.clone())
                    .unwrap_or(step_name);
                self.vars.insert(key, results);
            }
            EventType::SinkExecuted => {
                if let Some(sink) = self.sinks.get_mut(&event.node_id) {
                    sink.status = Some(Status::Completed);
                }
            }
            EventType::SinkFailed => {
                if let Some(sink) = self.sinks.get_mut(&event.node_id) {
                    sink.status = Some(Status::Failed);
                }
            }
            EventType::ExecutionCancelled => {
                self.cancelled = true;
                self.cancelled_at = Some(event.timestamp);
                self.status = Status::Cancelled;
            }
            EventType::WorkflowCompleted => {
                self.workflow_completed = true;
            }
            EventType::PlaybookCompleted => {
                self.playbook_completed = true;
                self.status = event.status;
            }
            EventType::CommandCompleted | EventType::CommandFailed => {}
        }
    }

    fn apply_result_directives(
        &mut self,
        playbook: &Playbook,
        node_id: &str,
        raw: Value,
        renderer: &Renderer,
    ) {
        let Some(result_spec) = playbook
            .get_step(base_node_name(node_id))
            .and_then(|s| s.tool.as_ref())
            .and_then(|t| t.result.as_ref())
        else {
            return;
        };

        let out = match &result_spec.pick {
            Some(pick) => match renderer.eval_expr(pick, &json!({ "raw": raw.clone() })) {
                Ok(v) => v,
                Err(e) => {
                    warn!(node_id, "result pick failed: {e}");
                    raw
                }
            },
            None => raw,
        };

        if let Some(name) = &result_spec.name {
            self.vars.insert(name.clone(), out.clone());
        }
        if let Some(collect) = &result_spec.collect {
            let list = self
                .vars
                .entry(collect.into.clone())
                .or_insert_with(|| Value::Array(vec![]));
            if let Value::Array(items) = list {
                items.push(out);
            }
        }
    }

    // =====================================================================
    // Queries used by the orchestrator
    // =====================================================================

    /// Status of a declared step, accounting for loop closure.
    pub fn step_status(&self, name: &str) -> Option<Status> {
        self.steps.get(name).map(|e| e.status)
    }

    pub fn is_step_terminal(&self, name: &str) -> bool {
        self.steps.get(name).map(|e| e.is_terminal()).unwrap_or(false)
    }

    pub fn is_step_completed(&self, name: &str) -> bool {
        self.step_status(name) == Some(Status::Completed)
    }

    /// Declared steps with a successful terminal status.
    pub fn completed_steps(&self, playbook: &Playbook) -> Vec<String> {
        playbook
            .workflow
            .iter()
            .filter(|s| self.is_step_completed(&s.step))
            .map(|s| s.step.clone())
            .collect()
    }

    /// Any non-terminal step instance or open sink command.
    pub fn has_inflight_work(&self) -> bool {
        self.steps.values().any(|e| !e.is_terminal())
            || self.sinks.values().any(|s| s.status.is_none())
            || self
                .loops
                .iter()
                .any(|(name, f)| !f.closed && !self.is_step_terminal(name))
    }

    /// Declared steps that failed terminally.
    pub fn failed_steps(&self, playbook: &Playbook) -> Vec<String> {
        playbook
            .workflow
            .iter()
            .filter(|s| self.step_status(&s.step) == Some(Status::Failed))
            .map(|s| s.step.clone())
            .collect()
    }

    /// Whether any sink failure is configured to fail the parent.
    pub fn fatal_sink_failure(&self) -> bool {
        self.sinks
            .values()
            .any(|s| s.fail_parent && s.status == Some(Status::Failed))
    }

    /// Build the template context for this execution.
    pub fn build_context(&self, playbook: &Playbook) -> Value {
        ContextBuilder::new(self.execution_id, &self.path, self.version)
            .workload(self.workload.as_ref())
            .execution_vars(&self.vars)
            .step_namespace(self.step_namespace(playbook))
            .build()
    }

    /// The read-only `step.<id>` namespace.
    pub fn step_namespace(&self, playbook: &Playbook) -> Value {
        let mut namespace = Map::new();
        for step in &playbook.workflow {
            namespace.insert(step.step.clone(), self.step_entry_value(step));
        }
        Value::Object(namespace)
    }

    fn step_entry_value(&self, step: &Step) -> Value {
        let entry = self.steps.get(&step.step);
        let frame = self.loops.get(&step.step);

        let status = entry.map(|e| e.status);
        let done = status.map(|s| s.is_terminal()).unwrap_or(false);
        let ok = status == Some(Status::Completed);
        let running = entry.is_some() && !done;

        let (total, completed, succeeded, failed) = match frame {
            Some(f) => {
                let terminal = f.statuses.values().filter(|s| s.is_some()).count();
                let succeeded = f
                    .statuses
                    .values()
                    .filter(|s| matches!(s, Some(Status::Completed)))
                    .count();
                (f.total, terminal, succeeded, f.failed_count())
            }
            None => (
                1,
                usize::from(done),
                usize::from(ok),
                usize::from(status == Some(Status::Failed)),
            ),
        };

        json!({
            "status": {
                "done": done,
                "ok": ok,
                "running": running,
                "started_at": entry.and_then(|e| e.started_at).map(|t| t.to_rfc3339()),
                "finished_at": entry.and_then(|e| e.finished_at).map(|t| t.to_rfc3339()),
                "error": entry.and_then(|e| e.error.as_ref()).map(|e| e.message.clone()),
                "total": total,
                "completed": completed,
                "succeeded": succeeded,
                "failed": failed,
            },
            "result": entry.and_then(|e| e.result.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noetl_core::event::loop_node_id;

    fn playbook() -> Playbook {
        Playbook::from_yaml(
            r#"
workload:
  cities: ["SFO", "JFK"]
workflow:
  - step: start
    next:
      - step: fetch
  - step: fetch
    tool:
      kind: http
      spec: {url: "https://x"}
      retry:
        max_attempts: 3
        backoff_ms: 10
        on: [transport]
      result:
        as: payload
    next:
      - step: end
  - step: city_loop
    loop:
      in: "{{ workload.cities }}"
      as: city
      collect:
        into: city_results
    tool:
      kind: noop
      spec: {}
  - step: end
"#,
        )
        .unwrap()
    }

    fn ev(id: i64, event_type: EventType, node: &str, status: Status) -> Event {
        Event::new(id, 500, event_type, node, status)
    }

    #[test]
    fn test_fold_lifecycle() {
        let pb = playbook();
        let renderer = Renderer::new();
        let events = vec![
            ev(1, EventType::PlaybookInitialized, "playbook", Status::Initialized).with_context(
                json!({"workload": {"cities": ["SFO"]}, "path": "demo", "version": 1}),
            ),
            ev(2, EventType::WorkflowInitialized, "workflow", Status::Initialized),
            ev(3, EventType::CommandIssued, "start", Status::Pending).with_attempt(1),
            ev(4, EventType::StepEnter, "start", Status::Started).with_attempt(1),
            ev(5, EventType::StepExit, "start", Status::Completed).with_attempt(1),
        ];

        let proj = Projection::fold(&pb, &events, &renderer);
        assert_eq!(proj.execution_id, 500);
        assert_eq!(proj.path, "demo");
        assert!(proj.workflow_initialized);
        assert!(proj.is_step_completed("start"));
        assert!(!proj.is_step_terminal("fetch"));
    }

    #[test]
    fn test_fold_is_deterministic() {
        let pb = playbook();
        let renderer = Renderer::new();
        let events = vec![
            ev(1, EventType::PlaybookInitialized, "playbook", Status::Initialized)
                .with_context(json!({"path": "demo", "version": 1})),
            ev(2, EventType::WorkflowInitialized, "workflow", Status::Initialized),
            ev(3, EventType::CommandIssued, "fetch", Status::Pending)
                .with_attempt(1)
                .with_meta(json!({"bind": {"limit": 5}})),
            ev(4, EventType::StepEnter, "fetch", Status::Started).with_attempt(1),
            ev(5, EventType::ActionCompleted, "fetch", Status::Completed)
                .with_result(json!({"body": "ok"}))
                .with_attempt(1),
            ev(6, EventType::StepExit, "fetch", Status::Completed)
                .with_result(json!({"body": "ok"}))
                .with_attempt(1),
        ];

        let a = Projection::fold(&pb, &events, &renderer);
        let b = Projection::fold(&pb, &events, &renderer);
        assert_eq!(
            a.build_context(&pb),
            b.build_context(&pb),
            "replaying the same sequence must give byte-equal context"
        );
        assert_eq!(a.vars.get("limit"), Some(&json!(5)));
        // result.as wrote the payload.
        assert_eq!(a.vars.get("payload"), Some(&json!({"body": "ok"})));
    }

    #[test]
    fn test_at_most_one_successful_exit() {
        let pb = playbook();
        let renderer = Renderer::new();
        let events = vec![
            ev(1, EventType::StepExit, "fetch", Status::Completed).with_result(json!({"n": 1})),
            ev(2, EventType::StepExit, "fetch", Status::Completed).with_result(json!({"n": 2})),
        ];
        let proj = Projection::fold(&pb, &events, &renderer);
        // The second exit is ignored.
        assert_eq!(proj.steps["fetch"].result, Some(json!({"n": 1})));
    }

    #[test]
    fn test_retryable_error_does_not_fail_step() {
        let pb = playbook();
        let renderer = Renderer::new();
        let mut err = ev(3, EventType::ActionError, "fetch", Status::Failed).with_attempt(1);
        err.error = Some(EventError::new("transport", "connection reset"));

        let events = vec![
            ev(1, EventType::CommandIssued, "fetch", Status::Pending).with_attempt(1),
            ev(2, EventType::StepEnter, "fetch", Status::Started).with_attempt(1),
            err,
        ];
        let proj = Projection::fold(&pb, &events, &renderer);
        let entry = &proj.steps["fetch"];
        assert!(!entry.is_terminal(), "retryable error leaves step in flight");
        assert_eq!(entry.last_error_attempt, Some(1));
    }

    #[test]
    fn test_exhausted_retries_fail_step() {
        let pb = playbook();
        let renderer = Renderer::new();
        let mut events = Vec::new();
        let mut id = 0;
        for attempt in 1..=3 {
            id += 1;
            events.push(ev(id, EventType::CommandIssued, "fetch", Status::Pending).with_attempt(attempt));
            id += 1;
            let mut e =
                ev(id, EventType::ActionError, "fetch", Status::Failed).with_attempt(attempt);
            e.error = Some(EventError::new("transport", "reset"));
            events.push(e);
        }
        let proj = Projection::fold(&pb, &events, &renderer);
        assert_eq!(proj.step_status("fetch"), Some(Status::Failed));
    }

    #[test]
    fn test_non_matching_error_kind_fails_immediately() {
        let pb = playbook();
        let renderer = Renderer::new();
        let mut e = ev(2, EventType::ActionError, "fetch", Status::Failed).with_attempt(1);
        e.error = Some(EventError::new("template", "missing variable"));
        let events = vec![
            ev(1, EventType::CommandIssued, "fetch", Status::Pending).with_attempt(1),
            e,
        ];
        let proj = Projection::fold(&pb, &events, &renderer);
        assert_eq!(proj.step_status("fetch"), Some(Status::Failed));
    }

    #[test]
    fn test_loop_aggregation_in_element_order() {
        let pb = playbook();
        let renderer = Renderer::new();
        let mut events = vec![
            ev(1, EventType::LoopIteration, &loop_node_id("city_loop", 0), Status::Pending)
                .with_loop("city_loop", 0)
                .with_meta(json!({"total": 2})),
            ev(2, EventType::LoopIteration, &loop_node_id("city_loop", 1), Status::Pending)
                .with_loop("city_loop", 1)
                .with_meta(json!({"total": 2})),
        ];
        // Completion arrives out of order: index 1 first.
        events.push(
            ev(3, EventType::StepExit, &loop_node_id("city_loop", 1), Status::Completed)
                .with_result(json!("JFK-done"))
                .with_loop("city_loop", 1),
        );
        events.push(
            ev(4, EventType::StepExit, &loop_node_id("city_loop", 0), Status::Completed)
                .with_result(json!("SFO-done"))
                .with_loop("city_loop", 0),
        );

        let proj = Projection::fold(&pb, &events, &renderer);
        let frame = &proj.loops["city_loop"];
        assert!(frame.all_terminal());
        assert_eq!(frame.ordered_results(), vec![json!("SFO-done"), json!("JFK-done")]);
    }

    #[test]
    fn test_loop_completed_writes_aggregate_var() {
        let pb = playbook();
        let renderer = Renderer::new();
        let events = vec![ev(1, EventType::LoopCompleted, "city_loop", Status::Completed)
            .with_result(json!({"data": {"count": 2, "results": ["a", "b"]}}))];
        let proj = Projection::fold(&pb, &events, &renderer);
        assert_eq!(proj.vars.get("city_results"), Some(&json!(["a", "b"])));
        assert!(proj.is_step_completed("city_loop"));
    }

    #[test]
    fn test_gate_monotonicity_done_stays_done() {
        let pb = playbook();
        let renderer = Renderer::new();
        let mut events =
            vec![ev(1, EventType::StepExit, "start", Status::Completed)];
        let proj = Projection::fold(&pb, &events, &renderer);
        let ns = proj.step_namespace(&pb);
        assert_eq!(ns["start"]["status"]["done"], true);

        // Any further events keep done == true.
        events.push(ev(2, EventType::StepEnter, "fetch", Status::Started));
        events.push(ev(3, EventType::CommandIssued, "end", Status::Pending));
        let proj = Projection::fold(&pb, &events, &renderer);
        assert_eq!(proj.step_namespace(&pb)["start"]["status"]["done"], true);
    }

    #[test]
    fn test_cancellation_projects() {
        let pb = playbook();
        let renderer = Renderer::new();
        let events = vec![ev(1, EventType::ExecutionCancelled, "playbook", Status::Cancelled)];
        let proj = Projection::fold(&pb, &events, &renderer);
        assert!(proj.cancelled);
        assert_eq!(proj.status, Status::Cancelled);
    }
}
