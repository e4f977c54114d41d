//! End-to-end scheduler scenarios against the in-memory store.
//!
//! Most scenarios use a scripted worker that claims commands from the
//! queue and reports events through the same ingestion path real workers
//! use, exercising the full issue -> claim -> execute -> report -> fold
//! cycle. The sub-playbook scenario goes further and runs the shipped
//! worker runtime against the real HTTP API.

use std::sync::Arc;

use serde_json::{json, Value};

use noetl_core::ids::content_hash;
use noetl_core::{Event, EventType, Status};
use noetl_server::engine::Scheduler;
use noetl_server::ServerConfig;
use noetl_storage::{
    CatalogKind, CatalogStore, ClaimedCommand, EventStore, MemoryStore, NewCatalogEntry,
    QueueStore, Store,
};

const POOL: &str = "cpu";
const WORKER: &str = "worker-test-1";

fn test_config() -> ServerConfig {
    ServerConfig {
        default_pool: POOL.to_string(),
        ..Default::default()
    }
}

async fn setup(playbooks: &[(&str, &str)]) -> (Arc<Scheduler<dyn Store>>, Arc<MemoryStore>) {
    let memory = Arc::new(MemoryStore::new());
    for (path, content) in playbooks {
        memory
            .register(NewCatalogEntry {
                kind: CatalogKind::Playbook,
                path: path.to_string(),
                version: None,
                content: content.to_string(),
                content_hash: content_hash(content),
            })
            .await
            .unwrap();
    }
    let store: Arc<dyn Store> = memory.clone();
    let scheduler = Arc::new(Scheduler::new(store, test_config()));
    (scheduler, memory)
}

/// What the simulated worker does with a claimed command.
enum Outcome {
    /// Report success with this result.
    Ok(Value),
    /// Report a tool error of the given kind.
    Err(&'static str, &'static str),
    /// Keep the lease, do not report anything yet.
    Hold,
}

fn worker_event(
    command: &ClaimedCommand,
    event_type: EventType,
    status: Status,
) -> Event {
    let mut event = Event::new(0, command.execution_id, event_type, &command.node_id, status);
    event.attempt = Some(command.step_attempt);
    event.worker_id = Some(WORKER.to_string());
    if let Some(index) = noetl_core::event::loop_index(&command.node_id) {
        event.current_index = Some(index as i64);
        event.loop_id = Some(noetl_core::event::base_node_name(&command.node_id).to_string());
    }
    event
}

/// Claim and execute queued commands until the queue drains or `rounds`
/// passes elapse. The handler decides each command's outcome.
async fn drive<F>(
    scheduler: &Arc<Scheduler<dyn Store>>,
    rounds: usize,
    mut handler: F,
) -> Vec<String>
where
    F: FnMut(&ClaimedCommand) -> Outcome,
{
    let mut executed = Vec::new();
    for _ in 0..rounds {
        let commands = scheduler
            .store()
            .claim(WORKER, POOL, 16, 60_000)
            .await
            .unwrap();
        if commands.is_empty() {
            break;
        }

        for command in commands {
            let is_sink = command.node_id.contains(":sink[");
            if !is_sink {
                scheduler
                    .ingest(worker_event(&command, EventType::StepEnter, Status::Started))
                    .await
                    .unwrap();
            }

            match handler(&command) {
                Outcome::Ok(result) => {
                    if is_sink {
                        scheduler
                            .ingest(
                                worker_event(&command, EventType::SinkExecuted, Status::Completed)
                                    .with_result(result),
                            )
                            .await
                            .unwrap();
                    } else {
                        scheduler
                            .ingest(
                                worker_event(
                                    &command,
                                    EventType::ActionCompleted,
                                    Status::Completed,
                                )
                                .with_result(result.clone()),
                            )
                            .await
                            .unwrap();
                        scheduler
                            .ingest(
                                worker_event(&command, EventType::StepExit, Status::Completed)
                                    .with_result(result),
                            )
                            .await
                            .unwrap();
                    }
                    scheduler
                        .store()
                        .complete(command.command_id, WORKER)
                        .await
                        .unwrap();
                    scheduler
                        .ingest(worker_event(
                            &command,
                            EventType::CommandCompleted,
                            Status::Completed,
                        ))
                        .await
                        .unwrap();
                }
                Outcome::Err(kind, message) => {
                    let mut event =
                        worker_event(&command, EventType::ActionError, Status::Failed);
                    event.error = Some(noetl_core::event::EventError::new(kind, message));
                    scheduler.ingest(event).await.unwrap();
                    scheduler
                        .store()
                        .fail(command.command_id, WORKER, message)
                        .await
                        .unwrap();
                    scheduler
                        .ingest(worker_event(
                            &command,
                            EventType::CommandFailed,
                            Status::Failed,
                        ))
                        .await
                        .unwrap();
                }
                Outcome::Hold => continue,
            }
            executed.push(command.node_id.clone());
        }
    }
    executed
}

fn events_of_type(events: &[Event], event_type: EventType) -> Vec<&Event> {
    events.iter().filter(|e| e.event_type == event_type).collect()
}

const HELLO_WORLD: &str = r#"
workflow:
  - step: start
    next:
      - step: test_step
  - step: test_step
    tool:
      kind: echo
      spec: {message: "hello"}
    next:
      - step: end
  - step: end
    next:
      - step: end_sink
  - step: end_sink
"#;

#[tokio::test]
async fn hello_world_event_sequence() {
    let (scheduler, _memory) = setup(&[("tests/hello", HELLO_WORLD)]).await;

    let execution_id = scheduler
        .start_execution("tests/hello", None, None, false, None)
        .await
        .unwrap();

    drive(&scheduler, 10, |_| Outcome::Ok(json!({"ok": true}))).await;

    let events = scheduler.store().load_events(execution_id).await.unwrap();
    assert!(events.len() >= 18, "expected >= 18 events, got {}", events.len());

    // Opening and closing bookends.
    assert_eq!(events[0].event_type, EventType::PlaybookInitialized);
    assert_eq!(events[0].status, Status::Initialized);
    assert_eq!(events[1].event_type, EventType::WorkflowInitialized);
    let wf_completed = events_of_type(&events, EventType::WorkflowCompleted);
    assert_eq!(wf_completed.len(), 1);
    assert_eq!(wf_completed[0].status, Status::Completed);
    let pb_completed = events_of_type(&events, EventType::PlaybookCompleted);
    assert_eq!(pb_completed.len(), 1);
    assert_eq!(pb_completed[0].status, Status::Completed);
    assert!(
        wf_completed[0].event_id < pb_completed[0].event_id,
        "workflow.completed precedes playbook.completed"
    );

    // Each step ran exactly once with the full command lifecycle.
    for step in ["start", "test_step", "end", "end_sink"] {
        for (event_type, status) in [
            (EventType::CommandIssued, Status::Pending),
            (EventType::StepEnter, Status::Started),
            (EventType::StepExit, Status::Completed),
            (EventType::CommandCompleted, Status::Completed),
        ] {
            let matching: Vec<&Event> = events
                .iter()
                .filter(|e| e.node_id == step && e.event_type == event_type)
                .collect();
            assert_eq!(matching.len(), 1, "{step}/{event_type} count");
            assert_eq!(matching[0].status, status, "{step}/{event_type} status");
        }

        // Per-step ordering: issued < enter < exit.
        let pos = |t: EventType| {
            events
                .iter()
                .position(|e| e.node_id == step && e.event_type == t)
                .unwrap()
        };
        assert!(pos(EventType::CommandIssued) < pos(EventType::StepEnter));
        assert!(pos(EventType::StepEnter) < pos(EventType::StepExit));
    }

    let record = scheduler
        .store()
        .get_execution(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, Status::Completed);
}

const FAN_OUT_JOIN: &str = r#"
workflow:
  - step: start
    next:
      - step: [fetch_user, score_user]
  - step: fetch_user
    tool: {kind: echo, spec: {message: "user"}}
    next:
      - step: join
  - step: score_user
    tool: {kind: echo, spec: {message: "score"}}
    next:
      - step: join
  - step: join
    when: "{{ done('fetch_user') and ok('score_user') }}"
"#;

#[tokio::test]
async fn fan_out_and_join_waits_for_slow_branch() {
    let (scheduler, _memory) = setup(&[("tests/join", FAN_OUT_JOIN)]).await;
    let execution_id = scheduler
        .start_execution("tests/join", None, None, false, None)
        .await
        .unwrap();

    // score_user takes longer: hold it while fetch_user completes.
    let mut held_score: Option<ClaimedCommand> = None;
    drive(&scheduler, 4, |cmd| {
        if cmd.node_id == "score_user" {
            held_score = Some(cmd.clone());
            Outcome::Hold
        } else {
            Outcome::Ok(json!({"done": cmd.node_id.clone()}))
        }
    })
    .await;

    let events = scheduler.store().load_events(execution_id).await.unwrap();
    assert!(
        !events
            .iter()
            .any(|e| e.node_id == "join" && e.event_type == EventType::StepEnter),
        "join must not enter before score_user completes"
    );

    // Finish the held branch through the worker path.
    let held = held_score.expect("score_user was claimed");
    scheduler
        .ingest(worker_event(&held, EventType::ActionCompleted, Status::Completed)
            .with_result(json!({"score": 10})))
        .await
        .unwrap();
    scheduler
        .ingest(worker_event(&held, EventType::StepExit, Status::Completed)
            .with_result(json!({"score": 10})))
        .await
        .unwrap();
    scheduler.store().complete(held.command_id, WORKER).await.unwrap();

    drive(&scheduler, 4, |_| Outcome::Ok(json!({"ok": true}))).await;

    let events = scheduler.store().load_events(execution_id).await.unwrap();
    let score_exit = events
        .iter()
        .position(|e| e.node_id == "score_user" && e.event_type == EventType::StepExit)
        .unwrap();
    let join_enters: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.node_id == "join" && e.event_type == EventType::StepEnter)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(join_enters.len(), 1, "exactly one join entry");
    assert!(join_enters[0] > score_exit, "join entered after slow branch");

    let record = scheduler
        .store()
        .get_execution(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, Status::Completed);
}

const CITY_LOOP: &str = r#"
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
      spec:
        path: "tests/child"
        parameters:
          city: "{{ city }}"
"#;

const CHILD: &str = r#"
workflow:
  - step: start
    next:
      - step: report
  - step: report
    tool: {kind: echo, spec: {message: "child"}}
"#;

/// Runs the shipped worker runtime against the real HTTP API, so the
/// `playbook` tool and the worker's event reporting are exercised as
/// deployed, not simulated.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn loop_spawns_children_and_aggregates_in_order() {
    let (scheduler, _memory) =
        setup(&[("tests/loop", CITY_LOOP), ("tests/child", CHILD)]).await;

    let app = noetl_server::api::router(noetl_server::api::AppState::new(scheduler.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_url = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mut config = noetl_worker::WorkerConfig::default()
        .with_server_url(&server_url)
        .with_capacity(8);
    config.poll_min = std::time::Duration::from_millis(50);
    config.poll_max = std::time::Duration::from_millis(200);
    let worker = Arc::new(noetl_worker::Worker::new(config));
    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    let execution_id = scheduler
        .start_execution("tests/loop", None, None, false, None)
        .await
        .unwrap();

    // Parent completes once every iteration's child has terminated and
    // the loop has closed.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(30);
    loop {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let record = scheduler
            .store()
            .get_execution(execution_id)
            .await
            .unwrap()
            .unwrap();
        if record.status.is_terminal() {
            assert_eq!(record.status, Status::Completed);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "parent execution did not finish in time"
        );
    }

    let events = scheduler.store().load_events(execution_id).await.unwrap();

    let iterations = events_of_type(&events, EventType::LoopIteration);
    assert_eq!(iterations.len(), 3);

    // Three children, each carrying the back-reference.
    let children = scheduler
        .store()
        .list_executions(&noetl_storage::ExecutionFilter {
            path: Some("tests/child".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(children.len(), 3);
    for child in &children {
        assert_eq!(child.parent_execution_id, Some(execution_id));
        let child_events = scheduler
            .store()
            .load_events(child.execution_id)
            .await
            .unwrap();
        assert_eq!(
            child_events[0].parent_execution_id,
            Some(execution_id),
            "child's first event carries parent_execution_id"
        );
    }

    // Exactly one parent event links each child via meta, as reported by
    // the worker's terminal step event.
    for child in &children {
        let wanted = child.execution_id.to_string();
        let linked: Vec<&Event> = events
            .iter()
            .filter(|e| {
                e.meta
                    .as_ref()
                    .and_then(|m| m.get("child_execution_id"))
                    .and_then(Value::as_str)
                    == Some(wanted.as_str())
            })
            .collect();
        assert_eq!(linked.len(), 1, "one linkage event for child {wanted}");
        assert_eq!(linked[0].event_type, EventType::StepExit);
    }

    let closed = events_of_type(&events, EventType::LoopCompleted);
    assert_eq!(closed.len(), 1);
    let data = &closed[0].result.as_ref().unwrap()["data"];
    assert_eq!(data["count"], 3);
    let results = data["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);

    // Results sit in element order regardless of completion order: each
    // slot's child was started with that slot's city.
    for (index, city) in ["SFO", "JFK", "LAX"].iter().enumerate() {
        let child_id: i64 = results[index]["child_execution_id"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        let child_events = scheduler.store().load_events(child_id).await.unwrap();
        let workload = &child_events[0].context.as_ref().unwrap()["workload"];
        assert_eq!(workload["city"], *city, "slot {index} belongs to {city}");
    }

    worker.shutdown();
    let _ = runner.await;
    server.abort();
}

const RETRY: &str = r#"
workflow:
  - step: start
    next:
      - step: flaky
  - step: flaky
    tool:
      kind: http
      spec: {url: "https://flaky.example"}
      retry:
        max_attempts: 3
        backoff_ms: 50
        on: [transport]
"#;

#[tokio::test]
async fn retry_on_transient_error_then_success() {
    let (scheduler, _memory) = setup(&[("tests/retry", RETRY)]).await;
    let execution_id = scheduler
        .start_execution("tests/retry", None, None, false, None)
        .await
        .unwrap();

    let mut flaky_attempts = 0;
    for _ in 0..8 {
        drive(&scheduler, 2, |cmd| {
            if cmd.node_id == "flaky" {
                flaky_attempts += 1;
                if flaky_attempts <= 2 {
                    return Outcome::Err("transport", "connection reset");
                }
            }
            Outcome::Ok(json!({"ok": true}))
        })
        .await;

        let record = scheduler
            .store()
            .get_execution(execution_id)
            .await
            .unwrap()
            .unwrap();
        if record.status.is_terminal() {
            break;
        }
        // Wait out the retry backoff before the next claim pass.
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    }

    let events = scheduler.store().load_events(execution_id).await.unwrap();
    let issued: Vec<&Event> = events
        .iter()
        .filter(|e| e.node_id == "flaky" && e.event_type == EventType::CommandIssued)
        .collect();
    assert_eq!(issued.len(), 3, "exactly three issuances for flaky");
    assert_eq!(
        issued.iter().map(|e| e.attempt.unwrap()).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let errors: Vec<&Event> = events
        .iter()
        .filter(|e| e.node_id == "flaky" && e.event_type == EventType::ActionError)
        .collect();
    assert_eq!(errors.len(), 2);

    let completions: Vec<&Event> = events
        .iter()
        .filter(|e| e.node_id == "flaky" && e.event_type == EventType::ActionCompleted)
        .collect();
    assert_eq!(completions.len(), 1);

    let record = scheduler
        .store()
        .get_execution(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, Status::Completed);
}

const LONG_STEP: &str = r#"
workflow:
  - step: start
    next:
      - step: long_step
  - step: long_step
    tool: {kind: http, spec: {url: "https://slow.example"}}
    next:
      - step: end
  - step: end
"#;

#[tokio::test]
async fn cancellation_settles_inflight_step() {
    let (scheduler, _memory) = setup(&[("tests/cancel", LONG_STEP)]).await;
    let execution_id = scheduler
        .start_execution("tests/cancel", None, None, false, None)
        .await
        .unwrap();

    // Run start; hold the long step mid-flight.
    let mut held: Option<ClaimedCommand> = None;
    drive(&scheduler, 3, |cmd| {
        if cmd.node_id == "long_step" {
            held = Some(cmd.clone());
            Outcome::Hold
        } else {
            Outcome::Ok(json!({}))
        }
    })
    .await;
    let held = held.expect("long_step claimed");

    scheduler
        .cancel_execution(execution_id, "user requested")
        .await
        .unwrap();

    // The worker observes cancellation on its next heartbeat and stops.
    let ack = scheduler
        .store()
        .heartbeat(held.command_id, WORKER, 60_000)
        .await
        .unwrap();
    assert!(ack.cancel_requested);
    scheduler
        .ingest(worker_event(&held, EventType::StepExit, Status::Cancelled))
        .await
        .unwrap();

    let events = scheduler.store().load_events(execution_id).await.unwrap();

    let cancel_pos = events
        .iter()
        .position(|e| e.event_type == EventType::ExecutionCancelled)
        .expect("execution.cancelled present");
    assert!(
        !events[cancel_pos..]
            .iter()
            .any(|e| e.event_type == EventType::CommandIssued),
        "no issuance after cancellation"
    );

    let long_exit = events
        .iter()
        .find(|e| e.node_id == "long_step" && e.event_type == EventType::StepExit)
        .expect("long step settled");
    assert_eq!(long_exit.status, Status::Cancelled);

    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::PlaybookCompleted);
    assert_eq!(last.status, Status::Cancelled);

    // `end` never ran.
    assert!(!events.iter().any(|e| e.node_id == "end"));
}

const GATED: &str = r#"
workflow:
  - step: start
    next:
      - step: [a, b]
  - step: a
    tool: {kind: echo, spec: {message: "slow"}}
  - step: b
    when: "{{ ok('a') }}"
"#;

#[tokio::test]
async fn gated_step_enters_exactly_once_after_dependency() {
    let (scheduler, _memory) = setup(&[("tests/gated", GATED)]).await;
    let execution_id = scheduler
        .start_execution("tests/gated", None, None, false, None)
        .await
        .unwrap();

    // Hold `a` for a while; `b` must not enter.
    let mut held: Option<ClaimedCommand> = None;
    drive(&scheduler, 3, |cmd| {
        if cmd.node_id == "a" {
            held = Some(cmd.clone());
            Outcome::Hold
        } else {
            Outcome::Ok(json!({}))
        }
    })
    .await;

    let events = scheduler.store().load_events(execution_id).await.unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| e.node_id == "b" && e.event_type == EventType::StepEnter)
            .count(),
        0,
        "no b entry before a completes"
    );

    // Complete `a`; `b` fires exactly once.
    let held = held.expect("a claimed");
    scheduler
        .ingest(worker_event(&held, EventType::StepExit, Status::Completed)
            .with_result(json!({})))
        .await
        .unwrap();
    scheduler.store().complete(held.command_id, WORKER).await.unwrap();

    drive(&scheduler, 4, |_| Outcome::Ok(json!({}))).await;

    let events = scheduler.store().load_events(execution_id).await.unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| e.node_id == "b" && e.event_type == EventType::StepEnter)
            .count(),
        1,
        "exactly one b entry after a completes"
    );

    let record = scheduler
        .store()
        .get_execution(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, Status::Completed);
}

#[tokio::test]
async fn replaying_the_log_reproduces_the_projection() {
    let (scheduler, _memory) = setup(&[("tests/hello", HELLO_WORLD)]).await;
    let execution_id = scheduler
        .start_execution("tests/hello", None, None, false, None)
        .await
        .unwrap();
    drive(&scheduler, 10, |_| Outcome::Ok(json!({"ok": true}))).await;

    let entry = scheduler
        .store()
        .fetch(CatalogKind::Playbook, "tests/hello", None)
        .await
        .unwrap()
        .unwrap();
    let playbook = noetl_core::Playbook::from_yaml(&entry.content).unwrap();
    let events = scheduler.store().load_events(execution_id).await.unwrap();

    let renderer = noetl_template::Renderer::new();
    let a = noetl_server::engine::Projection::fold(&playbook, &events, &renderer);
    let b = noetl_server::engine::Projection::fold(&playbook, &events, &renderer);

    assert_eq!(a.build_context(&playbook), b.build_context(&playbook));
    assert!(a.playbook_completed);
    assert_eq!(a.status, Status::Completed);
}
