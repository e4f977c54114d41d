//! Playbook DSL types.
//!
//! A playbook is a YAML document with two top-level keys:
//!
//! - `workload`: arbitrary object exposed as `workload.*` in templates
//! - `workflow`: ordered list of steps
//!
//! The step surface is closed: unknown keys are rejected at parse time so
//! authoring mistakes surface on registration, not mid-execution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A complete playbook document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Playbook {
    /// Top-level input bag, available under `workload.*`.
    #[serde(default)]
    pub workload: Option<serde_json::Value>,

    /// Ordered workflow steps.
    pub workflow: Vec<Step>,
}

impl Playbook {
    /// Parse a YAML document.
    pub fn from_yaml(doc: &str) -> Result<Self, crate::CoreError> {
        Ok(serde_yaml::from_str(doc)?)
    }

    /// Look up a step by id.
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.workflow.iter().find(|s| s.step == name)
    }

    /// Whether the workflow declares the entry step.
    pub fn has_start_step(&self) -> bool {
        self.get_step(crate::START_STEP).is_some()
    }

    /// All declared step ids, in workflow order.
    pub fn step_names(&self) -> Vec<&str> {
        self.workflow.iter().map(|s| s.step.as_str()).collect()
    }
}

/// One workflow step. The key set is fixed; extras are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Step id, unique within the workflow.
    pub step: String,

    /// Human description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,

    /// Gate expression; absent means unconditional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    /// Context writes applied when the call fires. Values are template
    /// expressions rendered at issue time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<BTreeMap<String, serde_json::Value>>,

    /// Iteration over a finite sequence.
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<LoopSpec>,

    /// The action this step performs. Routing-only steps omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolSpec>,

    /// Ordered outgoing edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Vec<NextEdge>>,
}

impl Step {
    /// Gate expression, defaulting to always-true.
    pub fn when_expr(&self) -> &str {
        self.when.as_deref().unwrap_or("true")
    }
}

/// Loop declaration: `{in: <expr>, as: <name>, parallelism?, collect?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopSpec {
    /// Template expression evaluating to a finite sequence.
    #[serde(rename = "in")]
    pub in_expr: String,

    /// Iterator variable name bound per element.
    #[serde(rename = "as")]
    pub iterator: String,

    /// Cap on simultaneously outstanding iteration commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,

    /// Append each element result into a named context list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect: Option<Collect>,
}

/// Collect target for loop or result aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Collect {
    pub into: String,
}

/// Tool invocation: `{kind, spec, args?, result?, retry?, timeout_ms?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolSpec {
    /// Plugin name: http, postgres, shell, playbook, ...
    pub kind: String,

    /// Tool-specific configuration; rendered by the worker against the
    /// command-carried context.
    pub spec: serde_json::Value,

    /// Arguments passed to the plugin alongside the spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<BTreeMap<String, serde_json::Value>>,

    /// Result directives applied after the tool returns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultSpec>,

    /// Retry policy for failed attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,

    /// Per-attempt execution timeout enforced by the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// When true, a failed step does not fail the workflow.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continue_on_error: bool,
}

/// Result directives: `raw -> pick -> as/collect -> sinks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultSpec {
    /// Expression selecting a subvalue of the raw tool return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pick: Option<String>,

    /// Context name the picked value is written to.
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Append into a context list (per loop iteration).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect: Option<Collect>,

    /// Sinks the result is forwarded to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink: Option<Vec<SinkSpec>>,
}

/// One sink declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkSpec {
    /// Sink plugin name: postgres, http, event, ...
    pub kind: String,

    /// Sink-specific configuration.
    pub spec: serde_json::Value,

    /// When true, a sink failure fails the parent step.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fail_parent: bool,
}

/// Retry policy: `{max_attempts, backoff_ms, jitter_ms, on, rebind?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySpec {
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff_ms: u64,

    #[serde(default)]
    pub jitter_ms: u64,

    /// Error kinds that trigger a retry; `*` matches any.
    #[serde(default)]
    pub on: Vec<String>,

    /// Re-render `bind` expressions on re-issued attempts.
    #[serde(default)]
    pub rebind: bool,
}

impl RetrySpec {
    /// Whether an error of the given kind is retryable under this policy.
    pub fn matches(&self, kind: &str) -> bool {
        self.on.is_empty() || self.on.iter().any(|p| p == "*" || p == kind)
    }
}

/// Edge target: a single step id or a fan-out list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepRef {
    Single(String),
    Many(Vec<String>),
}

impl StepRef {
    /// Targets in declaration order.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Self::Single(s) => vec![s.as_str()],
            Self::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

/// One outgoing edge: `{step, when?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NextEdge {
    pub step: StepRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_playbook() {
        let yaml = r#"
workload:
  greeting: hello
workflow:
  - step: start
    next:
      - step: test_step
  - step: test_step
    tool:
      kind: http
      spec:
        url: "https://example.com"
        method: GET
    next:
      - step: end
  - step: end
"#;
        let playbook = Playbook::from_yaml(yaml).unwrap();
        assert!(playbook.has_start_step());
        assert_eq!(playbook.step_names(), vec!["start", "test_step", "end"]);

        let step = playbook.get_step("test_step").unwrap();
        let tool = step.tool.as_ref().unwrap();
        assert_eq!(tool.kind, "http");
        assert_eq!(tool.spec["url"], "https://example.com");
    }

    #[test]
    fn test_parse_loop_with_collect() {
        let yaml = r#"
workflow:
  - step: start
    next:
      - step: city_loop
  - step: city_loop
    loop:
      in: "{{ workload.cities }}"
      as: city
      parallelism: 2
      collect:
        into: city_results
    tool:
      kind: playbook
      spec:
        path: "examples/weather"
"#;
        let playbook = Playbook::from_yaml(yaml).unwrap();
        let step = playbook.get_step("city_loop").unwrap();
        let lp = step.loop_spec.as_ref().unwrap();
        assert_eq!(lp.iterator, "city");
        assert_eq!(lp.parallelism, Some(2));
        assert_eq!(lp.collect.as_ref().unwrap().into, "city_results");
    }

    #[test]
    fn test_parse_retry_and_result() {
        let yaml = r#"
workflow:
  - step: start
    next:
      - step: fetch
  - step: fetch
    tool:
      kind: http
      spec:
        url: "{{ workload.url }}"
      retry:
        max_attempts: 3
        backoff_ms: 100
        jitter_ms: 25
        on: [transport]
      result:
        pick: "raw.body"
        as: payload
        sink:
          - kind: postgres
            spec:
              table: results
"#;
        let playbook = Playbook::from_yaml(yaml).unwrap();
        let tool = playbook.get_step("fetch").unwrap().tool.as_ref().unwrap();

        let retry = tool.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert!(retry.matches("transport"));
        assert!(!retry.matches("template"));
        assert!(!retry.rebind);

        let result = tool.result.as_ref().unwrap();
        assert_eq!(result.pick.as_deref(), Some("raw.body"));
        assert_eq!(result.name.as_deref(), Some("payload"));
        assert_eq!(result.sink.as_ref().unwrap()[0].kind, "postgres");
    }

    #[test]
    fn test_retry_wildcard_and_empty_on() {
        let any = RetrySpec {
            max_attempts: 2,
            backoff_ms: 0,
            jitter_ms: 0,
            on: vec!["*".to_string()],
            rebind: false,
        };
        assert!(any.matches("template"));

        let empty = RetrySpec {
            max_attempts: 2,
            backoff_ms: 0,
            jitter_ms: 0,
            on: vec![],
            rebind: false,
        };
        assert!(empty.matches("tool"));
    }

    #[test]
    fn test_fan_out_next_list() {
        let yaml = r#"
workflow:
  - step: start
    next:
      - step: [fetch_user, score_user]
  - step: fetch_user
  - step: score_user
  - step: join
    when: "{{ done('fetch_user') and ok('score_user') }}"
"#;
        let playbook = Playbook::from_yaml(yaml).unwrap();
        let edges = playbook.get_step("start").unwrap().next.as_ref().unwrap();
        assert_eq!(edges[0].step.targets(), vec!["fetch_user", "score_user"]);
        assert_eq!(
            playbook.get_step("join").unwrap().when_expr(),
            "{{ done('fetch_user') and ok('score_user') }}"
        );
    }

    #[test]
    fn test_unknown_step_key_rejected() {
        let yaml = r#"
workflow:
  - step: start
    retries: 3
"#;
        assert!(Playbook::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_register_roundtrip_preserves_ast() {
        let yaml = r#"
workload:
  limit: 10
workflow:
  - step: start
    bind:
      started: "{{ now() }}"
    next:
      - step: end
        when: "{{ workload.limit > 5 }}"
  - step: end
"#;
        let playbook = Playbook::from_yaml(yaml).unwrap();
        let json = serde_json::to_string(&playbook).unwrap();
        let reparsed: Playbook = serde_json::from_str(&json).unwrap();
        assert_eq!(
            serde_json::to_value(&playbook).unwrap(),
            serde_json::to_value(&reparsed).unwrap()
        );
    }
}
