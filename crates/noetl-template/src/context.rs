//! Context layering.
//!
//! Scopes nest workload -> execution -> step -> iterator; inner scopes
//! shadow outer ones. The reserved `step` namespace carries read-only
//! per-step status and is always injected last so nothing can shadow it.

use serde_json::{Map, Value};

use noetl_core::STEP_NAMESPACE;

/// Builds the JSON object templates are rendered against.
#[derive(Debug, Default, Clone)]
pub struct ContextBuilder {
    layers: Vec<Map<String, Value>>,
    step_namespace: Option<Value>,
}

impl ContextBuilder {
    pub fn new(execution_id: i64, path: &str, version: i64) -> Self {
        let mut base = Map::new();
        base.insert("execution_id".to_string(), Value::from(execution_id.to_string()));
        base.insert("path".to_string(), Value::from(path));
        base.insert("version".to_string(), Value::from(version));
        Self {
            layers: vec![base],
            step_namespace: None,
        }
    }

    /// Install the workload bag under `workload.*`.
    pub fn workload(mut self, workload: Option<&Value>) -> Self {
        let value = workload.cloned().unwrap_or_else(|| Value::Object(Map::new()));
        self.push_entry("workload", value);
        self
    }

    /// Overlay execution-scoped names (bind writes, result `as` targets,
    /// loop aggregates).
    pub fn execution_vars(mut self, vars: &Map<String, Value>) -> Self {
        self.layers.push(vars.clone());
        self
    }

    /// Overlay a step- or iterator-scoped layer; shadows everything below.
    pub fn scope(mut self, scope: &Map<String, Value>) -> Self {
        self.layers.push(scope.clone());
        self
    }

    /// Install the read-only `step` namespace.
    pub fn step_namespace(mut self, namespace: Value) -> Self {
        self.step_namespace = Some(namespace);
        self
    }

    fn push_entry(&mut self, key: &str, value: Value) {
        let mut layer = Map::new();
        layer.insert(key.to_string(), value);
        self.layers.push(layer);
    }

    /// Flatten layers into one object. Later layers win; the `step`
    /// namespace wins over everything.
    pub fn build(self) -> Value {
        let mut merged = Map::new();
        for layer in self.layers {
            for (k, v) in layer {
                if k == STEP_NAMESPACE {
                    continue;
                }
                merged.insert(k, v);
            }
        }
        merged.insert(
            STEP_NAMESPACE.to_string(),
            self.step_namespace.unwrap_or_else(|| Value::Object(Map::new())),
        );
        Value::Object(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_layering_and_shadowing() {
        let ctx = ContextBuilder::new(42, "demo/flow", 1)
            .workload(Some(&json!({"city": "SFO", "limit": 3})))
            .execution_vars(&obj(json!({"city_result": [1, 2], "limit": 5})))
            .scope(&obj(json!({"limit": 9})))
            .build();

        assert_eq!(ctx["execution_id"], "42");
        assert_eq!(ctx["workload"]["city"], "SFO");
        assert_eq!(ctx["city_result"], json!([1, 2]));
        // Inner scope shadows the execution var.
        assert_eq!(ctx["limit"], 9);
    }

    #[test]
    fn test_step_namespace_cannot_be_shadowed() {
        let ctx = ContextBuilder::new(1, "p", 1)
            .execution_vars(&obj(json!({"step": "bogus"})))
            .step_namespace(json!({"a": {"status": {"done": true}}}))
            .build();

        assert_eq!(ctx["step"]["a"]["status"]["done"], true);
    }

    #[test]
    fn test_default_namespace_is_empty_object() {
        let ctx = ContextBuilder::new(1, "p", 1).build();
        assert_eq!(ctx["step"], json!({}));
    }

    #[test]
    fn test_iterator_scope_binds_element() {
        let ctx = ContextBuilder::new(1, "p", 1)
            .workload(Some(&json!({"cities": ["SFO", "JFK"]})))
            .scope(&obj(json!({"city": "JFK", "current_index": 1})))
            .build();

        assert_eq!(ctx["city"], "JFK");
        assert_eq!(ctx["current_index"], 1);
    }
}
