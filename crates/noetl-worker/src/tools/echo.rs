//! Trivial tools: `noop` for routing-only steps, `echo` for tests and
//! smoke playbooks.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolCall, ToolError};

/// Routing steps (no `tool` key) execute as `noop`.
pub struct NoopTool;

#[async_trait]
impl Tool for NoopTool {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn execute(&self, _call: ToolCall<'_>) -> Result<Value, ToolError> {
        Ok(json!({}))
    }
}

/// Echoes its rendered spec and args back as the result.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn execute(&self, call: ToolCall<'_>) -> Result<Value, ToolError> {
        let mut out = call.spec.as_object().cloned().unwrap_or_default();
        if let Some(args) = call.args.as_object() {
            for (k, v) in args {
                out.insert(k.clone(), v.clone());
            }
        }
        Ok(Value::Object(out))
    }
}
