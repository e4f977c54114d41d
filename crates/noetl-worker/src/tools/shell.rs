//! Shell tool.
//!
//! Spec: `{command, cwd?, env?, allow_nonzero?}`. Runs through `sh -c`
//! and returns `{exit_code, stdout, stderr}`. A non-zero exit is a tool
//! error unless `allow_nonzero` is set.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{Tool, ToolCall, ToolError};

pub struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn execute(&self, call: ToolCall<'_>) -> Result<Value, ToolError> {
        let script = call
            .spec
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::tool("shell: spec.command is required"))?;
        let allow_nonzero = call
            .spec
            .get("allow_nonzero")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut command = Command::new("sh");
        command.arg("-c").arg(script);

        if let Some(cwd) = call.spec.get("cwd").and_then(Value::as_str) {
            command.current_dir(cwd);
        }
        if let Some(env) = call.spec.get("env").and_then(Value::as_object) {
            for (key, value) in env {
                if let Some(v) = value.as_str() {
                    command.env(key, v);
                }
            }
        }

        let output = command
            .output()
            .await
            .map_err(|e| ToolError::tool(format!("shell: spawn failed: {e}")))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

        if exit_code != 0 && !allow_nonzero {
            return Err(ToolError::tool(format!(
                "shell: exit {exit_code}: {stderr}"
            )));
        }

        Ok(json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(spec: &Value) -> ToolCall<'_> {
        // Leak the empties; test-only convenience.
        ToolCall {
            spec,
            args: Box::leak(Box::new(json!({}))),
            credentials: Box::leak(Box::new(json!({}))),
            context: Box::leak(Box::new(json!({}))),
            execution_id: 1,
            node_id: "sh",
        }
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let spec = json!({"command": "echo hello"});
        let out = ShellTool.execute(call(&spec)).await.unwrap();
        assert_eq!(out["exit_code"], 0);
        assert_eq!(out["stdout"], "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let spec = json!({"command": "exit 3"});
        let err = ShellTool.execute(call(&spec)).await.unwrap_err();
        assert!(err.message.contains("exit 3"));
    }

    #[tokio::test]
    async fn test_allow_nonzero() {
        let spec = json!({"command": "exit 3", "allow_nonzero": true});
        let out = ShellTool.execute(call(&spec)).await.unwrap();
        assert_eq!(out["exit_code"], 3);
    }
}
