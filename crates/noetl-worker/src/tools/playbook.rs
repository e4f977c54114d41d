//! Sub-playbook tool.
//!
//! Spec: `{path, version?, parameters?, merge?}`. Triggers a child
//! execution linked through `parent_execution_id` and the current node
//! as `parent_step`, then polls the server for the child's terminal
//! state. The parent command stays leased the whole time; the worker
//! runtime heartbeats around this call. Cancellation of the parent
//! cascades to the child server-side.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::client::ApiClient;

use super::{Tool, ToolCall, ToolError, ToolErrorKind};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct PlaybookTool {
    client: ApiClient,
}

impl PlaybookTool {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for PlaybookTool {
    fn name(&self) -> &'static str {
        "playbook"
    }

    async fn execute(&self, call: ToolCall<'_>) -> Result<Value, ToolError> {
        let path = call
            .spec
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::tool("playbook: spec.path is required"))?;
        let version = call.spec.get("version").and_then(Value::as_i64);
        let merge = call
            .spec
            .get("merge")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        // Parameters: explicit spec.parameters, with args overlaid.
        let mut parameters = call
            .spec
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({}));
        if let (Some(target), Some(args)) = (parameters.as_object_mut(), call.args.as_object()) {
            for (k, v) in args {
                target.insert(k.clone(), v.clone());
            }
        }

        let run = self
            .client
            .run_playbook(
                path,
                version,
                Some(&parameters),
                merge,
                Some((call.execution_id, call.node_id)),
            )
            .await
            .map_err(|e| ToolError::transport(format!("playbook: {e}")))?;

        info!(
            parent = call.execution_id,
            child = %run.execution_id,
            path,
            "child execution started"
        );

        // Wait for the child's terminal state. Transient status-poll
        // failures are tolerated; the child keeps running server-side.
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let status = match self.client.execution_status(&run.execution_id).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(child = %run.execution_id, "status poll failed: {e}");
                    continue;
                }
            };

            match status.status.as_str() {
                "COMPLETED" => {
                    return Ok(json!({
                        "child_execution_id": run.execution_id,
                        "status": "COMPLETED",
                        "result": status.result,
                    }));
                }
                "FAILED" => {
                    return Err(ToolError::tool(format!(
                        "playbook: child {} failed: {}",
                        run.execution_id,
                        status.error.unwrap_or_else(|| "unknown error".to_string())
                    )));
                }
                "CANCELLED" => {
                    return Err(ToolError::new(
                        ToolErrorKind::Cancelled,
                        format!("playbook: child {} cancelled", run.execution_id),
                    ));
                }
                _ => continue,
            }
        }
    }
}
