//! Tool plugins.
//!
//! Each plugin implements [`Tool`]: a pure mapping from
//! `(spec, args, credentials, ctx)` to a result value or an error. The
//! dispatcher is a name-keyed registry built once at process start.

pub mod echo;
pub mod http;
pub mod playbook;
pub mod postgres;
pub mod shell;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// Error kinds, matching the engine's retry predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    /// Rendering failure before dispatch.
    Template,
    /// Plugin-reported failure.
    Tool,
    /// Transient network problem.
    Transport,
    /// The per-command timeout elapsed.
    Timeout,
    /// Execution was cancelled mid-flight.
    Cancelled,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Tool => "tool",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A tool failure carrying its taxonomy kind.
#[derive(Debug, thiserror::Error)]
#[error("{}: {message}", kind.as_str())]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Tool, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Transport, message)
    }
}

/// One invocation, everything already rendered.
pub struct ToolCall<'a> {
    /// Rendered tool spec.
    pub spec: &'a Value,
    /// Rendered arguments.
    pub args: &'a Value,
    /// Resolved credentials keyed by alias.
    pub credentials: &'a Value,
    /// Full render context the command carried.
    pub context: &'a Value,
    /// Execution/node identity, for tools that need linkage.
    pub execution_id: i64,
    pub node_id: &'a str,
}

/// A tool plugin.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry key (`http`, `postgres`, `shell`, `playbook`, ...).
    fn name(&self) -> &'static str;

    async fn execute(&self, call: ToolCall<'_>) -> Result<Value, ToolError>;
}

/// Name-keyed dispatcher, built once at startup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in plugin installed.
    pub fn builtin(client: crate::client::ApiClient) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(echo::EchoTool));
        registry.register(Arc::new(echo::NoopTool));
        registry.register(Arc::new(http::HttpTool::new()));
        registry.register(Arc::new(shell::ShellTool));
        registry.register(Arc::new(postgres::PostgresTool));
        registry.register(Arc::new(playbook::PlaybookTool::new(client)));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.tools.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_registry_dispatch() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(echo::EchoTool));
        registry.register(Arc::new(echo::NoopTool));

        assert!(registry.get("echo").is_some());
        assert!(registry.get("noop").is_some());
        assert!(registry.get("bogus").is_none());
        assert_eq!(registry.names(), vec!["echo", "noop"]);

        let tool = registry.get("echo").unwrap();
        let spec = json!({"message": "hi"});
        let args = json!({});
        let creds = json!({});
        let ctx = json!({});
        let out = tool
            .execute(ToolCall {
                spec: &spec,
                args: &args,
                credentials: &creds,
                context: &ctx,
                execution_id: 1,
                node_id: "s",
            })
            .await
            .unwrap();
        assert_eq!(out["message"], "hi");
    }

    #[test]
    fn test_error_kinds() {
        let err = ToolError::transport("boom");
        assert_eq!(err.kind.as_str(), "transport");
        assert_eq!(err.to_string(), "transport: boom");
    }
}
