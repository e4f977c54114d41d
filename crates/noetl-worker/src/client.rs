//! HTTP client for the server's queue, event, and catalog APIs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use noetl_core::Event;
use noetl_storage::{ClaimedCommand, HeartbeatAck};

/// Client errors, split so retry policy can tell transport problems from
/// server rejections.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Network-level failure talking to the server.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server rejected the request.
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

/// Thin wrapper over reqwest for the worker protocol.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ClaimResponse {
    commands: Vec<ClaimedCommand>,
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a Value>,
    merge: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_step: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct RunResponse {
    pub execution_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecutionStatusResponse {
    pub execution_id: String,
    pub status: String,
    pub completed: bool,
    pub failed: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ClientError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn claim(
        &self,
        worker_id: &str,
        pool: &str,
        max_items: usize,
        lease_ms: i64,
    ) -> Result<Vec<ClaimedCommand>, ClientError> {
        let response = self
            .http
            .post(self.url("/api/queue/claim"))
            .json(&json!({
                "worker_id": worker_id,
                "pool": pool,
                "max_items": max_items,
                "lease_ms": lease_ms,
            }))
            .send()
            .await?;
        let body: ClaimResponse = Self::check(response).await?.json().await?;
        Ok(body.commands)
    }

    pub async fn heartbeat(
        &self,
        command_id: i64,
        worker_id: &str,
        extend_ms: i64,
    ) -> Result<HeartbeatAck, ClientError> {
        let response = self
            .http
            .post(self.url("/api/queue/heartbeat"))
            .json(&json!({
                "command_id": command_id,
                "worker_id": worker_id,
                "extend_ms": extend_ms,
            }))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn complete(
        &self,
        command: &ClaimedCommand,
        worker_id: &str,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url("/api/queue/complete"))
            .json(&json!({
                "command_id": command.command_id,
                "worker_id": worker_id,
                "execution_id": command.execution_id.to_string(),
                "node_id": command.node_id,
                "attempt": command.step_attempt,
            }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn fail(
        &self,
        command: &ClaimedCommand,
        worker_id: &str,
        error: &str,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url("/api/queue/fail"))
            .json(&json!({
                "command_id": command.command_id,
                "worker_id": worker_id,
                "execution_id": command.execution_id.to_string(),
                "node_id": command.node_id,
                "error": error,
                "attempt": command.step_attempt,
            }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Post one event. The server stamps id and timestamp.
    pub async fn post_event(&self, event: &Event) -> Result<(), ClientError> {
        let body = json!({
            "execution_id": event.execution_id.to_string(),
            "event_type": event.event_type.as_str(),
            "node_id": event.node_id,
            "status": event.status.as_str(),
            "result": event.result,
            "meta": event.meta,
            "error": event.error,
            "loop_id": event.loop_id,
            "current_index": event.current_index,
            "worker_id": event.worker_id,
            "attempt": event.attempt,
        });
        let response = self
            .http
            .post(self.url("/api/events"))
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn fetch_credential(&self, name: &str) -> Result<Value, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/api/catalog/credentials/{name}")))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Trigger a child execution (the `playbook` tool).
    pub async fn run_playbook(
        &self,
        path: &str,
        version: Option<i64>,
        parameters: Option<&Value>,
        merge: bool,
        parent: Option<(i64, &str)>,
    ) -> Result<RunResponse, ClientError> {
        let (parent_execution_id, parent_step) = match parent {
            Some((id, step)) => (Some(id.to_string()), Some(step)),
            None => (None, None),
        };
        let response = self
            .http
            .post(self.url("/api/run/playbook"))
            .json(&RunRequest {
                path,
                version,
                parameters,
                merge,
                parent_execution_id,
                parent_step,
            })
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn execution_status(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionStatusResponse, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/api/executions/{execution_id}/status")))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
