//! HTTP client for the CLI commands.

use serde_json::{json, Value};

use crate::error::CliError;

pub struct NoetlClient {
    base_url: String,
    http: reqwest::Client,
}

impl NoetlClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<Value, CliError> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            return Ok(body);
        }

        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string();

        Err(match status.as_u16() {
            422 => CliError::Validation(message),
            400..=499 => CliError::User(message),
            _ => CliError::System(format!("server error ({status}): {message}")),
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, CliError> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| CliError::System(format!("cannot reach server: {e}")))?;
        Self::check(response).await
    }

    async fn get(&self, path: &str) -> Result<Value, CliError> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| CliError::System(format!("cannot reach server: {e}")))?;
        Self::check(response).await
    }

    pub async fn register_playbook(
        &self,
        path: &str,
        version: Option<i64>,
        content: &str,
    ) -> Result<Value, CliError> {
        self.post(
            "/api/catalog/playbooks",
            &json!({ "path": path, "version": version, "content": content }),
        )
        .await
    }

    pub async fn run_playbook(
        &self,
        path: &str,
        version: Option<i64>,
        parameters: Value,
        merge: bool,
    ) -> Result<Value, CliError> {
        self.post(
            "/api/run/playbook",
            &json!({
                "path": path,
                "version": version,
                "parameters": parameters,
                "merge": merge,
            }),
        )
        .await
    }

    pub async fn execution_status(&self, execution_id: &str) -> Result<Value, CliError> {
        self.get(&format!("/api/executions/{execution_id}/status"))
            .await
    }

    pub async fn execution_detail(&self, execution_id: &str) -> Result<Value, CliError> {
        self.get(&format!("/api/executions/{execution_id}")).await
    }

    pub async fn cancel_execution(&self, execution_id: &str) -> Result<Value, CliError> {
        self.post(&format!("/api/executions/{execution_id}/cancel"), &json!({}))
            .await
    }

    pub async fn list_executions(&self) -> Result<Value, CliError> {
        self.get("/api/executions").await
    }
}
