//! HTTP tool.
//!
//! Spec: `{url, method?, headers?, params?, payload?}`. Args merge into
//! query params for GET-like methods and into the JSON payload
//! otherwise. Non-2xx responses are tool errors; connection problems are
//! transport errors so `retry.on: [transport]` can target them.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{Tool, ToolCall, ToolError, ToolErrorKind};

pub struct HttpTool {
    client: reqwest::Client,
}

impl HttpTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTool {
    fn default() -> Self {
        Self::new()
    }
}

fn string_map(value: Option<&Value>) -> Map<String, Value> {
    value
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn execute(&self, call: ToolCall<'_>) -> Result<Value, ToolError> {
        let url = call
            .spec
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::tool("http: spec.url is required"))?;
        let method = call
            .spec
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ToolError::tool(format!("http: invalid method '{method}'")))?;
        let is_bodyless = matches!(
            method,
            reqwest::Method::GET | reqwest::Method::HEAD | reqwest::Method::DELETE
        );

        let mut request = self.client.request(method, url);

        for (name, value) in string_map(call.spec.get("headers")) {
            if let Some(v) = value.as_str() {
                request = request.header(name, v);
            }
        }

        // Bearer auth from resolved credentials when the spec asks.
        if let Some(alias) = call.spec.get("auth").and_then(Value::as_str) {
            if let Some(token) = call
                .credentials
                .get(alias)
                .and_then(|c| c.get("token"))
                .and_then(Value::as_str)
            {
                request = request.bearer_auth(token);
            }
        }

        let mut params = string_map(call.spec.get("params"));
        let mut payload = call.spec.get("payload").cloned();
        if let Some(args) = call.args.as_object() {
            if is_bodyless {
                for (k, v) in args {
                    params.insert(k.clone(), v.clone());
                }
            } else {
                let body = payload.get_or_insert_with(|| json!({}));
                if let Some(obj) = body.as_object_mut() {
                    for (k, v) in args {
                        obj.insert(k.clone(), v.clone());
                    }
                }
            }
        }

        if !params.is_empty() {
            let query: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| {
                    let rendered = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), rendered)
                })
                .collect();
            request = request.query(&query);
        }
        if let Some(body) = &payload {
            request = request.json(body);
        }

        let started = Instant::now();
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::new(ToolErrorKind::Timeout, format!("http: {e}"))
            } else {
                ToolError::transport(format!("http: {e}"))
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::transport(format!("http: {e}")))?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let body: Value =
            serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.clone()));

        if !status.is_success() {
            return Err(ToolError::tool(format!(
                "http: {} returned {}",
                url,
                status.as_u16()
            )));
        }

        Ok(json!({
            "status": status.as_u16(),
            "body": body,
            "elapsed_ms": elapsed_ms,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_url_is_tool_error() {
        let spec = json!({"method": "GET"});
        let args = json!({});
        let creds = json!({});
        let ctx = json!({});
        let err = HttpTool::new()
            .execute(ToolCall {
                spec: &spec,
                args: &args,
                credentials: &creds,
                context: &ctx,
                execution_id: 1,
                node_id: "fetch",
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Tool);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let spec = json!({"url": "http://127.0.0.1:1/nothing"});
        let args = json!({});
        let creds = json!({});
        let ctx = json!({});
        let err = HttpTool::new()
            .execute(ToolCall {
                spec: &spec,
                args: &args,
                credentials: &creds,
                context: &ctx,
                execution_id: 1,
                node_id: "fetch",
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Transport);
    }
}
