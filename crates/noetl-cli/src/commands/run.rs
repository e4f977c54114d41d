//! `noetl run <path> [--set k=v ...]`

use std::time::Duration;

use serde_json::{Map, Value};

use crate::client::NoetlClient;
use crate::error::CliError;
use crate::output::{emit, field, Format};

const WATCH_INTERVAL: Duration = Duration::from_millis(750);

pub async fn run(
    client: &NoetlClient,
    format: Format,
    path: &str,
    version: Option<i64>,
    set: &[String],
    merge: bool,
    watch: bool,
) -> Result<(), CliError> {
    let parameters = parse_set(set)?;

    let response = client
        .run_playbook(path, version, Value::Object(parameters), merge)
        .await?;
    let execution_id = field(&response, "execution_id").to_string();

    emit(format, &response, |v| {
        format!("execution {} started", field(v, "execution_id"))
    });

    if !watch {
        return Ok(());
    }

    loop {
        tokio::time::sleep(WATCH_INTERVAL).await;
        let status = client.execution_status(&execution_id).await?;
        let state = field(&status, "status").to_string();

        match state.as_str() {
            "COMPLETED" => {
                emit(format, &status, |v| {
                    format!("execution {} completed", field(v, "execution_id"))
                });
                return Ok(());
            }
            "FAILED" => {
                emit(format, &status, |v| {
                    format!(
                        "execution {} failed: {}",
                        field(v, "execution_id"),
                        field(v, "error")
                    )
                });
                return Err(CliError::User(format!("execution {execution_id} failed")));
            }
            "CANCELLED" => {
                emit(format, &status, |v| {
                    format!("execution {} cancelled", field(v, "execution_id"))
                });
                return Err(CliError::User(format!(
                    "execution {execution_id} cancelled"
                )));
            }
            _ => continue,
        }
    }
}

/// Parse `--set key=value` pairs; values parse as JSON when they can,
/// otherwise stay strings.
fn parse_set(pairs: &[String]) -> Result<Map<String, Value>, CliError> {
    let mut out = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| CliError::User(format!("--set expects key=value, got '{pair}'")))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        out.insert(key.to_string(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_json_and_string() {
        let pairs = vec![
            "count=3".to_string(),
            "name=alice".to_string(),
            "flags=[1,2]".to_string(),
        ];
        let out = parse_set(&pairs).unwrap();
        assert_eq!(out["count"], Value::from(3));
        assert_eq!(out["name"], Value::from("alice"));
        assert_eq!(out["flags"], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_parse_set_rejects_bare_keys() {
        assert!(parse_set(&["oops".to_string()]).is_err());
    }
}
