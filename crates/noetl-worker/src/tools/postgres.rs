//! Postgres tool.
//!
//! Spec: `{connection?, auth?, query}`. The connection string comes from
//! the spec directly or from a resolved credential's `data.url`. Query
//! results come back as `{rows: [...], row_count}` with best-effort
//! column decoding.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Column, Row, TypeInfo};

use super::{Tool, ToolCall, ToolError, ToolErrorKind};

pub struct PostgresTool;

fn connection_string(call: &ToolCall<'_>) -> Result<String, ToolError> {
    if let Some(conn) = call.spec.get("connection").and_then(Value::as_str) {
        return Ok(conn.to_string());
    }
    if let Some(alias) = call.spec.get("auth").and_then(Value::as_str) {
        if let Some(url) = call
            .credentials
            .get(alias)
            .and_then(|c| c.get("url"))
            .and_then(Value::as_str)
        {
            return Ok(url.to_string());
        }
    }
    Err(ToolError::tool(
        "postgres: spec.connection or a credential with data.url is required",
    ))
}

fn decode_column(row: &sqlx::postgres::PgRow, index: usize) -> Value {
    let column = &row.columns()[index];
    match column.type_info().name() {
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "FLOAT4" | "FLOAT8" | "NUMERIC" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(index)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
    }
}

#[async_trait]
impl Tool for PostgresTool {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn execute(&self, call: ToolCall<'_>) -> Result<Value, ToolError> {
        let query = call
            .spec
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::tool("postgres: spec.query is required"))?;
        let connection = connection_string(&call)?;

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&connection)
            .await
            .map_err(|e| ToolError::new(ToolErrorKind::Transport, format!("postgres: {e}")))?;

        let rows = sqlx::query(query)
            .fetch_all(&pool)
            .await
            .map_err(|e| ToolError::tool(format!("postgres: {e}")))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut object = Map::new();
            for (index, column) in row.columns().iter().enumerate() {
                object.insert(column.name().to_string(), decode_column(row, index));
            }
            out.push(Value::Object(object));
        }

        pool.close().await;
        Ok(json!({ "row_count": out.len(), "rows": out }))
    }
}
