//! `noetl execute <subcommand>`

use clap::Subcommand;
use serde_json::Value;

use crate::client::NoetlClient;
use crate::error::CliError;
use crate::output::{emit, field, Format};

#[derive(Subcommand)]
pub enum ExecuteCommand {
    /// Show the status of an execution
    Status {
        /// Execution id
        id: String,
    },

    /// Show the event log of an execution
    Events {
        /// Execution id
        id: String,
    },

    /// Cancel an execution
    Cancel {
        /// Execution id
        id: String,
    },

    /// List recent executions
    List,
}

pub async fn run(
    client: &NoetlClient,
    format: Format,
    command: ExecuteCommand,
) -> Result<(), CliError> {
    match command {
        ExecuteCommand::Status { id } => {
            let status = client.execution_status(&id).await?;
            emit(format, &status, |v| {
                let progress = &v["progress"];
                format!(
                    "execution {}\n  status: {}\n  current step: {}\n  steps: {}/{} completed, {} failed",
                    field(v, "execution_id"),
                    field(v, "status"),
                    field(v, "current_step"),
                    progress["completed_steps"].as_i64().unwrap_or(0),
                    progress["total_steps"].as_i64().unwrap_or(0),
                    progress["failed_steps"].as_i64().unwrap_or(0),
                )
            });
        }
        ExecuteCommand::Events { id } => {
            let detail = client.execution_detail(&id).await?;
            emit(format, &detail, |v| {
                let mut lines = vec![format!(
                    "execution {} [{}]",
                    field(v, "execution_id"),
                    field(v, "status")
                )];
                if let Some(events) = v.get("events").and_then(Value::as_array) {
                    for event in events {
                        lines.push(format!(
                            "  {}  {:<20} {:<14} {}",
                            field(event, "timestamp"),
                            field(event, "event_type"),
                            field(event, "status"),
                            field(event, "node_id"),
                        ));
                    }
                }
                lines.join("\n")
            });
        }
        ExecuteCommand::Cancel { id } => {
            let response = client.cancel_execution(&id).await?;
            emit(format, &response, |v| {
                format!("execution {} cancelled", field(v, "execution_id"))
            });
        }
        ExecuteCommand::List => {
            let list = client.list_executions().await?;
            emit(format, &list, |v| {
                let mut lines = vec![format!(
                    "{:<22} {:<12} {:<8} {}",
                    "EXECUTION", "STATUS", "VERSION", "PATH"
                )];
                if let Some(items) = v.as_array() {
                    for item in items {
                        lines.push(format!(
                            "{:<22} {:<12} {:<8} {}",
                            field(item, "execution_id"),
                            field(item, "status"),
                            item["version"].as_i64().unwrap_or(0),
                            field(item, "path"),
                        ));
                    }
                }
                lines.join("\n")
            });
        }
    }
    Ok(())
}
