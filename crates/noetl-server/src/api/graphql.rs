//! GraphQL surface.
//!
//! Mirrors the REST run/status operations for clients that prefer a
//! single endpoint.

use async_graphql::{Context, EmptySubscription, Object, Schema, SimpleObject, ID};
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::Extension;
use uuid::Uuid;

use noetl_storage::EventStore;

use super::AppState;
use crate::services::executions;

pub type AppSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

/// A playbook execution instance.
#[derive(SimpleObject, Clone, Debug)]
pub struct Execution {
    /// Execution identifier, usable with `executionStatus`.
    pub execution_id: ID,
    /// Current status (`RUNNING`, `COMPLETED`, `FAILED`, `CANCELLED`).
    pub status: String,
    /// Correlation id for this request.
    pub request_id: String,
}

#[derive(SimpleObject, Clone, Debug)]
pub struct ExecutionStatus {
    pub execution_id: ID,
    pub status: String,
    pub completed: bool,
    pub failed: bool,
    pub current_step: Option<String>,
    pub total_steps: i64,
    pub completed_steps: i64,
    pub failed_steps: i64,
    /// Recent events, JSON-encoded.
    pub events: Vec<String>,
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// Status and progress of one execution.
    async fn execution_status(
        &self,
        ctx: &Context<'_>,
        execution_id: String,
    ) -> async_graphql::Result<ExecutionStatus> {
        let state = ctx.data::<AppState>()?;
        let id: i64 = execution_id
            .parse()
            .map_err(|_| async_graphql::Error::new("invalid execution id"))?;

        let store = state.scheduler.store();
        let record = store
            .get_execution(id)
            .await
            .map_err(|e| async_graphql::Error::new(e.to_string()))?
            .ok_or_else(|| async_graphql::Error::new(format!("execution {id} not found")))?;

        let view = executions::status(store.as_ref(), &record)
            .await
            .map_err(|e| async_graphql::Error::new(e.to_string()))?;

        let events = store
            .load_events_page(id, 0, 100)
            .await
            .map_err(|e| async_graphql::Error::new(e.to_string()))?
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect();

        Ok(ExecutionStatus {
            execution_id: ID(view.execution_id),
            status: view.status.to_string(),
            completed: view.completed,
            failed: view.failed,
            current_step: view.current_step,
            total_steps: view.progress.total_steps,
            completed_steps: view.progress.completed_steps,
            failed_steps: view.progress.failed_steps,
            events,
        })
    }
}

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    /// Start an execution of a registered playbook.
    async fn execute_playbook(
        &self,
        ctx: &Context<'_>,
        name: String,
        variables: Option<async_graphql::Json<serde_json::Value>>,
        client_id: Option<String>,
    ) -> async_graphql::Result<Execution> {
        let state = ctx.data::<AppState>()?;
        let request_id = client_id.unwrap_or_else(|| Uuid::now_v7().to_string());

        let execution_id = state
            .scheduler
            .start_execution(&name, None, variables.map(|v| v.0), false, None)
            .await
            .map_err(|e| async_graphql::Error::new(e.to_string()))?;

        Ok(Execution {
            execution_id: ID(execution_id.to_string()),
            status: "RUNNING".to_string(),
            request_id,
        })
    }
}

pub fn build_schema(state: AppState) -> AppSchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(state)
        .finish()
}

/// POST /api/graphql
pub async fn handler(
    Extension(schema): Extension<AppSchema>,
    request: GraphQLRequest,
) -> GraphQLResponse {
    schema.execute(request.into_inner()).await.into()
}
