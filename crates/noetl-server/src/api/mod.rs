//! REST, GraphQL, and SSE surface.

pub mod catalog;
pub mod error;
pub mod events;
pub mod executions;
pub mod graphql;
pub mod queue;
pub mod runs;
pub mod sanitize;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use noetl_storage::Store;

use crate::engine::Scheduler;

pub use error::ApiError;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler<dyn Store>>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler<dyn Store>>) -> Self {
        Self { scheduler }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    shard_index: u32,
    shard_count: u32,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let config = state.scheduler.config();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        shard_index: config.shard_index,
        shard_count: config.shard_count,
    })
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    let schema = graphql::build_schema(state.clone());

    Router::new()
        .route("/health", get(health))
        .route("/api/catalog/playbooks", post(catalog::register_playbook))
        .route("/api/catalog/playbooks/fetch", get(catalog::fetch_playbook))
        .route(
            "/api/catalog/credentials",
            post(catalog::register_credential),
        )
        .route(
            "/api/catalog/credentials/{name}",
            get(catalog::fetch_credential),
        )
        .route("/api/run/playbook", post(runs::run_playbook))
        .route("/api/executions", get(executions::list_executions))
        .route("/api/executions/{id}", get(executions::get_execution))
        .route("/api/executions/{id}/status", get(executions::get_status))
        .route("/api/executions/{id}/cancel", post(executions::cancel))
        .route("/api/events", post(events::ingest))
        .route("/events", get(events::stream))
        .route("/api/queue/claim", post(queue::claim))
        .route("/api/queue/heartbeat", post(queue::heartbeat))
        .route("/api/queue/complete", post(queue::complete))
        .route("/api/queue/fail", post(queue::fail))
        .route("/api/queue/release", post(queue::release))
        .route("/api/graphql", post(graphql::handler))
        .layer(axum::Extension(schema))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}
