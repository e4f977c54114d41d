//! Catalog handlers: playbook and credential registration.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use noetl_core::ids::content_hash;
use noetl_core::{validate_playbook, Playbook};
use noetl_storage::{CatalogKind, CatalogStore, NewCatalogEntry};

use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct RegisterPlaybookRequest {
    pub path: String,
    #[serde(default)]
    pub version: Option<i64>,
    /// The playbook YAML document.
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub path: String,
    pub version: i64,
    pub content_hash: String,
}

/// POST /api/catalog/playbooks
///
/// Parses and validates the DSL before anything is stored; validation
/// problems come back synchronously as 422.
pub async fn register_playbook(
    State(state): State<AppState>,
    Json(request): Json<RegisterPlaybookRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    if request.path.trim().is_empty() {
        return Err(ApiError::Validation("path must not be empty".to_string()));
    }

    let playbook = Playbook::from_yaml(&request.content)?;
    validate_playbook(&playbook)?;

    let entry = state
        .scheduler
        .store()
        .register(NewCatalogEntry {
            kind: CatalogKind::Playbook,
            path: request.path,
            version: request.version,
            content_hash: content_hash(&request.content),
            content: request.content,
        })
        .await?;

    info!(path = %entry.path, version = entry.version, "playbook registered");
    Ok(Json(RegisterResponse {
        path: entry.path,
        version: entry.version,
        content_hash: entry.content_hash,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FetchPlaybookQuery {
    pub path: String,
    #[serde(default)]
    pub version: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PlaybookResponse {
    pub path: String,
    pub version: i64,
    pub content: String,
    pub content_hash: String,
}

/// GET /api/catalog/playbooks/fetch?path=...&version=...
pub async fn fetch_playbook(
    State(state): State<AppState>,
    Query(query): Query<FetchPlaybookQuery>,
) -> Result<Json<PlaybookResponse>, ApiError> {
    let entry = state
        .scheduler
        .store()
        .fetch(CatalogKind::Playbook, &query.path, query.version)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("playbook {}", query.path)))?;

    Ok(Json(PlaybookResponse {
        path: entry.path,
        version: entry.version,
        content: entry.content,
        content_hash: entry.content_hash,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterCredentialRequest {
    pub name: String,
    #[serde(default, rename = "type")]
    pub credential_type: Option<String>,
    /// Opaque credential payload; never logged.
    pub data: serde_json::Value,
}

/// POST /api/catalog/credentials
pub async fn register_credential(
    State(state): State<AppState>,
    Json(request): Json<RegisterCredentialRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::Validation("name must not be empty".to_string()));
    }

    let content = serde_json::to_string(&serde_json::json!({
        "type": request.credential_type,
        "data": request.data,
    }))
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    let entry = state
        .scheduler
        .store()
        .register(NewCatalogEntry {
            kind: CatalogKind::Credential,
            path: request.name,
            version: None,
            content_hash: content_hash(&content),
            content,
        })
        .await?;

    info!(name = %entry.path, version = entry.version, "credential registered");
    Ok(Json(RegisterResponse {
        path: entry.path,
        version: entry.version,
        content_hash: entry.content_hash,
    }))
}

#[derive(Debug, Serialize)]
pub struct CredentialResponse {
    pub name: String,
    #[serde(rename = "type")]
    pub credential_type: Option<String>,
    pub data: serde_json::Value,
}

/// GET /api/catalog/credentials/{name}
///
/// Worker-facing: resolves credentials referenced by name from
/// playbooks.
pub async fn fetch_credential(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CredentialResponse>, ApiError> {
    let entry = state
        .scheduler
        .store()
        .fetch(CatalogKind::Credential, &name, None)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("credential {name}")))?;

    let parsed: serde_json::Value = serde_json::from_str(&entry.content)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(CredentialResponse {
        name: entry.path,
        credential_type: parsed
            .get("type")
            .and_then(|v| v.as_str())
            .map(String::from),
        data: parsed.get("data").cloned().unwrap_or_default(),
    }))
}
