//! Web UI routes
//!
//! Handlers for the dashboard page and the JSON API. Every mutation takes the
//! write lock so two requests never interleave a load and a save.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::SharedState;
use crate::clients::partial_md5;
use crate::models::{Mapping, MappingStatus, Suggestion, SuggestionState, SyncStateDb};
use crate::store::StoreError;

/// Error body: `{"error": "..."}`
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Dashboard page
pub async fn index() -> impl IntoResponse {
    Html(include_str!("index.html"))
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

// === API Endpoints ===

#[derive(Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub hostname: String,
    pub uptime_secs: u64,
    pub mappings: BTreeMap<String, usize>,
    pub storyteller_configured: bool,
    pub hardcover_configured: bool,
}

fn status_name(status: MappingStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", status))
}

/// GET /api/status
pub async fn api_status(State(state): State<SharedState>) -> Result<Json<StatusResponse>, ApiError> {
    let state = state.read().await;
    let db = state.mappings.load_or_default()?;

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
        uptime_secs: state.started_at.elapsed().as_secs(),
        mappings: db
            .count_by_status()
            .into_iter()
            .map(|(status, n)| (status_name(status), n))
            .collect(),
        storyteller_configured: state.storyteller_configured,
        hardcover_configured: state.hardcover_configured,
    }))
}

/// GET /api/mappings
pub async fn api_list_mappings(State(state): State<SharedState>) -> Result<Json<Vec<Mapping>>, ApiError> {
    let state = state.read().await;
    Ok(Json(state.mappings.load_or_default()?.mappings))
}

/// POST /api/mappings
#[derive(Debug, Deserialize)]
pub struct CreateMappingRequest {
    pub abs_id: String,
    #[serde(default)]
    pub abs_title: Option<String>,
    pub ebook_filename: String,
    #[serde(default)]
    pub kosync_doc_id: Option<String>,
}

pub async fn api_create_mapping(
    State(state): State<SharedState>,
    Json(req): Json<CreateMappingRequest>,
) -> Result<(StatusCode, Json<Mapping>), ApiError> {
    let state = state.write().await;

    if req.abs_id.trim().is_empty() {
        return Err(ApiError::BadRequest("abs_id is required".to_string()));
    }
    let mapping = new_mapping(
        &state.ebooks,
        &req.abs_id,
        req.abs_title.as_deref(),
        &req.ebook_filename,
        req.kosync_doc_id.as_deref(),
    )?;

    let mut db = state.mappings.load_or_default()?;
    if db.find(&mapping.abs_id).is_some() {
        return Err(ApiError::Conflict(format!("{} is already mapped", mapping.abs_id)));
    }
    db.mappings.push(mapping.clone());
    state.mappings.save(&db)?;

    info!(abs_id = %mapping.abs_id, ebook = %mapping.ebook_filename, doc_id = %mapping.kosync_doc_id, "Mapping created");
    Ok((StatusCode::CREATED, Json(mapping)))
}

/// Validate the ebook and fill in the title and document id
fn new_mapping(
    ebooks: &crate::ebook::EbookParser,
    abs_id: &str,
    abs_title: Option<&str>,
    ebook_filename: &str,
    kosync_doc_id: Option<&str>,
) -> Result<Mapping, ApiError> {
    if ebook_filename.is_empty() || ebook_filename.contains('/') || ebook_filename.contains('\\') {
        return Err(ApiError::BadRequest(format!("Invalid ebook filename: {}", ebook_filename)));
    }
    let path = ebooks
        .find_epub(ebook_filename)
        .ok_or_else(|| ApiError::NotFound(format!("Ebook not found: {}", ebook_filename)))?;

    let doc_id = match kosync_doc_id.filter(|d| !d.trim().is_empty()) {
        Some(d) => d.to_string(),
        None => partial_md5(&path).map_err(|e| ApiError::Internal(e.to_string()))?,
    };

    let title = match abs_title.filter(|t| !t.trim().is_empty()) {
        Some(t) => t.to_string(),
        None => std::path::Path::new(ebook_filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| ebook_filename.to_string()),
    };

    Ok(Mapping::new_pending(abs_id, title, doc_id, ebook_filename))
}

/// DELETE /api/mappings/:abs_id
pub async fn api_delete_mapping(
    State(state): State<SharedState>,
    Path(abs_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let state = state.write().await;

    let mut db = state.mappings.load_or_default()?;
    let before = db.mappings.len();
    db.mappings.retain(|m| m.abs_id != abs_id);
    if db.mappings.len() == before {
        return Err(ApiError::NotFound(format!("No mapping for {}", abs_id)));
    }
    state.mappings.save(&db)?;

    let mut sync_state = state.state.load_or_default()?;
    if sync_state.remove(&abs_id).is_some() {
        state.state.save(&sync_state)?;
    }

    info!(%abs_id, "Mapping deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/mappings/:abs_id/retry
pub async fn api_retry_mapping(
    State(state): State<SharedState>,
    Path(abs_id): Path<String>,
) -> Result<Json<Mapping>, ApiError> {
    let state = state.write().await;

    let mut db = state.mappings.load_or_default()?;
    let mapping = db
        .find_mut(&abs_id)
        .ok_or_else(|| ApiError::NotFound(format!("No mapping for {}", abs_id)))?;

    match mapping.status {
        MappingStatus::FailedRetryLater | MappingStatus::Crashed => {
            mapping.status = MappingStatus::Pending;
        }
        other => {
            return Err(ApiError::Conflict(format!(
                "Mapping is {}, only failed mappings can be retried",
                status_name(other)
            )))
        }
    }
    let mapping = mapping.clone();
    state.mappings.save(&db)?;

    info!(%abs_id, "Mapping queued for retry");
    Ok(Json(mapping))
}

/// GET /api/state
pub async fn api_state(State(state): State<SharedState>) -> Result<Json<SyncStateDb>, ApiError> {
    let state = state.read().await;
    Ok(Json(state.state.load_or_default()?))
}

#[derive(Serialize)]
pub struct SuggestionEntry {
    pub key: String,
    #[serde(flatten)]
    pub suggestion: Suggestion,
}

/// GET /api/suggestions - pending only, best score first
pub async fn api_suggestions(
    State(state): State<SharedState>,
) -> Result<Json<Vec<SuggestionEntry>>, ApiError> {
    let state = state.read().await;
    let db = state.suggestions.load_or_default()?;

    let mut pending: Vec<SuggestionEntry> = db
        .into_iter()
        .filter(|(_, s)| s.state == SuggestionState::Pending)
        .map(|(key, suggestion)| SuggestionEntry { key, suggestion })
        .collect();
    pending.sort_by(|a, b| {
        b.suggestion
            .score
            .total_cmp(&a.suggestion.score)
            .then_with(|| a.key.cmp(&b.key))
    });

    Ok(Json(pending))
}

/// POST /api/suggestions/:key/dismiss
pub async fn api_dismiss_suggestion(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let state = state.write().await;

    let mut db = state.suggestions.load_or_default()?;
    let suggestion = db
        .get_mut(&key)
        .ok_or_else(|| ApiError::NotFound(format!("No suggestion {}", key)))?;
    suggestion.state = SuggestionState::Dismissed;
    state.suggestions.save(&db)?;

    info!(%key, "Suggestion dismissed");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/suggestions/:key/accept
pub async fn api_accept_suggestion(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<(StatusCode, Json<Mapping>), ApiError> {
    let state = state.write().await;

    let mut suggestions = state.suggestions.load_or_default()?;
    let suggestion = suggestions
        .get_mut(&key)
        .ok_or_else(|| ApiError::NotFound(format!("No suggestion {}", key)))?;
    if suggestion.state != SuggestionState::Pending {
        return Err(ApiError::Conflict(format!("Suggestion {} is no longer pending", key)));
    }
    let (abs_id, title, ebook) = suggestion
        .mapping_parts()
        .ok_or_else(|| ApiError::BadRequest(format!("Suggestion {} has no ebook to map", key)))?;

    let mut db = state.mappings.load_or_default()?;
    if db.find(&abs_id).is_some() {
        return Err(ApiError::Conflict(format!("{} is already mapped", abs_id)));
    }
    let mapping = new_mapping(&state.ebooks, &abs_id, Some(&title), &ebook, None)?;
    db.mappings.push(mapping.clone());
    state.mappings.save(&db)?;

    suggestion.state = SuggestionState::Accepted;
    state.suggestions.save(&suggestions)?;

    info!(%key, abs_id = %mapping.abs_id, ebook = %mapping.ebook_filename, "Suggestion accepted");
    Ok((StatusCode::CREATED, Json(mapping)))
}

