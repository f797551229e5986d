use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::config::SiteConfig;
use crate::errors::SessionError;
use crate::session::manager::SessionManager;
use crate::session::rpc::MethodRegistry;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub registry: Arc<MethodRegistry>,
    pub sites: Vec<SiteConfig>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub site: String,
    #[serde(default)]
    pub hostname: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::NotFound(_) => ApiError::NotFound(message),
            SessionError::Busy | SessionError::InvalidState { .. } => ApiError::Conflict(message),
            SessionError::Configuration(_) | SessionError::InvalidRequest(_) => {
                ApiError::BadRequest(message)
            }
            _ => ApiError::Internal(message),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sites", get(list_sites))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_sites(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.sites.clone())
}

async fn list_sessions(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let sessions = state.manager.list().await?;
    Ok(Json(sessions))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let machine = state.manager.get(&id).await?;
    Ok(Json(machine.snapshot()))
}

/// Allocate a session for a registered site and push its configuration.
async fn create_session(
    State(state): State<SharedState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let site = state
        .sites
        .iter()
        .find(|s| s.key == req.site)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown site '{}'", req.site)))?;
    let config = site.session_config(req.hostname.as_deref().filter(|h| !h.trim().is_empty()));
    config.validate()?;

    let machine = state.manager.create().await?;
    let session = machine.configure(config).await?;
    tracing::info!(session_id = %session.id, site = %site.key, "session allocated for site");
    Ok((StatusCode::CREATED, Json(session)))
}
