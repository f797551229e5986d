use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use super::api::{self, AppState, SharedState};
use super::ws;
use crate::config::SitecraftToml;
use crate::session::credentials::{CredentialMinter, GitHubAppCredentials};
use crate::session::db::{SessionDb, SessionStore};
use crate::session::manager::{LocalEnvironmentFactory, SessionManager};
use crate::session::rpc::MethodRegistry;

/// Configuration for the HTTP listener.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4280,
            dev_mode: false,
        }
    }
}

/// Wire the store, credential source, environments and method registry
/// together from a loaded configuration.
pub fn build_state(config: &SitecraftToml) -> Result<SharedState> {
    let db_path = &config.server.db_path;
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let store = SessionStore::new(db_path).context("Failed to initialize session database")?;

    let minter = CredentialMinter::new(
        &config.github.api_base,
        Duration::from_secs(config.github.request_timeout_secs),
    )
    .context("Failed to build GitHub client")?;
    let credentials = GitHubAppCredentials::new(
        minter,
        config.github.app_id.clone(),
        config.private_key()?,
        config.github.installation_id.clone(),
    );

    let environments = LocalEnvironmentFactory::new(
        &config.environment.workspace_root,
        &config.environment.preview_url_template,
    );

    let manager = SessionManager::new(
        SessionDb::new(store),
        Arc::new(environments),
        Arc::new(credentials),
        config.pipeline_settings()?,
    );
    let registry = MethodRegistry::standard().context("Invalid RPC method registry")?;
    tracing::debug!(methods = ?registry.names(), "RPC methods registered");

    Ok(Arc::new(AppState {
        manager: Arc::new(manager),
        registry: Arc::new(registry),
        sites: config.sites.clone(),
    }))
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws/sessions/{id}", get(ws::ws_handler))
        .with_state(state)
}

pub async fn start_server(config: ServerConfig, state: SharedState) -> Result<()> {
    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, dev_mode = config.dev_mode, "sitecraft listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
