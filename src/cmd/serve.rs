//! HTTP and WebSocket server command: `sitecraft serve`.

use std::path::Path;

use anyhow::Result;
use sitecraft::config::SitecraftToml;
use sitecraft::web::server::{ServerConfig, build_state, start_server};

pub async fn cmd_serve(
    config_path: &Path,
    host: Option<String>,
    port: Option<u16>,
    dev: bool,
) -> Result<()> {
    let mut config = SitecraftToml::load_or_default(config_path)?;
    config.apply_env();

    for warning in config.validate() {
        tracing::warn!(%warning, "configuration warning");
    }
    tracing::info!(
        config = %config_path.display(),
        sites = config.sites.len(),
        "configuration loaded"
    );

    let state = build_state(&config)?;
    start_server(
        ServerConfig {
            host: host.unwrap_or_else(|| config.server.host.clone()),
            port: port.unwrap_or(config.server.port),
            dev_mode: dev,
        },
        state,
    )
    .await
}
