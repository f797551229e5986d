//! Credential check command: `sitecraft mint-token`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sitecraft::config::SitecraftToml;
use sitecraft::session::credentials::{CredentialMinter, CredentialSource, GitHubAppCredentials};

/// Mint one installation token to prove the app settings work. The token
/// itself is never printed.
pub async fn cmd_mint_token(config_path: &Path) -> Result<()> {
    let mut config = SitecraftToml::load_or_default(config_path)?;
    config.apply_env();

    let minter = CredentialMinter::new(
        &config.github.api_base,
        Duration::from_secs(config.github.request_timeout_secs),
    )?;
    let credentials = GitHubAppCredentials::new(
        minter,
        config.github.app_id.clone(),
        config.private_key()?,
        config.github.installation_id.clone(),
    );

    let credential = credentials
        .mint()
        .await
        .context("Failed to mint installation token")?;
    println!(
        "Installation token minted; expires at {}",
        credential.expires_at.to_rfc3339()
    );
    Ok(())
}
