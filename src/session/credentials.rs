//! GitHub App installation tokens.
//!
//! Minting is two steps: sign a short RS256 app assertion with the app's
//! private key, then trade it for an installation-scoped access token. The
//! token and the key never reach the logs; only the exchange status and body do.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use super::models::Credential;
use crate::errors::CredentialError;

pub const GITHUB_API_BASE: &str = "https://api.github.com";

/// Clock-skew allowance applied to `iat`.
const ASSERTION_BACKDATE_SECS: i64 = 60;
/// GitHub refuses app assertions that live longer than ten minutes.
const ASSERTION_LIFETIME_SECS: i64 = 600;

/// Claims of the signed app assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

impl AssertionClaims {
    pub fn new(app_id: &str, now: i64) -> Self {
        Self {
            iat: now - ASSERTION_BACKDATE_SECS,
            exp: now + ASSERTION_LIFETIME_SECS,
            iss: app_id.to_string(),
        }
    }
}

/// Sign an app assertion with a PEM-encoded RSA private key (PKCS#8 or PKCS#1).
pub fn sign_assertion(
    app_id: &str,
    private_key_pem: &str,
    now: i64,
) -> Result<String, CredentialError> {
    let key = EncodingKey::from_rsa_pem(normalize_pem(private_key_pem).as_bytes())
        .map_err(CredentialError::Signing)?;
    let claims = AssertionClaims::new(app_id, now);
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(CredentialError::Signing)
}

/// Keys passed through environment variables often arrive with literal `\n`.
fn normalize_pem(pem: &str) -> String {
    if pem.contains("\\n") && !pem.contains('\n') {
        pem.replace("\\n", "\n")
    } else {
        pem.to_string()
    }
}

fn required<'a>(value: Option<&'a str>, name: &'static str) -> Result<&'a str, CredentialError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(CredentialError::Configuration(name))
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Exchanges signed app assertions for installation access tokens.
#[derive(Debug, Clone)]
pub struct CredentialMinter {
    client: reqwest::Client,
    api_base: String,
}

impl CredentialMinter {
    pub fn new(api_base: &str, request_timeout: Duration) -> Result<Self, CredentialError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("sitecraft/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(CredentialError::Request)?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Mint an installation token. Single attempt: a failure here is almost
    /// always misconfiguration and would fail the same way on retry.
    pub async fn mint(
        &self,
        app_id: Option<&str>,
        private_key: Option<&str>,
        installation_id: Option<&str>,
    ) -> Result<Credential, CredentialError> {
        let app_id = required(app_id, "app_id")?;
        let private_key = required(private_key, "private_key")?;
        let installation_id = required(installation_id, "installation_id")?;

        let assertion = sign_assertion(app_id, private_key, Utc::now().timestamp())?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", assertion))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .map_err(CredentialError::Request)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                installation_id,
                body = %body,
                "installation token exchange rejected"
            );
            return Err(CredentialError::Auth {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: AccessTokenResponse = resp
            .json()
            .await
            .map_err(|e| CredentialError::InvalidResponse(e.to_string()))?;
        tracing::info!(installation_id, "minted installation token");
        Ok(Credential::new(parsed.token, parsed.expires_at))
    }
}

/// Source of credentials for the provisioning pipeline.
/// Real implementation: `GitHubAppCredentials`; tests substitute their own.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn mint(&self) -> Result<Credential, CredentialError>;
}

/// App settings bound to a minter. Missing values are kept as `None` so the
/// failure surfaces as a configuration error at the step that needs them.
pub struct GitHubAppCredentials {
    minter: CredentialMinter,
    app_id: Option<String>,
    private_key: Option<String>,
    installation_id: Option<String>,
}

impl GitHubAppCredentials {
    pub fn new(
        minter: CredentialMinter,
        app_id: Option<String>,
        private_key: Option<String>,
        installation_id: Option<String>,
    ) -> Self {
        Self {
            minter,
            app_id,
            private_key,
            installation_id,
        }
    }
}

#[async_trait]
impl CredentialSource for GitHubAppCredentials {
    async fn mint(&self) -> Result<Credential, CredentialError> {
        self.minter
            .mint(
                self.app_id.as_deref(),
                self.private_key.as_deref(),
                self.installation_id.as_deref(),
            )
            .await
    }
}
