//! Configuration for sitecraft, read from `sitecraft.toml`.
//!
//! Layering: file values, then environment variables (a `.env` file is
//! loaded first by the binary), then CLI flags applied by the caller.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 4280
//! db_path = ".sitecraft/sessions.db"
//!
//! [github]
//! app_id = "123456"
//! installation_id = "7890"
//! private_key_path = "keys/app.pem"
//!
//! [environment]
//! workspace_root = ".sitecraft/workspaces"
//! repo_dir = "repo"
//! preview_url_template = "http://localhost:{port}"
//!
//! [provisioning]
//! install_command = "npm install"
//! dev_command = "npm run dev -- --host 0.0.0.0 --port {port}"
//!
//! [provisioning.env]
//! NODE_ENV = "development"
//!
//! [tool]
//! command = "claude --print --dangerously-skip-permissions"
//! config_path = ".claude/settings.json"
//!
//! [tool.overrides.permissions]
//! defaultMode = "acceptEdits"
//!
//! [[sites]]
//! key = "acme"
//! repo_owner = "acme"
//! repo_name = "site"
//! display_name = "Acme"
//! preview_port = 4321
//! hostname = "example.test"
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::session::credentials::GITHUB_API_BASE;
use crate::session::machine::PipelineSettings;
use crate::session::models::SessionConfig;

pub const CONFIG_FILE_NAME: &str = "sitecraft.toml";

const ENV_APP_ID: &str = "GITHUB_APP_ID";
const ENV_PRIVATE_KEY: &str = "GITHUB_APP_PRIVATE_KEY";
const ENV_INSTALLATION_ID: &str = "GITHUB_APP_INSTALLATION_ID";
const ENV_TOOL_CMD: &str = "SITECRAFT_TOOL_CMD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SitecraftToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub environment: EnvironmentSection,
    #[serde(default)]
    pub provisioning: ProvisioningSection,
    #[serde(default)]
    pub tool: ToolSection,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4280
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".sitecraft/sessions.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
        }
    }
}

/// GitHub App identity used to mint installation tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
    /// Inline PEM. Prefer `private_key_path` or `GITHUB_APP_PRIVATE_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String {
    GITHUB_API_BASE.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            app_id: None,
            installation_id: None,
            private_key: None,
            private_key_path: None,
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSection {
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default = "default_repo_dir")]
    pub repo_dir: String,
    /// Placeholders: `{port}`, `{hostname}`, `{token}`.
    #[serde(default = "default_preview_url_template")]
    pub preview_url_template: String,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".sitecraft/workspaces")
}

fn default_repo_dir() -> String {
    "repo".to_string()
}

fn default_preview_url_template() -> String {
    "http://localhost:{port}".to_string()
}

impl Default for EnvironmentSection {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            repo_dir: default_repo_dir(),
            preview_url_template: default_preview_url_template(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningSection {
    #[serde(default = "default_install_command")]
    pub install_command: String,
    #[serde(default = "default_dev_command")]
    pub dev_command: String,
    #[serde(default = "default_port_timeout_secs")]
    pub port_timeout_secs: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_checkout_timeout_secs")]
    pub checkout_timeout_secs: u64,
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_git_author_name")]
    pub git_author_name: String,
    #[serde(default = "default_git_author_email")]
    pub git_author_email: String,
    /// Shared variables injected before anything else runs.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_install_command() -> String {
    "npm install".to_string()
}

fn default_dev_command() -> String {
    "npm run dev -- --host 0.0.0.0 --port {port}".to_string()
}

fn default_port_timeout_secs() -> u64 {
    60
}

fn default_settle_delay_ms() -> u64 {
    2000
}

fn default_checkout_timeout_secs() -> u64 {
    300
}

fn default_install_timeout_secs() -> u64 {
    900
}

fn default_git_author_name() -> String {
    "sitecraft".to_string()
}

fn default_git_author_email() -> String {
    "sitecraft@users.noreply.github.com".to_string()
}

impl Default for ProvisioningSection {
    fn default() -> Self {
        Self {
            install_command: default_install_command(),
            dev_command: default_dev_command(),
            port_timeout_secs: default_port_timeout_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            checkout_timeout_secs: default_checkout_timeout_secs(),
            install_timeout_secs: default_install_timeout_secs(),
            git_author_name: default_git_author_name(),
            git_author_email: default_git_author_email(),
            env: BTreeMap::new(),
        }
    }
}

/// The code-modification tool run for every edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSection {
    #[serde(default = "default_tool_command")]
    pub command: String,
    /// Tool settings file inside the checkout that receives `overrides`.
    /// An empty string disables the merge step.
    #[serde(default = "default_tool_config_path")]
    pub config_path: String,
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_tool_overrides")]
    pub overrides: toml::Table,
}

fn default_tool_command() -> String {
    "claude --print --dangerously-skip-permissions".to_string()
}

fn default_tool_config_path() -> String {
    ".claude/settings.json".to_string()
}

fn default_tool_timeout_secs() -> u64 {
    1200
}

fn default_tool_overrides() -> toml::Table {
    let mut permissions = toml::Table::new();
    permissions.insert("defaultMode".into(), toml::Value::String("acceptEdits".into()));
    let mut overrides = toml::Table::new();
    overrides.insert("permissions".into(), toml::Value::Table(permissions));
    overrides
}

impl Default for ToolSection {
    fn default() -> Self {
        Self {
            command: default_tool_command(),
            config_path: default_tool_config_path(),
            timeout_secs: default_tool_timeout_secs(),
            overrides: default_tool_overrides(),
        }
    }
}

/// One preconfigured site a session can be created for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub key: String,
    pub repo_owner: String,
    pub repo_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub site_url: String,
    pub preview_port: u16,
    #[serde(default)]
    pub hostname: String,
}

impl SiteConfig {
    /// Session configuration for this site; `hostname` replaces the
    /// configured one when given.
    pub fn session_config(&self, hostname: Option<&str>) -> SessionConfig {
        SessionConfig {
            repo_owner: self.repo_owner.clone(),
            repo_name: self.repo_name.clone(),
            display_name: self.display_name.clone(),
            site_url: self.site_url.clone(),
            preview_port: self.preview_port,
            hostname: hostname.unwrap_or(&self.hostname).to_string(),
        }
    }
}

impl SitecraftToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse sitecraft.toml")
    }

    /// Load `path`, or defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize sitecraft.toml")?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment variable overrides on top of file values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(app_id) = set(ENV_APP_ID) {
            self.github.app_id = Some(app_id);
        }
        if let Some(installation_id) = set(ENV_INSTALLATION_ID) {
            self.github.installation_id = Some(installation_id);
        }
        if let Some(private_key) = set(ENV_PRIVATE_KEY) {
            self.github.private_key = Some(private_key);
        }
        if let Some(command) = set(ENV_TOOL_CMD) {
            self.tool.command = command;
        }
    }

    /// The app private key: inline value first, then `private_key_path`.
    pub fn private_key(&self) -> Result<Option<String>> {
        if let Some(key) = self.github.private_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Ok(Some(key.clone()));
        }
        match &self.github.private_key_path {
            Some(path) => std::fs::read_to_string(path)
                .map(Some)
                .with_context(|| format!("Failed to read private key: {}", path.display())),
            None => Ok(None),
        }
    }

    pub fn site(&self, key: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.key == key)
    }

    /// Settings handed to every session state machine.
    pub fn pipeline_settings(&self) -> Result<PipelineSettings> {
        let overrides = serde_json::to_value(&self.tool.overrides)
            .context("Failed to convert tool overrides to JSON")?;
        let config_path = self.tool.config_path.trim();
        Ok(PipelineSettings {
            repo_dir: self.environment.repo_dir.clone(),
            install_command: self.provisioning.install_command.clone(),
            dev_command: self.provisioning.dev_command.clone(),
            shared_env: self
                .provisioning
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
            git_author_name: self.provisioning.git_author_name.clone(),
            git_author_email: self.provisioning.git_author_email.clone(),
            checkout_timeout: Duration::from_secs(self.provisioning.checkout_timeout_secs),
            install_timeout: Duration::from_secs(self.provisioning.install_timeout_secs),
            port_timeout: Duration::from_secs(self.provisioning.port_timeout_secs),
            settle_delay: Duration::from_millis(self.provisioning.settle_delay_ms),
            tool_command: self.tool.command.clone(),
            tool_config_path: (!config_path.is_empty()).then(|| config_path.to_string()),
            tool_overrides: overrides,
            tool_timeout: Duration::from_secs(self.tool.timeout_secs),
        })
    }

    /// Copy safe to print: inline private key replaced by a marker.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.github.private_key.is_some() {
            copy.github.private_key = Some("<redacted>".to_string());
        }
        copy
    }

    /// Human-readable warnings; an empty list means the file looks usable.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.github.app_id.is_none() {
            warnings.push(format!(
                "github.app_id is not set (or {}); provisioning will fail",
                ENV_APP_ID
            ));
        }
        if self.github.installation_id.is_none() {
            warnings.push(format!(
                "github.installation_id is not set (or {}); provisioning will fail",
                ENV_INSTALLATION_ID
            ));
        }
        if self.github.private_key.is_none() && self.github.private_key_path.is_none() {
            warnings.push(format!(
                "No GitHub App private key configured (github.private_key_path or {})",
                ENV_PRIVATE_KEY
            ));
        }
        if let Some(path) = &self.github.private_key_path
            && !path.exists()
        {
            warnings.push(format!(
                "github.private_key_path does not exist: {}",
                path.display()
            ));
        }

        if !self.provisioning.dev_command.contains("{port}") {
            warnings.push(
                "provisioning.dev_command has no {port} placeholder; the dev server may not listen on the session port"
                    .to_string(),
            );
        }
        if self.environment.repo_dir.trim().is_empty() {
            warnings.push("environment.repo_dir must not be empty".to_string());
        }
        let template = &self.environment.preview_url_template;
        let stripped = template
            .replace("{port}", "")
            .replace("{hostname}", "")
            .replace("{token}", "");
        if stripped.contains('{') || stripped.contains('}') {
            warnings.push(format!(
                "environment.preview_url_template has an unknown placeholder: {}",
                template
            ));
        }

        let mut seen = HashSet::new();
        for site in &self.sites {
            if !seen.insert(site.key.as_str()) {
                warnings.push(format!("Duplicate site key '{}'", site.key));
            }
            if site.preview_port == 0 {
                warnings.push(format!("Site '{}' has preview_port 0", site.key));
            }
            if site.repo_owner.trim().is_empty() || site.repo_name.trim().is_empty() {
                warnings.push(format!("Site '{}' is missing repo_owner or repo_name", site.key));
            }
        }

        warnings
    }
}
