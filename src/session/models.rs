use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Unconfigured,
    Configuring,
    Provisioning,
    Ready,
    Editing,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Configuring => "configuring",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Editing => "editing",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unconfigured" => Ok(Self::Unconfigured),
            "configuring" => Ok(Self::Configuring),
            "provisioning" => Ok(Self::Provisioning),
            "ready" => Ok(Self::Ready),
            "editing" => Ok(Self::Editing),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// One completed edit request. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditEntry {
    pub prompt: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
}

/// The durable session record. Snapshots of this struct are what observers
/// receive and what the store persists; there are no partial updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub hostname: String,
    pub display_name: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub site_url: String,
    pub preview_url: Option<String>,
    pub preview_port: u16,
    pub is_provisioned: bool,
    pub edits: Vec<EditEntry>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: SessionStatus::Unconfigured,
            hostname: String::new(),
            display_name: String::new(),
            repo_owner: String::new(),
            repo_name: String::new(),
            site_url: String::new(),
            preview_url: None,
            preview_port: 0,
            is_provisioned: false,
            edits: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }

    /// Timestamp for the next edit entry: never earlier than the previous one,
    /// so the sequence stays non-decreasing even if the wall clock steps back.
    pub fn next_edit_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.edits.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        }
    }
}

/// Initial configuration pushed into a session by the site registry or a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(alias = "owner")]
    pub repo_owner: String,
    #[serde(alias = "repo")]
    pub repo_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub site_url: String,
    #[serde(alias = "port")]
    pub preview_port: u16,
    pub hostname: String,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.repo_owner.trim().is_empty() {
            return Err(SessionError::Configuration("repository owner is required".into()));
        }
        if self.repo_name.trim().is_empty() {
            return Err(SessionError::Configuration("repository name is required".into()));
        }
        if self.hostname.trim().is_empty() {
            return Err(SessionError::Configuration("hostname is required".into()));
        }
        if self.preview_port == 0 {
            return Err(SessionError::Configuration("preview port must be non-zero".into()));
        }
        Ok(())
    }

    /// Merge the configuration fields into a session record.
    pub fn apply_to(&self, session: &mut Session) {
        session.repo_owner = self.repo_owner.trim().to_string();
        session.repo_name = self.repo_name.trim().to_string();
        session.display_name = if self.display_name.is_empty() {
            self.repo_name.trim().to_string()
        } else {
            self.display_name.clone()
        };
        session.site_url = self.site_url.clone();
        session.preview_port = self.preview_port;
        session.hostname = self.hostname.trim().to_string();
    }
}

/// A short-lived installation token. Held for one provisioning pass only.
#[derive(Clone)]
pub struct Credential {
    token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
