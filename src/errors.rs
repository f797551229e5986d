//! Typed error hierarchy for sitecraft.
//!
//! Three enums cover the three layers a session touches:
//! - `CredentialError`: assertion signing and the installation-token exchange
//! - `EnvironmentError`: commands, processes and files inside the environment
//! - `SessionError`: what a client of a session observes
//!
//! The first two convert into `SessionError` so pipeline steps can use `?`.

use std::time::Duration;

use thiserror::Error;

/// Errors from minting a source-control credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Missing GitHub App setting: {0}")]
    Configuration(&'static str),

    #[error("Failed to sign app assertion: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),

    #[error("Token exchange request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Token exchange rejected with status {status}: {body}")]
    Auth { status: u16, body: String },

    #[error("Token exchange returned an unreadable body: {0}")]
    InvalidResponse(String),
}

/// Errors raised by an [`Environment`](crate::session::environment::Environment) adapter.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("Command exited with code {exit_code}")]
    Execution { exit_code: i32, last_output: String },

    #[error("Port {port} was not bound within {}s", waited.as_secs())]
    PortTimeout { port: u16, waited: Duration },

    #[error("Port {port} is already in use by another process")]
    PortInUse { port: u16 },

    #[error("Background process exited before binding its port (code {code:?})")]
    ProcessExited { code: Option<i32> },

    #[error("Unknown background process {0}")]
    UnknownProcess(String),

    #[error("Path escapes the environment: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to session clients.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("GitHub rejected the credential exchange ({status}): {body}")]
    Auth { status: u16, body: String },

    #[error("Command failed with exit code {exit_code}: {last_output}")]
    Execution { exit_code: i32, last_output: String },

    #[error("Timed out: {message}")]
    Timeout { message: String, logs: String },

    #[error("An edit is already running for this session")]
    Busy,

    #[error("Cannot {action} while the session is {status}")]
    InvalidState { action: &'static str, status: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session {0} not found")]
    NotFound(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SessionError {
    /// Stable machine-readable tag used in wire error frames.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Configuration(_) => "configuration",
            SessionError::Auth { .. } => "auth",
            SessionError::Execution { .. } => "execution",
            SessionError::Timeout { .. } => "timeout",
            SessionError::Busy => "busy",
            SessionError::InvalidState { .. } => "invalid_state",
            SessionError::InvalidRequest(_) => "invalid_request",
            SessionError::NotFound(_) => "not_found",
            SessionError::Environment(_) => "environment",
            SessionError::Other(_) => "internal",
        }
    }
}

impl From<CredentialError> for SessionError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Configuration(_) => SessionError::Configuration(err.to_string()),
            CredentialError::Auth { status, body } => SessionError::Auth { status, body },
            CredentialError::Signing(_) => SessionError::Configuration(err.to_string()),
            CredentialError::Request(_) | CredentialError::InvalidResponse(_) => {
                SessionError::Auth {
                    status: 0,
                    body: err.to_string(),
                }
            }
        }
    }
}

impl From<EnvironmentError> for SessionError {
    fn from(err: EnvironmentError) -> Self {
        match err {
            EnvironmentError::Execution {
                exit_code,
                last_output,
            } => SessionError::Execution {
                exit_code,
                last_output,
            },
            EnvironmentError::PortTimeout { .. } => SessionError::Timeout {
                message: err.to_string(),
                logs: String::new(),
            },
            other => SessionError::Environment(other.to_string()),
        }
    }
}
