//! In-memory doubles for the environment and credential seams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Notify;

use super::credentials::CredentialSource;
use super::environment::{Environment, ExposedPort, OutputCallback, OutputStream, ProcessHandle};
use super::machine::PipelineSettings;
use super::manager::EnvironmentFactory;
use super::models::Credential;
use crate::errors::{CredentialError, EnvironmentError};

pub const TEST_TOOL_COMMAND: &str = "edit-tool";

/// Pipeline settings with no waiting and the fake tool command.
pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        repo_dir: "repo".into(),
        install_command: "npm install".into(),
        dev_command: "npm run dev -- --host 0.0.0.0 --port {port}".into(),
        shared_env: HashMap::new(),
        git_author_name: "sitecraft".into(),
        git_author_email: "sitecraft@users.noreply.github.com".into(),
        checkout_timeout: Duration::from_secs(5),
        install_timeout: Duration::from_secs(5),
        port_timeout: Duration::from_millis(50),
        settle_delay: Duration::ZERO,
        tool_command: TEST_TOOL_COMMAND.into(),
        tool_config_path: Some(".claude/settings.json".into()),
        tool_overrides: json!({"permissions": {"allow": ["Edit"]}}),
        tool_timeout: Duration::from_secs(5),
    }
}

/// Scriptable environment that records every call as `kind:detail`.
#[derive(Default)]
pub struct FakeEnvironment {
    calls: Mutex<Vec<String>>,
    vars: Mutex<HashMap<String, String>>,
    files: Mutex<HashMap<String, String>>,
    install_output: Vec<String>,
    install_failure: Option<(i32, String)>,
    install_gate: Option<Arc<Notify>>,
    tool_output: Vec<String>,
    tool_failure: Option<(i32, String)>,
    tool_gate: Option<Arc<Notify>>,
    tool_io_error: bool,
    port_timeout: bool,
    port_in_use: bool,
    process_exit: Option<i32>,
    process_logs: String,
    hanging_checkout: bool,
}

impl FakeEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        self
    }

    pub fn with_install_output(mut self, chunks: &[&str]) -> Self {
        self.install_output = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_install_failure(mut self, exit_code: i32, output: &str) -> Self {
        self.install_failure = Some((exit_code, output.to_string()));
        self
    }

    /// Block the install step until `gate` is notified.
    pub fn with_install_gate(mut self, gate: Arc<Notify>) -> Self {
        self.install_gate = Some(gate);
        self
    }

    pub fn with_tool_output(mut self, chunks: &[&str]) -> Self {
        self.tool_output = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_tool_failure(mut self, exit_code: i32, output: &str) -> Self {
        self.tool_failure = Some((exit_code, output.to_string()));
        self
    }

    /// Block the edit tool until `gate` is notified.
    pub fn with_tool_gate(mut self, gate: Arc<Notify>) -> Self {
        self.tool_gate = Some(gate);
        self
    }

    pub fn with_tool_io_error(mut self) -> Self {
        self.tool_io_error = true;
        self
    }

    pub fn with_port_timeout(mut self) -> Self {
        self.port_timeout = true;
        self
    }

    /// Another process already listens on every port.
    pub fn with_port_in_use(mut self) -> Self {
        self.port_in_use = true;
        self
    }

    pub fn with_process_exit(mut self, code: i32) -> Self {
        self.process_exit = Some(code);
        self
    }

    pub fn with_process_logs(mut self, logs: &str) -> Self {
        self.process_logs = logs.to_string();
        self
    }

    pub fn with_hanging_checkout(mut self) -> Self {
        self.hanging_checkout = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(':').next() == Some(kind))
            .count()
    }

    pub fn var(&self, name: &str) -> Option<String> {
        self.vars.lock().unwrap().get(name).cloned()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Wait until a call starting with `prefix` has been recorded.
    pub async fn wait_for_call(&self, prefix: &str) {
        let seen = async {
            while !self.calls().iter().any(|c| c.starts_with(prefix)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), seen).await.is_err() {
            panic!("no call starting with {prefix:?} in {:?}", self.calls());
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Environment for FakeEnvironment {
    async fn set_env_vars(&self, vars: HashMap<String, String>) -> Result<(), EnvironmentError> {
        let mut keys: Vec<&String> = vars.keys().collect();
        keys.sort();
        self.record(format!(
            "set_env:{}",
            keys.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(",")
        ));
        self.vars.lock().unwrap().extend(vars);
        Ok(())
    }

    async fn execute(
        &self,
        command: &str,
        working_dir: &str,
        on_output: OutputCallback<'_>,
    ) -> Result<(), EnvironmentError> {
        self.record(format!("execute:{} @ {}", command, working_dir));
        let is_tool = command.starts_with(TEST_TOOL_COMMAND);
        let (output, failure, gate) = if is_tool {
            (&self.tool_output, &self.tool_failure, self.tool_gate.clone())
        } else {
            (
                &self.install_output,
                &self.install_failure,
                self.install_gate.clone(),
            )
        };

        if let Some(gate) = gate {
            gate.notified().await;
        }
        if is_tool && self.tool_io_error {
            return Err(EnvironmentError::Io(std::io::Error::other("sandbox went away")));
        }
        for chunk in output {
            on_output(OutputStream::Stdout, chunk);
        }
        match failure {
            Some((exit_code, last_output)) => {
                if !is_tool {
                    on_output(OutputStream::Stderr, last_output);
                }
                Err(EnvironmentError::Execution {
                    exit_code: *exit_code,
                    last_output: last_output.clone(),
                })
            }
            None => Ok(()),
        }
    }

    async fn start_background_process(
        &self,
        command: &str,
        _working_dir: &str,
    ) -> Result<ProcessHandle, EnvironmentError> {
        self.record(format!("start:{}", command));
        Ok(ProcessHandle::new("dev-server"))
    }

    async fn ensure_port_free(&self, port: u16) -> Result<(), EnvironmentError> {
        self.record(format!("check_port:{}", port));
        if self.port_in_use {
            return Err(EnvironmentError::PortInUse { port });
        }
        Ok(())
    }

    async fn wait_for_port(
        &self,
        _handle: &ProcessHandle,
        port: u16,
        timeout: Duration,
    ) -> Result<(), EnvironmentError> {
        self.record(format!("wait:{}", port));
        if let Some(code) = self.process_exit {
            return Err(EnvironmentError::ProcessExited { code: Some(code) });
        }
        if self.port_timeout {
            return Err(EnvironmentError::PortTimeout {
                port,
                waited: timeout,
            });
        }
        Ok(())
    }

    async fn stop_process(&self, handle: &ProcessHandle) -> Result<(), EnvironmentError> {
        self.record(format!("stop:{}", handle.id()));
        Ok(())
    }

    async fn fetch_process_logs(&self, handle: &ProcessHandle) -> Result<String, EnvironmentError> {
        self.record(format!("logs:{}", handle.id()));
        Ok(self.process_logs.clone())
    }

    async fn expose_port(
        &self,
        port: u16,
        hostname: &str,
        _access_token: &str,
    ) -> Result<ExposedPort, EnvironmentError> {
        self.record(format!("expose:{}:{}", port, hostname));
        Ok(ExposedPort {
            url: format!("https://{}-{}", port, hostname),
        })
    }

    async fn checkout_repository(&self, url: &str, target_dir: &str) -> Result<(), EnvironmentError> {
        self.record(format!("checkout:{} -> {}", url, target_dir));
        if self.hanging_checkout {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>, EnvironmentError> {
        self.record(format!("read:{}", path));
        Ok(self.file(path))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), EnvironmentError> {
        self.record(format!("write:{}", path));
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }
}

/// Hands every session a fresh, well-behaved `FakeEnvironment`.
pub struct FakeEnvironmentFactory;

impl EnvironmentFactory for FakeEnvironmentFactory {
    fn create(&self, _session_id: &str) -> anyhow::Result<Arc<dyn Environment>> {
        Ok(Arc::new(FakeEnvironment::new()))
    }
}

pub enum FakeCredentials {
    Token(String),
    Missing(&'static str),
    Rejected(u16, String),
}

impl FakeCredentials {
    pub fn token(token: &str) -> Self {
        Self::Token(token.to_string())
    }

    pub fn missing(setting: &'static str) -> Self {
        Self::Missing(setting)
    }

    pub fn rejected(status: u16, body: &str) -> Self {
        Self::Rejected(status, body.to_string())
    }
}

#[async_trait]
impl CredentialSource for FakeCredentials {
    async fn mint(&self) -> Result<Credential, CredentialError> {
        match self {
            Self::Token(token) => Ok(Credential::new(
                token.clone(),
                Utc::now() + chrono::Duration::hours(1),
            )),
            Self::Missing(setting) => Err(CredentialError::Configuration(*setting)),
            Self::Rejected(status, body) => Err(CredentialError::Auth {
                status: *status,
                body: body.clone(),
            }),
        }
    }
}
