//! Per-session lifecycle controller.
//!
//! ```text
//! Unconfigured ─configure─> Configuring ─provision─> Provisioning ─> Ready ⇄ Editing
//!                               ^                        │                    │
//!                               └──────configure──── Failed <─────────────────┘
//! ```
//!
//! Every mutation goes through [`SessionMachine::commit`]: it runs under the
//! per-session writer lock, persists the new whole record, then swaps it in
//! and publishes the snapshot. Guards (start provisioning once, one edit at a
//! time) are decided inside the commit closure, so check and set are atomic.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::Mutex as AsyncMutex;
use tracing::Instrument;

use super::channel::ProgressSender;
use super::credentials::CredentialSource;
use super::db::SessionDb;
use super::environment::{Environment, OutputStream, ProcessHandle, github_clone_url};
use super::merge::deep_merge;
use super::models::{EditEntry, Session, SessionConfig, SessionStatus};
use super::notifier::SessionNotifier;
use super::prompt::{edit_command, strip_control_sequences};
use crate::errors::{EnvironmentError, SessionError};

/// Everything the pipeline needs that is not per-session.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Checkout directory, relative to the environment root.
    pub repo_dir: String,
    pub install_command: String,
    /// Dev server command; `{port}` is replaced with the session's port.
    pub dev_command: String,
    pub shared_env: HashMap<String, String>,
    pub git_author_name: String,
    pub git_author_email: String,
    pub checkout_timeout: Duration,
    pub install_timeout: Duration,
    pub port_timeout: Duration,
    pub settle_delay: Duration,
    pub tool_command: String,
    /// Tool configuration file inside the checkout; `None` skips the merge step.
    pub tool_config_path: Option<String>,
    pub tool_overrides: Value,
    pub tool_timeout: Duration,
}

impl PipelineSettings {
    pub fn dev_command_for(&self, port: u16) -> String {
        self.dev_command.replace("{port}", &port.to_string())
    }

    fn repo_path(&self, relative: &str) -> String {
        if self.repo_dir.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.repo_dir.trim_end_matches('/'), relative)
        }
    }
}

/// Result of a provisioning request.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionOutcome {
    /// This call ran the pipeline to `Ready`.
    Provisioned(Session),
    /// Already `Ready`/`Editing`; nothing was done.
    AlreadyProvisioned(Session),
    /// Another call is running the pipeline right now.
    InProgress(Session),
}

impl ProvisionOutcome {
    pub fn session(&self) -> &Session {
        match self {
            Self::Provisioned(s) | Self::AlreadyProvisioned(s) | Self::InProgress(s) => s,
        }
    }

    fn as_json(&self) -> Value {
        let outcome = match self {
            Self::Provisioned(_) => "provisioned",
            Self::AlreadyProvisioned(_) => "already_provisioned",
            Self::InProgress(_) => "in_progress",
        };
        json!({
            "outcome": outcome,
            "previewUrl": self.session().preview_url,
            "status": self.session().status,
        })
    }
}

enum ProvisionStart {
    Run(Session),
    Skip(ProvisionOutcome),
}

pub struct SessionMachine {
    id: String,
    state: Mutex<Session>,
    /// Serializes every read-modify-write of `state` together with its persist.
    writer: AsyncMutex<()>,
    env: Arc<dyn Environment>,
    credentials: Arc<dyn CredentialSource>,
    db: SessionDb,
    notifier: Arc<SessionNotifier>,
    settings: Arc<PipelineSettings>,
    preview_token: String,
    /// Dev server started by the last provisioning run, if still running.
    dev_server: AsyncMutex<Option<ProcessHandle>>,
}

impl SessionMachine {
    pub fn new(
        session: Session,
        env: Arc<dyn Environment>,
        credentials: Arc<dyn CredentialSource>,
        db: SessionDb,
        notifier: Arc<SessionNotifier>,
        settings: Arc<PipelineSettings>,
    ) -> Self {
        Self {
            id: session.id.clone(),
            state: Mutex::new(session),
            writer: AsyncMutex::new(()),
            env,
            credentials,
            db,
            notifier,
            settings,
            preview_token: uuid::Uuid::new_v4().simple().to_string(),
            dev_server: AsyncMutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Session {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot().status
    }

    /// Atomic read-modify-write of the whole record.
    ///
    /// `f` edits a copy. A changed record is written to the store first and
    /// only then replaces the in-memory one and is broadcast to observers.
    /// If `f` or the write fails nothing changes.
    async fn commit<T, F>(&self, f: F) -> Result<(Session, T), SessionError>
    where
        F: FnOnce(&mut Session) -> Result<T, SessionError>,
    {
        let _writer = self.writer.lock().await;
        let current = self.snapshot();
        let mut next = current.clone();
        let value = f(&mut next)?;
        if next == current {
            return Ok((next, value));
        }
        next.updated_at = Utc::now();

        if let Err(e) = self.db.put(next.clone()).await {
            tracing::error!(session_id = %self.id, error = %format!("{:#}", e), "failed to persist session");
            return Err(SessionError::Other(anyhow::anyhow!(
                "Failed to persist session: {:#}",
                e
            )));
        }
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next.clone();
        self.notifier.publish(&next);
        Ok((next, value))
    }

    /// Merge initial configuration into the session and move to `Configuring`.
    pub async fn configure(&self, config: SessionConfig) -> Result<Session, SessionError> {
        config.validate()?;
        let (session, ()) = self
            .commit(|s| match s.status {
                SessionStatus::Unconfigured | SessionStatus::Configuring | SessionStatus::Failed => {
                    config.apply_to(s);
                    s.preview_url = None;
                    s.is_provisioned = false;
                    s.last_error = None;
                    s.status = SessionStatus::Configuring;
                    Ok(())
                }
                status => Err(SessionError::InvalidState {
                    action: "reconfigure",
                    status: status.to_string(),
                }),
            })
            .await?;
        tracing::info!(
            session_id = %self.id,
            repo = %session.repo_slug(),
            port = session.preview_port,
            "session configured"
        );
        Ok(session)
    }

    /// Run the provisioning pipeline once. Re-entrant calls while the
    /// pipeline runs or after it finished are no-ops.
    ///
    /// `progress` always receives exactly one terminal event.
    pub async fn provision(&self, progress: ProgressSender) -> Result<ProvisionOutcome, SessionError> {
        let start = self
            .commit(|s| match s.status {
                SessionStatus::Configuring => {
                    s.status = SessionStatus::Provisioning;
                    s.last_error = None;
                    Ok(ProvisionStart::Run(s.clone()))
                }
                SessionStatus::Provisioning => {
                    Ok(ProvisionStart::Skip(ProvisionOutcome::InProgress(s.clone())))
                }
                SessionStatus::Ready | SessionStatus::Editing => Ok(ProvisionStart::Skip(
                    ProvisionOutcome::AlreadyProvisioned(s.clone()),
                )),
                status @ (SessionStatus::Unconfigured | SessionStatus::Failed) => {
                    Err(SessionError::InvalidState {
                        action: "provision",
                        status: status.to_string(),
                    })
                }
            })
            .await;

        let session = match start {
            Ok((_, ProvisionStart::Run(session))) => session,
            Ok((_, ProvisionStart::Skip(outcome))) => {
                progress.complete(outcome.as_json());
                return Ok(outcome);
            }
            Err(e) => {
                progress.fail(e.to_string());
                return Err(e);
            }
        };

        let span = tracing::info_span!("provision", session_id = %self.id, repo = %session.repo_slug());
        let result = match self.run_pipeline(&session, &progress).instrument(span).await {
            Ok(preview_url) => self
                .commit(|s| {
                    s.preview_url = Some(preview_url.clone());
                    s.is_provisioned = true;
                    s.status = SessionStatus::Ready;
                    Ok(())
                })
                .await
                .map(|(session, ())| (session, preview_url)),
            Err(e) => Err(e),
        };

        match result {
            Ok((session, preview_url)) => {
                tracing::info!(session_id = %self.id, preview_url = %preview_url, "session ready");
                progress.line(format!("Preview ready at {}", preview_url));
                let outcome = ProvisionOutcome::Provisioned(session);
                progress.complete(outcome.as_json());
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "provisioning failed");
                self.stop_dev_server().await;
                self.mark_failed(&e).await;
                progress.line(format!("Error: {}", e));
                progress.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Move to `Failed`. When the store rejects the write the failure is
    /// still applied in memory so clients see it.
    async fn mark_failed(&self, error: &SessionError) {
        let message = error.to_string();
        let stored = self
            .commit(|s| {
                apply_failure(s, &message);
                Ok(())
            })
            .await;
        if stored.is_err() {
            let _writer = self.writer.lock().await;
            let snapshot = {
                let mut state = self
                    .state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                apply_failure(&mut state, &message);
                state.updated_at = Utc::now();
                state.clone()
            };
            self.notifier.publish(&snapshot);
        }
    }

    async fn stop_dev_server(&self) {
        let previous = self.dev_server.lock().await.take();
        if let Some(handle) = previous
            && let Err(e) = self.env.stop_process(&handle).await
        {
            tracing::warn!(session_id = %self.id, process_id = %handle.id(), error = %e, "failed to stop dev server");
        }
    }

    async fn run_pipeline(
        &self,
        session: &Session,
        progress: &ProgressSender,
    ) -> Result<String, SessionError> {
        let settings = &self.settings;
        let port = session.preview_port;

        // A server left over from an earlier run still holds the port and the checkout.
        self.stop_dev_server().await;

        progress.line("Configuring environment variables...");
        let mut vars = settings.shared_env.clone();
        vars.insert("GIT_AUTHOR_NAME".into(), settings.git_author_name.clone());
        vars.insert("GIT_AUTHOR_EMAIL".into(), settings.git_author_email.clone());
        vars.insert("GIT_COMMITTER_NAME".into(), settings.git_author_name.clone());
        vars.insert("GIT_COMMITTER_EMAIL".into(), settings.git_author_email.clone());
        self.env.set_env_vars(vars).await?;

        progress.line("Minting GitHub access token...");
        let credential = self.credentials.mint().await?;
        self.env
            .set_env_vars(HashMap::from([
                ("GH_TOKEN".to_string(), credential.token().to_string()),
                ("GITHUB_TOKEN".to_string(), credential.token().to_string()),
            ]))
            .await?;

        progress.line(format!(
            "Cloning {} into {}...",
            session.repo_slug(),
            settings.repo_dir
        ));
        let clone_url = github_clone_url(
            &session.repo_owner,
            &session.repo_name,
            Some(credential.token()),
        );
        drop(credential);
        bounded(
            settings.checkout_timeout,
            "repository checkout",
            self.env.checkout_repository(&clone_url, &settings.repo_dir),
        )
        .await?;

        if let Some(config_path) = &settings.tool_config_path {
            progress.line(format!("Applying tool configuration to {}...", config_path));
            self.apply_tool_config(config_path).await?;
        }

        progress.line(format!("Installing dependencies ({})...", settings.install_command));
        let mut relay = |_stream: OutputStream, data: &str| progress.chunk(data);
        bounded(
            settings.install_timeout,
            "dependency install",
            self.env
                .execute(&settings.install_command, &settings.repo_dir, &mut relay),
        )
        .await?;

        progress.line(format!("Checking port {} is free...", port));
        self.env.ensure_port_free(port).await?;

        progress.line("Starting dev server...");
        let handle = self
            .env
            .start_background_process(&settings.dev_command_for(port), &settings.repo_dir)
            .await?;
        *self.dev_server.lock().await = Some(handle.clone());

        progress.line(format!("Waiting for port {}...", port));
        if let Err(wait_err) = self
            .env
            .wait_for_port(&handle, port, settings.port_timeout)
            .await
        {
            let logs = match self.env.fetch_process_logs(&handle).await {
                Ok(logs) => logs,
                Err(e) => format!("(could not read dev server logs: {})", e),
            };
            progress.line("Dev server logs:");
            progress.chunk(if logs.ends_with('\n') {
                logs.clone()
            } else {
                format!("{}\n", logs)
            });
            return Err(match wait_err {
                EnvironmentError::ProcessExited { code } => SessionError::Execution {
                    exit_code: code.unwrap_or(-1),
                    last_output: logs,
                },
                other => SessionError::Timeout {
                    message: format!("dev server did not become reachable: {}", other),
                    logs,
                },
            });
        }

        if !settings.settle_delay.is_zero() {
            tokio::time::sleep(settings.settle_delay).await;
        }

        progress.line(format!("Exposing port {} on {}...", port, session.hostname));
        let exposed = self
            .env
            .expose_port(port, &session.hostname, &self.preview_token)
            .await?;
        Ok(exposed.url)
    }

    async fn apply_tool_config(&self, config_path: &str) -> Result<(), SessionError> {
        let path = self.settings.repo_path(config_path);
        let base = match self.env.read_file(&path).await? {
            Some(text) if !text.trim().is_empty() => serde_json::from_str(&text).map_err(|e| {
                SessionError::Configuration(format!("{} is not valid JSON: {}", config_path, e))
            })?,
            _ => Value::Object(Default::default()),
        };
        let merged = deep_merge(base, self.settings.tool_overrides.clone());
        let rendered = serde_json::to_string_pretty(&merged)
            .map_err(|e| SessionError::Other(anyhow::anyhow!(e)))?;
        self.env.write_file(&path, &format!("{}\n", rendered)).await?;
        Ok(())
    }

    /// Run one edit request against the provisioned environment.
    ///
    /// Only one edit may be in flight; a concurrent request gets
    /// [`SessionError::Busy`]. Tool failures are folded into the stored
    /// response and the session returns to `Ready`.
    pub async fn submit_edit(
        &self,
        prompt: &str,
        progress: ProgressSender,
    ) -> Result<EditEntry, SessionError> {
        if prompt.trim().is_empty() {
            let err = SessionError::InvalidRequest("prompt must not be empty".into());
            progress.fail(err.to_string());
            return Err(err);
        }

        let begin = self
            .commit(|s| match s.status {
                SessionStatus::Ready => {
                    s.status = SessionStatus::Editing;
                    Ok(s.display_name.clone())
                }
                SessionStatus::Editing => Err(SessionError::Busy),
                status => Err(SessionError::InvalidState {
                    action: "submit an edit",
                    status: status.to_string(),
                }),
            })
            .await;
        let site_name = match begin {
            Ok((_, site_name)) => site_name,
            Err(e) => {
                progress.fail(e.to_string());
                return Err(e);
            }
        };

        let span = tracing::info_span!("edit", session_id = %self.id);
        let run = self.run_tool(prompt, &site_name, &progress).instrument(span).await;

        let response = match run {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "edit aborted");
                self.mark_failed(&e).await;
                progress.fail(e.to_string());
                return Err(e);
            }
        };

        let prompt = prompt.to_string();
        let completed = self
            .commit(|s| {
                let entry = EditEntry {
                    prompt,
                    response,
                    timestamp: s.next_edit_timestamp(Utc::now()),
                };
                s.edits.push(entry.clone());
                s.status = SessionStatus::Ready;
                Ok(entry)
            })
            .await;
        match completed {
            Ok((_, entry)) => {
                progress.complete(json!(entry));
                Ok(entry)
            }
            Err(e) => {
                let err = SessionError::Other(anyhow::anyhow!("Edit could not be saved: {}", e));
                self.mark_failed(&err).await;
                progress.fail(err.to_string());
                Err(err)
            }
        }
    }

    /// Execute the tool and return the accumulated (cleaned) response.
    /// Only environment faults other than the tool's own failure are errors.
    async fn run_tool(
        &self,
        prompt: &str,
        site_name: &str,
        progress: &ProgressSender,
    ) -> Result<String, SessionError> {
        let settings = &self.settings;
        let command = edit_command(&settings.tool_command, prompt, site_name);
        let mut response = String::new();

        let outcome = {
            let mut relay = |_stream: OutputStream, data: &str| {
                let clean = strip_control_sequences(data);
                progress.chunk(clean.clone());
                response.push_str(&clean);
            };
            tokio::time::timeout(
                settings.tool_timeout,
                self.env.execute(&command, &settings.repo_dir, &mut relay),
            )
            .await
        };

        let marker = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(EnvironmentError::Execution {
                exit_code,
                last_output,
            })) => {
                tracing::warn!(session_id = %self.id, exit_code, "edit tool failed");
                let detail = strip_control_sequences(&last_output);
                Some(if detail.trim().is_empty() {
                    format!("[error] Edit tool exited with code {}", exit_code)
                } else {
                    format!(
                        "[error] Edit tool exited with code {}: {}",
                        exit_code,
                        detail.trim()
                    )
                })
            }
            Ok(Err(other)) => return Err(other.into()),
            Err(_) => {
                tracing::warn!(session_id = %self.id, "edit tool timed out");
                Some(format!(
                    "[error] Edit tool timed out after {}s",
                    settings.tool_timeout.as_secs()
                ))
            }
        };

        if let Some(marker) = marker {
            let separator = if response.is_empty() || response.ends_with('\n') {
                "\n"
            } else {
                "\n\n"
            };
            let block = format!("{}{}\n", separator, marker);
            progress.chunk(block.clone());
            response.push_str(&block);
        }
        Ok(response)
    }
}

fn apply_failure(session: &mut Session, message: &str) {
    session.status = SessionStatus::Failed;
    session.preview_url = None;
    session.is_provisioned = false;
    session.last_error = Some(message.to_string());
}

/// Bound an environment call with an explicit timeout.
async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, EnvironmentError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(SessionError::from),
        Err(_) => Err(SessionError::Timeout {
            message: format!("{} did not finish within {}s", what, limit.as_secs()),
            logs: String::new(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::channel::{StreamEvent, progress_channel};
    use crate::session::testing::{FakeCredentials, FakeEnvironment, test_settings};

    fn config() -> SessionConfig {
        SessionConfig {
            repo_owner: "acme".into(),
            repo_name: "site".into(),
            display_name: "Acme".into(),
            site_url: "https://acme.test".into(),
            preview_port: 4321,
            hostname: "example.test".into(),
        }
    }

    struct Harness {
        machine: Arc<SessionMachine>,
        env: Arc<FakeEnvironment>,
        db: SessionDb,
        notifier: Arc<SessionNotifier>,
    }

    fn harness_with(env: FakeEnvironment, credentials: FakeCredentials) -> Harness {
        let env = Arc::new(env);
        let db = SessionDb::in_memory().unwrap();
        let notifier = Arc::new(SessionNotifier::new());
        let machine = Arc::new(SessionMachine::new(
            Session::new("s1"),
            env.clone(),
            Arc::new(credentials),
            db.clone(),
            notifier.clone(),
            Arc::new(test_settings()),
        ));
        Harness {
            machine,
            env,
            db,
            notifier,
        }
    }

    fn harness(env: FakeEnvironment) -> Harness {
        harness_with(env, FakeCredentials::token("ghs_test"))
    }

    async fn provision(machine: &SessionMachine) -> (Result<ProvisionOutcome, SessionError>, Vec<StreamEvent>) {
        let (tx, rx) = progress_channel();
        let result = machine.provision(tx).await;
        (result, rx.collect().await)
    }

    async fn edit(machine: &SessionMachine, prompt: &str) -> (Result<EditEntry, SessionError>, Vec<StreamEvent>) {
        let (tx, rx) = progress_channel();
        let result = machine.submit_edit(prompt, tx).await;
        (result, rx.collect().await)
    }

    async fn ready(h: &Harness) {
        h.machine.configure(config()).await.unwrap();
        let (result, _) = provision(&h.machine).await;
        result.unwrap();
    }

    fn chunks(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk(c) => Some(c.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn provisioning_walks_every_state_and_exposes_port() {
        let h = harness(FakeEnvironment::new());
        let mut observed = h.notifier.subscribe("s1");
        assert_eq!(h.machine.status(), SessionStatus::Unconfigured);

        h.machine.configure(config()).await.unwrap();
        let (result, events) = provision(&h.machine).await;
        let outcome = result.unwrap();
        assert!(matches!(outcome, ProvisionOutcome::Provisioned(_)));

        let session = h.machine.snapshot();
        assert_eq!(session.status, SessionStatus::Ready);
        assert!(session.is_provisioned);
        assert_eq!(
            session.preview_url.as_deref(),
            Some("https://4321-example.test")
        );
        assert!(session.edits.is_empty());

        let mut statuses = Vec::new();
        while let Ok(snapshot) = observed.try_recv() {
            statuses.push(snapshot.status);
        }
        assert_eq!(
            statuses,
            vec![
                SessionStatus::Configuring,
                SessionStatus::Provisioning,
                SessionStatus::Ready
            ]
        );
        assert!(matches!(events.last(), Some(StreamEvent::Completed(_))));
        assert_eq!(h.db.get("s1").await.unwrap(), Some(session));
    }

    #[tokio::test]
    async fn pipeline_steps_run_in_order_with_progress_lines() {
        let h = harness(FakeEnvironment::new().with_install_output(&["added 42 packages\n"]));
        h.machine.configure(config()).await.unwrap();
        let (_, events) = provision(&h.machine).await;

        let calls = h.env.calls();
        let kinds: Vec<&str> = calls.iter().map(|c| c.split(':').next().unwrap_or("")).collect();
        assert_eq!(
            kinds,
            vec![
                "set_env", "set_env", "checkout", "read", "write", "execute", "check_port", "start",
                "wait", "expose"
            ]
        );

        let text = chunks(&events);
        let order = [
            "Configuring environment variables",
            "Minting GitHub access token",
            "Cloning acme/site",
            "Applying tool configuration",
            "Installing dependencies",
            "added 42 packages",
            "Checking port 4321 is free",
            "Starting dev server",
            "Waiting for port 4321",
            "Exposing port 4321 on example.test",
            "Preview ready at https://4321-example.test",
        ];
        let mut cursor = 0;
        for needle in order {
            let found = text[cursor..].find(needle).unwrap_or_else(|| panic!("missing {needle:?} in {text}"));
            cursor += found + needle.len();
        }
    }

    #[tokio::test]
    async fn credential_is_injected_but_never_streamed() {
        let h = harness(FakeEnvironment::new());
        h.machine.configure(config()).await.unwrap();
        let (_, events) = provision(&h.machine).await;

        assert_eq!(h.env.var("GH_TOKEN").as_deref(), Some("ghs_test"));
        assert_eq!(h.env.var("GIT_AUTHOR_NAME").as_deref(), Some("sitecraft"));
        assert!(h.env.calls().iter().any(|c| c.contains("x-access-token:ghs_test@github.com/acme/site.git")));
        assert!(!chunks(&events).contains("ghs_test"));
    }

    #[tokio::test]
    async fn tool_config_is_deep_merged_into_checkout() {
        let env = FakeEnvironment::new().with_file(
            "repo/.claude/settings.json",
            r#"{"permissions": {"deny": ["Bash"]}, "model": "sonnet"}"#,
        );
        let h = harness(env);
        ready(&h).await;

        let written: Value =
            serde_json::from_str(&h.env.file("repo/.claude/settings.json").unwrap()).unwrap();
        assert_eq!(
            written,
            json!({"permissions": {"deny": ["Bash"], "allow": ["Edit"]}, "model": "sonnet"})
        );
    }

    #[tokio::test]
    async fn invalid_tool_config_fails_provisioning() {
        let env = FakeEnvironment::new().with_file("repo/.claude/settings.json", "{not json");
        let h = harness(env);
        h.machine.configure(config()).await.unwrap();
        let (result, _) = provision(&h.machine).await;
        assert!(matches!(result, Err(SessionError::Configuration(_))));
        assert_eq!(h.machine.status(), SessionStatus::Failed);
    }

    #[tokio::test]
    async fn reprovisioning_when_ready_is_a_noop() {
        let h = harness(FakeEnvironment::new());
        ready(&h).await;
        let before = h.machine.snapshot();
        let calls_before = h.env.calls().len();

        let (result, events) = provision(&h.machine).await;
        assert!(matches!(result, Ok(ProvisionOutcome::AlreadyProvisioned(_))));
        assert_eq!(h.machine.snapshot(), before);
        assert_eq!(h.env.calls().len(), calls_before);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Completed(_)));
    }

    #[tokio::test]
    async fn concurrent_provision_trigger_is_a_noop() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let h = harness(FakeEnvironment::new().with_install_gate(gate.clone()));
        h.machine.configure(config()).await.unwrap();

        let machine = h.machine.clone();
        let first = tokio::spawn(async move { provision(&machine).await });
        h.env.wait_for_call("execute").await;

        let (second, _) = provision(&h.machine).await;
        assert!(matches!(second, Ok(ProvisionOutcome::InProgress(_))));

        gate.notify_one();
        let (first, _) = first.await.unwrap();
        assert!(matches!(first, Ok(ProvisionOutcome::Provisioned(_))));
        assert_eq!(h.env.count("checkout"), 1);
        assert_eq!(h.env.count("execute"), 1);
    }

    #[tokio::test]
    async fn provisioning_requires_configuration() {
        let h = harness(FakeEnvironment::new());
        let (result, events) = provision(&h.machine).await;
        assert!(matches!(result, Err(SessionError::InvalidState { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::Failed(_))));
        assert!(h.env.calls().is_empty());
    }

    #[tokio::test]
    async fn port_timeout_fails_with_logs_before_terminal_error() {
        let env = FakeEnvironment::new()
            .with_port_timeout()
            .with_process_logs("vite v5.0.0\nError: EADDRINUSE 4321\n");
        let h = harness(env);
        h.machine.configure(config()).await.unwrap();
        let (result, events) = provision(&h.machine).await;

        match result {
            Err(SessionError::Timeout { logs, .. }) => assert!(logs.contains("EADDRINUSE")),
            other => panic!("Expected Timeout, got {:?}", other),
        }
        let session = h.machine.snapshot();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.preview_url.is_none());
        assert!(!session.is_provisioned);
        assert!(session.last_error.is_some());

        let (terminal, body) = events.split_last().unwrap();
        assert!(matches!(terminal, StreamEvent::Failed(_)));
        assert!(chunks(body).contains("EADDRINUSE 4321"));
        assert_eq!(h.env.count("expose"), 0);
    }

    #[tokio::test]
    async fn port_held_elsewhere_fails_before_dev_server_starts() {
        let h = harness(FakeEnvironment::new().with_port_in_use());
        h.machine.configure(config()).await.unwrap();
        let (result, events) = provision(&h.machine).await;

        match result {
            Err(SessionError::Environment(message)) => assert!(message.contains("4321")),
            other => panic!("Expected Environment error, got {:?}", other),
        }
        let session = h.machine.snapshot();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.preview_url.is_none());
        assert_eq!(h.env.count("start"), 0);
        assert_eq!(h.env.count("wait"), 0);
        assert_eq!(h.env.count("expose"), 0);
        assert!(chunks(&events).contains("Checking port 4321 is free"));
    }

    #[tokio::test]
    async fn unreachable_dev_server_is_stopped() {
        let h = harness(FakeEnvironment::new().with_port_timeout());
        h.machine.configure(config()).await.unwrap();
        let _ = provision(&h.machine).await;
        assert_eq!(h.env.count("stop"), 1);

        let calls = h.env.calls();
        let logs_at = calls.iter().position(|c| c.starts_with("logs:")).unwrap();
        let stop_at = calls.iter().position(|c| c == "stop:dev-server").unwrap();
        assert!(logs_at < stop_at);

        h.machine.configure(config()).await.unwrap();
        let _ = provision(&h.machine).await;
        assert_eq!(h.env.count("start"), 2);
        assert_eq!(h.env.count("stop"), 2);
    }

    #[tokio::test]
    async fn reprovisioning_stops_the_previous_dev_server_first() {
        let h = harness(FakeEnvironment::new().with_tool_io_error());
        ready(&h).await;
        let _ = edit(&h.machine, "hello").await;
        assert_eq!(h.machine.status(), SessionStatus::Failed);
        assert_eq!(h.env.count("stop"), 0);

        h.machine.configure(config()).await.unwrap();
        let (result, _) = provision(&h.machine).await;
        result.unwrap();

        let calls = h.env.calls();
        let stop_at = calls.iter().position(|c| c == "stop:dev-server").unwrap();
        let checkout_at = calls.iter().rposition(|c| c.starts_with("checkout:")).unwrap();
        let start_at = calls.iter().rposition(|c| c.starts_with("start:")).unwrap();
        assert!(stop_at < checkout_at);
        assert!(checkout_at < start_at);
        assert_eq!(h.env.count("stop"), 1);
    }

    #[tokio::test]
    async fn crashed_dev_server_is_an_execution_error() {
        let h = harness(FakeEnvironment::new().with_process_exit(1).with_process_logs("boom"));
        h.machine.configure(config()).await.unwrap();
        let (result, events) = provision(&h.machine).await;
        assert!(matches!(result, Err(SessionError::Execution { exit_code: 1, .. })));
        assert!(chunks(&events).contains("boom"));
    }

    #[tokio::test]
    async fn credential_failure_aborts_before_checkout() {
        let h = harness_with(FakeEnvironment::new(), FakeCredentials::missing("app_id"));
        h.machine.configure(config()).await.unwrap();
        let (result, events) = provision(&h.machine).await;

        assert!(matches!(result, Err(SessionError::Configuration(_))));
        assert_eq!(h.machine.status(), SessionStatus::Failed);
        assert_eq!(h.env.count("checkout"), 0);
        let text = chunks(&events);
        assert!(text.contains("Minting GitHub access token"));
        assert!(text.contains("Error: Configuration error"));
    }

    #[tokio::test]
    async fn rejected_exchange_surfaces_auth_error() {
        let h = harness_with(FakeEnvironment::new(), FakeCredentials::rejected(401, "Bad credentials"));
        h.machine.configure(config()).await.unwrap();
        let (result, _) = provision(&h.machine).await;
        assert!(matches!(result, Err(SessionError::Auth { status: 401, .. })));
    }

    #[tokio::test]
    async fn install_failure_fails_the_pipeline() {
        let h = harness(FakeEnvironment::new().with_install_failure(1, "npm ERR! code E404"));
        h.machine.configure(config()).await.unwrap();
        let (result, events) = provision(&h.machine).await;
        assert!(matches!(result, Err(SessionError::Execution { exit_code: 1, .. })));
        assert!(chunks(&events).contains("npm ERR! code E404"));
        assert_eq!(h.env.count("start"), 0);
    }

    #[tokio::test]
    async fn reconfigure_recovers_from_failure() {
        let h = harness(FakeEnvironment::new().with_port_timeout());
        h.machine.configure(config()).await.unwrap();
        let _ = provision(&h.machine).await;
        assert_eq!(h.machine.status(), SessionStatus::Failed);

        let session = h.machine.configure(config()).await.unwrap();
        assert_eq!(session.status, SessionStatus::Configuring);
        assert!(session.last_error.is_none());
    }

    #[tokio::test]
    async fn reconfigure_is_rejected_once_provisioned() {
        let h = harness(FakeEnvironment::new());
        ready(&h).await;
        let mut other = config();
        other.preview_port = 3000;
        let err = h.machine.configure(other).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));
        assert_eq!(h.machine.snapshot().preview_port, 4321);
    }

    #[tokio::test]
    async fn successful_edits_append_in_order() {
        let h = harness(FakeEnvironment::new().with_tool_output(&["\x1b[32mUpdated\x1b[0m header\n"]));
        ready(&h).await;

        for prompt in ["first", "second", "third"] {
            let (result, _) = edit(&h.machine, prompt).await;
            result.unwrap();
        }

        let session = h.machine.snapshot();
        assert_eq!(session.status, SessionStatus::Ready);
        let prompts: Vec<&str> = session.edits.iter().map(|e| e.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["first", "second", "third"]);
        assert!(session.edits.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(session.edits[0].response, "Updated header\n");
    }

    #[tokio::test]
    async fn edit_output_is_cleaned_before_relay() {
        let h = harness(FakeEnvironment::new().with_tool_output(&["\x1b[1mbold\x1b[0m\r\n"]));
        ready(&h).await;
        let (_, events) = edit(&h.machine, "x").await;
        assert_eq!(events[0], StreamEvent::Chunk("bold\n".into()));
        assert!(matches!(events.last(), Some(StreamEvent::Completed(_))));
    }

    #[tokio::test]
    async fn edit_command_quotes_the_prompt() {
        let h = harness(FakeEnvironment::new());
        ready(&h).await;
        let _ = edit(&h.machine, "it's $(whoami)").await;
        let command = h
            .env
            .calls()
            .into_iter()
            .find(|c| c.starts_with("execute:edit-tool"))
            .unwrap();
        assert!(command.contains(r"it'\''s $(whoami)"));
    }

    #[tokio::test]
    async fn failing_tool_is_recorded_with_error_marker() {
        let h = harness(
            FakeEnvironment::new()
                .with_tool_output(&["Working on it\n"])
                .with_tool_failure(2, "API overloaded"),
        );
        ready(&h).await;

        let (result, events) = edit(&h.machine, "change header to blue").await;
        let entry = result.unwrap();
        assert!(entry.response.starts_with("Working on it\n"));
        assert!(entry.response.contains("[error] Edit tool exited with code 2: API overloaded"));

        let session = h.machine.snapshot();
        assert_eq!(session.status, SessionStatus::Ready);
        assert_eq!(session.edits.len(), 1);
        assert!(chunks(&events).contains("[error]"));
        assert!(matches!(events.last(), Some(StreamEvent::Completed(_))));
    }

    #[tokio::test]
    async fn concurrent_edit_is_rejected_as_busy() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let h = harness(FakeEnvironment::new().with_tool_gate(gate.clone()));
        ready(&h).await;

        let machine = h.machine.clone();
        let first = tokio::spawn(async move { edit(&machine, "first").await });
        h.env.wait_for_call("execute:edit-tool").await;
        assert_eq!(h.machine.status(), SessionStatus::Editing);

        let (second, events) = edit(&h.machine, "second").await;
        assert!(matches!(second, Err(SessionError::Busy)));
        assert!(matches!(events.as_slice(), [StreamEvent::Failed(_)]));

        gate.notify_one();
        first.await.unwrap().0.unwrap();
        let session = h.machine.snapshot();
        assert_eq!(session.edits.len(), 1);
        assert_eq!(session.edits[0].prompt, "first");
    }

    #[tokio::test]
    async fn edit_before_ready_is_rejected() {
        let h = harness(FakeEnvironment::new());
        h.machine.configure(config()).await.unwrap();
        let (result, _) = edit(&h.machine, "hello").await;
        assert!(matches!(result, Err(SessionError::InvalidState { .. })));
        assert!(h.machine.snapshot().edits.is_empty());
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let h = harness(FakeEnvironment::new());
        ready(&h).await;
        let (result, _) = edit(&h.machine, "   ").await;
        assert!(matches!(result, Err(SessionError::InvalidRequest(_))));
        assert_eq!(h.machine.status(), SessionStatus::Ready);
    }

    #[tokio::test]
    async fn broken_environment_during_edit_fails_session() {
        let h = harness(FakeEnvironment::new().with_tool_io_error());
        ready(&h).await;
        let (result, _) = edit(&h.machine, "hello").await;
        assert!(matches!(result, Err(SessionError::Environment(_))));
        let session = h.machine.snapshot();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.edits.is_empty());
    }

    #[tokio::test]
    async fn unsaved_edit_fails_the_session() {
        let h = harness(FakeEnvironment::new().with_tool_output(&["done\n"]));
        ready(&h).await;
        h.db.execute_batch(
            "CREATE TRIGGER reject_edits BEFORE UPDATE ON sessions
             WHEN json_array_length(NEW.record, '$.edits') > 0
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
        )
        .await
        .unwrap();

        let (result, events) = edit(&h.machine, "make it blue").await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Edit could not be saved"));
        assert!(matches!(events.last(), Some(StreamEvent::Failed(_))));

        let session = h.machine.snapshot();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.last_error.unwrap().contains("disk I/O error"));
        let stored = h.db.get("s1").await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);
        assert!(stored.edits.is_empty());
    }

    #[tokio::test]
    async fn rejected_write_leaves_the_session_unchanged() {
        let h = harness(FakeEnvironment::new());
        h.machine.configure(config()).await.unwrap();
        let mut observed = h.notifier.subscribe("s1");
        h.db.execute_batch("DROP TABLE sessions").await.unwrap();

        let (result, events) = provision(&h.machine).await;
        assert!(matches!(result, Err(SessionError::Other(_))));
        assert!(matches!(events.as_slice(), [StreamEvent::Failed(_)]));
        assert_eq!(h.machine.status(), SessionStatus::Configuring);
        assert!(observed.try_recv().is_err());
        assert!(h.env.calls().is_empty());
    }

    #[tokio::test]
    async fn operation_finishes_after_client_disconnects() {
        let h = harness(FakeEnvironment::new());
        h.machine.configure(config()).await.unwrap();
        let (tx, rx) = progress_channel();
        drop(rx);
        let result = h.machine.provision(tx).await;
        assert!(result.is_ok());
        assert_eq!(h.machine.status(), SessionStatus::Ready);
    }

    #[tokio::test]
    async fn checkout_timeout_is_enforced() {
        let h = harness(FakeEnvironment::new().with_hanging_checkout());
        let machine = Arc::new(SessionMachine::new(
            Session::new("s2"),
            h.env.clone(),
            Arc::new(FakeCredentials::token("ghs_test")),
            h.db.clone(),
            h.notifier.clone(),
            Arc::new(PipelineSettings {
                checkout_timeout: Duration::from_millis(20),
                ..test_settings()
            }),
        ));
        machine.configure(config()).await.unwrap();
        let (result, _) = provision(&machine).await;
        match result {
            Err(SessionError::Timeout { message, .. }) => {
                assert!(message.contains("repository checkout"))
            }
            other => panic!("Expected Timeout, got {:?}", other),
        }
    }

    #[test]
    fn dev_command_substitutes_port() {
        assert_eq!(
            test_settings().dev_command_for(4321),
            "npm run dev -- --host 0.0.0.0 --port 4321"
        );
    }
}
