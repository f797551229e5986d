use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;

use super::credentials::CredentialSource;
use super::db::SessionDb;
use super::environment::Environment;
use super::local::LocalEnvironment;
use super::machine::{PipelineSettings, SessionMachine};
use super::models::{Session, SessionStatus};
use super::notifier::SessionNotifier;
use crate::errors::SessionError;

/// Builds the environment a new state machine is bound to.
pub trait EnvironmentFactory: Send + Sync {
    fn create(&self, session_id: &str) -> anyhow::Result<Arc<dyn Environment>>;
}

/// One directory per session under `workspace_root`.
pub struct LocalEnvironmentFactory {
    workspace_root: PathBuf,
    preview_url_template: String,
}

impl LocalEnvironmentFactory {
    pub fn new(workspace_root: impl Into<PathBuf>, preview_url_template: &str) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            preview_url_template: preview_url_template.to_string(),
        }
    }
}

impl EnvironmentFactory for LocalEnvironmentFactory {
    fn create(&self, session_id: &str) -> anyhow::Result<Arc<dyn Environment>> {
        let root = self.workspace_root.join(session_id);
        let env = LocalEnvironment::new(&root, &self.preview_url_template)
            .with_context(|| format!("Failed to prepare workspace {}", root.display()))?;
        Ok(Arc::new(env))
    }
}

/// Registry of live session state machines.
///
/// Machines are created on allocation or rehydrated from the store on first
/// access. A record found mid-operation was interrupted by a restart and is
/// loaded as `Failed`.
pub struct SessionManager {
    db: SessionDb,
    notifier: Arc<SessionNotifier>,
    environments: Arc<dyn EnvironmentFactory>,
    credentials: Arc<dyn CredentialSource>,
    settings: Arc<PipelineSettings>,
    live: Mutex<HashMap<String, Arc<SessionMachine>>>,
}

impl SessionManager {
    pub fn new(
        db: SessionDb,
        environments: Arc<dyn EnvironmentFactory>,
        credentials: Arc<dyn CredentialSource>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            db,
            notifier: Arc::new(SessionNotifier::new()),
            environments,
            credentials,
            settings: Arc::new(settings),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn notifier(&self) -> &Arc<SessionNotifier> {
        &self.notifier
    }

    fn build(&self, session: Session) -> Result<Arc<SessionMachine>, SessionError> {
        let env = self.environments.create(&session.id)?;
        Ok(Arc::new(SessionMachine::new(
            session,
            env,
            self.credentials.clone(),
            self.db.clone(),
            self.notifier.clone(),
            self.settings.clone(),
        )))
    }

    /// Allocate a new session id with a default record.
    pub async fn create(&self) -> Result<Arc<SessionMachine>, SessionError> {
        let session = Session::new(uuid::Uuid::new_v4().to_string());
        self.db.put(session.clone()).await?;
        let machine = self.build(session)?;
        tracing::info!(session_id = %machine.id(), "session created");
        self.live
            .lock()
            .await
            .insert(machine.id().to_string(), machine.clone());
        Ok(machine)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<SessionMachine>, SessionError> {
        let mut live = self.live.lock().await;
        if let Some(machine) = live.get(id) {
            return Ok(machine.clone());
        }

        let mut session = self
            .db
            .get(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if matches!(
            session.status,
            SessionStatus::Provisioning | SessionStatus::Editing
        ) {
            tracing::warn!(session_id = %id, status = %session.status, "session was interrupted, marking failed");
            session.last_error = Some(format!("{} was interrupted by a restart", session.status));
            session.status = SessionStatus::Failed;
            session.preview_url = None;
            session.is_provisioned = false;
            session.updated_at = chrono::Utc::now();
            self.db.put(session.clone()).await?;
        }

        let machine = self.build(session)?;
        live.insert(id.to_string(), machine.clone());
        Ok(machine)
    }

    /// Snapshots of every stored session, live ones taking precedence.
    pub async fn list(&self) -> Result<Vec<Session>, SessionError> {
        let stored = self.db.list().await?;
        let live = self.live.lock().await;
        Ok(stored
            .into_iter()
            .map(|s| match live.get(&s.id) {
                Some(machine) => machine.snapshot(),
                None => s,
            })
            .collect())
    }
}
