use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::Session;

/// Async-safe handle to the session store.
///
/// Wraps `SessionStore` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct SessionDb {
    inner: Arc<std::sync::Mutex<SessionStore>>,
}

impl SessionDb {
    pub fn new(store: SessionStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Open an in-memory store (for tests and throwaway servers).
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(SessionStore::new_in_memory()?))
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SessionStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("Session store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Session store task panicked")?
    }

    pub async fn put(&self, session: Session) -> Result<()> {
        self.call(move |store| store.put(&session)).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let id = id.to_string();
        self.call(move |store| store.get(&id)).await
    }

    pub async fn list(&self) -> Result<Vec<Session>> {
        self.call(|store| store.list()).await
    }
}

/// Whole-record session persistence. Each row holds one JSON snapshot.
pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    record TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Insert or replace the full record for `session.id`.
    pub fn put(&self, session: &Session) -> Result<()> {
        let record = serde_json::to_string(session).context("Failed to serialize session")?;
        self.conn
            .execute(
                "INSERT INTO sessions (id, status, record, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    record = excluded.record,
                    updated_at = excluded.updated_at",
                params![
                    session.id,
                    session.status.as_str(),
                    record,
                    session.created_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to store session {}", session.id))?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Session>> {
        let record: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to load session {}", id))?;
        record
            .map(|json| {
                serde_json::from_str::<Session>(&json)
                    .with_context(|| format!("Corrupt record for session {}", id))
            })
            .transpose()
    }

    /// All sessions, most recently updated first.
    pub fn list(&self) -> Result<Vec<Session>> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM sessions ORDER BY updated_at DESC, id")
            .context("Failed to prepare session listing")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to list sessions")?;

        let mut sessions = Vec::new();
        for row in rows {
            let json = row.context("Failed to read session row")?;
            sessions.push(serde_json::from_str(&json).context("Corrupt session record")?);
        }
        Ok(sessions)
    }
}

#[cfg(test)]
impl SessionDb {
    /// Run raw SQL against the underlying connection.
    pub(crate) async fn execute_batch(&self, sql: &'static str) -> Result<()> {
        self.call(move |store| store.conn.execute_batch(sql).context("Failed to run SQL"))
            .await
    }
}
