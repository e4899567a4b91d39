//! Connection lifecycle: one physical SQLite file per session directory,
//! opened in WAL mode, with schema bootstrap guarded by a `OnceLock` the way
//! `PostgresRuntimeRepository::ensure_schema` guards its own bootstrap.

use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use agent_session_types::{SessionError, SessionResult, StorageDriverError};
use rusqlite::Connection;

use crate::migrations::run_migrations;

fn driver_err(context: &str, err: rusqlite::Error) -> SessionError {
    SessionError::Storage(StorageDriverError::new(context.to_string(), err))
}

/// Shared handle to one session's embedded store.
///
/// `rusqlite::Connection` is not `Sync`; callers reach it only through
/// [`SessionStore::with_connection`], which hops to a blocking thread so the
/// async reaper/authority tasks never stall waiting on a synchronous mutex.
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
    schema_ready: Arc<OnceLock<Result<(), String>>>,
}

impl SessionStore {
    pub fn open(path: impl AsRef<Path>) -> SessionResult<Self> {
        let conn = Connection::open(path).map_err(|e| driver_err("open database", e))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> SessionResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| driver_err("open in-memory database", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> SessionResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| driver_err("set WAL journal mode", e))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| driver_err("enable foreign keys", e))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            schema_ready: Arc::new(OnceLock::new()),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Runs `migrations` exactly once per `SessionStore` instance, under the
    /// `schema_ready` barrier (§4.1: "applied once under a concurrency
    /// barrier at session first-touch; each migration is idempotent").
    fn ensure_schema(&self) -> SessionResult<()> {
        let result = self.schema_ready.get_or_init(|| {
            let mut guard = self.conn.lock().expect("storage connection poisoned");
            run_migrations(&mut guard).map_err(|e| e.to_string())
        });
        result.clone().map_err(|e| {
            SessionError::StorageCorrupt(format!("schema migration failed: {e}"))
        })
    }

    /// Runs `f` against the underlying connection on a blocking thread.
    pub async fn with_connection<F, T>(&self, f: F) -> SessionResult<T>
    where
        F: FnOnce(&Connection) -> SessionResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("storage connection poisoned");
            f(&guard)
        })
        .await
        .map_err(|e| SessionError::StorageCorrupt(format!("blocking task panicked: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_runs_migrations_once() {
        let store = SessionStore::open_in_memory().unwrap();
        let version: i64 = store
            .with_connection(|conn| {
                conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
                    .map_err(|e| driver_err("read schema version", e))
            })
            .await
            .unwrap();
        assert!(version >= 1);
    }
}
