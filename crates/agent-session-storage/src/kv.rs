//! Key-value area: session metadata, last-activity timestamp, and the
//! interrupt flag (§4.1, §4.2).

use agent_session_types::{SessionError, SessionMetadata, SessionResult, StorageDriverError};
use rusqlite::{params, Connection, OptionalExtension};

use crate::connection::SessionStore;

const KEY_METADATA: &str = "metadata";
const KEY_LAST_ACTIVITY: &str = "last_activity_ms";
const KEY_INTERRUPT: &str = "interrupt_requested";
const KEY_ACTIVE_EXECUTION: &str = "active_execution_id";

fn driver_err(context: &str, err: rusqlite::Error) -> SessionError {
    SessionError::Storage(StorageDriverError::new(context.to_string(), err))
}

fn get_raw(conn: &Connection, key: &str) -> SessionResult<Option<String>> {
    conn.query_row("SELECT value FROM kv_store WHERE key = ?1", params![key], |row| row.get(0))
        .optional()
        .map_err(|e| driver_err("read kv_store", e))
}

fn put_raw(conn: &Connection, key: &str, value: &str) -> SessionResult<()> {
    conn.execute(
        "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .map_err(|e| driver_err("write kv_store", e))?;
    Ok(())
}

impl SessionStore {
    pub async fn load_metadata(&self) -> SessionResult<Option<SessionMetadata>> {
        self.with_connection(|conn| {
            let raw = get_raw(conn, KEY_METADATA)?;
            raw.map(|s| {
                serde_json::from_str(&s).map_err(|e| {
                    SessionError::StorageCorrupt(format!("metadata JSON corrupt: {e}"))
                })
            })
            .transpose()
        })
        .await
    }

    pub async fn save_metadata(&self, metadata: &SessionMetadata) -> SessionResult<()> {
        let raw = serde_json::to_string(metadata)
            .map_err(|e| SessionError::StorageCorrupt(format!("metadata serialize: {e}")))?;
        self.with_connection(move |conn| put_raw(conn, KEY_METADATA, &raw)).await
    }

    pub async fn load_last_activity_ms(&self) -> SessionResult<Option<i64>> {
        self.with_connection(|conn| {
            get_raw(conn, KEY_LAST_ACTIVITY)?
                .map(|s| {
                    s.parse::<i64>()
                        .map_err(|e| SessionError::StorageCorrupt(format!("last_activity corrupt: {e}")))
                })
                .transpose()
        })
        .await
    }

    pub async fn touch_last_activity(&self, now_ms: i64) -> SessionResult<()> {
        self.with_connection(move |conn| put_raw(conn, KEY_LAST_ACTIVITY, &now_ms.to_string()))
            .await
    }

    pub async fn set_interrupt_requested(&self, requested: bool) -> SessionResult<()> {
        self.with_connection(move |conn| put_raw(conn, KEY_INTERRUPT, if requested { "1" } else { "0" }))
            .await
    }

    pub async fn is_interrupt_requested(&self) -> SessionResult<bool> {
        self.with_connection(|conn| Ok(get_raw(conn, KEY_INTERRUPT)?.as_deref() == Some("1")))
            .await
    }

    pub async fn set_active_execution(&self, execution_id: Option<&str>) -> SessionResult<()> {
        let execution_id = execution_id.map(|s| s.to_string());
        self.with_connection(move |conn| match &execution_id {
            Some(id) => put_raw(conn, KEY_ACTIVE_EXECUTION, id),
            None => {
                conn.execute("DELETE FROM kv_store WHERE key = ?1", params![KEY_ACTIVE_EXECUTION])
                    .map_err(|e| driver_err("clear active execution", e))?;
                Ok(())
            }
        })
        .await
    }

    pub async fn active_execution_id(&self) -> SessionResult<Option<String>> {
        self.with_connection(|conn| get_raw(conn, KEY_ACTIVE_EXECUTION)).await
    }

    /// Wipes every row in every table (§4.6 `deleteSession`), keeping the
    /// schema itself intact so the store stays usable if the session id is
    /// ever reused.
    pub async fn delete_all(&self) -> SessionResult<()> {
        self.with_connection(|conn| {
            for table in ["kv_store", "events", "execution_leases", "command_queue", "executions"] {
                conn.execute(&format!("DELETE FROM {table}"), params![])
                    .map_err(|e| driver_err("delete session data", e))?;
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_session_types::{GitSource, SessionId, UserId};
    use chrono::Utc;

    fn sample_metadata() -> SessionMetadata {
        SessionMetadata::new(
            SessionId::from("agent_1"),
            UserId::from("user_1"),
            GitSource::GitHub {
                github_repo: "acme/repo".into(),
                github_token: None,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn metadata_round_trips() {
        let store = SessionStore::open_in_memory().unwrap();
        assert!(store.load_metadata().await.unwrap().is_none());
        let meta = sample_metadata();
        store.save_metadata(&meta).await.unwrap();
        let loaded = store.load_metadata().await.unwrap().unwrap();
        assert_eq!(loaded.session_id, meta.session_id);
    }

    #[tokio::test]
    async fn active_execution_pointer_round_trips() {
        let store = SessionStore::open_in_memory().unwrap();
        assert!(store.active_execution_id().await.unwrap().is_none());
        store.set_active_execution(Some("exec-1")).await.unwrap();
        assert_eq!(store.active_execution_id().await.unwrap().as_deref(), Some("exec-1"));
        store.set_active_execution(None).await.unwrap();
        assert!(store.active_execution_id().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn interrupt_flag_defaults_to_false() {
        let store = SessionStore::open_in_memory().unwrap();
        assert!(!store.is_interrupt_requested().await.unwrap());
        store.set_interrupt_requested(true).await.unwrap();
        assert!(store.is_interrupt_requested().await.unwrap());
    }
}
