//! `command_queue` table backing the Command Queue (§3, §4.4).

use agent_session_types::{ExecutionId, QueueEntry, SessionError, SessionId, SessionResult, StorageDriverError};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};

use crate::connection::SessionStore;

fn driver_err(context: &str, err: rusqlite::Error) -> SessionError {
    SessionError::Storage(StorageDriverError::new(context.to_string(), err))
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<QueueEntry> {
    let message_json: String = row.get(3)?;
    Ok(QueueEntry {
        id: row.get(0)?,
        session_id: SessionId::from(row.get::<_, String>(1)?),
        execution_id: ExecutionId::from(row.get::<_, String>(2)?),
        message_json: serde_json::from_str(&message_json).unwrap_or(serde_json::Value::Null),
        created_at: ms_to_dt(row.get(4)?),
    })
}

impl SessionStore {
    pub async fn enqueue(
        &self,
        session_id: SessionId,
        execution_id: ExecutionId,
        message: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> SessionResult<i64> {
        self.with_connection(move |conn| {
            let message_json = serde_json::to_string(&message)
                .map_err(|e| SessionError::StorageCorrupt(format!("queue message serialize: {e}")))?;
            conn.execute(
                "INSERT INTO command_queue (session_id, execution_id, message_json, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id.as_str(), execution_id.as_str(), message_json, created_at.timestamp_millis()],
            )
            .map_err(|e| driver_err("enqueue", e))?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn peek_oldest(&self, session_id: SessionId) -> SessionResult<Option<QueueEntry>> {
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT id, session_id, execution_id, message_json, created_at_ms
                 FROM command_queue WHERE session_id = ?1 ORDER BY id ASC LIMIT 1",
                params![session_id.as_str()],
                row_to_entry,
            )
            .optional()
            .map_err(|e| driver_err("peek oldest queue entry", e))
        })
        .await
    }

    pub async fn dequeue_by_id(&self, row_id: i64) -> SessionResult<()> {
        self.with_connection(move |conn| {
            conn.execute("DELETE FROM command_queue WHERE id = ?1", params![row_id])
                .map_err(|e| driver_err("dequeue by id", e))?;
            Ok(())
        })
        .await
    }

    pub async fn count(&self, session_id: SessionId) -> SessionResult<i64> {
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM command_queue WHERE session_id = ?1",
                params![session_id.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| driver_err("count queue entries", e))
        })
        .await
    }

    /// Every queue row for `session_id` in FIFO order, including rows parked
    /// behind an active execution that `peek_oldest` alone would never
    /// surface (reaper §4.6 step e needs to sweep the whole queue, not just
    /// the head).
    pub async fn list_all(&self, session_id: SessionId) -> SessionResult<Vec<QueueEntry>> {
        self.with_connection(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, session_id, execution_id, message_json, created_at_ms
                     FROM command_queue WHERE session_id = ?1 ORDER BY id ASC",
                )
                .map_err(|e| driver_err("prepare list queue entries", e))?;
            let rows = stmt
                .query_map(params![session_id.as_str()], row_to_entry)
                .map_err(|e| driver_err("list queue entries", e))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| driver_err("read queue entries", e))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_peek_and_dequeue() {
        let store = SessionStore::open_in_memory().unwrap();
        let session_id = SessionId::from("s1");
        let now = Utc::now();
        let first = store
            .enqueue(session_id.clone(), ExecutionId::from("e1"), serde_json::json!({"n": 1}), now)
            .await
            .unwrap();
        store
            .enqueue(session_id.clone(), ExecutionId::from("e2"), serde_json::json!({"n": 2}), now)
            .await
            .unwrap();

        assert_eq!(store.count(session_id.clone()).await.unwrap(), 2);
        let head = store.peek_oldest(session_id.clone()).await.unwrap().unwrap();
        assert_eq!(head.id, first);

        store.dequeue_by_id(first).await.unwrap();
        assert_eq!(store.count(session_id.clone()).await.unwrap(), 1);
        let head = store.peek_oldest(session_id).await.unwrap().unwrap();
        assert_eq!(head.execution_id, ExecutionId::from("e2"));
    }
}
