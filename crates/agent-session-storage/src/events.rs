//! Append-only event log (§3 `StoredEvent`, §4.1, §4.7).
//!
//! Storage ids are monotonically increasing `AUTOINCREMENT` rows, giving the
//! Event Fabric the strictly increasing sequence numbers §5 requires for
//! replay ordering.

use agent_session_types::{ExecutionId, SessionError, SessionId, StorageDriverError, StoredEvent};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};

use crate::connection::SessionStore;

fn driver_err(context: &str, err: rusqlite::Error) -> SessionError {
    SessionError::Storage(StorageDriverError::new(context.to_string(), err))
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<StoredEvent> {
    let payload_json: String = row.get(4)?;
    Ok(StoredEvent {
        id: row.get(0)?,
        execution_id: ExecutionId::from(row.get::<_, String>(1)?),
        session_id: SessionId::from(row.get::<_, String>(2)?),
        stream_event_type: row.get(3)?,
        payload_json: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
        timestamp: ms_to_dt(row.get(5)?),
    })
}

impl SessionStore {
    /// Appends one event and returns its assigned storage id.
    pub async fn append_event(
        &self,
        session_id: SessionId,
        execution_id: ExecutionId,
        stream_event_type: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> agent_session_types::SessionResult<i64> {
        self.with_connection(move |conn: &Connection| {
            let payload_json = serde_json::to_string(&payload)
                .map_err(|e| SessionError::StorageCorrupt(format!("event payload serialize: {e}")))?;
            conn.execute(
                "INSERT INTO events (execution_id, session_id, stream_event_type, payload_json, timestamp_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    execution_id.as_str(),
                    session_id.as_str(),
                    stream_event_type,
                    payload_json,
                    timestamp.timestamp_millis()
                ],
            )
            .map_err(|e| driver_err("append event", e))?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Events for `execution_id` with storage id greater than `after_id`, in
    /// ascending order — the replay contract the stream endpoint depends on.
    pub async fn events_since(
        &self,
        execution_id: ExecutionId,
        after_id: i64,
    ) -> agent_session_types::SessionResult<Vec<StoredEvent>> {
        self.with_connection(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, execution_id, session_id, stream_event_type, payload_json, timestamp_ms
                     FROM events WHERE execution_id = ?1 AND id > ?2 ORDER BY id ASC",
                )
                .map_err(|e| driver_err("prepare events_since", e))?;
            let rows = stmt
                .query_map(params![execution_id.as_str(), after_id], row_to_event)
                .map_err(|e| driver_err("query events_since", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| driver_err("collect events_since", e))
        })
        .await
    }

    /// All events in this session's store with storage id greater than
    /// `after_id`, in ascending order. Unlike [`events_since`], not scoped to
    /// one execution — used to seed a `/stream` client, which replays the
    /// whole session's buffer rather than a single execution's (§4.7).
    ///
    /// [`events_since`]: SessionStore::events_since
    pub async fn events_since_all(&self, after_id: i64) -> agent_session_types::SessionResult<Vec<StoredEvent>> {
        self.with_connection(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, execution_id, session_id, stream_event_type, payload_json, timestamp_ms
                     FROM events WHERE id > ?1 ORDER BY id ASC",
                )
                .map_err(|e| driver_err("prepare events_since_all", e))?;
            let rows = stmt
                .query_map(params![after_id], row_to_event)
                .map_err(|e| driver_err("query events_since_all", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| driver_err("collect events_since_all", e))
        })
        .await
    }

    /// Deletes events older than `retention` relative to `now` (§4.6 reaper
    /// step c). Returns the number of rows deleted.
    pub async fn delete_events_older_than(
        &self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> agent_session_types::SessionResult<u64> {
        let cutoff_ms = (now - retention).timestamp_millis();
        self.with_connection(move |conn| {
            let deleted = conn
                .execute("DELETE FROM events WHERE timestamp_ms < ?1", params![cutoff_ms])
                .map_err(|e| driver_err("delete expired events", e))?;
            Ok(deleted as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn append_and_replay_in_order() {
        let store = SessionStore::open_in_memory().unwrap();
        let session_id = SessionId::from("s1");
        let execution_id = ExecutionId::from("e1");
        let now = Utc::now();
        store
            .append_event(
                session_id.clone(),
                execution_id.clone(),
                "log".into(),
                serde_json::json!({"n": 1}),
                now,
            )
            .await
            .unwrap();
        let second_id = store
            .append_event(
                session_id.clone(),
                execution_id.clone(),
                "log".into(),
                serde_json::json!({"n": 2}),
                now,
            )
            .await
            .unwrap();

        let events = store.events_since(execution_id, 0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].id, second_id);
        assert_eq!(events[1].payload_json, serde_json::json!({"n": 2}));
    }

    #[tokio::test]
    async fn events_since_all_ignores_execution_boundaries() {
        let store = SessionStore::open_in_memory().unwrap();
        let session_id = SessionId::from("s1");
        let now = Utc::now();
        store
            .append_event(session_id.clone(), ExecutionId::from("e1"), "log".into(), serde_json::json!({"n": 1}), now)
            .await
            .unwrap();
        store
            .append_event(session_id, ExecutionId::from("e2"), "log".into(), serde_json::json!({"n": 2}), now)
            .await
            .unwrap();

        let events = store.events_since_all(0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].execution_id, ExecutionId::from("e1"));
        assert_eq!(events[1].execution_id, ExecutionId::from("e2"));
    }

    #[tokio::test]
    async fn retention_deletes_old_events() {
        let store = SessionStore::open_in_memory().unwrap();
        let old = Utc::now() - Duration::days(100);
        store
            .append_event(SessionId::from("s1"), ExecutionId::from("e1"), "log".into(), serde_json::json!({}), old)
            .await
            .unwrap();
        let deleted = store
            .delete_events_older_than(Utc::now(), Duration::days(90))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }
}
