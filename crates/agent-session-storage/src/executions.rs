//! `executions` table backing the Execution Registry (§3, §4.2).
//!
//! This module is pure storage: insert, read, and unconditional field
//! updates. State-machine enforcement (legal status transitions,
//! `AlreadyExists`, active-pointer discipline) lives in the registry crate,
//! one layer up — storage just persists whatever it is told.

use agent_session_types::{
    Execution, ExecutionId, ExecutionStatus, SessionError, SessionResult, StorageDriverError,
};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};

use crate::connection::SessionStore;

fn driver_err(context: &str, err: rusqlite::Error) -> SessionError {
    SessionError::Storage(StorageDriverError::new(context.to_string(), err))
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn status_to_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Interrupted => "interrupted",
    }
}

fn status_from_str(s: &str) -> ExecutionStatus {
    match s {
        "running" => ExecutionStatus::Running,
        "completed" => ExecutionStatus::Completed,
        "failed" => ExecutionStatus::Failed,
        "interrupted" => ExecutionStatus::Interrupted,
        _ => ExecutionStatus::Pending,
    }
}

fn row_to_execution(row: &rusqlite::Row) -> rusqlite::Result<Execution> {
    let last_heartbeat_ms: Option<i64> = row.get(4)?;
    let completed_at_ms: Option<i64> = row.get(5)?;
    Ok(Execution {
        execution_id: ExecutionId::from(row.get::<_, String>(0)?),
        mode: row.get(1)?,
        status: status_from_str(&row.get::<_, String>(2)?),
        started_at: ms_to_dt(row.get(3)?),
        last_heartbeat: last_heartbeat_ms.map(ms_to_dt),
        completed_at: completed_at_ms.map(ms_to_dt),
        error: row.get(6)?,
        ingest_token: row.get(7)?,
        process_id: row.get(8)?,
    })
}

impl SessionStore {
    /// Returns `false` if `execution_id` already exists (caller maps that to `AlreadyExists`).
    pub async fn insert_execution(&self, execution: Execution) -> SessionResult<bool> {
        self.with_connection(move |conn| {
            let changed = conn
                .execute(
                    "INSERT OR IGNORE INTO executions
                        (execution_id, mode, status, started_at_ms, last_heartbeat_ms, completed_at_ms, error, ingest_token, process_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        execution.execution_id.as_str(),
                        execution.mode,
                        status_to_str(execution.status),
                        execution.started_at.timestamp_millis(),
                        execution.last_heartbeat.map(|t| t.timestamp_millis()),
                        execution.completed_at.map(|t| t.timestamp_millis()),
                        execution.error,
                        execution.ingest_token,
                        execution.process_id,
                    ],
                )
                .map_err(|e| driver_err("insert execution", e))?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> SessionResult<Option<Execution>> {
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT execution_id, mode, status, started_at_ms, last_heartbeat_ms, completed_at_ms, error, ingest_token, process_id
                 FROM executions WHERE execution_id = ?1",
                params![execution_id.as_str()],
                row_to_execution,
            )
            .optional()
            .map_err(|e| driver_err("read execution", e))
        })
        .await
    }

    pub async fn update_execution_status(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        completed_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> SessionResult<()> {
        self.with_connection(move |conn| {
            conn.execute(
                "UPDATE executions SET status = ?1, completed_at_ms = ?2, error = ?3 WHERE execution_id = ?4",
                params![
                    status_to_str(status),
                    completed_at.map(|t| t.timestamp_millis()),
                    error,
                    execution_id.as_str()
                ],
            )
            .map_err(|e| driver_err("update execution status", e))?;
            Ok(())
        })
        .await
    }

    pub async fn update_heartbeat(&self, execution_id: ExecutionId, ts: DateTime<Utc>) -> SessionResult<()> {
        self.with_connection(move |conn| {
            conn.execute(
                "UPDATE executions SET last_heartbeat_ms = ?1 WHERE execution_id = ?2",
                params![ts.timestamp_millis(), execution_id.as_str()],
            )
            .map_err(|e| driver_err("update heartbeat", e))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> Execution {
        Execution::new(ExecutionId::from(id), "code", "tok", Utc::now())
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = SessionStore::open_in_memory().unwrap();
        assert!(store.insert_execution(sample("e1")).await.unwrap());
        assert!(!store.insert_execution(sample("e1")).await.unwrap());
    }

    #[tokio::test]
    async fn status_and_heartbeat_updates_persist() {
        let store = SessionStore::open_in_memory().unwrap();
        store.insert_execution(sample("e1")).await.unwrap();
        let now = Utc::now();
        store.update_heartbeat(ExecutionId::from("e1"), now).await.unwrap();
        store
            .update_execution_status(ExecutionId::from("e1"), ExecutionStatus::Running, None, None)
            .await
            .unwrap();
        let loaded = store.get_execution(ExecutionId::from("e1")).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert_eq!(loaded.last_heartbeat.unwrap().timestamp_millis(), now.timestamp_millis());
    }
}
