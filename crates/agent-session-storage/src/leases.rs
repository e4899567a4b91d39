//! `execution_leases` table backing the Lease Registry (§3, §4.3).

use agent_session_types::{ExecutionId, Lease, LeaseId, SessionError, SessionResult, StorageDriverError};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};

use crate::connection::SessionStore;

fn driver_err(context: &str, err: rusqlite::Error) -> SessionError {
    SessionError::Storage(StorageDriverError::new(context.to_string(), err))
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

impl SessionStore {
    /// Succeeds iff no unexpired lease exists for `execution_id` (§4.3
    /// `tryAcquire`). A caller racing an expired lease simply overwrites it.
    pub async fn try_acquire_lease(
        &self,
        execution_id: ExecutionId,
        lease_id: LeaseId,
        message_id: Option<String>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SessionResult<bool> {
        self.with_connection(move |conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT expires_at_ms FROM execution_leases WHERE execution_id = ?1",
                    params![execution_id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| driver_err("read lease", e))?;

            if let Some(expires_at_ms) = existing {
                if expires_at_ms > now.timestamp_millis() {
                    return Ok(false);
                }
            }

            conn.execute(
                "INSERT INTO execution_leases (execution_id, lease_id, expires_at_ms, message_id)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(execution_id) DO UPDATE SET
                    lease_id = excluded.lease_id,
                    expires_at_ms = excluded.expires_at_ms,
                    message_id = excluded.message_id",
                params![
                    execution_id.as_str(),
                    lease_id.as_str(),
                    expires_at.timestamp_millis(),
                    message_id
                ],
            )
            .map_err(|e| driver_err("acquire lease", e))?;
            Ok(true)
        })
        .await
    }

    /// Succeeds iff `lease_id` currently holds an unexpired lease on
    /// `execution_id` (§4.3 `extend`).
    pub async fn extend_lease(
        &self,
        execution_id: ExecutionId,
        lease_id: LeaseId,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SessionResult<bool> {
        self.with_connection(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE execution_leases SET expires_at_ms = ?1
                     WHERE execution_id = ?2 AND lease_id = ?3 AND expires_at_ms > ?4",
                    params![
                        new_expires_at.timestamp_millis(),
                        execution_id.as_str(),
                        lease_id.as_str(),
                        now.timestamp_millis()
                    ],
                )
                .map_err(|e| driver_err("extend lease", e))?;
            Ok(updated > 0)
        })
        .await
    }

    /// Idempotent: releasing an already-released or foreign lease is a no-op.
    pub async fn release_lease(&self, execution_id: ExecutionId, lease_id: LeaseId) -> SessionResult<()> {
        self.with_connection(move |conn| {
            conn.execute(
                "DELETE FROM execution_leases WHERE execution_id = ?1 AND lease_id = ?2",
                params![execution_id.as_str(), lease_id.as_str()],
            )
            .map_err(|e| driver_err("release lease", e))?;
            Ok(())
        })
        .await
    }

    /// Deletes every expired lease; returns how many were removed (reaper §4.6 step d).
    pub async fn delete_expired_leases(&self, now: DateTime<Utc>) -> SessionResult<u64> {
        self.with_connection(move |conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM execution_leases WHERE expires_at_ms <= ?1",
                    params![now.timestamp_millis()],
                )
                .map_err(|e| driver_err("delete expired leases", e))?;
            Ok(deleted as u64)
        })
        .await
    }

    pub async fn get_lease(&self, execution_id: ExecutionId) -> SessionResult<Option<Lease>> {
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT execution_id, lease_id, expires_at_ms, message_id FROM execution_leases WHERE execution_id = ?1",
                params![execution_id.as_str()],
                |row| {
                    Ok(Lease {
                        execution_id: ExecutionId::from(row.get::<_, String>(0)?),
                        lease_id: LeaseId::from(row.get::<_, String>(1)?),
                        expires_at: ms_to_dt(row.get(2)?),
                        message_id: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|e| driver_err("read lease", e))
        })
        .await
    }
}
