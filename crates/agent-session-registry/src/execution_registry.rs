//! Execution Registry (§4.2): the status state machine and the
//! active-execution pointer, layered on top of the raw `executions` table.

use agent_session_storage::SessionStore;
use agent_session_types::{Execution, ExecutionId, ExecutionStatus, SessionError, SessionResult};
use chrono::{DateTime, Utc};

#[derive(Clone)]
pub struct ExecutionRegistry {
    store: SessionStore,
}

impl ExecutionRegistry {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    /// Creates a new execution row in `pending` state.
    pub async fn add(&self, execution_id: ExecutionId, mode: impl Into<String>, ingest_token: impl Into<String>, now: DateTime<Utc>) -> SessionResult<()> {
        let execution = Execution::new(execution_id.clone(), mode, ingest_token, now);
        let inserted = self.store.insert_execution(execution).await?;
        if !inserted {
            return Err(SessionError::AlreadyExists(execution_id.to_string()));
        }
        Ok(())
    }

    pub async fn get(&self, execution_id: ExecutionId) -> SessionResult<Option<Execution>> {
        self.store.get_execution(execution_id).await
    }

    /// Enforces the status state machine (§3); returns `InvalidTransition`
    /// when the move is illegal, `NotFound` when the row doesn't exist.
    pub async fn update_status(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        completed_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> SessionResult<()> {
        let mut execution = self
            .store
            .get_execution(execution_id.clone())
            .await?
            .ok_or_else(|| SessionError::NotFound(execution_id.to_string()))?;

        execution.transition(status, completed_at, error.clone())?;

        self.store
            .update_execution_status(execution_id, status, completed_at, error)
            .await
    }

    /// No-op if the execution is missing (§4.2: used by the ingest handler,
    /// which shouldn't fail the whole frame over a stale heartbeat).
    pub async fn update_heartbeat(&self, execution_id: ExecutionId, ts: DateTime<Utc>) -> SessionResult<()> {
        if self.store.get_execution(execution_id.clone()).await?.is_none() {
            return Ok(());
        }
        self.store.update_heartbeat(execution_id, ts).await
    }

    pub async fn set_active_execution(&self, execution_id: ExecutionId) -> SessionResult<()> {
        if self.store.active_execution_id().await?.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        self.store.set_active_execution(Some(execution_id.as_str())).await
    }

    pub async fn clear_active_execution(&self) -> SessionResult<()> {
        self.store.set_active_execution(None).await
    }

    pub async fn active_execution_id(&self) -> SessionResult<Option<ExecutionId>> {
        Ok(self.store.active_execution_id().await?.map(ExecutionId::from))
    }

    pub async fn request_interrupt(&self) -> SessionResult<()> {
        self.store.set_interrupt_requested(true).await
    }

    pub async fn is_interrupt_requested(&self) -> SessionResult<bool> {
        self.store.is_interrupt_requested().await
    }

    pub async fn clear_interrupt(&self) -> SessionResult<()> {
        self.store.set_interrupt_requested(false).await
    }
}
