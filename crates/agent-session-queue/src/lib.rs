//! Command Queue (§4.4): a thin FIFO facade over the embedded store.
//!
//! Depth limiting and TTL expiry are policy decisions owned by the Session
//! Authority (§4.6) — this crate only persists and retrieves rows.

use agent_session_storage::SessionStore;
use agent_session_types::{ExecutionId, QueueEntry, SessionId, SessionResult};
use chrono::{DateTime, Utc};

pub use agent_session_types::{MAX_QUEUE_DEPTH, QUEUE_ENTRY_TTL};

#[derive(Clone)]
pub struct CommandQueue {
    store: SessionStore,
}

impl CommandQueue {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    pub async fn enqueue(
        &self,
        session_id: SessionId,
        execution_id: ExecutionId,
        message: serde_json::Value,
        now: DateTime<Utc>,
    ) -> SessionResult<i64> {
        self.store.enqueue(session_id, execution_id, message, now).await
    }

    pub async fn peek_oldest(&self, session_id: SessionId) -> SessionResult<Option<QueueEntry>> {
        self.store.peek_oldest(session_id).await
    }

    pub async fn dequeue_by_id(&self, row_id: i64) -> SessionResult<()> {
        self.store.dequeue_by_id(row_id).await
    }

    pub async fn count(&self, session_id: SessionId) -> SessionResult<i64> {
        self.store.count(session_id).await
    }

    pub async fn list_all(&self, session_id: SessionId) -> SessionResult<Vec<QueueEntry>> {
        self.store.list_all(session_id).await
    }
}
