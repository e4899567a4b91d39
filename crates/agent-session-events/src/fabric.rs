//! Persistence + broadcast split (§4.7): an append-only `EventStore`-style
//! log generalized to a multi-subscriber fan-out backed by the same table.

use agent_session_storage::SessionStore;
use agent_session_types::{ExecutionId, SessionId, SessionResult, StoredEvent};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventFabric {
    store: SessionStore,
    sender: broadcast::Sender<StoredEvent>,
}

impl EventFabric {
    pub fn new(store: SessionStore) -> Self {
        let (sender, _receiver) = broadcast::channel(BROADCAST_CAPACITY);
        Self { store, sender }
    }

    /// Persists one event and fans it out to every live `/stream` subscriber.
    /// Broadcast happens only after the write succeeds, so replay-from-id
    /// never skips an event a subscriber was told about.
    pub async fn append(
        &self,
        session_id: SessionId,
        execution_id: ExecutionId,
        stream_event_type: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> SessionResult<StoredEvent> {
        let id = self
            .store
            .append_event(session_id.clone(), execution_id.clone(), stream_event_type.clone(), payload.clone(), timestamp)
            .await?;
        let event = StoredEvent {
            id,
            execution_id,
            session_id,
            stream_event_type,
            payload_json: payload,
            timestamp,
        };
        // No subscribers is not an error — it just means nobody is watching yet.
        let _ = self.sender.send(event.clone());
        Ok(event)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoredEvent> {
        self.sender.subscribe()
    }

    /// Replays persisted events for `execution_id` after `after_id`, in
    /// ascending storage-id order — used to seed a freshly connected
    /// `/stream` client before it starts receiving broadcasts.
    pub async fn replay(&self, execution_id: ExecutionId, after_id: i64) -> SessionResult<Vec<StoredEvent>> {
        self.store.events_since(execution_id, after_id).await
    }

    /// Replays the whole session's event buffer (not one execution's) in
    /// ascending storage-id order — what a freshly connected `/stream` client
    /// is seeded with before it starts receiving broadcasts (§4.7).
    pub async fn replay_session(&self, after_id: i64) -> SessionResult<Vec<StoredEvent>> {
        self.store.events_since_all(after_id).await
    }

    pub async fn delete_older_than(&self, now: DateTime<Utc>, retention: chrono::Duration) -> SessionResult<u64> {
        self.store.delete_events_older_than(now, retention).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replay_then_broadcast_preserves_order() {
        let fabric = EventFabric::new(SessionStore::open_in_memory().unwrap());
        let session_id = SessionId::from("s1");
        let execution_id = ExecutionId::from("e1");
        let now = Utc::now();

        fabric
            .append(session_id.clone(), execution_id.clone(), "log".into(), serde_json::json!({"n": 1}), now)
            .await
            .unwrap();

        let mut subscriber = fabric.subscribe();
        let second = fabric
            .append(session_id.clone(), execution_id.clone(), "log".into(), serde_json::json!({"n": 2}), now)
            .await
            .unwrap();

        let replayed = fabric.replay(execution_id.clone(), 0).await.unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[1].id, second.id);

        let broadcasted = subscriber.recv().await.unwrap();
        assert_eq!(broadcasted.id, second.id);
    }

    #[tokio::test]
    async fn replay_session_spans_multiple_executions() {
        let fabric = EventFabric::new(SessionStore::open_in_memory().unwrap());
        let session_id = SessionId::from("s1");
        let now = Utc::now();
        fabric
            .append(session_id.clone(), ExecutionId::from("e1"), "log".into(), serde_json::json!({"n": 1}), now)
            .await
            .unwrap();
        fabric
            .append(session_id, ExecutionId::from("e2"), "log".into(), serde_json::json!({"n": 2}), now)
            .await
            .unwrap();

        let replayed = fabric.replay_session(0).await.unwrap();
        assert_eq!(replayed.len(), 2);
    }

    #[tokio::test]
    async fn append_succeeds_with_no_subscribers() {
        let fabric = EventFabric::new(SessionStore::open_in_memory().unwrap());
        fabric
            .append(SessionId::from("s1"), ExecutionId::from("e1"), "log".into(), serde_json::json!({}), Utc::now())
            .await
            .unwrap();
    }
}
