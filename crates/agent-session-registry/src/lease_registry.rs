//! Lease Registry (§4.3): dedups concurrent consumers of one enqueued
//! execution message.

use agent_session_storage::SessionStore;
use agent_session_types::{ExecutionId, Lease, LeaseId, SessionResult, DEFAULT_LEASE_TTL};
use chrono::{DateTime, Utc};

#[derive(Clone)]
pub struct LeaseRegistry {
    store: SessionStore,
}

impl LeaseRegistry {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    pub async fn try_acquire(
        &self,
        execution_id: ExecutionId,
        lease_id: LeaseId,
        message_id: Option<String>,
        now: DateTime<Utc>,
    ) -> SessionResult<bool> {
        self.store
            .try_acquire_lease(execution_id, lease_id, message_id, now + DEFAULT_LEASE_TTL, now)
            .await
    }

    pub async fn extend(&self, execution_id: ExecutionId, lease_id: LeaseId, now: DateTime<Utc>) -> SessionResult<bool> {
        self.store.extend_lease(execution_id, lease_id, now + DEFAULT_LEASE_TTL, now).await
    }

    pub async fn release(&self, execution_id: ExecutionId, lease_id: LeaseId) -> SessionResult<()> {
        self.store.release_lease(execution_id, lease_id).await
    }

    pub async fn delete_expired(&self, now: DateTime<Utc>) -> SessionResult<u64> {
        self.store.delete_expired_leases(now).await
    }

    pub async fn get(&self, execution_id: ExecutionId) -> SessionResult<Option<Lease>> {
        self.store.get_lease(execution_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn registry() -> LeaseRegistry {
        LeaseRegistry::new(SessionStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn second_acquire_fails_until_first_expires_or_releases() {
        let registry = registry().await;
        let now = Utc::now();
        let execution_id = ExecutionId::from("e1");
        assert!(registry
            .try_acquire(execution_id.clone(), LeaseId::from("l1"), None, now)
            .await
            .unwrap());
        assert!(!registry
            .try_acquire(execution_id.clone(), LeaseId::from("l2"), None, now)
            .await
            .unwrap());

        registry.release(execution_id.clone(), LeaseId::from("l1")).await.unwrap();
        assert!(registry
            .try_acquire(execution_id, LeaseId::from("l2"), None, now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_expired_removes_stale_leases() {
        let registry = registry().await;
        let now = Utc::now();
        let execution_id = ExecutionId::from("e1");
        registry.try_acquire(execution_id.clone(), LeaseId::from("l1"), None, now).await.unwrap();
        let later = now + DEFAULT_LEASE_TTL + Duration::seconds(1);
        let removed = registry.delete_expired(later).await.unwrap();
        assert_eq!(removed, 1);
        assert!(registry.get(execution_id).await.unwrap().is_none());
    }
}
