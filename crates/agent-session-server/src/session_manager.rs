//! Per-process session registry: lazily opens a session's embedded store,
//! wires a `SessionAuthority` for it, and spawns its reaper loop exactly
//! once (§2 "actor per session", §4.6).

use std::collections::HashMap;
use std::sync::Arc;

use agent_session_authority::{
    channel::ChannelQueueSender, run_reaper_loop, HttpBackendLinkClient, IdentitySecretsDecryptor, SessionAuthority,
};
use agent_session_sandbox::{LocalProcessSandboxRuntime, SandboxRuntime};
use agent_session_storage::SessionStore;
use agent_session_types::{ExecutionId, SessionId, SessionResult};
use tokio::sync::{mpsc, Mutex};

use crate::config::ServerConfig;

/// Backpressure on the in-process dispatch channel: past this many
/// outstanding dispatches the external queue send in
/// `tryAdvanceQueueInternal` blocks, which is the correct behavior for a
/// single-node deployment with no durable external queue to absorb a burst.
const DISPATCH_CHANNEL_CAPACITY: usize = 256;

pub struct SessionManager {
    config: ServerConfig,
    sandbox: Arc<dyn SandboxRuntime>,
    external_queue: Arc<ChannelQueueSender>,
    dispatch_receiver: Mutex<Option<mpsc::Receiver<agent_session_authority::channel::DispatchedMessage>>>,
    authorities: Mutex<HashMap<String, Arc<SessionAuthority>>>,
    /// Maps a dispatched execution back to its session — `/ingest` is handed
    /// only `executionId` on the wire (§6), never `sessionId`, so this is the
    /// only way the route handler can find the right authority. Populated by
    /// the dispatch worker the moment it drains a message off the external
    /// queue stand-in.
    execution_sessions: Mutex<HashMap<String, SessionId>>,
}

impl SessionManager {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_sandbox(config, Arc::new(LocalProcessSandboxRuntime))
    }

    /// Used by tests to swap in a scripted `SandboxRuntime` so dispatch-worker
    /// tests never shell out to a real `git`/network.
    pub fn with_sandbox(config: ServerConfig, sandbox: Arc<dyn SandboxRuntime>) -> Self {
        let (external_queue, dispatch_receiver) = ChannelQueueSender::pair(DISPATCH_CHANNEL_CAPACITY);
        Self {
            config,
            sandbox,
            external_queue: Arc::new(external_queue),
            dispatch_receiver: Mutex::new(Some(dispatch_receiver)),
            authorities: Mutex::new(HashMap::new()),
            execution_sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register_execution_session(&self, execution_id: &ExecutionId, session_id: &SessionId) {
        self.execution_sessions
            .lock()
            .await
            .insert(execution_id.as_str().to_string(), session_id.clone());
    }

    pub async fn session_for_execution(&self, execution_id: &ExecutionId) -> Option<SessionId> {
        self.execution_sessions.lock().await.get(execution_id.as_str()).cloned()
    }

    /// Hands the dispatch worker its receiver half. Panics if called twice —
    /// there is exactly one dispatch worker per process.
    pub async fn take_dispatch_receiver(&self) -> mpsc::Receiver<agent_session_authority::channel::DispatchedMessage> {
        self.dispatch_receiver
            .lock()
            .await
            .take()
            .expect("dispatch receiver already taken")
    }

    fn store_path(&self, session_id: &SessionId) -> std::path::PathBuf {
        self.config.data_dir.join(format!("{}.sqlite3", session_id.as_str()))
    }

    /// Opens (creating if absent) the authority for `session_id`, spawning
    /// its reaper loop the first time it's constructed in this process.
    pub async fn get_or_create(&self, session_id: &SessionId) -> SessionResult<Arc<SessionAuthority>> {
        let mut authorities = self.authorities.lock().await;
        if let Some(existing) = authorities.get(session_id.as_str()) {
            return Ok(existing.clone());
        }

        tokio::fs::create_dir_all(&self.config.data_dir)
            .await
            .map_err(|e| agent_session_types::SessionError::StorageCorrupt(format!("create data dir: {e}")))?;

        let store = SessionStore::open(self.store_path(session_id))?;
        let authority = Arc::new(SessionAuthority::new(
            session_id.clone(),
            store,
            self.sandbox.clone(),
            self.external_queue.clone(),
            Arc::new(HttpBackendLinkClient::new(self.config.backend_base_url.clone())),
            Arc::new(IdentitySecretsDecryptor),
            self.config.authority.clone(),
        ));

        tokio::spawn(run_reaper_loop((*authority).clone()));
        authorities.insert(session_id.as_str().to_string(), authority.clone());
        Ok(authority)
    }

    /// Looks up an already-open authority without creating one; used by
    /// routes that must 404 on an unknown session rather than silently
    /// provisioning an empty one (§6 `/stream`, `/ingest`).
    pub async fn existing(&self, session_id: &SessionId) -> Option<Arc<SessionAuthority>> {
        self.authorities.lock().await.get(session_id.as_str()).cloned()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        let mut config = ServerConfig::from_env();
        config.data_dir = std::env::temp_dir().join(format!("agent-session-server-test-{}", uuid::Uuid::new_v4()));
        config
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let manager = SessionManager::new(config());
        let session_id = SessionId::from("s1");
        let first = manager.get_or_create(&session_id).await.unwrap();
        let second = manager.get_or_create(&session_id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        tokio::fs::remove_dir_all(&manager.config().data_dir).await.ok();
    }

    #[tokio::test]
    async fn unopened_session_is_not_existing() {
        let manager = SessionManager::new(config());
        assert!(manager.existing(&SessionId::from("ghost")).await.is_none());
    }

    #[tokio::test]
    async fn execution_session_lookup_round_trips() {
        let manager = SessionManager::new(config());
        let execution_id = agent_session_types::ExecutionId::from("e1");
        let session_id = SessionId::from("s1");
        assert!(manager.session_for_execution(&execution_id).await.is_none());
        manager.register_execution_session(&execution_id, &session_id).await;
        assert_eq!(manager.session_for_execution(&execution_id).await, Some(session_id));
    }
}
