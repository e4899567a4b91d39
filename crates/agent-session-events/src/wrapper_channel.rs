//! Wrapper command channel (§4.7): `sendToWrapper(executionId, command)`.
//!
//! The actual `/ingest` socket is owned by the server binary (it is the only
//! crate that touches an axum `WebSocket`); this registry just tracks which
//! execution each live ingest connection is tagged with.

use std::collections::HashMap;
use std::sync::Mutex;

use agent_session_types::{ExecutionId, SessionError, SessionResult, WrapperCommand};
use tokio::sync::mpsc;

#[derive(Default)]
pub struct WrapperChannelRegistry {
    channels: Mutex<HashMap<String, mpsc::Sender<WrapperCommand>>>,
}

impl WrapperChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, execution_id: ExecutionId, sender: mpsc::Sender<WrapperCommand>) {
        self.channels.lock().unwrap().insert(execution_id.as_str().to_string(), sender);
    }

    pub fn unregister(&self, execution_id: &ExecutionId) {
        self.channels.lock().unwrap().remove(execution_id.as_str());
    }

    /// Returns `success=false` semantics are the caller's job (§4.6
    /// `interruptExecution`); here, a missing channel is just `NotFound`.
    pub async fn send_to_wrapper(&self, execution_id: &ExecutionId, command: WrapperCommand) -> SessionResult<()> {
        let sender = self
            .channels
            .lock()
            .unwrap()
            .get(execution_id.as_str())
            .cloned()
            .ok_or_else(|| SessionError::NotFound(execution_id.to_string()))?;
        sender
            .send(command)
            .await
            .map_err(|_| SessionError::NotFound(execution_id.to_string()))
    }

    pub fn is_connected(&self, execution_id: &ExecutionId) -> bool {
        self.channels.lock().unwrap().contains_key(execution_id.as_str())
    }
}
