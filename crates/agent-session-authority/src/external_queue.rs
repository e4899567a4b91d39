//! `ExternalQueueSender` (§2, §4.6 step 4): the durable message queue that
//! carries a dispatched `ExecutionMessage` to a queue consumer is an
//! explicitly out-of-scope collaborator (§1) — this trait is the narrow seam
//! the Authority calls through, mirroring the `SandboxRuntime` abstraction
//! in `agent-session-sandbox` for the same reason (an external system this
//! workspace does not own).

use agent_session_types::{ExecutionId, SessionId, SessionResult};
use async_trait::async_trait;

#[async_trait]
pub trait ExternalQueueSender: Send + Sync {
    /// Delivers one execution message for dispatch. A failure here must
    /// leave the caller free to retry later (§4.6 step 4) — it must never
    /// partially succeed.
    async fn send(&self, session_id: &SessionId, execution_id: &ExecutionId, message: &serde_json::Value) -> SessionResult<()>;
}

/// In-process stand-in for the real durable queue, used by the server
/// binary's single-node deployment and by tests: an `mpsc` channel plays the
/// role of the external transport, with a paired consumer half that a
/// dispatch worker drains.
pub mod channel {
    use super::*;
    use agent_session_types::SessionError;
    use tokio::sync::mpsc;

    #[derive(Clone, Debug)]
    pub struct DispatchedMessage {
        pub session_id: SessionId,
        pub execution_id: ExecutionId,
        pub message: serde_json::Value,
    }

    pub struct ChannelQueueSender {
        sender: mpsc::Sender<DispatchedMessage>,
    }

    impl ChannelQueueSender {
        pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<DispatchedMessage>) {
            let (sender, receiver) = mpsc::channel(capacity);
            (Self { sender }, receiver)
        }
    }

    #[async_trait]
    impl ExternalQueueSender for ChannelQueueSender {
        async fn send(&self, session_id: &SessionId, execution_id: &ExecutionId, message: &serde_json::Value) -> SessionResult<()> {
            self.sender
                .send(DispatchedMessage {
                    session_id: session_id.clone(),
                    execution_id: execution_id.clone(),
                    message: message.clone(),
                })
                .await
                .map_err(|_| SessionError::BadRequest("external queue receiver closed".into()))
        }
    }
}

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingQueueSender {
        pub sent: Mutex<Vec<(SessionId, ExecutionId, serde_json::Value)>>,
        pub fail_next: Mutex<bool>,
    }

    impl RecordingQueueSender {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next_send(&self) {
            *self.fail_next.lock().unwrap() = true;
        }
    }

    #[async_trait]
    impl ExternalQueueSender for RecordingQueueSender {
        async fn send(&self, session_id: &SessionId, execution_id: &ExecutionId, message: &serde_json::Value) -> SessionResult<()> {
            if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                return Err(agent_session_types::SessionError::BadRequest("send failed".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((session_id.clone(), execution_id.clone(), message.clone()));
            Ok(())
        }
    }
}
