//! Callback job construction (§4.8): the payload shape sent to `callbackTarget`.

use agent_session_types::{CallbackTarget, ExecutionId, ExecutionStatus, SessionId};
use serde::Serialize;

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub session_id: SessionId,
    pub cloud_agent_session_id: SessionId,
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kilo_session_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CallbackJob {
    pub target: CallbackTarget,
    pub payload: CallbackPayload,
}

impl CallbackJob {
    /// `cloudAgentSessionId` duplicates `sessionId` in the payload; the
    /// distilled wire format carries both names for the same value so
    /// external consumers that expect either key keep working.
    pub fn for_terminal_status(
        target: CallbackTarget,
        session_id: SessionId,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        error_message: Option<String>,
        last_seen_branch: Option<String>,
        kilo_session_id: Option<String>,
    ) -> Self {
        Self {
            target,
            payload: CallbackPayload {
                cloud_agent_session_id: session_id.clone(),
                session_id,
                execution_id,
                status,
                error_message,
                last_seen_branch,
                kilo_session_id,
            },
        }
    }
}
