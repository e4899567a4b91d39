//! Streamed wrapper events (§6) and their durable, append-only storage
//! representation (§3 `StoredEvent`).
//!
//! `streamEventType` values beyond the ones the Authority reacts to are
//! passed through unmodified, so the payload stays an open `serde_json::Value`
//! map rather than a closed enum of every possible kilocode event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ExecutionId, SessionId};

/// One frame received on `/ingest` (§6 "Wrapper event messages"). Wire-exact:
/// the wrapper process emits `streamEventType`/`payload` camelCase keys.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WrapperEvent {
    pub stream_event_type: String,
    pub payload: serde_json::Value,
}

impl WrapperEvent {
    /// `payload.event` for `streamEventType == "kilocode"` frames; the only
    /// shape the Authority inspects for side effects (§4.7).
    pub fn kilocode_event(&self) -> Option<&str> {
        if self.stream_event_type != "kilocode" {
            return None;
        }
        self.payload.get("event").and_then(|v| v.as_str())
    }

    pub fn kilocode_session_id(&self) -> Option<&str> {
        if self.kilocode_event() != Some("session_created") {
            return None;
        }
        self.payload.get("sessionId").and_then(|v| v.as_str())
    }

    pub fn kilocode_error(&self) -> Option<&str> {
        self.payload.get("error").and_then(|v| v.as_str())
    }

    /// Maps terminal kilocode events to the Execution status they imply.
    pub fn terminal_status(&self) -> Option<crate::execution::ExecutionStatus> {
        use crate::execution::ExecutionStatus;
        match self.kilocode_event()? {
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "interrupted" => Some(ExecutionStatus::Interrupted),
            _ => None,
        }
    }
}

/// A durable, append-only row (§3 `StoredEvent`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredEvent {
    pub id: i64,
    pub execution_id: ExecutionId,
    pub session_id: SessionId,
    pub stream_event_type: String,
    pub payload_json: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Authority -> wrapper command frames (§6 "Wrapper command messages").
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WrapperCommand {
    Kill { signal: String },
    Ping,
}

impl WrapperCommand {
    pub fn kill_sigterm() -> Self {
        WrapperCommand::Kill {
            signal: "SIGTERM".to_string(),
        }
    }
}
