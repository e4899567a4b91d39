//! Execution records and the status state machine (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};
use crate::ids::ExecutionId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Interrupted
        )
    }

    /// `pending -> running -> {completed,failed,interrupted}`, plus the
    /// direct `pending -> failed` escape hatch when dispatch never reaches
    /// the wrapper (§3). All other transitions, including any transition out
    /// of a terminal state, are rejected.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Interrupted)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub execution_id: ExecutionId,
    pub mode: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub ingest_token: String,
    pub process_id: Option<String>,
}

impl Execution {
    pub fn new(execution_id: ExecutionId, mode: impl Into<String>, ingest_token: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            execution_id,
            mode: mode.into(),
            status: ExecutionStatus::Pending,
            started_at: now,
            last_heartbeat: None,
            completed_at: None,
            error: None,
            ingest_token: ingest_token.into(),
            process_id: None,
        }
    }

    /// Validates and applies a status transition in place; returns the
    /// previous status on success.
    pub fn transition(
        &mut self,
        next: ExecutionStatus,
        completed_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> SessionResult<ExecutionStatus> {
        if !self.status.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let previous = self.status;
        self.status = next;
        if next.is_terminal() {
            self.completed_at = completed_at;
            self.error = error;
        }
        Ok(previous)
    }
}
