//! Semantic error taxonomy shared by every crate in the workspace.
//!
//! One flat enum rather than per-crate error types: callers at the HTTP edge
//! need to map every failure kind to a status code regardless of which
//! component raised it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session already prepared")]
    AlreadyPrepared,

    #[error("session not prepared")]
    NotPrepared,

    #[error("session already initiated")]
    AlreadyInitiated,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid metadata at {path}: {reason}")]
    InvalidMetadata { path: String, reason: String },

    #[error("invalid execution transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("an execution is already active")]
    AlreadyActive,

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("lease already held for execution {0}")]
    LeaseHeld(String),

    #[error("setup command failed: {command} (exit {exit_code}): {stderr}")]
    SetupCommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("workspace missing for session {0}")]
    WorkspaceMissing(String),

    #[error("queue is full")]
    QueueFull,

    #[error("queue entry expired")]
    QueueExpired,

    #[error("sandbox error (retryable): {0}")]
    SandboxRetryable(String),

    #[error("sandbox overloaded: {0}")]
    SandboxOverloaded(String),

    #[error("sandbox fatal error: {0}")]
    SandboxFatal(String),

    #[error("backend link failed: {0}")]
    BackendLinkFailed(String),

    #[error("callback delivery failed: {0}")]
    CallbackDeliveryFailed(String),

    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageDriverError),
}

/// Wraps the underlying SQLite driver error so `rusqlite::Error` never leaks
/// past the storage crate's public API.
#[derive(Debug, Error)]
#[error("{context}: {source}")]
pub struct StorageDriverError {
    pub context: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl StorageDriverError {
    pub fn new(context: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Whether a sandbox-layer error is eligible for `with_sandbox_retry`.
///
/// Matches §4.5's retry policy: retryable-but-not-overloaded errors retry,
/// everything else (fatal, overloaded) surfaces immediately.
impl SessionError {
    pub fn is_sandbox_retryable(&self) -> bool {
        matches!(self, SessionError::SandboxRetryable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_retryable_classification() {
        assert!(SessionError::SandboxRetryable("timeout".into()).is_sandbox_retryable());
        assert!(!SessionError::SandboxOverloaded("busy".into()).is_sandbox_retryable());
        assert!(!SessionError::SandboxFatal("boom".into()).is_sandbox_retryable());
        assert!(!SessionError::QueueFull.is_sandbox_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = SessionError::InvalidTransition {
            from: "completed".into(),
            to: "running".into(),
        };
        assert_eq!(err.to_string(), "invalid execution transition: completed -> running");
    }
}
