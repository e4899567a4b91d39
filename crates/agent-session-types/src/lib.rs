//! Shared identifiers, data model, and error taxonomy for the cloud agent
//! session core. Every other crate in the workspace depends on this one and
//! none of its types depend back on them.

pub mod error;
pub mod event;
pub mod execution;
pub mod ids;
pub mod lease;
pub mod metadata;
pub mod queue;

pub use error::{SessionError, SessionResult, StorageDriverError};
pub use event::{StoredEvent, WrapperCommand, WrapperEvent};
pub use execution::{Execution, ExecutionStatus};
pub use ids::{BotId, ExecutionId, LeaseId, OrgId, SandboxId, SessionId, UserId};
pub use lease::{Lease, DEFAULT_LEASE_TTL};
pub use metadata::{
    CallbackTarget, GitSource, McpServerConfig, MetadataPatch, PreparedExecutionInput, SessionMetadata,
};
pub use queue::{QueueEntry, MAX_QUEUE_DEPTH, QUEUE_ENTRY_TTL};
