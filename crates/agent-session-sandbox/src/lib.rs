//! Sandbox Orchestrator (§4.5): workspace provisioning for Initialize and
//! Resume flows, behind a narrow [`SandboxRuntime`] transport trait so the
//! logic is testable without a real sandbox process.

mod env;
mod provisioning;
mod retry;
mod runtime;
mod sandbox_id;

pub use env::{build_environment, ReservedEnv};
pub use provisioning::{
    initialize, resume, InitializeRequest, PreparedSession, ResumeRequest, SetupMode, WorkspaceLayout,
    SETUP_COMMAND_TIMEOUT_SECS,
};
pub use retry::{is_retryable, with_sandbox_retry, MAX_ATTEMPTS};
pub use runtime::{CommandOutput, LocalProcessSandboxRuntime, SandboxRuntime};
pub use sandbox_id::generate_sandbox_id;

#[cfg(any(test, feature = "test-fixtures"))]
pub use runtime::fake::FakeSandboxRuntime;
