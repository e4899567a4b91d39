//! `startExecution` request/plan shapes (§4.6, §6).

use std::collections::HashMap;

use agent_session_types::SandboxId;
use serde::{Deserialize, Serialize};

/// The `startExecution` branches (§4.6): three kinds (`initiate`,
/// `initiatePrepared`, `resume`) without disambiguating the first two in the
/// wire contract; since a session only ever reaches `startExecution` by
/// having been `prepare()`d first (a separate call, §4.6 scenario 1), an
/// `initiatePrepared` dispatch of an already-prepared session is observably
/// identical to a plain `initiate` one. This implementation merges them into
/// a single `Initiate` branch (recorded in DESIGN.md) and keeps `Resume`
/// distinct since it skips re-cloning and allows a one-off prompt override.
///
/// - `Initiate` — session is `prepared`, not yet `initiated`: finalizes
///   `tryInitiate` (idempotent if already initiated) and dispatches using
///   the `preparedExecution` fields already stored on the metadata.
/// - `Resume` — session has already initiated; starts a new execution
///   against the existing session, optionally overriding the prompt for
///   this invocation, reusing the workspace instead of re-cloning.
#[derive(Clone, Debug)]
pub enum StartExecutionRequest {
    Initiate {
        token_overrides: TokenOverrides,
        shallow_clone: bool,
    },
    Resume {
        prompt_override: Option<String>,
        token_overrides: TokenOverrides,
    },
}

/// Token overrides supplied with the request take precedence over whatever
/// is stored on metadata (§4.6: "preferring request overrides over stored
/// values, then installation-derived tokens"). Installation-derived tokens
/// (a GitHub App installation token) come from the GitHub platform, an
/// out-of-scope collaborator (§1) — this implementation never derives one,
/// it only has a slot for a caller to supply one.
#[derive(Clone, Debug, Default)]
pub struct TokenOverrides {
    pub github_token: Option<String>,
    pub git_token: Option<String>,
    pub installation_token: Option<String>,
}

impl TokenOverrides {
    pub fn resolved_git_source_token(&self) -> Option<&str> {
        self.github_token
            .as_deref()
            .or(self.git_token.as_deref())
            .or(self.installation_token.as_deref())
    }
}

/// The message enqueued into the Command Queue and handed to the external
/// queue (§2 data flow, §6): everything a dispatch worker needs to provision
/// the sandbox and launch the wrapper, serialized as the queue row's
/// `messageJson`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WrapperLaunchPlan {
    pub sandbox_id: SandboxId,
    pub workspace: String,
    pub session_home: String,
    pub environment: HashMap<String, String>,
    pub branch: String,
    pub prompt: String,
    pub mode: String,
    pub model: String,
    pub auto_commit: bool,
    pub condense_on_complete: bool,
    pub append_system_prompt: Option<String>,
    pub ingest_token: String,
    /// `true` for a fresh clone (`initialize`), `false` for a warm `resume`.
    pub is_initialize: bool,
    pub shallow_clone: bool,
    /// Resolved from `TokenOverrides` at `startExecution` time (§4.6: "preferring
    /// request overrides over stored values"). Used on `resume` in place of the
    /// token stored on metadata when the workspace needs a fresh clone (§4.5 step 2).
    pub token_override: Option<String>,
}
