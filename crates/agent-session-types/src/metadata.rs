//! Session metadata: the durable record the Session Authority owns per
//! session (§3 `SessionMetadata`).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};
use crate::ids::{BotId, OrgId, SessionId, UserId};

/// Exactly one of these two variants is ever populated on a `SessionMetadata`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GitSource {
    GitHub {
        github_repo: String,
        github_token: Option<String>,
    },
    Generic {
        git_url: String,
        git_token: Option<String>,
    },
}

impl GitSource {
    pub fn token(&self) -> Option<&str> {
        match self {
            GitSource::GitHub { github_token, .. } => github_token.as_deref(),
            GitSource::Generic { git_token, .. } => git_token.as_deref(),
        }
    }

    /// `true` when the remote host name contains `gitlab`, per §4.5 step 2.
    pub fn is_gitlab(&self) -> bool {
        match self {
            GitSource::Generic { git_url, .. } => git_url.contains("gitlab"),
            GitSource::GitHub { .. } => false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpServerConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct CallbackTarget {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// The execution parameters fixed at `prepare()` time (§4.6).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct PreparedExecutionInput {
    pub prompt: String,
    pub mode: String,
    pub model: String,
    #[serde(default)]
    pub auto_commit: bool,
    #[serde(default)]
    pub condense_on_complete: bool,
    pub append_system_prompt: Option<String>,
}

/// A patch applied by `try_update` (§4.6): `None` leaves a field unchanged,
/// `Some(None)` clears it, `Some(Some(v))` sets it — null fields clear,
/// undefined fields leave the stored value unchanged.
#[derive(Clone, Debug, Default)]
pub struct MetadataPatch {
    pub prompt: Option<String>,
    pub mode: Option<String>,
    pub model: Option<String>,
    pub auto_commit: Option<bool>,
    pub condense_on_complete: Option<bool>,
    pub append_system_prompt: Option<Option<String>>,
    pub upstream_branch: Option<Option<String>>,
    pub setup_commands: Option<Option<Vec<String>>>,
    pub callback_target: Option<Option<CallbackTarget>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub org_id: Option<OrgId>,
    pub bot_id: Option<BotId>,
    pub kilocode_token: Option<String>,
    pub source: GitSource,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    /// name -> envelope-encrypted ciphertext; decrypted just-in-time by the
    /// sandbox orchestrator (§4.5 step 2), never held in plaintext here.
    #[serde(default)]
    pub encrypted_secrets: HashMap<String, String>,
    pub setup_commands: Option<Vec<String>>,
    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
    pub upstream_branch: Option<String>,
    pub kilo_session_id: Option<String>,
    pub prepared_execution: Option<PreparedExecutionInput>,
    pub prepared_at: Option<DateTime<Utc>>,
    pub initiated_at: Option<DateTime<Utc>>,
    pub callback_target: Option<CallbackTarget>,
    pub version: u64,
    pub timestamp: i64,
}

impl SessionMetadata {
    pub fn new(session_id: SessionId, user_id: UserId, source: GitSource, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            user_id,
            org_id: None,
            bot_id: None,
            kilocode_token: None,
            source,
            env_vars: HashMap::new(),
            encrypted_secrets: HashMap::new(),
            setup_commands: None,
            mcp_servers: HashMap::new(),
            upstream_branch: None,
            kilo_session_id: None,
            prepared_execution: None,
            prepared_at: None,
            initiated_at: None,
            callback_target: None,
            version: 0,
            timestamp: now.timestamp_millis(),
        }
    }

    /// Invariant (b): `initiated_at` requires `prepared_at` (§3).
    pub fn validate(&self) -> SessionResult<()> {
        if self.initiated_at.is_some() && self.prepared_at.is_none() {
            return Err(SessionError::InvalidMetadata {
                path: "initiatedAt".into(),
                reason: "initiatedAt requires preparedAt".into(),
            });
        }
        Ok(())
    }

    /// Bumps `version` and `timestamp`; called on every mutating write (§3 invariant c).
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.timestamp = now.timestamp_millis();
    }

    pub fn apply_patch(&mut self, patch: MetadataPatch, now: DateTime<Utc>) -> SessionResult<()> {
        let mut prepared = self
            .prepared_execution
            .clone()
            .unwrap_or_default();
        if let Some(v) = patch.prompt {
            prepared.prompt = v;
        }
        if let Some(v) = patch.mode {
            prepared.mode = v;
        }
        if let Some(v) = patch.model {
            prepared.model = v;
        }
        if let Some(v) = patch.auto_commit {
            prepared.auto_commit = v;
        }
        if let Some(v) = patch.condense_on_complete {
            prepared.condense_on_complete = v;
        }
        if let Some(v) = patch.append_system_prompt {
            prepared.append_system_prompt = v;
        }
        self.prepared_execution = Some(prepared);

        if let Some(v) = patch.upstream_branch {
            self.upstream_branch = v;
        }
        if let Some(v) = patch.setup_commands {
            self.setup_commands = v;
        }
        if let Some(v) = patch.callback_target {
            self.callback_target = v;
        }

        self.validate()?;
        self.touch(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionMetadata {
        SessionMetadata::new(
            SessionId::from("agent_1"),
            UserId::from("user_1"),
            GitSource::GitHub {
                github_repo: "acme/repo".into(),
                github_token: Some("t1".into()),
            },
            Utc::now(),
        )
    }

    #[test]
    fn initiated_without_prepared_is_invalid() {
        let mut meta = sample();
        meta.initiated_at = Some(Utc::now());
        assert!(matches!(
            meta.validate(),
            Err(SessionError::InvalidMetadata { .. })
        ));
    }

    #[test]
    fn touch_is_monotonic() {
        let mut meta = sample();
        let (v0, t0) = (meta.version, meta.timestamp);
        meta.touch(Utc::now());
        assert!(meta.version > v0);
        assert!(meta.timestamp >= t0);
    }

    #[test]
    fn patch_clears_with_some_none() {
        let mut meta = sample();
        meta.upstream_branch = Some("main".into());
        let patch = MetadataPatch {
            upstream_branch: Some(None),
            ..Default::default()
        };
        meta.apply_patch(patch, Utc::now()).unwrap();
        assert_eq!(meta.upstream_branch, None);
    }

    #[test]
    fn patch_leaves_unset_fields_unchanged() {
        let mut meta = sample();
        meta.upstream_branch = Some("main".into());
        let patch = MetadataPatch::default();
        meta.apply_patch(patch, Utc::now()).unwrap();
        assert_eq!(meta.upstream_branch, Some("main".into()));
    }

    #[test]
    fn is_gitlab_detects_host_substring() {
        let source = GitSource::Generic {
            git_url: "https://gitlab.example.com/acme/repo.git".into(),
            git_token: None,
        };
        assert!(source.is_gitlab());
    }
}
