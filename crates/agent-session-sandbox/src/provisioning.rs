//! Initialize/Resume provisioning flows (§4.5).

use std::collections::HashMap;

use agent_session_types::{GitSource, SessionError, SessionId, SessionResult};
use chrono::{DateTime, Utc};

use crate::env::{build_environment, ReservedEnv};
use crate::runtime::SandboxRuntime;

pub const SETUP_COMMAND_TIMEOUT_SECS: u64 = 120;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetupMode {
    /// `initiate`: first non-zero exit raises `SetupCommandFailed`.
    FailFast,
    /// `resume` when the workspace had to be re-created: log and continue.
    Lenient,
}

pub struct WorkspaceLayout {
    pub workspace: String,
    pub session_home: String,
}

impl WorkspaceLayout {
    pub fn for_session(owner_segment: &str, session_id: &SessionId) -> Self {
        Self {
            workspace: format!("/workspace/{owner_segment}/sessions/{}", session_id.as_str()),
            session_home: format!("/home/{}", session_id.as_str()),
        }
    }
}

pub struct InitializeRequest<'a> {
    pub session_id: &'a SessionId,
    pub owner_segment: &'a str,
    pub kilocode_token: &'a str,
    pub kilocode_organization_id: Option<&'a str>,
    pub user_env_vars: &'a HashMap<String, String>,
    pub decrypted_secrets: &'a HashMap<String, String>,
    pub source: &'a GitSource,
    pub upstream_branch: Option<&'a str>,
    pub setup_commands: &'a [String],
    pub mcp_servers_json: Option<&'a serde_json::Value>,
    pub shallow_clone: bool,
}

pub struct PreparedSession {
    pub workspace: String,
    pub session_home: String,
    pub environment: HashMap<String, String>,
    pub branch: String,
    pub setup_warnings: Vec<String>,
}

fn mcp_settings_path(session_home: &str) -> String {
    format!("{session_home}/.kilocode/cli/global/settings/mcp_settings.json")
}

async fn ensure_session_dirs(runtime: &dyn SandboxRuntime, layout: &WorkspaceLayout) -> SessionResult<()> {
    runtime.mkdir_p(&layout.workspace).await?;
    runtime.mkdir_p(&layout.session_home).await?;
    for sub in ["cli/global/tasks", "cli/logs", "cli/global/settings"] {
        runtime.mkdir_p(&format!("{}/.kilocode/{sub}", layout.session_home)).await?;
    }
    Ok(())
}

async fn run_setup_commands(
    runtime: &dyn SandboxRuntime,
    workspace: &str,
    env: &HashMap<String, String>,
    commands: &[String],
    mode: SetupMode,
) -> SessionResult<Vec<String>> {
    let mut warnings = Vec::new();
    for command in commands {
        let parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        let Some((program, args)) = parts.split_first() else { continue };
        let output = runtime
            .run(workspace, program, args, env, SETUP_COMMAND_TIMEOUT_SECS)
            .await?;
        if !output.success() {
            match mode {
                SetupMode::FailFast => {
                    return Err(SessionError::SetupCommandFailed {
                        command: command.clone(),
                        exit_code: output.exit_code,
                        stderr: output.stderr,
                    });
                }
                SetupMode::Lenient => {
                    warnings.push(format!("setup command failed (exit {}): {command}", output.exit_code));
                    tracing::warn!(
                        component = "sandbox",
                        event = "sandbox.setup_command.failed_lenient",
                        command = %command,
                        exit_code = output.exit_code,
                        "setup command failed during resume, continuing"
                    );
                }
            }
        }
    }
    Ok(warnings)
}

async fn write_mcp_settings(
    runtime: &dyn SandboxRuntime,
    session_home: &str,
    mcp_servers_json: &serde_json::Value,
) -> SessionResult<()> {
    let body = serde_json::json!({ "mcpServers": mcp_servers_json });
    let pretty = serde_json::to_string_pretty(&body)
        .map_err(|e| SessionError::BadRequest(format!("mcp settings serialize: {e}")))?;
    runtime.write_file(&mcp_settings_path(session_home), &pretty).await
}

/// Builds a fresh workspace for a brand-new session (§4.5 "Initialize").
pub async fn initialize(runtime: &dyn SandboxRuntime, req: InitializeRequest<'_>, now: DateTime<Utc>) -> SessionResult<PreparedSession> {
    let layout = WorkspaceLayout::for_session(req.owner_segment, req.session_id);
    ensure_session_dirs(runtime, &layout).await?;

    let environment = build_environment(
        req.user_env_vars,
        req.decrypted_secrets,
        req.source,
        ReservedEnv {
            home: &layout.session_home,
            session_id: req.session_id.as_str(),
            session_home: &layout.session_home,
            kilocode_token: req.kilocode_token,
            kilocode_organization_id: req.kilocode_organization_id,
        },
    );

    if let Ok(free) = runtime.disk_free_bytes(&layout.workspace).await {
        if free < 512 * 1024 * 1024 {
            tracing::warn!(
                component = "sandbox",
                event = "sandbox.disk_space.low",
                session_id = %req.session_id,
                free_bytes = free,
                "low disk space before clone"
            );
        }
    }

    clone_source(runtime, &layout.workspace, req.source, &environment, req.shallow_clone).await?;

    let branch = match req.upstream_branch {
        Some(branch) => {
            manage_existing_branch(runtime, &layout.workspace, branch, &environment).await?;
            branch.to_string()
        }
        None => {
            let branch = format!("session/{}", req.session_id.as_str());
            let output = runtime
                .run(&layout.workspace, "git", &["checkout".into(), "-b".into(), branch.clone()], &environment, 30)
                .await?;
            if !output.success() {
                return Err(SessionError::SandboxFatal(format!(
                    "Failed to create session branch {branch}: {}",
                    output.stderr
                )));
            }
            branch
        }
    };

    let setup_warnings = run_setup_commands(runtime, &layout.workspace, &environment, req.setup_commands, SetupMode::FailFast).await?;

    if let Some(mcp) = req.mcp_servers_json {
        write_mcp_settings(runtime, &layout.session_home, mcp).await?;
    }

    let _ = now;
    Ok(PreparedSession {
        workspace: layout.workspace,
        session_home: layout.session_home,
        environment,
        branch,
        setup_warnings,
    })
}

pub struct ResumeRequest<'a> {
    pub session_id: &'a SessionId,
    pub owner_segment: &'a str,
    pub kilocode_token: &'a str,
    pub kilocode_organization_id: Option<&'a str>,
    pub user_env_vars: &'a HashMap<String, String>,
    pub decrypted_secrets: &'a HashMap<String, String>,
    pub source: Option<&'a GitSource>,
    pub fresh_token: Option<&'a str>,
    pub setup_commands: &'a [String],
    pub mcp_servers_json: Option<&'a serde_json::Value>,
}

/// Re-opens an existing session's workspace, re-cloning only if the
/// directory was lost (§4.5 "Resume").
pub async fn resume(runtime: &dyn SandboxRuntime, req: ResumeRequest<'_>) -> SessionResult<PreparedSession> {
    let layout = WorkspaceLayout::for_session(req.owner_segment, req.session_id);
    ensure_session_dirs(runtime, &layout).await?;

    let environment = match req.source {
        Some(source) => build_environment(
            req.user_env_vars,
            req.decrypted_secrets,
            source,
            ReservedEnv {
                home: &layout.session_home,
                session_id: req.session_id.as_str(),
                session_home: &layout.session_home,
                kilocode_token: req.kilocode_token,
                kilocode_organization_id: req.kilocode_organization_id,
            },
        ),
        None => {
            let mut env = req.user_env_vars.clone();
            env.extend(req.decrypted_secrets.clone());
            env.insert("HOME".to_string(), layout.session_home.clone());
            env.insert("SESSION_ID".to_string(), req.session_id.as_str().to_string());
            env.insert("SESSION_HOME".to_string(), layout.session_home.clone());
            env.insert("KILOCODE_TOKEN".to_string(), req.kilocode_token.to_string());
            env
        }
    };

    let git_dir = format!("{}/.git", layout.workspace);
    let workspace_exists = runtime.path_exists(&git_dir).await?;

    let mut setup_warnings = Vec::new();
    if !workspace_exists {
        let Some(source) = req.source else {
            return Err(SessionError::WorkspaceMissing(req.session_id.to_string()));
        };
        let source_with_fresh_token = apply_fresh_token(source, req.fresh_token);
        clone_source(runtime, &layout.workspace, &source_with_fresh_token, &environment, false).await?;
        setup_warnings = run_setup_commands(runtime, &layout.workspace, &environment, req.setup_commands, SetupMode::Lenient).await?;
        if let Some(mcp) = req.mcp_servers_json {
            write_mcp_settings(runtime, &layout.session_home, mcp).await?;
        }
    }

    Ok(PreparedSession {
        workspace: layout.workspace,
        session_home: layout.session_home,
        environment,
        branch: String::new(),
        setup_warnings,
    })
}

fn apply_fresh_token(source: &GitSource, fresh_token: Option<&str>) -> GitSource {
    match (source, fresh_token) {
        (GitSource::GitHub { github_repo, github_token }, Some(fresh)) => GitSource::GitHub {
            github_repo: github_repo.clone(),
            github_token: Some(fresh.to_string()).or_else(|| github_token.clone()),
        },
        (GitSource::Generic { git_url, git_token }, Some(fresh)) => GitSource::Generic {
            git_url: git_url.clone(),
            git_token: Some(fresh.to_string()).or_else(|| git_token.clone()),
        },
        _ => source.clone(),
    }
}

async fn clone_source(
    runtime: &dyn SandboxRuntime,
    workspace: &str,
    source: &GitSource,
    env: &HashMap<String, String>,
    shallow: bool,
) -> SessionResult<()> {
    let mut args = vec!["clone".to_string()];
    if shallow {
        args.push("--depth".to_string());
        args.push("1".to_string());
    }
    let url = match source {
        GitSource::GitHub { github_repo, .. } => format!("https://github.com/{github_repo}.git"),
        GitSource::Generic { git_url, .. } => git_url.clone(),
    };
    args.push(url);
    args.push(".".to_string());

    let output = runtime.run(workspace, "git", &args, env, SETUP_COMMAND_TIMEOUT_SECS).await?;
    if !output.success() {
        return Err(SessionError::SandboxRetryable(format!("git clone failed: {}", output.stderr)));
    }
    Ok(())
}

/// §4.5 step 6 `manageBranch`: verifies the remote branch exists (`git
/// fetch`), then checks it out. Per the Open Question decision recorded in
/// DESIGN.md, a remote that doesn't have `branch` is surfaced as
/// `BadRequest` rather than silently falling back to creating a local
/// branch of that name — guessing here would silently diverge from the
/// caller's `upstreamBranch` request.
async fn manage_existing_branch(
    runtime: &dyn SandboxRuntime,
    workspace: &str,
    branch: &str,
    env: &HashMap<String, String>,
) -> SessionResult<()> {
    let fetch = runtime
        .run(workspace, "git", &["fetch".into(), "origin".into(), branch.to_string()], env, 60)
        .await?;
    if !fetch.success() {
        return Err(SessionError::BadRequest(format!(
            "upstream branch {branch} does not exist on the remote: {}",
            fetch.stderr.trim()
        )));
    }
    let checkout = runtime
        .run(workspace, "git", &["checkout".into(), branch.to_string()], env, 30)
        .await?;
    if !checkout.success() {
        return Err(SessionError::SandboxFatal(format!(
            "Failed to create session branch {branch}: {}",
            checkout.stderr
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeSandboxRuntime;

    fn github_source() -> GitSource {
        GitSource::GitHub {
            github_repo: "acme/repo".into(),
            github_token: Some("t1".into()),
        }
    }

    #[tokio::test]
    async fn initialize_clones_and_creates_session_branch() {
        let runtime = FakeSandboxRuntime::new();
        let session_id = SessionId::from("s1");
        let req = InitializeRequest {
            session_id: &session_id,
            owner_segment: "user_u1",
            kilocode_token: "kilo-tok",
            kilocode_organization_id: None,
            user_env_vars: &HashMap::new(),
            decrypted_secrets: &HashMap::new(),
            source: &github_source(),
            upstream_branch: None,
            setup_commands: &[],
            mcp_servers_json: None,
            shallow_clone: false,
        };
        let prepared = initialize(&runtime, req, Utc::now()).await.unwrap();
        assert_eq!(prepared.branch, "session/s1");
        assert!(prepared.environment.get("GH_TOKEN").is_some());
        let calls = runtime.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c.contains("git clone")));
        assert!(calls.iter().any(|c| c.contains("checkout -b session/s1")));
    }

    #[tokio::test]
    async fn initialize_fails_fast_on_setup_command_error() {
        let runtime = FakeSandboxRuntime::new();
        runtime.script(
            "false",
            crate::runtime::CommandOutput { exit_code: 1, stdout: String::new(), stderr: "boom".into() },
        );
        let session_id = SessionId::from("s1");
        let req = InitializeRequest {
            session_id: &session_id,
            owner_segment: "user_u1",
            kilocode_token: "kilo-tok",
            kilocode_organization_id: None,
            user_env_vars: &HashMap::new(),
            decrypted_secrets: &HashMap::new(),
            source: &github_source(),
            upstream_branch: None,
            setup_commands: &["false".to_string()],
            mcp_servers_json: None,
            shallow_clone: false,
        };
        let err = initialize(&runtime, req, Utc::now()).await.unwrap_err();
        assert!(matches!(err, SessionError::SetupCommandFailed { .. }));
    }

    #[tokio::test]
    async fn resume_skips_clone_when_workspace_exists() {
        let layout = WorkspaceLayout::for_session("user_u1", &SessionId::from("s1"));
        let runtime = FakeSandboxRuntime::new().with_existing_path(format!("{}/.git", layout.workspace));
        let session_id = SessionId::from("s1");
        let req = ResumeRequest {
            session_id: &session_id,
            owner_segment: "user_u1",
            kilocode_token: "kilo-tok",
            kilocode_organization_id: None,
            user_env_vars: &HashMap::new(),
            decrypted_secrets: &HashMap::new(),
            source: Some(&github_source()),
            fresh_token: None,
            setup_commands: &[],
            mcp_servers_json: None,
        };
        resume(&runtime, req).await.unwrap();
        let calls = runtime.calls.lock().unwrap();
        assert!(!calls.iter().any(|c| c.contains("git clone")));
    }

    #[tokio::test]
    async fn resume_reclones_and_is_lenient_on_missing_workspace() {
        let runtime = FakeSandboxRuntime::new();
        runtime.script(
            "false",
            crate::runtime::CommandOutput { exit_code: 1, stdout: String::new(), stderr: "boom".into() },
        );
        let session_id = SessionId::from("s1");
        let req = ResumeRequest {
            session_id: &session_id,
            owner_segment: "user_u1",
            kilocode_token: "kilo-tok",
            kilocode_organization_id: None,
            user_env_vars: &HashMap::new(),
            decrypted_secrets: &HashMap::new(),
            source: Some(&github_source()),
            fresh_token: Some("fresher"),
            setup_commands: &["false".to_string()],
            mcp_servers_json: None,
        };
        let prepared = resume(&runtime, req).await.unwrap();
        assert_eq!(prepared.setup_warnings.len(), 1);
    }

    #[tokio::test]
    async fn upstream_branch_missing_on_remote_is_bad_request_not_fatal() {
        let runtime = FakeSandboxRuntime::new();
        runtime.script(
            "git fetch origin missing-branch",
            crate::runtime::CommandOutput { exit_code: 1, stdout: String::new(), stderr: "couldn't find remote ref".into() },
        );
        let session_id = SessionId::from("s1");
        let req = InitializeRequest {
            session_id: &session_id,
            owner_segment: "user_u1",
            kilocode_token: "kilo-tok",
            kilocode_organization_id: None,
            user_env_vars: &HashMap::new(),
            decrypted_secrets: &HashMap::new(),
            source: &github_source(),
            upstream_branch: Some("missing-branch"),
            setup_commands: &[],
            mcp_servers_json: None,
            shallow_clone: false,
        };
        let err = initialize(&runtime, req, Utc::now()).await.unwrap_err();
        assert!(matches!(err, SessionError::BadRequest(_)));
    }

    #[tokio::test]
    async fn resume_without_metadata_source_and_missing_workspace_is_fatal() {
        let runtime = FakeSandboxRuntime::new();
        let session_id = SessionId::from("s1");
        let req = ResumeRequest {
            session_id: &session_id,
            owner_segment: "user_u1",
            kilocode_token: "kilo-tok",
            kilocode_organization_id: None,
            user_env_vars: &HashMap::new(),
            decrypted_secrets: &HashMap::new(),
            source: None,
            fresh_token: None,
            setup_commands: &[],
            mcp_servers_json: None,
        };
        let err = resume(&runtime, req).await.unwrap_err();
        assert!(matches!(err, SessionError::WorkspaceMissing(_)));
    }
}
