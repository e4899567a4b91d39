//! Session Authority (§4.6): the single-writer state machine each session
//! actor runs — `prepare`/`tryUpdate`/`tryInitiate`/`startExecution`/
//! `enqueueExecution`/the re-entrancy-barrier dispatch/`onExecutionComplete`/
//! `interruptExecution`/`deleteSession`. Every method takes `&self` and is
//! safe to call concurrently only because a deployment runs exactly one
//! `SessionAuthority` per session (the actor-per-session model, §2); nothing
//! in this crate enforces that from the outside.

use std::collections::HashMap;
use std::sync::Arc;

use agent_session_callback::{CallbackDispatcher, CallbackJob};
use agent_session_events::{EventFabric, WrapperChannelRegistry};
use agent_session_queue::CommandQueue;
use agent_session_registry::{ExecutionRegistry, LeaseRegistry};
use agent_session_sandbox::{
    generate_sandbox_id, initialize as sandbox_initialize, resume as sandbox_resume, with_sandbox_retry, InitializeRequest,
    PreparedSession, ResumeRequest, SandboxRuntime,
};
use agent_session_storage::SessionStore;
use agent_session_types::{
    BotId, CallbackTarget, Execution, ExecutionId, ExecutionStatus, GitSource, LeaseId, McpServerConfig, MetadataPatch, OrgId,
    PreparedExecutionInput, SandboxId, SessionError, SessionId, SessionMetadata, SessionResult, UserId, WrapperCommand,
    MAX_QUEUE_DEPTH,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::backend_link::BackendLinkClient;
use crate::config::AuthorityConfig;
use crate::external_queue::ExternalQueueSender;
use crate::launch_plan::{StartExecutionRequest, TokenOverrides, WrapperLaunchPlan};
use crate::secrets::SecretsDecryptor;

/// Full prepare-time input, mirroring `SessionMetadata`'s settable fields
/// (§3). Grouped into one struct so `prepare` doesn't take a dozen
/// positional arguments.
#[derive(Clone, Debug)]
pub struct PrepareRequest {
    pub user_id: UserId,
    pub org_id: Option<OrgId>,
    pub bot_id: Option<BotId>,
    pub kilocode_token: Option<String>,
    pub source: GitSource,
    pub input: PreparedExecutionInput,
    pub env_vars: HashMap<String, String>,
    pub encrypted_secrets: HashMap<String, String>,
    pub setup_commands: Option<Vec<String>>,
    pub mcp_servers: HashMap<String, McpServerConfig>,
    pub callback_target: Option<CallbackTarget>,
}

/// The outcome of `startExecution`/`enqueueExecution`: either the execution
/// was dispatched immediately or it was queued behind an in-flight one
/// (§4.6 step 4, scenario 2).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EnqueueOutcome {
    Dispatched,
    Queued { position: i64 },
}

#[derive(Clone, Debug, Default)]
pub struct ReaperReport {
    pub session_deleted: bool,
    pub executions_marked_stale: u32,
    pub leases_expired: u32,
    pub events_pruned: u64,
    pub queue_entries_expired: u32,
}

#[derive(Clone)]
pub struct SessionAuthority {
    pub(crate) session_id: SessionId,
    pub(crate) store: SessionStore,
    pub(crate) executions: ExecutionRegistry,
    pub(crate) leases: LeaseRegistry,
    pub(crate) queue: CommandQueue,
    pub(crate) events: EventFabric,
    pub(crate) wrapper_channels: Arc<WrapperChannelRegistry>,
    pub(crate) callbacks: Arc<CallbackDispatcher>,
    pub(crate) sandbox: Arc<dyn SandboxRuntime>,
    pub(crate) external_queue: Arc<dyn ExternalQueueSender>,
    pub(crate) backend_link: Arc<dyn BackendLinkClient>,
    pub(crate) secrets: Arc<dyn SecretsDecryptor>,
    pub(crate) config: AuthorityConfig,
}

fn owner_segment(org_id: Option<&OrgId>, user_id: &UserId) -> String {
    match org_id {
        Some(org_id) => format!("org_{}", org_id.as_str()),
        None => format!("user_{}", user_id.as_str()),
    }
}

fn mcp_servers_json(mcp_servers: &HashMap<String, McpServerConfig>) -> Option<serde_json::Value> {
    if mcp_servers.is_empty() {
        return None;
    }
    serde_json::to_value(mcp_servers).ok()
}

impl SessionAuthority {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        store: SessionStore,
        sandbox: Arc<dyn SandboxRuntime>,
        external_queue: Arc<dyn ExternalQueueSender>,
        backend_link: Arc<dyn BackendLinkClient>,
        secrets: Arc<dyn SecretsDecryptor>,
        config: AuthorityConfig,
    ) -> Self {
        Self {
            session_id,
            executions: ExecutionRegistry::new(store.clone()),
            leases: LeaseRegistry::new(store.clone()),
            queue: CommandQueue::new(store.clone()),
            events: EventFabric::new(store.clone()),
            wrapper_channels: Arc::new(WrapperChannelRegistry::new()),
            callbacks: Arc::new(CallbackDispatcher::new()),
            store,
            sandbox,
            external_queue,
            backend_link,
            secrets,
            config,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn events(&self) -> &EventFabric {
        &self.events
    }

    pub fn wrapper_channels(&self) -> Arc<WrapperChannelRegistry> {
        self.wrapper_channels.clone()
    }

    /// The sandbox transport this authority was built with; the server
    /// binary's dispatch worker uses it to launch the wrapper process after
    /// `provision` finishes (§6 "exit codes... map to execution statuses").
    pub fn sandbox(&self) -> Arc<dyn SandboxRuntime> {
        self.sandbox.clone()
    }

    pub fn executions(&self) -> &ExecutionRegistry {
        &self.executions
    }

    pub async fn metadata(&self) -> SessionResult<Option<SessionMetadata>> {
        self.store.load_metadata().await
    }

    async fn require_metadata(&self) -> SessionResult<SessionMetadata> {
        self.store
            .load_metadata()
            .await?
            .ok_or_else(|| SessionError::NotFound(self.session_id.to_string()))
    }

    async fn touch_activity(&self, now: DateTime<Utc>) -> SessionResult<()> {
        self.store.touch_last_activity(now.timestamp_millis()).await
    }

    /// §4.6 `prepare`: fails with `AlreadyPrepared` if called twice.
    pub async fn prepare(&self, request: PrepareRequest, now: DateTime<Utc>) -> SessionResult<()> {
        if let Some(existing) = self.store.load_metadata().await? {
            if existing.prepared_at.is_some() {
                return Err(SessionError::AlreadyPrepared);
            }
        }

        let mut meta = SessionMetadata::new(self.session_id.clone(), request.user_id, request.source, now);
        meta.org_id = request.org_id;
        meta.bot_id = request.bot_id;
        meta.kilocode_token = request.kilocode_token;
        meta.env_vars = request.env_vars;
        meta.encrypted_secrets = request.encrypted_secrets;
        meta.setup_commands = request.setup_commands;
        meta.mcp_servers = request.mcp_servers;
        meta.callback_target = request.callback_target;
        meta.prepared_execution = Some(request.input);
        meta.prepared_at = Some(now);
        meta.validate()?;
        meta.touch(now);

        self.store.save_metadata(&meta).await?;
        self.touch_activity(now).await?;
        tracing::info!(component = "authority", event = "session.prepared", session_id = %self.session_id, "session prepared");
        Ok(())
    }

    /// §4.6 `tryUpdate`: succeeds only between `prepare` and `tryInitiate`.
    pub async fn try_update(&self, patch: MetadataPatch, now: DateTime<Utc>) -> SessionResult<()> {
        let mut meta = self.require_metadata().await?;
        if meta.prepared_at.is_none() {
            return Err(SessionError::NotPrepared);
        }
        if meta.initiated_at.is_some() {
            return Err(SessionError::AlreadyInitiated);
        }
        meta.apply_patch(patch, now)?;
        self.store.save_metadata(&meta).await?;
        self.touch_activity(now).await
    }

    /// §4.6 `tryInitiate`: idempotent once `initiatedAt` is set.
    pub async fn try_initiate(&self, now: DateTime<Utc>) -> SessionResult<()> {
        let mut meta = self.require_metadata().await?;
        if meta.prepared_at.is_none() {
            return Err(SessionError::NotPrepared);
        }
        if meta.initiated_at.is_some() {
            return Ok(());
        }
        meta.initiated_at = Some(now);
        meta.validate()?;
        meta.touch(now);
        self.store.save_metadata(&meta).await?;
        self.touch_activity(now).await
    }

    pub async fn update_kilo_session_id(&self, kilo_session_id: String, now: DateTime<Utc>) -> SessionResult<()> {
        let mut meta = self.require_metadata().await?;
        meta.kilo_session_id = Some(kilo_session_id);
        meta.touch(now);
        self.store.save_metadata(&meta).await
    }

    pub async fn update_upstream_branch(&self, branch: String, now: DateTime<Utc>) -> SessionResult<()> {
        let mut meta = self.require_metadata().await?;
        meta.upstream_branch = Some(branch);
        meta.touch(now);
        self.store.save_metadata(&meta).await
    }

    /// §4.6 `startExecution`: checks the queue bound before allocating
    /// anything, resolves the sandbox id, then routes through
    /// `enqueueExecution`. The depth check has to happen before
    /// `executions.add` — otherwise a rejected `QueueFull` start still
    /// leaves a `pending` execution row with no queue entry behind it.
    pub async fn start_execution(&self, request: StartExecutionRequest, ingest_token: impl Into<String>, now: DateTime<Utc>) -> SessionResult<(ExecutionId, EnqueueOutcome)> {
        let meta = self.require_metadata().await?;
        if meta.prepared_at.is_none() {
            return Err(SessionError::NotPrepared);
        }

        let (token_overrides, shallow_clone, prompt_override, is_initialize) = match &request {
            StartExecutionRequest::Initiate { token_overrides, shallow_clone } => (token_overrides.clone(), *shallow_clone, None, true),
            StartExecutionRequest::Resume { prompt_override, token_overrides } => {
                if meta.initiated_at.is_none() {
                    return Err(SessionError::NotPrepared);
                }
                (token_overrides.clone(), false, prompt_override.clone(), false)
            }
        };

        if matches!(request, StartExecutionRequest::Initiate { .. }) {
            self.try_initiate(now).await?;
        }

        let prepared = meta
            .prepared_execution
            .clone()
            .ok_or_else(|| SessionError::NotPrepared)?;
        let prompt = prompt_override.unwrap_or(prepared.prompt);

        let depth = self.queue.count(self.session_id.clone()).await?;
        if depth >= MAX_QUEUE_DEPTH as i64 {
            return Err(SessionError::QueueFull);
        }

        let execution_id = ExecutionId::from(format!("exec_{}", Uuid::new_v4().simple()));
        let ingest_token = ingest_token.into();
        self.executions.add(execution_id.clone(), prepared.mode.clone(), ingest_token.clone(), now).await?;

        let sandbox_id = SandboxId::from(generate_sandbox_id(
            meta.org_id.as_ref().map(|o| o.as_str()),
            meta.user_id.as_str(),
            meta.bot_id.as_ref().map(|b| b.as_str()),
        ));

        let plan = WrapperLaunchPlan {
            sandbox_id,
            workspace: String::new(),
            session_home: String::new(),
            environment: HashMap::new(),
            branch: meta.upstream_branch.clone().unwrap_or_default(),
            prompt,
            mode: prepared.mode,
            model: prepared.model,
            auto_commit: prepared.auto_commit,
            condense_on_complete: prepared.condense_on_complete,
            append_system_prompt: prepared.append_system_prompt,
            ingest_token,
            is_initialize,
            shallow_clone,
            token_override: token_overrides.resolved_git_source_token().map(str::to_string),
        };

        let message = serde_json::to_value(&plan).map_err(|e| SessionError::BadRequest(format!("launch plan serialize: {e}")))?;

        let outcome = self.enqueue_execution(execution_id.clone(), message, now).await?;
        self.touch_activity(now).await?;
        Ok((execution_id, outcome))
    }

    /// §4.6 `enqueueExecution`: persists the queue row (rejecting at
    /// `MAX_QUEUE_DEPTH`) then calls the dispatch barrier.
    pub async fn enqueue_execution(&self, execution_id: ExecutionId, message: serde_json::Value, now: DateTime<Utc>) -> SessionResult<EnqueueOutcome> {
        let depth = self.queue.count(self.session_id.clone()).await?;
        if depth >= MAX_QUEUE_DEPTH as i64 {
            return Err(SessionError::QueueFull);
        }
        self.queue.enqueue(self.session_id.clone(), execution_id, message, now).await?;
        match self.try_advance_queue_internal(now).await? {
            Some(_) => Ok(EnqueueOutcome::Dispatched),
            None => Ok(EnqueueOutcome::Queued { position: depth + 1 }),
        }
    }

    /// §4.6 `tryAdvanceQueueInternal`: the re-entrancy barrier. Bails
    /// immediately if an execution is already active — the caller that
    /// finishes (`onExecutionComplete`) is the one that gets to advance the
    /// queue next, so this never races with itself.
    pub async fn try_advance_queue_internal(&self, now: DateTime<Utc>) -> SessionResult<Option<ExecutionId>> {
        if self.executions.active_execution_id().await?.is_some() {
            return Ok(None);
        }

        loop {
            let Some(entry) = self.queue.peek_oldest(self.session_id.clone()).await? else {
                return Ok(None);
            };

            if entry.is_expired(now) {
                self.queue.dequeue_by_id(entry.id).await?;
                self.executions
                    .update_status(entry.execution_id.clone(), ExecutionStatus::Failed, Some(now), Some("queue_expired".to_string()))
                    .await?;
                tracing::warn!(
                    component = "authority",
                    event = "queue.entry_expired",
                    session_id = %self.session_id,
                    execution_id = %entry.execution_id,
                    "dropped expired queue entry"
                );
                continue;
            }

            let lease_id = LeaseId::from(Uuid::new_v4().to_string());
            let acquired = self
                .leases
                .try_acquire(entry.execution_id.clone(), lease_id.clone(), None, now)
                .await?;
            if !acquired {
                return Ok(None);
            }

            if self.executions.set_active_execution(entry.execution_id.clone()).await.is_err() {
                // Lost the race to another caller between the barrier check above and
                // here; leave the row queued for the winner's completion to advance.
                return Ok(None);
            }

            // Row stays in the queue until the send is confirmed (§4.6 step 4):
            // a failed send must never orphan a dequeued-but-undelivered message.
            if let Err(err) = self.external_queue.send(&self.session_id, &entry.execution_id, &entry.message_json).await {
                self.executions.clear_active_execution().await?;
                self.leases.release(entry.execution_id.clone(), lease_id).await?;
                tracing::warn!(
                    component = "authority",
                    event = "execution.dispatch_send_failed",
                    session_id = %self.session_id,
                    execution_id = %entry.execution_id,
                    error = %err,
                    "external queue send failed, leaving entry queued for retry"
                );
                return Ok(None);
            }

            self.queue.dequeue_by_id(entry.id).await?;
            self.executions
                .update_status(entry.execution_id.clone(), ExecutionStatus::Running, None, None)
                .await?;

            tracing::info!(
                component = "authority",
                event = "execution.dispatched",
                session_id = %self.session_id,
                execution_id = %entry.execution_id,
                "execution dispatched"
            );
            return Ok(Some(entry.execution_id));
        }
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> SessionResult<Option<Execution>> {
        self.executions.get(execution_id).await
    }

    pub async fn update_heartbeat(&self, execution_id: ExecutionId, now: DateTime<Utc>) -> SessionResult<()> {
        self.executions.update_heartbeat(execution_id, now).await
    }

    /// §4.6 `onExecutionComplete`: transitions the execution, clears the
    /// active pointer, fires the callback, and lets the next queued
    /// execution (if any) advance.
    pub async fn on_execution_complete(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> SessionResult<Option<ExecutionId>> {
        if !status.is_terminal() {
            return Err(SessionError::InvalidTransition {
                from: "running".to_string(),
                to: status.to_string(),
            });
        }

        let current = self.executions.get(execution_id.clone()).await?;
        if let Some(execution) = &current {
            if execution.status == status {
                // Idempotent redelivery of the same terminal frame (§4.7).
                return self.try_advance_queue_internal(now).await;
            }
        }

        self.executions.update_status(execution_id.clone(), status, Some(now), error.clone()).await?;
        self.executions.clear_active_execution().await?;
        if let Some(lease) = self.leases.get(execution_id.clone()).await? {
            self.leases.release(execution_id.clone(), lease.lease_id).await?;
        }
        self.wrapper_channels.unregister(&execution_id);

        if let Some(meta) = self.store.load_metadata().await? {
            if let Some(target) = meta.callback_target.clone() {
                let job = CallbackJob::for_terminal_status(
                    target,
                    self.session_id.clone(),
                    execution_id.clone(),
                    status,
                    error,
                    meta.upstream_branch.clone(),
                    meta.kilo_session_id.clone(),
                );
                let dispatcher = self.callbacks.clone();
                tokio::spawn(async move {
                    let mut attempts = 0u32;
                    loop {
                        attempts += 1;
                        match dispatcher.deliver(&job, attempts).await {
                            agent_session_callback::DeliveryResult::Success | agent_session_callback::DeliveryResult::Failed => break,
                            agent_session_callback::DeliveryResult::Retry { delay } => {
                                tokio::time::sleep(delay).await;
                            }
                        }
                    }
                });
            }
        }

        self.touch_activity(now).await?;
        self.try_advance_queue_internal(now).await
    }

    /// §4.6 `interruptExecution`: best-effort SIGTERM to the active
    /// execution's wrapper; returns whether a live channel was reached.
    pub async fn interrupt_execution(&self) -> SessionResult<bool> {
        let Some(execution_id) = self.executions.active_execution_id().await? else {
            return Ok(false);
        };
        self.executions.request_interrupt().await?;
        match self
            .wrapper_channels
            .send_to_wrapper(&execution_id, WrapperCommand::kill_sigterm())
            .await
        {
            Ok(()) => Ok(true),
            Err(SessionError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// §4.6 `deleteSession`: refuses to delete while an execution is active.
    pub async fn delete_session(&self) -> SessionResult<()> {
        if self.executions.active_execution_id().await?.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        self.store.delete_all().await
    }

    /// Fires the `session_created` backend link call (§6) once the wrapper
    /// reports its kilocode session id; non-fatal by contract.
    pub async fn link_cloud_agent(&self, kilo_session_id: &str) -> SessionResult<()> {
        let meta = self.require_metadata().await?;
        let Some(token) = meta.kilocode_token.clone() else {
            return Ok(());
        };
        self.backend_link.link_cloud_agent(&token, kilo_session_id, self.session_id.as_str()).await
    }

    /// Runs the sandbox orchestrator for a just-dispatched execution; called
    /// by the server binary's dispatch worker after it drains the external
    /// queue, never by the Authority itself (§4.5 lives outside this crate's
    /// write path so a slow clone never blocks `tryAdvanceQueueInternal`).
    pub async fn provision(&self, plan: &WrapperLaunchPlan, now: DateTime<Utc>) -> SessionResult<PreparedSession> {
        let meta = self.require_metadata().await?;
        let ctx = ProvisionContext {
            sandbox: self.sandbox.clone(),
            session_id: self.session_id.clone(),
            owner_segment: owner_segment(meta.org_id.as_ref(), &meta.user_id),
            kilocode_token: meta.kilocode_token.clone().unwrap_or_default(),
            org_id: meta.org_id.clone(),
            user_env_vars: meta.env_vars.clone(),
            decrypted_secrets: self.secrets.decrypt_all(&meta.encrypted_secrets).await?,
            source: meta.source.clone(),
            upstream_branch: meta.upstream_branch.clone(),
            setup_commands: meta.setup_commands.clone().unwrap_or_default(),
            mcp_json: mcp_servers_json(&meta.mcp_servers),
        };

        if plan.is_initialize {
            let shallow_clone = plan.shallow_clone;
            with_sandbox_retry(
                move |_attempt| {
                    let ctx = ctx.clone();
                    async move { ctx.initialize(shallow_clone, now).await }
                },
                || async { Ok(()) },
            )
            .await
        } else {
            let fresh_token = plan_fresh_token(plan);
            with_sandbox_retry(
                move |_attempt| {
                    let ctx = ctx.clone();
                    let fresh_token = fresh_token.clone();
                    async move { ctx.resume(fresh_token).await }
                },
                || async { Ok(()) },
            )
            .await
        }
    }
}

/// Bundles everything a provisioning attempt needs off of `SessionMetadata`
/// so `with_sandbox_retry`'s `FnMut` only has to clone one value per retry.
#[derive(Clone)]
struct ProvisionContext {
    sandbox: Arc<dyn SandboxRuntime>,
    session_id: SessionId,
    owner_segment: String,
    kilocode_token: String,
    org_id: Option<OrgId>,
    user_env_vars: HashMap<String, String>,
    decrypted_secrets: HashMap<String, String>,
    source: GitSource,
    upstream_branch: Option<String>,
    setup_commands: Vec<String>,
    mcp_json: Option<serde_json::Value>,
}

impl ProvisionContext {
    async fn initialize(&self, shallow_clone: bool, now: DateTime<Utc>) -> SessionResult<PreparedSession> {
        sandbox_initialize(
            self.sandbox.as_ref(),
            InitializeRequest {
                session_id: &self.session_id,
                owner_segment: &self.owner_segment,
                kilocode_token: &self.kilocode_token,
                kilocode_organization_id: self.org_id.as_ref().map(|o| o.as_str()),
                user_env_vars: &self.user_env_vars,
                decrypted_secrets: &self.decrypted_secrets,
                source: &self.source,
                upstream_branch: self.upstream_branch.as_deref(),
                setup_commands: &self.setup_commands,
                mcp_servers_json: self.mcp_json.as_ref(),
                shallow_clone,
            },
            now,
        )
        .await
    }

    async fn resume(&self, fresh_token: Option<String>) -> SessionResult<PreparedSession> {
        sandbox_resume(
            self.sandbox.as_ref(),
            ResumeRequest {
                session_id: &self.session_id,
                owner_segment: &self.owner_segment,
                kilocode_token: &self.kilocode_token,
                kilocode_organization_id: self.org_id.as_ref().map(|o| o.as_str()),
                user_env_vars: &self.user_env_vars,
                decrypted_secrets: &self.decrypted_secrets,
                source: Some(&self.source),
                fresh_token: fresh_token.as_deref(),
                setup_commands: &self.setup_commands,
                mcp_servers_json: self.mcp_json.as_ref(),
            },
        )
        .await
    }
}

fn plan_fresh_token(plan: &WrapperLaunchPlan) -> Option<String> {
    plan.token_override.clone()
}
