//! Reaper (§4.6 scheduled maintenance): per-session alarm that runs on
//! `config.reaper_interval` and sweeps the five things nothing else in this
//! crate proactively cleans up — idle sessions, stale executions, expired
//! leases, expired queue entries parked behind an active execution, and
//! old events.

use chrono::{DateTime, Utc};

use crate::authority::{ReaperReport, SessionAuthority};
use agent_session_types::{ExecutionStatus, SessionResult};

impl SessionAuthority {
    /// One reaper pass. Each stage is independent — a failure in one does
    /// not stop the others from running, except storage errors on the
    /// session-deletion stage itself, which end the tick early since there
    /// is nothing left to sweep once the session is gone.
    pub async fn reap(&self, now: DateTime<Utc>) -> SessionResult<ReaperReport> {
        let mut report = ReaperReport::default();

        if self.maybe_delete_idle_session(now).await? {
            report.session_deleted = true;
            return Ok(report);
        }

        report.executions_marked_stale = self.mark_stale_executions(now).await?;
        report.leases_expired = self.leases.delete_expired(now).await? as u32;
        report.queue_entries_expired = self.expire_queue_entries(now).await?;
        report.events_pruned = self.events.delete_older_than(now, self.config.event_retention).await?;

        // §4.6 step e: always re-attempt a dispatch at the end of the pass.
        // A prior `onExecutionComplete` may have cleared the active pointer
        // and then failed before it finished advancing the queue itself —
        // without this, a session with queued work but nothing currently
        // stale would never dispatch again.
        self.try_advance_queue_internal(now).await?;

        Ok(report)
    }

    /// §4.6 step a: an idle, non-active session past `session_ttl` is
    /// deleted outright. Never deletes a session mid-execution.
    async fn maybe_delete_idle_session(&self, now: DateTime<Utc>) -> SessionResult<bool> {
        if self.executions.active_execution_id().await?.is_some() {
            return Ok(false);
        }
        let Some(last_activity_ms) = self.store.load_last_activity_ms().await? else {
            return Ok(false);
        };
        let idle_for = now.timestamp_millis() - last_activity_ms;
        if idle_for <= self.config.session_ttl.num_milliseconds() {
            return Ok(false);
        }
        self.store.delete_all().await?;
        tracing::info!(component = "authority", event = "reaper.session_deleted", session_id = %self.session_id, "idle session deleted");
        Ok(true)
    }

    /// §4.6 step b: the one execution a session can have active is stale if
    /// it never got a heartbeat (`pendingStartTimeout` since it started) or
    /// stopped heartbeating (`staleThreshold` since the last one). Marking it
    /// `Failed` clears the active pointer's hold on the queue, so the next
    /// queued execution (if any) gets to run.
    async fn mark_stale_executions(&self, now: DateTime<Utc>) -> SessionResult<u32> {
        let Some(execution_id) = self.executions.active_execution_id().await? else {
            return Ok(0);
        };
        let Some(execution) = self.executions.get(execution_id.clone()).await? else {
            return Ok(0);
        };
        if execution.status != ExecutionStatus::Running && execution.status != ExecutionStatus::Pending {
            return Ok(0);
        }

        let (is_stale, reason) = match execution.last_heartbeat {
            Some(heartbeat) => (
                now - heartbeat > self.config.stale_threshold,
                "Execution timeout - no heartbeat received",
            ),
            None => (
                now - execution.started_at > self.config.pending_start_timeout,
                "wrapper never connected",
            ),
        };
        if !is_stale {
            return Ok(0);
        }

        self.executions
            .update_status(execution_id.clone(), ExecutionStatus::Failed, Some(now), Some(reason.to_string()))
            .await?;
        self.executions.clear_active_execution().await?;
        self.wrapper_channels.unregister(&execution_id);
        tracing::warn!(
            component = "authority",
            event = "reaper.execution_marked_stale",
            session_id = %self.session_id,
            execution_id = %execution_id,
            "reaped stale execution"
        );

        self.try_advance_queue_internal(now).await?;
        Ok(1)
    }

    /// Drops every queue row past `QUEUE_ENTRY_TTL`, wherever it
    /// sits in the FIFO — `tryAdvanceQueueInternal` only ever inspects the
    /// head, so a long-running active execution can otherwise let rows
    /// behind it sit expired indefinitely.
    async fn expire_queue_entries(&self, now: DateTime<Utc>) -> SessionResult<u32> {
        let entries = self.queue.list_all(self.session_id.clone()).await?;
        let mut expired = 0u32;
        for entry in entries {
            if !entry.is_expired(now) {
                continue;
            }
            self.queue.dequeue_by_id(entry.id).await?;
            self.executions
                .update_status(entry.execution_id.clone(), ExecutionStatus::Failed, Some(now), Some("queue_expired".to_string()))
                .await?;
            expired += 1;
        }
        if expired > 0 {
            tracing::info!(
                component = "authority",
                event = "reaper.queue_entries_expired",
                session_id = %self.session_id,
                count = expired,
                "reaped expired queue entries"
            );
        }
        Ok(expired)
    }
}

/// Drives `reap` on `config.reaper_interval` until the session actor drops
/// this future (the server binary's per-session task owns its lifetime,
/// §2 actor-per-session model). A missed wakeup due to a transient storage
/// error just gets retried on the next tick rather than killing the loop.
pub async fn run_reaper_loop(authority: SessionAuthority) {
    let period = authority.config.reaper_interval.to_std().unwrap_or(std::time::Duration::from_secs(300));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = Utc::now();
        match authority.reap(now).await {
            Ok(report) if report.session_deleted => {
                tracing::info!(component = "authority", event = "reaper.loop_exit", session_id = %authority.session_id(), "session deleted, stopping reaper loop");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(component = "authority", event = "reaper.tick_failed", session_id = %authority.session_id(), error = %err, "reaper tick failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_link::fake::RecordingBackendLinkClient;
    use crate::config::AuthorityConfig;
    use crate::external_queue::fake::RecordingQueueSender;
    use crate::secrets::fake::FakeSecretsDecryptor;
    use agent_session_sandbox::FakeSandboxRuntime;
    use agent_session_storage::SessionStore;
    use agent_session_types::{ExecutionId, GitSource, SessionId, UserId};
    use std::sync::Arc;

    fn authority_with(config: AuthorityConfig) -> SessionAuthority {
        SessionAuthority::new(
            SessionId::from("s1"),
            SessionStore::open_in_memory().unwrap(),
            Arc::new(FakeSandboxRuntime::default()),
            Arc::new(RecordingQueueSender::new()),
            Arc::new(RecordingBackendLinkClient::new()),
            Arc::new(FakeSecretsDecryptor),
            config,
        )
    }

    async fn prepared(authority: &SessionAuthority, now: DateTime<Utc>) {
        use crate::authority::PrepareRequest;
        use agent_session_types::PreparedExecutionInput;

        authority
            .prepare(
                PrepareRequest {
                    user_id: UserId::from("u1"),
                    org_id: None,
                    bot_id: None,
                    kilocode_token: None,
                    source: GitSource::GitHub {
                        github_repo: "acme/repo".into(),
                        github_token: None,
                    },
                    input: PreparedExecutionInput {
                        prompt: "do it".into(),
                        mode: "code".into(),
                        model: "m1".into(),
                        auto_commit: false,
                        condense_on_complete: false,
                        append_system_prompt: None,
                    },
                    env_vars: Default::default(),
                    encrypted_secrets: Default::default(),
                    setup_commands: None,
                    mcp_servers: Default::default(),
                    callback_target: None,
                },
                now,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn idle_session_past_ttl_is_deleted() {
        let mut config = AuthorityConfig::default();
        config.session_ttl = chrono::Duration::minutes(10);
        let authority = authority_with(config);
        let now = Utc::now();
        prepared(&authority, now).await;

        let report = authority.reap(now + chrono::Duration::minutes(11)).await.unwrap();
        assert!(report.session_deleted);
        assert!(authority.metadata().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn active_session_is_never_deleted() {
        let mut config = AuthorityConfig::default();
        config.session_ttl = chrono::Duration::minutes(10);
        let authority = authority_with(config);
        let now = Utc::now();
        prepared(&authority, now).await;
        authority.executions.add(ExecutionId::from("e1"), "code", "tok", now).await.unwrap();
        authority.executions.set_active_execution(ExecutionId::from("e1")).await.unwrap();

        let report = authority.reap(now + chrono::Duration::minutes(11)).await.unwrap();
        assert!(!report.session_deleted);
    }

    #[tokio::test]
    async fn stale_pending_execution_is_marked_failed_and_unblocks_queue() {
        let mut config = AuthorityConfig::default();
        config.pending_start_timeout = chrono::Duration::minutes(5);
        let authority = authority_with(config);
        let now = Utc::now();
        prepared(&authority, now).await;

        authority.executions.add(ExecutionId::from("e1"), "code", "tok", now).await.unwrap();
        authority.executions.set_active_execution(ExecutionId::from("e1")).await.unwrap();

        let later = now + chrono::Duration::minutes(6);
        let report = authority.reap(later).await.unwrap();
        assert_eq!(report.executions_marked_stale, 1);
        let execution = authority.get_execution(ExecutionId::from("e1")).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error.as_deref(), Some("wrapper never connected"));
        assert!(authority.executions.active_execution_id().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_running_execution_gets_the_heartbeat_timeout_message() {
        let mut config = AuthorityConfig::default();
        config.stale_threshold = chrono::Duration::minutes(5);
        let authority = authority_with(config);
        let now = Utc::now();
        prepared(&authority, now).await;

        authority.executions.add(ExecutionId::from("e1"), "code", "tok", now).await.unwrap();
        authority.executions.set_active_execution(ExecutionId::from("e1")).await.unwrap();
        authority
            .executions
            .update_status(ExecutionId::from("e1"), ExecutionStatus::Running, None, None)
            .await
            .unwrap();
        authority.executions.update_heartbeat(ExecutionId::from("e1"), now).await.unwrap();

        let later = now + chrono::Duration::minutes(6);
        let report = authority.reap(later).await.unwrap();
        assert_eq!(report.executions_marked_stale, 1);
        let execution = authority.get_execution(ExecutionId::from("e1")).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error.as_deref(), Some("Execution timeout - no heartbeat received"));
    }

    #[tokio::test]
    async fn reap_advances_the_queue_even_when_nothing_is_stale() {
        let authority = authority_with(AuthorityConfig::default());
        let now = Utc::now();
        prepared(&authority, now).await;

        // Simulate an `onExecutionComplete` that cleared the active pointer
        // but crashed before it could call `tryAdvanceQueueInternal` itself:
        // a queued row sits behind a now-empty active slot.
        authority.executions.add(ExecutionId::from("queued"), "code", "tok", now).await.unwrap();
        authority
            .queue
            .enqueue(authority.session_id().clone(), ExecutionId::from("queued"), serde_json::json!({}), now)
            .await
            .unwrap();

        authority.reap(now).await.unwrap();

        assert_eq!(authority.executions.active_execution_id().await.unwrap(), Some(ExecutionId::from("queued")));
        assert_eq!(authority.queue.count(authority.session_id().clone()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queue_entries_behind_active_execution_expire_independently_of_the_head() {
        let authority = authority_with(AuthorityConfig::default());
        let now = Utc::now();
        prepared(&authority, now).await;

        authority.executions.add(ExecutionId::from("active"), "code", "tok", now).await.unwrap();
        authority.executions.set_active_execution(ExecutionId::from("active")).await.unwrap();

        authority.executions.add(ExecutionId::from("queued"), "code", "tok", now).await.unwrap();
        authority
            .queue
            .enqueue(authority.session_id().clone(), ExecutionId::from("queued"), serde_json::json!({}), now)
            .await
            .unwrap();

        let much_later = now + chrono::Duration::hours(2);
        let report = authority.reap(much_later).await.unwrap();
        assert_eq!(report.queue_entries_expired, 1);
        let queued = authority.get_execution(ExecutionId::from("queued")).await.unwrap().unwrap();
        assert_eq!(queued.status, ExecutionStatus::Failed);
        assert_eq!(authority.queue.count(authority.session_id().clone()).await.unwrap(), 0);
    }
}
