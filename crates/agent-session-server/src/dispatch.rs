//! Dispatch worker (§4.5, §6): drains the in-process external queue stand-in,
//! provisions the sandbox for the dispatched execution, and launches the
//! wrapper process. The wrapper's actual progress and completion arrive later
//! over `/ingest`; this worker only owns the launch, never the outcome.

use std::collections::HashMap;
use std::sync::Arc;

use agent_session_authority::{channel::DispatchedMessage, WrapperLaunchPlan};
use agent_session_types::ExecutionStatus;
use chrono::Utc;

use crate::session_manager::SessionManager;

/// Falls back to the wrapper CLI's conventional entrypoint name when
/// `WRAPPER_BIN` isn't set; overridable per-deployment since the actual
/// binary path depends on how the sandbox image was built.
fn wrapper_binary() -> String {
    std::env::var("WRAPPER_BIN").unwrap_or_else(|_| "kilocode-wrapper".to_string())
}

/// Upper bound on how long a single wrapper invocation may run before the
/// sandbox transport gives up and reports `SandboxRetryable`. The reaper's
/// stale-execution sweep (§4.6 step b) is the backstop for a wrapper that
/// hangs past this without ever heartbeating.
const WRAPPER_TIMEOUT_SECS: u64 = 6 * 60 * 60;

pub async fn run_dispatch_worker(manager: Arc<SessionManager>) {
    let mut receiver = manager.take_dispatch_receiver().await;
    while let Some(dispatched) = receiver.recv().await {
        manager
            .register_execution_session(&dispatched.execution_id, &dispatched.session_id)
            .await;
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_dispatch(&manager, dispatched.clone()).await {
                tracing::error!(
                    component = "server",
                    event = "dispatch.failed",
                    session_id = %dispatched.session_id,
                    execution_id = %dispatched.execution_id,
                    error = %err,
                    "dispatch worker failed to launch wrapper"
                );
            }
        });
    }
    tracing::info!(component = "server", event = "dispatch.worker_exit", "dispatch channel closed, worker stopping");
}

async fn handle_dispatch(manager: &SessionManager, dispatched: DispatchedMessage) -> anyhow::Result<()> {
    let authority = manager.get_or_create(&dispatched.session_id).await?;
    let plan: WrapperLaunchPlan = serde_json::from_value(dispatched.message.clone())?;
    let now = Utc::now();

    let prepared = authority.provision(&plan, now).await?;
    authority.update_heartbeat(dispatched.execution_id.clone(), now).await.ok();

    let mut env: HashMap<String, String> = prepared.environment.clone();
    env.insert("KILOCODE_INGEST_TOKEN".to_string(), plan.ingest_token.clone());
    env.insert("KILOCODE_PROMPT".to_string(), plan.prompt.clone());
    env.insert("KILOCODE_MODE".to_string(), plan.mode.clone());
    env.insert("KILOCODE_MODEL".to_string(), plan.model.clone());
    if let Some(append) = &plan.append_system_prompt {
        env.insert("KILOCODE_APPEND_SYSTEM_PROMPT".to_string(), append.clone());
    }

    tracing::info!(
        component = "server",
        event = "dispatch.launching_wrapper",
        session_id = %dispatched.session_id,
        execution_id = %dispatched.execution_id,
        workspace = %prepared.workspace,
        "launching wrapper process"
    );

    let output = authority
        .sandbox()
        .run(&prepared.workspace, &wrapper_binary(), &[], &env, WRAPPER_TIMEOUT_SECS)
        .await;

    let completion_now = Utc::now();
    let (status, error) = match output {
        Ok(output) => match output.exit_code {
            0 => (ExecutionStatus::Completed, None),
            143 => (ExecutionStatus::Interrupted, None),
            code => (ExecutionStatus::Failed, Some(format!("wrapper exited {code}: {}", output.stderr.trim()))),
        },
        Err(err) => (ExecutionStatus::Failed, Some(err.to_string())),
    };

    authority
        .on_execution_complete(dispatched.execution_id.clone(), status, error, completion_now)
        .await?;
    Ok(())
}
