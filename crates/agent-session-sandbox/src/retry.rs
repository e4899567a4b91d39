//! `with_sandbox_retry` (§4.5): up to 3 attempts, exponential backoff with
//! jitter, only for errors carrying `retryable=true` and not `overloaded=true`.

use std::future::Future;

use agent_session_types::{SessionError, SessionResult};
use rand::Rng;

pub const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 200;

fn backoff_delay_ms(attempt: u32) -> u64 {
    let exponential = BASE_DELAY_MS * 2u64.pow(attempt.saturating_sub(1));
    let jitter = rand::thread_rng().gen_range(0..=exponential / 2);
    exponential + jitter
}

/// Retries `op` up to [`MAX_ATTEMPTS`] times. Before each retry, `cleanup` is
/// invoked to tear down the partially-provisioned workspace; a cleanup
/// failure is logged, never raised (§4.5).
pub async fn with_sandbox_retry<Op, Fut, T, Cleanup, CleanupFut>(mut op: Op, mut cleanup: Cleanup) -> SessionResult<T>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = SessionResult<T>>,
    Cleanup: FnMut() -> CleanupFut,
    CleanupFut: Future<Output = SessionResult<()>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_sandbox_retryable() && attempt < MAX_ATTEMPTS => {
                if let Err(cleanup_err) = cleanup().await {
                    tracing::warn!(
                        component = "sandbox",
                        event = "sandbox.retry.cleanup_failed",
                        attempt,
                        error = %cleanup_err,
                        "cleanup after failed attempt did not complete"
                    );
                }
                tokio::time::sleep(std::time::Duration::from_millis(backoff_delay_ms(attempt))).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Classifies an error for callers that need to decide retry eligibility
/// without going through [`with_sandbox_retry`] (e.g. logging paths).
pub fn is_retryable(err: &SessionError) -> bool {
    err.is_sandbox_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_up_to_three_times_then_succeeds() {
        let attempts = AtomicU32::new(0);
        let cleanups = AtomicU32::new(0);
        let result = with_sandbox_retry(
            |_n| {
                let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if count < 3 {
                        Err(SessionError::SandboxRetryable("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
            || {
                cleanups.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let attempts = AtomicU32::new(0);
        let result: SessionResult<()> = with_sandbox_retry(
            |_n| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(SessionError::SandboxFatal("nope".into())) }
            },
            || async { Ok(()) },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overloaded_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: SessionResult<()> = with_sandbox_retry(
            |_n| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(SessionError::SandboxOverloaded("busy".into())) }
            },
            || async { Ok(()) },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let result: SessionResult<()> = with_sandbox_retry(
            |_n| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(SessionError::SandboxRetryable("always".into())) }
            },
            || async { Ok(()) },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }
}
