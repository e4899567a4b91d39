//! Pure retry/backoff decision (§4.8): no I/O, so it is unit tested without
//! a network.

use std::time::Duration;

pub const MAX_CALLBACK_ATTEMPTS: u32 = 5;
const BASE_DELAY_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Outcome {
    Success,
    Retry { delay: Duration },
    Failed,
}

/// `attempts` is the number of attempts made so far, including the one that
/// just failed (first failure is `attempts == 1`).
pub fn decide(status: Option<u16>, attempts: u32) -> Outcome {
    match status {
        Some(200) | Some(201) | Some(204) => Outcome::Success,
        _ if !should_retry(status) => Outcome::Failed,
        _ if attempts >= MAX_CALLBACK_ATTEMPTS => Outcome::Failed,
        _ => Outcome::Retry {
            delay: delay_for(attempts),
        },
    }
}

/// `status == None` models a network-level failure (no response at all).
fn should_retry(status: Option<u16>) -> bool {
    match status {
        None => true,
        Some(429) => true,
        Some(code) => (500..600).contains(&code),
    }
}

/// `60 * 2^(attempts-1)` seconds, per §4.8.
pub fn delay_for(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1);
    Duration::from_secs(BASE_DELAY_SECS.saturating_mul(1u64 << exponent.min(32)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_statuses_succeed() {
        for code in [200, 201, 204] {
            assert_eq!(decide(Some(code), 1), Outcome::Success);
        }
    }

    #[test]
    fn server_error_retries_with_base_delay() {
        assert_eq!(
            decide(Some(503), 1),
            Outcome::Retry {
                delay: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn rate_limit_retries() {
        assert_eq!(
            decide(Some(429), 2),
            Outcome::Retry {
                delay: Duration::from_secs(120)
            }
        );
    }

    #[test]
    fn network_failure_retries() {
        assert_eq!(
            decide(None, 1),
            Outcome::Retry {
                delay: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn other_4xx_never_retries() {
        assert_eq!(decide(Some(400), 1), Outcome::Failed);
        assert_eq!(decide(Some(404), 1), Outcome::Failed);
    }

    #[test]
    fn exhausts_after_five_attempts() {
        assert_eq!(decide(Some(500), 5), Outcome::Failed);
    }

    #[test]
    fn delay_doubles_each_attempt() {
        assert_eq!(delay_for(1), Duration::from_secs(60));
        assert_eq!(delay_for(2), Duration::from_secs(120));
        assert_eq!(delay_for(3), Duration::from_secs(240));
        assert_eq!(delay_for(4), Duration::from_secs(480));
    }
}
