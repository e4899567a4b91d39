//! `AuthorityConfig` (§9 "Global state", §10): every tunable the Authority
//! needs is threaded through its constructor, never read from a global.

use chrono::Duration;

#[derive(Clone, Debug)]
pub struct AuthorityConfig {
    /// Idle-session deletion threshold (§4.6 reaper step a). 90 days.
    pub session_ttl: Duration,
    /// Running execution with no heartbeat past this is stale (§4.6 step b).
    pub stale_threshold: Duration,
    /// Pending execution the wrapper never connected to (§4.6 step b). 5 min.
    pub pending_start_timeout: Duration,
    /// Reaper cadence (§4.6). 5 min.
    pub reaper_interval: Duration,
    /// Event retention horizon (§4.6 step c). 90 days.
    pub event_retention: Duration,
    /// Base URL of the analytics backend for the `session_created` link call (§6).
    pub backend_base_url: String,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::days(90),
            stale_threshold: Duration::minutes(10),
            pending_start_timeout: Duration::minutes(5),
            reaper_interval: Duration::minutes(5),
            event_retention: Duration::days(90),
            backend_base_url: "https://api.kilocode.ai".to_string(),
        }
    }
}
