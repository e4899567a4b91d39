//! `ServerConfig` (§10): every tunable the binary needs, read from the
//! environment with an `env::var(...).unwrap_or_else(...)` idiom, one
//! variable per tunable rather than a config-file framework.

use std::net::SocketAddr;
use std::path::PathBuf;

use agent_session_authority::AuthorityConfig;
use chrono::Duration;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_duration_ms(key: &str, default_ms: i64) -> Duration {
    let millis = std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default_ms);
    Duration::milliseconds(millis)
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub backend_base_url: String,
    /// Origins allowed to open `/stream` (§6). Comma-separated in
    /// `STREAM_ALLOWED_ORIGINS`; empty means no origin is allowed.
    pub allowed_origins: Vec<String>,
    /// HMAC key used to verify `/stream` tickets. Generated randomly at
    /// startup if `TICKET_SIGNING_KEY` is unset, which only makes sense for a
    /// single-process deployment where the issuer and verifier are the same
    /// binary instance.
    pub ticket_signing_key: Vec<u8>,
    pub authority: AuthorityConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let bind_addr = env_string("SERVER_BIND_ADDR", "0.0.0.0:8080")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));
        let data_dir = PathBuf::from(env_string("SESSION_DATA_DIR", "./data/sessions"));
        let backend_base_url = env_string("BACKEND_BASE_URL", "https://api.kilocode.ai");
        let allowed_origins = std::env::var("STREAM_ALLOWED_ORIGINS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let ticket_signing_key = std::env::var("TICKET_SIGNING_KEY")
            .map(|v| v.into_bytes())
            .unwrap_or_else(|_| {
                tracing::warn!(
                    component = "server",
                    event = "config.ticket_key_generated",
                    "TICKET_SIGNING_KEY not set, generating an ephemeral key for this process"
                );
                uuid::Uuid::new_v4().as_bytes().to_vec()
            });

        let authority = AuthorityConfig {
            session_ttl: env_duration_ms("SESSION_TTL_MS", Duration::days(90).num_milliseconds()),
            stale_threshold: env_duration_ms("STALE_THRESHOLD_MS", Duration::minutes(10).num_milliseconds()),
            pending_start_timeout: env_duration_ms("PENDING_START_TIMEOUT_MS", Duration::minutes(5).num_milliseconds()),
            reaper_interval: env_duration_ms("REAPER_INTERVAL_MS", Duration::minutes(5).num_milliseconds()),
            event_retention: env_duration_ms("RETENTION_MS", Duration::days(90).num_milliseconds()),
            backend_base_url: backend_base_url.clone(),
        };

        Self {
            bind_addr,
            data_dir,
            backend_base_url,
            allowed_origins,
            ticket_signing_key,
            authority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_when_env_is_unset() {
        // SAFETY (test-only, single-threaded test): clears a handful of vars
        // this process may have inherited so the default-path assertions
        // below are deterministic regardless of the ambient environment.
        for key in ["SERVER_BIND_ADDR", "SESSION_DATA_DIR", "STREAM_ALLOWED_ORIGINS", "TICKET_SIGNING_KEY"] {
            std::env::remove_var(key);
        }
        let config = ServerConfig::from_env();
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.allowed_origins.is_empty());
        assert_eq!(config.authority.session_ttl, Duration::days(90));
    }
}
