//! Backend link call (§6): fire-and-forget `POST .../cliSessions.linkCloudAgent`
//! on `session_created`. Non-fatal by contract (§4.7, §7) — callers log and
//! move on regardless of outcome.

use agent_session_types::SessionResult;
use async_trait::async_trait;
use serde::Serialize;

#[derive(Serialize)]
struct LinkCloudAgentBody<'a> {
    kilo_session_id: &'a str,
    cloud_agent_session_id: &'a str,
}

#[async_trait]
pub trait BackendLinkClient: Send + Sync {
    async fn link_cloud_agent(&self, kilocode_token: &str, kilo_session_id: &str, cloud_agent_session_id: &str) -> SessionResult<()>;
}

pub struct HttpBackendLinkClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackendLinkClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BackendLinkClient for HttpBackendLinkClient {
    async fn link_cloud_agent(&self, kilocode_token: &str, kilo_session_id: &str, cloud_agent_session_id: &str) -> SessionResult<()> {
        let url = format!("{}/api/trpc/cliSessions.linkCloudAgent", self.base_url.trim_end_matches('/'));
        let body = LinkCloudAgentBody {
            kilo_session_id,
            cloud_agent_session_id,
        };

        let response = match self
            .client
            .post(&url)
            .bearer_auth(kilocode_token)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(component = "authority", event = "backend_link.request_failed", error = %err, "backend link call failed");
                return Ok(());
            }
        };

        if !response.status().is_success() {
            tracing::warn!(component = "authority", event = "backend_link.non_200", status = response.status().as_u16(), "backend link call rejected");
            return Ok(());
        }

        match response.json::<serde_json::Value>().await {
            Ok(body) => {
                let success = body
                    .get("result")
                    .and_then(|r| r.get("data"))
                    .and_then(|d| d.get("success"))
                    .and_then(|s| s.as_bool())
                    .unwrap_or(false);
                if !success {
                    tracing::warn!(component = "authority", event = "backend_link.success_false", "backend link call reported failure");
                }
            }
            Err(err) => {
                tracing::warn!(component = "authority", event = "backend_link.bad_body", error = %err, "backend link response was not valid JSON");
            }
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingBackendLinkClient {
        pub calls: Mutex<Vec<(String, String)>>,
    }

    impl RecordingBackendLinkClient {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl BackendLinkClient for RecordingBackendLinkClient {
        async fn link_cloud_agent(&self, _kilocode_token: &str, kilo_session_id: &str, cloud_agent_session_id: &str) -> SessionResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push((kilo_session_id.to_string(), cloud_agent_session_id.to_string()));
            Ok(())
        }
    }
}
