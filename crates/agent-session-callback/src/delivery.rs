//! Thin HTTP transport around the pure [`policy`] decision (§4.8).

use std::time::Duration;

use reqwest::Client;

use crate::job::CallbackJob;
use crate::policy::{decide, Outcome};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeliveryResult {
    Success,
    Retry { delay: Duration },
    Failed,
}

pub struct CallbackDispatcher {
    client: Client,
}

impl Default for CallbackDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    /// Delivers one attempt of `job`; `attempts` counts this attempt. Callers
    /// own the retry loop, scheduling the next attempt after `Retry{delay}`.
    pub async fn deliver(&self, job: &CallbackJob, attempts: u32) -> DeliveryResult {
        let mut request = self.client.post(&job.target.url).json(&job.payload);
        if let Some(auth) = job.target.headers.get("Authorization") {
            request = request.header("Authorization", auth);
        }
        for (name, value) in &job.target.headers {
            if name != "Authorization" {
                request = request.header(name, value);
            }
        }

        let status = request.send().await.ok().map(|resp| resp.status().as_u16());
        match decide(status, attempts) {
            Outcome::Success => {
                tracing::info!(component = "callback", event = "delivered", url = %job.target.url, attempts);
                DeliveryResult::Success
            }
            Outcome::Retry { delay } => {
                tracing::warn!(component = "callback", event = "retry_scheduled", url = %job.target.url, attempts, delay_secs = delay.as_secs());
                DeliveryResult::Retry { delay }
            }
            Outcome::Failed => {
                tracing::error!(component = "callback", event = "delivery_failed", url = %job.target.url, attempts);
                DeliveryResult::Failed
            }
        }
    }
}
