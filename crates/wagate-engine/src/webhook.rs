use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use wagate_core::{InstanceId, NormalizedMessage};

/// Event name consumers receive for inbound messages.
pub const MESSAGE_EVENT: &str = "messages.upsert";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WebhookPayload {
    pub instance: String,
    #[serde(rename = "instanceId")]
    pub instance_id: InstanceId,
    pub event: &'static str,
    pub data: NormalizedMessage,
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("endpoint returned {0}")]
    Status(reqwest::StatusCode),
}

/// Best-effort, single-attempt webhook delivery.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: Client,
    timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(timeout: Duration) -> Self {
        let client = match Client::builder()
            .timeout(timeout)
            .user_agent("wagate-webhook/0.1")
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "webhook client build failed; using default client");
                Client::new()
            }
        };
        Self { client, timeout }
    }

    /// Schedules one POST on `runtime` and returns immediately. A missing or
    /// blank endpoint is a no-op. Failures are logged and dropped.
    pub fn deliver(&self, runtime: &Handle, endpoint: Option<&str>, payload: WebhookPayload) {
        let Some(url) = endpoint.map(str::trim).filter(|u| !u.is_empty()) else {
            return;
        };
        let url = url.to_string();
        let this = self.clone();
        runtime.spawn(async move {
            match this.post(&url, &payload).await {
                Ok(()) => debug!(instance = %payload.instance, "webhook delivered"),
                Err(e) => warn!(
                    instance = %payload.instance,
                    instance_id = %payload.instance_id,
                    error = %e,
                    "webhook delivery failed"
                ),
            }
        });
    }

    pub async fn post(&self, url: &str, payload: &WebhookPayload) -> Result<(), WebhookError> {
        // Per-request timeout still applies if the builder fell back.
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::Status(status));
        }
        Ok(())
    }
}
