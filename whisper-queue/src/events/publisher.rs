//! Outbound event publishing.
//!
//! Delivery is at-least-once: transport errors are retried internally with a
//! short backoff, and the consumer side is idempotent, so a duplicate publish
//! is harmless.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::events::envelope::{EventEnvelope, encode_message_data};
use crate::{Error, Result};

/// Default per-request timeout for publish calls, in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Bounded publish attempts before giving up.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base backoff between publish attempts, in milliseconds.
const RETRY_BASE_DELAY_MS: u64 = 200;

/// Event publisher trait.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an envelope to the event topic.
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()>;
}

/// Pub/sub publisher configuration.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Publish API base URL.
    pub endpoint: String,
    /// Project the topic lives in.
    pub project_id: String,
    /// Topic name.
    pub topic: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Bounded publish attempts.
    pub max_attempts: u32,
}

impl PubSubConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            endpoint: settings.pubsub_endpoint.clone(),
            project_id: settings.gcp_project_id.clone(),
            topic: settings.pubsub_topic.clone(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Publisher posting to the pub/sub REST publish endpoint.
pub struct PubSubPublisher {
    config: PubSubConfig,
    client: Client,
}

impl PubSubPublisher {
    pub fn new(config: PubSubConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn publish_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/topics/{}:publish",
            self.config.endpoint.trim_end_matches('/'),
            self.config.project_id,
            self.config.topic,
        )
    }
}

#[async_trait]
impl EventPublisher for PubSubPublisher {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        let body = json!({
            "messages": [{ "data": encode_message_data(envelope)? }]
        });
        let url = self.publish_url();

        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error: Option<Error> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY_MS.saturating_mul(1u64 << (attempt - 1));
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            match self.client.post(&url).json(&body).send().await {
                Ok(response) => match response.error_for_status() {
                    Ok(_) => {
                        debug!(
                            job_id = %envelope.job_id,
                            event_type = %envelope.event_type,
                            "Published event"
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(
                            job_id = %envelope.job_id,
                            attempt = attempt + 1,
                            "Publish rejected: {}", e
                        );
                        last_error = Some(e.into());
                    }
                },
                Err(e) => {
                    warn!(
                        job_id = %envelope.job_id,
                        attempt = attempt + 1,
                        "Publish transport error: {}", e
                    );
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Other("publish failed".to_string())))
    }
}
