//! Webhook delivery of rollback alerts.

use crate::capabilities::{AlertCallback, AlertError};
use async_trait::async_trait;
use serde_json::json;
use shared_types::RollbackEvent;

pub struct WebhookAlerter {
    url: String,
    client: reqwest::Client,
}

impl WebhookAlerter {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertCallback for WebhookAlerter {
    async fn alert(&self, event: &RollbackEvent) -> Result<(), AlertError> {
        let trigger = if event.auto_triggered { "automatic" } else { "manual" };
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "text": format!(
                    "{} rollback triggered for recommendation {} ({}; oom_kills={}, throttle_increase={:.1}%)",
                    trigger,
                    event.original_recommendation_id,
                    event.reason.as_str(),
                    event.oom_kills_detected,
                    event.throttle_increase_percent,
                ),
                "event": event,
            }))
            .send()
            .await
            .map_err(|e| AlertError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AlertError(format!(
                "webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}
