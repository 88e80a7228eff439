//! Best-effort webhook delivery. Every live registered webhook receives
//! every payload; failures are logged and never propagate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anchorage_common::now_nanos;
use anchorage_model::WebhookPayload;
use anchorage_store::*;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WebhookSender {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    environment: String,
}

impl WebhookSender {
    pub fn new(store: Arc<dyn Store>, environment: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .expect("build webhook http client");
        Self {
            store,
            client,
            environment,
        }
    }

    pub fn payload(
        &self,
        resource_type: &str,
        id: &str,
        new_state: &str,
        old_state: &str,
    ) -> WebhookPayload {
        let mut extra_data = BTreeMap::new();
        extra_data.insert("Environment".to_string(), self.environment.clone());
        WebhookPayload {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            new_state: new_state.to_string(),
            old_state: old_state.to_string(),
            timestamp: now_nanos(),
            extra_data,
        }
    }

    pub async fn send_to_all_webhooks(&self, payload: &WebhookPayload) {
        let webhooks = match self.store.get_webhooks().await {
            Ok(webhooks) => webhooks,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list webhooks; skipping delivery");
                return;
            }
        };
        for webhook in webhooks {
            if let Err(err) = self
                .client
                .post(&webhook.url)
                .json(payload)
                .send()
                .await
                .and_then(|resp| resp.error_for_status())
            {
                tracing::warn!(
                    error = %err,
                    webhook_id = %webhook.id,
                    url = %webhook.url,
                    "webhook delivery failed"
                );
            }
        }
    }
}
