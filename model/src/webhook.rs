use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A registered webhook endpoint. All live webhooks receive every payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Webhook {
    pub id: String,
    pub owner_id: String,
    pub url: String,
    /// Unix epoch timestamp in milliseconds.
    pub create_at: i64,
    /// Unix epoch timestamp in milliseconds. Zero means not deleted.
    pub delete_at: i64,
}

impl Webhook {
    pub fn is_deleted(&self) -> bool {
        self.delete_at > 0
    }
}

/// The JSON body delivered to registered webhooks on a state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
    pub new_state: String,
    pub old_state: String,
    /// Unix epoch timestamp in nanoseconds.
    pub timestamp: i64,
    pub extra_data: BTreeMap<String, String>,
}
