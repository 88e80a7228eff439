//! Supervisor-side metrics. Transition counters are recorded at each state
//! change; lifecycle histograms are recorded when a resource settles, using
//! the newest matching request event to label the originating request.

use metrics::{counter, histogram};

use anchorage_common::now_millis;
use anchorage_model::{StateChangeEvent, StateChangeEventFilter};
use anchorage_store::*;

pub fn record_transition(resource_type: &str, old_state: &str, new_state: &str) {
    counter!(
        "anchorage_state_transitions_total",
        "resource" => resource_type.to_string(),
        "old_state" => old_state.to_string(),
        "new_state" => new_state.to_string(),
    )
    .increment(1);
}

/// Record how long the resource took to settle, labeled by the `*Requested`
/// state that started the work. The originating request is the newest
/// state-change event whose new state is one of `request_states`.
pub async fn record_lifecycle_duration(
    store: &dyn Store,
    resource_type: &str,
    resource_id: &str,
    request_states: &[&str],
    settled_state: &str,
) {
    let filter = StateChangeEventFilter {
        resource_id: Some(resource_id.to_string()),
        resource_type: Some(resource_type.to_string()),
        new_states: request_states.iter().map(|s| s.to_string()).collect(),
        max_results: 1,
    };
    let events = match store.get_state_change_events(&filter).await {
        Ok(events) => events,
        Err(err) => {
            tracing::warn!(error = %err, resource_id, "failed to query events for metrics");
            return;
        }
    };
    let Some(origin): Option<&StateChangeEvent> = events.first() else {
        tracing::error!(
            resource_type,
            resource_id,
            settled_state,
            "no originating request event found; skipping duration metric"
        );
        return;
    };
    let seconds = (now_millis() - origin.timestamp).max(0) as f64 / 1000.0;
    histogram!(
        "anchorage_resource_lifecycle_seconds",
        "resource" => resource_type.to_string(),
        "requested_state" => origin.new_state.clone(),
        "settled_state" => settled_state.to_string(),
    )
    .record(seconds);
}
