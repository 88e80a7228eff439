use serde::{Deserialize, Serialize};

/// Append-only record of a resource state transition. Queried newest-first
/// to compute lifecycle durations for metrics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateChangeEvent {
    pub id: String,
    pub resource_id: String,
    /// One of `anchorage_common::resource_types`.
    pub resource_type: String,
    pub old_state: String,
    pub new_state: String,
    /// Unix epoch timestamp in milliseconds.
    pub timestamp: i64,
}

/// Filter for state-change event queries. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct StateChangeEventFilter {
    pub resource_id: Option<String>,
    pub resource_type: Option<String>,
    /// Restrict to events whose new state is one of these.
    pub new_states: Vec<String>,
    /// Zero means unbounded.
    pub max_results: usize,
}
