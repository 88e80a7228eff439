use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A configuration bundle joined to installations. `sequence` increases on
/// every mutation; members compare it against their recorded
/// `group_sequence` to detect drift during in-flight reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub sequence: i64,
    /// Version override inherited by member installations, empty for none.
    pub version: String,
    /// Environment overrides merged into member workloads.
    pub env_overrides: BTreeMap<String, String>,
    /// Unix epoch timestamp in milliseconds.
    pub create_at: i64,
    /// Unix epoch timestamp in milliseconds. Zero means not deleted.
    pub delete_at: i64,
    pub lock_acquired_by: Option<String>,
    pub lock_acquired_at: i64,
}

impl Group {
    pub fn is_deleted(&self) -> bool {
        self.delete_at > 0
    }
}
