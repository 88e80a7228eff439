use std::time::{SystemTime, UNIX_EPOCH};

pub mod args;
pub mod metrics;
pub mod postgres;
pub mod shutdown;
pub mod wait;

/// Resource types handled by the control plane. Used as the `resource_type`
/// discriminator in state-change events and webhook payloads.
pub mod resource_types {
    pub const CLUSTER: &str = "cluster";
    pub const INSTALLATION: &str = "installation";
    pub const CLUSTER_INSTALLATION: &str = "cluster_installation";
    pub const INSTALLATION_BACKUP: &str = "installation_backup";
    pub const INSTALLATION_DB_RESTORATION: &str = "installation_db_restoration";
    pub const INSTALLATION_DB_MIGRATION: &str = "installation_db_migration";
}

/// Generate a new opaque resource ID (hyphenless UUIDv4).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Current wall-clock time as unix epoch milliseconds. Zero is reserved to
/// mean "unset" throughout the data model.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current wall-clock time as unix epoch nanoseconds, for webhook payloads.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}
