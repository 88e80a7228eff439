use serde::{Deserialize, Serialize};

/// A DNS name pointing at an installation. Records are tombstoned with
/// `delete_at` before the row itself is removed during final cleanup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallationDnsRecord {
    pub id: String,
    pub installation_id: String,
    pub domain_name: String,
    pub is_primary: bool,
    /// Unix epoch timestamp in milliseconds.
    pub create_at: i64,
    /// Unix epoch timestamp in milliseconds. Zero means not deleted.
    pub delete_at: i64,
}

impl InstallationDnsRecord {
    pub fn is_deleted(&self) -> bool {
        self.delete_at > 0
    }
}
