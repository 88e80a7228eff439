use anyhow::Result;
use async_trait::async_trait;

/// External DNS provider. `create_dns_records` must be an idempotent
/// create-or-update so DNS configuration can run on every pass.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn create_dns_records(&self, names: &[String], endpoints: &[String]) -> Result<()>;
    async fn delete_dns_records(&self, names: &[String]) -> Result<()>;
}
