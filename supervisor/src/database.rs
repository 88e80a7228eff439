//! Database backends the tenants' data lives in. The supervisors drive
//! provisioning, teardown and cross-backend migration through this trait;
//! the concrete drivers are external.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use anchorage_model::{DatabaseKind, Installation, InstallationDbMigrationOperation};

#[async_trait]
pub trait DatabaseProvider: Send + Sync {
    async fn provision(&self, installation: &Installation) -> Result<()>;
    async fn teardown(&self, installation: &Installation, keep_data: bool) -> Result<()>;
    /// Re-reads backend-side connection metadata so dependent secrets can be
    /// regenerated (used before hibernation and wake-up).
    async fn refresh_metadata(&self, installation: &Installation) -> Result<()>;
    /// Prepare the source side of a migration away from this backend.
    async fn migrate_out(
        &self,
        installation: &Installation,
        operation: &InstallationDbMigrationOperation,
    ) -> Result<()>;
    /// Prepare the destination side of a migration into this backend.
    async fn migrate_to(
        &self,
        installation: &Installation,
        operation: &InstallationDbMigrationOperation,
    ) -> Result<()>;
    /// Undo `migrate_to` on this backend.
    async fn rollback(
        &self,
        installation: &Installation,
        operation: &InstallationDbMigrationOperation,
    ) -> Result<()>;
    /// Remove migration artifacts left on this backend once the operation
    /// row is deleted.
    async fn teardown_migrated(
        &self,
        installation: &Installation,
        operation: &InstallationDbMigrationOperation,
    ) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct DatabaseRegistry {
    providers: HashMap<DatabaseKind, Arc<dyn DatabaseProvider>>,
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: DatabaseKind, provider: Arc<dyn DatabaseProvider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    pub fn get(&self, kind: DatabaseKind) -> Result<Arc<dyn DatabaseProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| anyhow!("no database provider registered for {kind}"))
    }
}
