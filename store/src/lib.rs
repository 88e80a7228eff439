//! Persistence contract for the control plane.
//!
//! Every resource kind gets CRUD, a lock pair, and an unlocked-pending-work
//! query. The lock protocol is what coordinates concurrent supervisor
//! replicas: `lock` is an atomic compare-and-set that succeeds iff the row
//! is unlocked or already held by the caller, `unlock` by a non-holder is a
//! no-op unless forced, and pending-work queries never return locked rows.

use anyhow::Result;
use async_trait::async_trait;

use anchorage_model::*;

mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_cluster(&self, id: &str) -> Result<Option<Cluster>>;
    /// Every non-deleted cluster, all pages.
    async fn get_clusters(&self) -> Result<Vec<Cluster>>;
    /// Unlocked clusters in pending-work states, highest work priority
    /// first. The sort is stable so equal-priority rows keep store order.
    async fn get_unlocked_clusters_pending_work(&self) -> Result<Vec<Cluster>>;
    async fn create_cluster(&self, cluster: &Cluster) -> Result<()>;
    async fn update_cluster(&self, cluster: &Cluster) -> Result<()>;
    /// Tombstone the cluster row (sets `delete_at`).
    async fn delete_cluster(&self, id: &str) -> Result<()>;
    async fn lock_cluster(&self, id: &str, locker_id: &str) -> Result<bool>;
    async fn unlock_cluster(&self, id: &str, locker_id: &str, force: bool) -> Result<bool>;
}

#[async_trait]
pub trait InstallationStore: Send + Sync {
    async fn get_installation(&self, id: &str) -> Result<Option<Installation>>;
    async fn get_unlocked_installations_pending_work(&self) -> Result<Vec<Installation>>;
    async fn create_installation(&self, installation: &Installation) -> Result<()>;
    async fn update_installation(&self, installation: &Installation) -> Result<()>;
    /// Tombstone the installation row (sets `delete_at`).
    async fn delete_installation(&self, id: &str) -> Result<()>;
    async fn lock_installation(&self, id: &str, locker_id: &str) -> Result<bool>;
    async fn unlock_installation(&self, id: &str, locker_id: &str, force: bool) -> Result<bool>;
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn get_group(&self, id: &str) -> Result<Option<Group>>;
    async fn create_group(&self, group: &Group) -> Result<()>;
    async fn update_group(&self, group: &Group) -> Result<()>;
    async fn lock_group(&self, id: &str, locker_id: &str) -> Result<bool>;
    async fn unlock_group(&self, id: &str, locker_id: &str, force: bool) -> Result<bool>;
}

#[async_trait]
pub trait ClusterInstallationStore: Send + Sync {
    async fn get_cluster_installation(&self, id: &str) -> Result<Option<ClusterInstallation>>;
    /// All bindings of one installation, `Deleted` ones included. Binding
    /// rows live forever, and cleanup paths need the tombstones.
    async fn get_cluster_installations_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<ClusterInstallation>>;
    /// All bindings on one cluster, `Deleted` ones included.
    async fn get_cluster_installations_for_cluster(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<ClusterInstallation>>;
    async fn get_unlocked_cluster_installations_pending_work(
        &self,
    ) -> Result<Vec<ClusterInstallation>>;
    async fn create_cluster_installation(&self, ci: &ClusterInstallation) -> Result<()>;
    async fn update_cluster_installation(&self, ci: &ClusterInstallation) -> Result<()>;
    async fn lock_cluster_installation(&self, id: &str, locker_id: &str) -> Result<bool>;
    async fn unlock_cluster_installation(
        &self,
        id: &str,
        locker_id: &str,
        force: bool,
    ) -> Result<bool>;
    /// All-or-nothing lock over a set of bindings.
    async fn lock_cluster_installations(&self, ids: &[String], locker_id: &str) -> Result<bool>;
    async fn unlock_cluster_installations(
        &self,
        ids: &[String],
        locker_id: &str,
        force: bool,
    ) -> Result<bool>;
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn get_backup(&self, id: &str) -> Result<Option<InstallationBackup>>;
    /// Non-deleted backups of one installation.
    async fn get_backups_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<InstallationBackup>>;
    /// Backups in requested/in-progress states that claimed the given
    /// cluster installation.
    async fn get_active_backups_for_cluster_installation(
        &self,
        cluster_installation_id: &str,
    ) -> Result<Vec<InstallationBackup>>;
    async fn get_unlocked_backups_pending_work(&self) -> Result<Vec<InstallationBackup>>;
    async fn create_backup(&self, backup: &InstallationBackup) -> Result<()>;
    async fn update_backup(&self, backup: &InstallationBackup) -> Result<()>;
    /// Tombstone the backup row (sets `delete_at`).
    async fn delete_backup(&self, id: &str) -> Result<()>;
    async fn lock_backup(&self, id: &str, locker_id: &str) -> Result<bool>;
    async fn unlock_backup(&self, id: &str, locker_id: &str, force: bool) -> Result<bool>;
}

#[async_trait]
pub trait RestorationStore: Send + Sync {
    async fn get_restoration(&self, id: &str)
    -> Result<Option<InstallationDbRestorationOperation>>;
    async fn get_restorations_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<InstallationDbRestorationOperation>>;
    async fn get_unlocked_restorations_pending_work(
        &self,
    ) -> Result<Vec<InstallationDbRestorationOperation>>;
    async fn create_restoration(&self, op: &InstallationDbRestorationOperation) -> Result<()>;
    async fn update_restoration(&self, op: &InstallationDbRestorationOperation) -> Result<()>;
    async fn delete_restoration(&self, id: &str) -> Result<()>;
    async fn lock_restoration(&self, id: &str, locker_id: &str) -> Result<bool>;
    async fn unlock_restoration(&self, id: &str, locker_id: &str, force: bool) -> Result<bool>;
}

#[async_trait]
pub trait MigrationStore: Send + Sync {
    async fn get_migration(&self, id: &str) -> Result<Option<InstallationDbMigrationOperation>>;
    async fn get_migrations_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<InstallationDbMigrationOperation>>;
    async fn get_unlocked_migrations_pending_work(
        &self,
    ) -> Result<Vec<InstallationDbMigrationOperation>>;
    async fn create_migration(&self, op: &InstallationDbMigrationOperation) -> Result<()>;
    async fn update_migration(&self, op: &InstallationDbMigrationOperation) -> Result<()>;
    async fn delete_migration(&self, id: &str) -> Result<()>;
    async fn lock_migration(&self, id: &str, locker_id: &str) -> Result<bool>;
    async fn unlock_migration(&self, id: &str, locker_id: &str, force: bool) -> Result<bool>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn create_state_change_event(&self, event: &StateChangeEvent) -> Result<()>;
    /// Matching events, newest first.
    async fn get_state_change_events(
        &self,
        filter: &StateChangeEventFilter,
    ) -> Result<Vec<StateChangeEvent>>;
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn get_webhooks(&self) -> Result<Vec<Webhook>>;
    async fn create_webhook(&self, webhook: &Webhook) -> Result<()>;
}

#[async_trait]
pub trait DnsRecordStore: Send + Sync {
    /// All records of an installation, tombstoned ones included.
    async fn get_dns_records_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<InstallationDnsRecord>>;
    async fn create_dns_record(&self, record: &InstallationDnsRecord) -> Result<()>;
    /// Remove the row entirely; used by installation final cleanup after the
    /// provider-side record is gone.
    async fn delete_dns_record(&self, id: &str) -> Result<()>;
}

/// The full store contract the supervisors are written against.
pub trait Store:
    ClusterStore
    + InstallationStore
    + GroupStore
    + ClusterInstallationStore
    + BackupStore
    + RestorationStore
    + MigrationStore
    + EventStore
    + WebhookStore
    + DnsRecordStore
{
}

impl<T> Store for T where
    T: ClusterStore
        + InstallationStore
        + GroupStore
        + ClusterInstallationStore
        + BackupStore
        + RestorationStore
        + MigrationStore
        + EventStore
        + WebhookStore
        + DnsRecordStore
{
}
