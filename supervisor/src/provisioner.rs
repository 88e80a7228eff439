//! Interfaces to the machinery that talks to the actual compute substrate.
//! The supervisors only ever see these traits; concrete drivers live
//! elsewhere and are registered per provisioner tag at startup.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use anchorage_model::{
    Cluster, ClusterInstallation, ClusterResources, DataResidence, Installation,
    InstallationBackup, InstallationDbRestorationOperation, ProvisionerKind,
};

/// Cluster lifecycle plus the in-cluster job machinery (backups, restores,
/// arbitrary exec). One implementation per [`ProvisionerKind`].
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    async fn prepare_cluster(&self, cluster: &Cluster) -> Result<()>;
    async fn create_cluster(&self, cluster: &Cluster) -> Result<()>;
    async fn check_cluster_created(&self, cluster: &Cluster) -> Result<bool>;
    async fn create_nodegroups(&self, cluster: &Cluster) -> Result<()>;
    async fn check_nodegroups_created(&self, cluster: &Cluster) -> Result<bool>;
    async fn provision_cluster(&self, cluster: &Cluster) -> Result<()>;
    async fn upgrade_cluster(&self, cluster: &Cluster) -> Result<()>;
    async fn resize_cluster(&self, cluster: &Cluster) -> Result<()>;
    /// Returns true once the cluster is fully gone.
    async fn delete_cluster(&self, cluster: &Cluster) -> Result<bool>;
    /// Refreshes the provisioner-side metadata stored on the cluster row
    /// (node counts, versions) after a mutating operation.
    async fn refresh_cluster_metadata(&self, cluster: &mut Cluster) -> Result<()>;
    async fn get_cluster_resources(&self, cluster: &Cluster) -> Result<ClusterResources>;
    async fn get_public_load_balancer_endpoint(&self, cluster: &Cluster) -> Result<String>;

    /// The adapter reconciling tenant workloads at the given custom-resource
    /// schema version.
    fn cluster_installation_provisioner(
        &self,
        cr_version: &str,
    ) -> Arc<dyn ClusterInstallationProvisioner>;

    async fn trigger_backup(
        &self,
        backup: &InstallationBackup,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
        cluster: &Cluster,
    ) -> Result<DataResidence>;
    /// A positive value is the backup's start timestamp (done); zero means
    /// the job is still running. Exhausted retries surface as
    /// [`crate::error::JobBackoffLimitReached`].
    async fn check_backup_status(
        &self,
        backup: &InstallationBackup,
        cluster: &Cluster,
    ) -> Result<i64>;
    async fn cleanup_backup_job(
        &self,
        backup: &InstallationBackup,
        cluster: &Cluster,
    ) -> Result<()>;

    async fn trigger_restore(
        &self,
        installation: &Installation,
        backup: &InstallationBackup,
        cluster_installation: &ClusterInstallation,
        cluster: &Cluster,
    ) -> Result<()>;
    /// Same contract as `check_backup_status`: completion timestamp, zero,
    /// or the backoff sentinel.
    async fn check_restore_status(
        &self,
        restoration: &InstallationDbRestorationOperation,
        cluster: &Cluster,
    ) -> Result<i64>;
    async fn cleanup_restore_job(
        &self,
        restoration: &InstallationDbRestorationOperation,
        cluster: &Cluster,
    ) -> Result<()>;

    /// Run a one-off command inside the workload's namespace.
    async fn exec_cluster_installation_job(
        &self,
        cluster: &Cluster,
        cluster_installation: &ClusterInstallation,
        args: &[String],
    ) -> Result<()>;
}

/// Reconciles the tenant workload custom resource inside a cluster. Selected
/// per CR schema version via
/// [`ClusterProvisioner::cluster_installation_provisioner`].
#[async_trait]
pub trait ClusterInstallationProvisioner: Send + Sync {
    async fn create_cluster_installation(
        &self,
        cluster: &Cluster,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<()>;
    /// Ensures the CR has been migrated to this adapter's schema version.
    /// Returns true when a migration was performed.
    async fn ensure_cr_migrated(
        &self,
        cluster: &Cluster,
        installation: &Installation,
    ) -> Result<bool>;
    async fn update_cluster_installation(
        &self,
        cluster: &Cluster,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<()>;
    async fn hibernate_cluster_installation(
        &self,
        cluster: &Cluster,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<()>;
    async fn delete_cluster_installation(
        &self,
        cluster: &Cluster,
        cluster_installation: &ClusterInstallation,
    ) -> Result<()>;
    /// (ready, stable): ready means serving, stable means fully converged.
    async fn is_resource_ready_and_stable(
        &self,
        cluster: &Cluster,
        cluster_installation: &ClusterInstallation,
    ) -> Result<(bool, bool)>;
    async fn refresh_secrets(
        &self,
        cluster: &Cluster,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<()>;
    async fn prepare_cluster_utilities(
        &self,
        cluster: &Cluster,
        installation: &Installation,
    ) -> Result<()>;
    async fn delete_installation_volume_secrets(
        &self,
        cluster: &Cluster,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<()>;
}

/// Registry of cluster provisioners keyed by tag.
#[derive(Clone, Default)]
pub struct ProvisionerRegistry {
    provisioners: HashMap<ProvisionerKind, Arc<dyn ClusterProvisioner>>,
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        kind: ProvisionerKind,
        provisioner: Arc<dyn ClusterProvisioner>,
    ) -> Self {
        self.provisioners.insert(kind, provisioner);
        self
    }

    pub fn get(&self, kind: ProvisionerKind) -> Result<Arc<dyn ClusterProvisioner>> {
        self.provisioners
            .get(&kind)
            .cloned()
            .ok_or_else(|| anyhow!("no provisioner registered for {kind}"))
    }

    /// Convenience for the common lookup-by-cluster case.
    pub fn for_cluster(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterProvisioner>> {
        self.get(cluster.provisioner)
    }
}
