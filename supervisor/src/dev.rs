//! In-memory provider stack. Backs `--store memory` local runs, where every
//! provisioner operation succeeds instantly, and doubles as the controllable
//! fake for unit tests (status knobs, call logs).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

use anchorage_common::now_millis;
use anchorage_model::{
    Cluster, ClusterInstallation, ClusterResources, DataResidence, Installation,
    InstallationBackup, InstallationDbMigrationOperation, InstallationDbRestorationOperation,
};

use crate::database::DatabaseProvider;
use crate::dns::DnsProvider;
use crate::error::JobBackoffLimitReached;
use crate::filestore::{FilestoreProvider, ObjectStoreClient};
use crate::provisioner::{ClusterInstallationProvisioner, ClusterProvisioner};

/// Outcome a fake job-status check reports.
#[derive(Debug, Clone, Copy)]
pub enum JobStatus {
    Running,
    Done(i64),
    BackoffLimitReached,
}

impl JobStatus {
    fn resolve(self) -> Result<i64> {
        match self {
            JobStatus::Running => Ok(0),
            JobStatus::Done(ts) => Ok(ts),
            JobStatus::BackoffLimitReached => Err(JobBackoffLimitReached.into()),
        }
    }
}

/// Shared knobs and call logs for the dev provisioner pair.
pub struct DevProvisionerState {
    /// Per-cluster resource snapshots; clusters not present fall back to
    /// `default_resources`.
    pub cluster_resources: Mutex<HashMap<String, ClusterResources>>,
    pub default_resources: Mutex<ClusterResources>,
    pub cluster_created: AtomicBool,
    pub nodegroups_created: AtomicBool,
    pub cluster_gone: AtomicBool,
    /// (ready, stable) reported for every workload.
    pub ready_and_stable: Mutex<(bool, bool)>,
    pub backup_status: Mutex<JobStatus>,
    pub restore_status: Mutex<JobStatus>,
    pub load_balancer_endpoint: Mutex<String>,
    pub exec_log: Mutex<Vec<Vec<String>>>,
    pub fail_exec: AtomicBool,
    /// Free-form log of lifecycle calls, e.g. `create-cluster:<id>`.
    pub calls: Mutex<Vec<String>>,
}

impl Default for DevProvisionerState {
    fn default() -> Self {
        Self {
            cluster_resources: Mutex::new(HashMap::new()),
            default_resources: Mutex::new(ClusterResources {
                total_cpu_millis: 128_000,
                used_cpu_millis: 0,
                total_memory_mib: 262_144,
                used_memory_mib: 0,
                total_pod_count: 500,
                used_pod_count: 0,
            }),
            cluster_created: AtomicBool::new(true),
            nodegroups_created: AtomicBool::new(true),
            cluster_gone: AtomicBool::new(true),
            ready_and_stable: Mutex::new((true, true)),
            backup_status: Mutex::new(JobStatus::Done(now_millis())),
            restore_status: Mutex::new(JobStatus::Done(now_millis())),
            load_balancer_endpoint: Mutex::new("lb.dev.anchorage.internal".to_string()),
            exec_log: Mutex::new(Vec::new()),
            fail_exec: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl DevProvisionerState {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn set_cluster_resources(&self, cluster_id: &str, resources: ClusterResources) {
        self.cluster_resources
            .lock()
            .unwrap()
            .insert(cluster_id.to_string(), resources);
    }
}

#[derive(Default)]
pub struct DevProvisioner {
    pub state: Arc<DevProvisionerState>,
}

impl DevProvisioner {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterProvisioner for DevProvisioner {
    async fn prepare_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.state.record(format!("prepare-cluster:{}", cluster.id));
        Ok(())
    }

    async fn create_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.state.record(format!("create-cluster:{}", cluster.id));
        Ok(())
    }

    async fn check_cluster_created(&self, _cluster: &Cluster) -> Result<bool> {
        Ok(self.state.cluster_created.load(Ordering::SeqCst))
    }

    async fn create_nodegroups(&self, cluster: &Cluster) -> Result<()> {
        self.state
            .record(format!("create-nodegroups:{}", cluster.id));
        Ok(())
    }

    async fn check_nodegroups_created(&self, _cluster: &Cluster) -> Result<bool> {
        Ok(self.state.nodegroups_created.load(Ordering::SeqCst))
    }

    async fn provision_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.state
            .record(format!("provision-cluster:{}", cluster.id));
        Ok(())
    }

    async fn upgrade_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.state.record(format!("upgrade-cluster:{}", cluster.id));
        Ok(())
    }

    async fn resize_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.state.record(format!("resize-cluster:{}", cluster.id));
        Ok(())
    }

    async fn delete_cluster(&self, cluster: &Cluster) -> Result<bool> {
        self.state.record(format!("delete-cluster:{}", cluster.id));
        Ok(self.state.cluster_gone.load(Ordering::SeqCst))
    }

    async fn refresh_cluster_metadata(&self, cluster: &mut Cluster) -> Result<()> {
        self.state
            .record(format!("refresh-metadata:{}", cluster.id));
        Ok(())
    }

    async fn get_cluster_resources(&self, cluster: &Cluster) -> Result<ClusterResources> {
        let overrides = self.state.cluster_resources.lock().unwrap();
        Ok(overrides
            .get(&cluster.id)
            .copied()
            .unwrap_or(*self.state.default_resources.lock().unwrap()))
    }

    async fn get_public_load_balancer_endpoint(&self, _cluster: &Cluster) -> Result<String> {
        Ok(self.state.load_balancer_endpoint.lock().unwrap().clone())
    }

    fn cluster_installation_provisioner(
        &self,
        _cr_version: &str,
    ) -> Arc<dyn ClusterInstallationProvisioner> {
        Arc::new(DevClusterInstallationProvisioner {
            state: self.state.clone(),
        })
    }

    async fn trigger_backup(
        &self,
        backup: &InstallationBackup,
        installation: &Installation,
        _cluster_installation: &ClusterInstallation,
        _cluster: &Cluster,
    ) -> Result<DataResidence> {
        self.state.record(format!("trigger-backup:{}", backup.id));
        Ok(DataResidence {
            url: format!("s3://anchorage-backups/{}/{}", installation.id, backup.id),
            region: "us-east-1".to_string(),
            bucket: "anchorage-backups".to_string(),
            path_prefix: installation.id.clone(),
            object_key: backup.id.clone(),
        })
    }

    async fn check_backup_status(
        &self,
        _backup: &InstallationBackup,
        _cluster: &Cluster,
    ) -> Result<i64> {
        self.state.backup_status.lock().unwrap().resolve()
    }

    async fn cleanup_backup_job(
        &self,
        backup: &InstallationBackup,
        _cluster: &Cluster,
    ) -> Result<()> {
        self.state
            .record(format!("cleanup-backup-job:{}", backup.id));
        Ok(())
    }

    async fn trigger_restore(
        &self,
        _installation: &Installation,
        backup: &InstallationBackup,
        _cluster_installation: &ClusterInstallation,
        _cluster: &Cluster,
    ) -> Result<()> {
        self.state.record(format!("trigger-restore:{}", backup.id));
        Ok(())
    }

    async fn check_restore_status(
        &self,
        _restoration: &InstallationDbRestorationOperation,
        _cluster: &Cluster,
    ) -> Result<i64> {
        self.state.restore_status.lock().unwrap().resolve()
    }

    async fn cleanup_restore_job(
        &self,
        restoration: &InstallationDbRestorationOperation,
        _cluster: &Cluster,
    ) -> Result<()> {
        self.state
            .record(format!("cleanup-restore-job:{}", restoration.id));
        Ok(())
    }

    async fn exec_cluster_installation_job(
        &self,
        _cluster: &Cluster,
        _cluster_installation: &ClusterInstallation,
        args: &[String],
    ) -> Result<()> {
        if self.state.fail_exec.load(Ordering::SeqCst) {
            bail!("exec failed");
        }
        self.state.exec_log.lock().unwrap().push(args.to_vec());
        Ok(())
    }
}

pub struct DevClusterInstallationProvisioner {
    state: Arc<DevProvisionerState>,
}

#[async_trait]
impl ClusterInstallationProvisioner for DevClusterInstallationProvisioner {
    async fn create_cluster_installation(
        &self,
        _cluster: &Cluster,
        _installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<()> {
        self.state
            .record(format!("create-ci:{}", cluster_installation.id));
        Ok(())
    }

    async fn ensure_cr_migrated(
        &self,
        _cluster: &Cluster,
        installation: &Installation,
    ) -> Result<bool> {
        self.state
            .record(format!("ensure-cr-migrated:{}", installation.id));
        Ok(false)
    }

    async fn update_cluster_installation(
        &self,
        _cluster: &Cluster,
        _installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<()> {
        self.state
            .record(format!("update-ci:{}", cluster_installation.id));
        Ok(())
    }

    async fn hibernate_cluster_installation(
        &self,
        _cluster: &Cluster,
        _installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<()> {
        self.state
            .record(format!("hibernate-ci:{}", cluster_installation.id));
        Ok(())
    }

    async fn delete_cluster_installation(
        &self,
        _cluster: &Cluster,
        cluster_installation: &ClusterInstallation,
    ) -> Result<()> {
        self.state
            .record(format!("delete-ci:{}", cluster_installation.id));
        Ok(())
    }

    async fn is_resource_ready_and_stable(
        &self,
        _cluster: &Cluster,
        _cluster_installation: &ClusterInstallation,
    ) -> Result<(bool, bool)> {
        Ok(*self.state.ready_and_stable.lock().unwrap())
    }

    async fn refresh_secrets(
        &self,
        _cluster: &Cluster,
        _installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<()> {
        self.state
            .record(format!("refresh-secrets:{}", cluster_installation.id));
        Ok(())
    }

    async fn prepare_cluster_utilities(
        &self,
        _cluster: &Cluster,
        installation: &Installation,
    ) -> Result<()> {
        self.state
            .record(format!("prepare-utilities:{}", installation.id));
        Ok(())
    }

    async fn delete_installation_volume_secrets(
        &self,
        _cluster: &Cluster,
        installation: &Installation,
        _cluster_installation: &ClusterInstallation,
    ) -> Result<()> {
        self.state
            .record(format!("delete-volume-secrets:{}", installation.id));
        Ok(())
    }
}

/// Database provider that records calls and always succeeds.
#[derive(Default)]
pub struct DevDatabase {
    pub calls: Mutex<Vec<String>>,
}

impl DevDatabase {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl DatabaseProvider for DevDatabase {
    async fn provision(&self, installation: &Installation) -> Result<()> {
        self.record(format!("provision:{}", installation.id));
        Ok(())
    }

    async fn teardown(&self, installation: &Installation, keep_data: bool) -> Result<()> {
        self.record(format!("teardown:{}:keep={keep_data}", installation.id));
        Ok(())
    }

    async fn refresh_metadata(&self, installation: &Installation) -> Result<()> {
        self.record(format!("refresh-metadata:{}", installation.id));
        Ok(())
    }

    async fn migrate_out(
        &self,
        installation: &Installation,
        operation: &InstallationDbMigrationOperation,
    ) -> Result<()> {
        self.record(format!("migrate-out:{}:{}", installation.id, operation.id));
        Ok(())
    }

    async fn migrate_to(
        &self,
        installation: &Installation,
        operation: &InstallationDbMigrationOperation,
    ) -> Result<()> {
        self.record(format!("migrate-to:{}:{}", installation.id, operation.id));
        Ok(())
    }

    async fn rollback(
        &self,
        installation: &Installation,
        operation: &InstallationDbMigrationOperation,
    ) -> Result<()> {
        self.record(format!("rollback:{}:{}", installation.id, operation.id));
        Ok(())
    }

    async fn teardown_migrated(
        &self,
        installation: &Installation,
        operation: &InstallationDbMigrationOperation,
    ) -> Result<()> {
        self.record(format!(
            "teardown-migrated:{}:{}",
            installation.id, operation.id
        ));
        Ok(())
    }
}

#[derive(Default)]
pub struct DevFilestore {
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl FilestoreProvider for DevFilestore {
    async fn provision(&self, installation: &Installation) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("provision:{}", installation.id));
        Ok(())
    }

    async fn teardown(&self, installation: &Installation, keep_data: bool) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("teardown:{}:keep={keep_data}", installation.id));
        Ok(())
    }
}

#[derive(Default)]
pub struct DevDns {
    pub created: Mutex<Vec<(String, String)>>,
    pub deleted: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl DnsProvider for DevDns {
    async fn create_dns_records(&self, names: &[String], endpoints: &[String]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("dns create failed"));
        }
        let mut created = self.created.lock().unwrap();
        for name in names {
            for endpoint in endpoints {
                created.push((name.clone(), endpoint.clone()));
            }
        }
        Ok(())
    }

    async fn delete_dns_records(&self, names: &[String]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("dns delete failed"));
        }
        self.deleted.lock().unwrap().extend(names.iter().cloned());
        Ok(())
    }
}

#[derive(Default)]
pub struct DevObjectStore {
    pub deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl ObjectStoreClient for DevObjectStore {
    async fn delete_object(&self, residence: &DataResidence) -> Result<()> {
        self.deleted.lock().unwrap().push(residence.url.clone());
        Ok(())
    }
}
