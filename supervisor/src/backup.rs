//! Backup supervisor: triggers tenant data backup jobs and tracks them to
//! completion or deletion.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use anchorage_common::{new_id, now_millis, resource_types};
use anchorage_model::{
    BackupState, ClusterInstallation, FilestoreKind, Installation, InstallationBackup,
    InstallationState,
};
use anchorage_store::*;

use crate::error::is_backoff_limit_reached;
use crate::events::EventProducer;
use crate::filestore::ObjectStoreClient;
use crate::metrics;
use crate::provisioner::ProvisionerRegistry;
use crate::scheduler::Doer;
use crate::webhooks::WebhookSender;

pub struct BackupSupervisor {
    store: Arc<dyn Store>,
    provisioners: ProvisionerRegistry,
    events: Arc<EventProducer>,
    webhooks: Arc<WebhookSender>,
    object_store: Arc<dyn ObjectStoreClient>,
    instance_id: String,
}

#[async_trait]
impl Doer for BackupSupervisor {
    async fn do_work(&self) -> Result<()> {
        let backups = self.store.get_unlocked_backups_pending_work().await?;
        for backup in backups {
            self.supervise(&backup).await;
        }
        Ok(())
    }

    async fn shutdown(&self) {}
}

impl BackupSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        provisioners: ProvisionerRegistry,
        events: Arc<EventProducer>,
        webhooks: Arc<WebhookSender>,
        object_store: Arc<dyn ObjectStoreClient>,
    ) -> Self {
        Self {
            store,
            provisioners,
            events,
            webhooks,
            object_store,
            instance_id: new_id(),
        }
    }

    pub async fn supervise(&self, backup: &InstallationBackup) {
        match self.store.lock_backup(&backup.id, &self.instance_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::warn!(error = %err, backup_id = %backup.id, "failed to lock backup");
                return;
            }
        }
        let result = self.supervise_locked(backup).await;
        if let Err(err) = self
            .store
            .unlock_backup(&backup.id, &self.instance_id, false)
            .await
        {
            tracing::error!(error = %err, backup_id = %backup.id, "failed to unlock backup");
        }
        if let Err(err) = result {
            tracing::error!(error = %err, backup_id = %backup.id, "backup supervision failed");
        }
    }

    async fn supervise_locked(&self, observed: &InstallationBackup) -> Result<()> {
        let Some(mut backup) = self.store.get_backup(&observed.id).await? else {
            bail!("backup {} vanished from the store", observed.id);
        };
        if backup.state != observed.state {
            tracing::debug!(
                backup_id = %backup.id,
                observed = %observed.state,
                stored = %backup.state,
                "backup state changed underneath us; skipping"
            );
            return Ok(());
        }

        let old_state = backup.state;
        let new_state = self.transition(&mut backup).await;
        if new_state == old_state {
            return Ok(());
        }

        backup.state = new_state;
        self.store.update_backup(&backup).await?;
        self.events
            .produce_backup_state_change_event(&backup, old_state)
            .await;
        metrics::record_transition(
            resource_types::INSTALLATION_BACKUP,
            old_state.as_str(),
            new_state.as_str(),
        );
        let payload = self.webhooks.payload(
            resource_types::INSTALLATION_BACKUP,
            &backup.id,
            new_state.as_str(),
            old_state.as_str(),
        );
        self.webhooks.send_to_all_webhooks(&payload).await;
        tracing::info!(
            backup_id = %backup.id,
            old_state = %old_state,
            new_state = %new_state,
            "backup transitioned"
        );
        Ok(())
    }

    async fn transition(&self, backup: &mut InstallationBackup) -> BackupState {
        match backup.state {
            BackupState::BackupRequested => self.handle_requested(backup).await,
            BackupState::BackupInProgress => self.handle_in_progress(backup).await,
            BackupState::DeletionRequested => self.handle_deletion(backup).await,
            _ => {
                tracing::error!(
                    backup_id = %backup.id,
                    state = %backup.state,
                    "unexpected backup state; no transition"
                );
                backup.state
            }
        }
    }

    async fn handle_requested(&self, backup: &mut InstallationBackup) -> BackupState {
        let installation = match self.store.get_installation(&backup.installation_id).await {
            Ok(Some(installation)) => installation,
            Ok(None) => {
                tracing::error!(
                    backup_id = %backup.id,
                    installation_id = %backup.installation_id,
                    "installation missing"
                );
                return BackupState::BackupFailed;
            }
            Err(err) => {
                tracing::warn!(error = %err, backup_id = %backup.id, "failed to fetch installation");
                return backup.state;
            }
        };
        if let Err(err) = ensure_installation_ready_for_backup(&installation) {
            tracing::warn!(error = %err, backup_id = %backup.id, "installation not backup-eligible");
            return backup.state;
        }
        let ci = match self.claimable_cluster_installation(&installation).await {
            Ok(Some(ci)) => ci,
            Ok(None) => {
                tracing::warn!(backup_id = %backup.id, "no cluster installation to run the backup on");
                return backup.state;
            }
            Err(err) => {
                tracing::warn!(error = %err, backup_id = %backup.id, "failed to pick cluster installation");
                return backup.state;
            }
        };

        // Claim the binding for the duration of the trigger so it cannot be
        // deleted or hibernated underneath the job launch.
        match self
            .store
            .lock_cluster_installation(&ci.id, &self.instance_id)
            .await
        {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                tracing::debug!(backup_id = %backup.id, ci_id = %ci.id, "binding locked elsewhere");
                return backup.state;
            }
        }
        let result = self.trigger_backup(backup, &installation, &ci).await;
        if let Err(err) = self
            .store
            .unlock_cluster_installation(&ci.id, &self.instance_id, false)
            .await
        {
            tracing::error!(error = %err, ci_id = %ci.id, "failed to unlock cluster installation");
        }
        match result {
            Ok(()) => BackupState::BackupInProgress,
            Err(err) => {
                tracing::warn!(error = %err, backup_id = %backup.id, "failed to trigger backup");
                backup.state
            }
        }
    }

    async fn trigger_backup(
        &self,
        backup: &mut InstallationBackup,
        installation: &Installation,
        ci: &ClusterInstallation,
    ) -> Result<()> {
        let cluster = self
            .store
            .get_cluster(&ci.cluster_id)
            .await?
            .with_context(|| format!("cluster {} missing for binding {}", ci.cluster_id, ci.id))?;
        let provisioner = self.provisioners.for_cluster(&cluster)?;
        let residence = provisioner
            .trigger_backup(backup, installation, ci, &cluster)
            .await?;
        backup.data_residence = Some(residence);
        backup.cluster_installation_id = ci.id.clone();
        Ok(())
    }

    async fn claimable_cluster_installation(
        &self,
        installation: &Installation,
    ) -> Result<Option<ClusterInstallation>> {
        Ok(self
            .store
            .get_cluster_installations_for_installation(&installation.id)
            .await?
            .into_iter()
            .find(|ci| !ci.is_deleted()))
    }

    async fn handle_in_progress(&self, backup: &mut InstallationBackup) -> BackupState {
        let cluster = match self.backing_cluster(backup).await {
            Ok(cluster) => cluster,
            Err(err) => {
                tracing::error!(error = %err, backup_id = %backup.id, "backup lost its cluster");
                return BackupState::BackupFailed;
            }
        };
        let provisioner = match self.provisioners.for_cluster(&cluster) {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(error = %err, backup_id = %backup.id, "no provisioner");
                return backup.state;
            }
        };
        match provisioner.check_backup_status(backup, &cluster).await {
            Ok(0) => backup.state,
            Ok(start_at) => {
                backup.start_at = start_at;
                BackupState::BackupSucceeded
            }
            Err(err) if is_backoff_limit_reached(&err) => {
                tracing::error!(backup_id = %backup.id, "backup job exhausted its retries");
                BackupState::BackupFailed
            }
            Err(err) => {
                tracing::warn!(error = %err, backup_id = %backup.id, "failed to check backup status");
                backup.state
            }
        }
    }

    async fn handle_deletion(&self, backup: &mut InstallationBackup) -> BackupState {
        // Best-effort job cleanup while the hosting cluster still exists.
        match self.backing_cluster(backup).await {
            Ok(cluster) => {
                let provisioner = match self.provisioners.for_cluster(&cluster) {
                    Ok(p) => p,
                    Err(err) => {
                        tracing::error!(error = %err, backup_id = %backup.id, "no provisioner");
                        return backup.state;
                    }
                };
                if let Err(err) = provisioner.cleanup_backup_job(backup, &cluster).await {
                    tracing::warn!(error = %err, backup_id = %backup.id, "failed to clean up backup job");
                    return backup.state;
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, backup_id = %backup.id, "skipping job cleanup");
            }
        }

        if let Some(residence) = &backup.data_residence {
            // Only object-store-backed artifacts are deletable through the
            // control plane.
            if !residence.is_object_store() {
                tracing::error!(
                    backup_id = %backup.id,
                    url = %residence.url,
                    "backup residence is not an object store; cannot delete"
                );
                return BackupState::DeletionFailed;
            }
            if let Err(err) = self.object_store.delete_object(residence).await {
                tracing::warn!(error = %err, backup_id = %backup.id, "failed to delete backup artifacts");
                return backup.state;
            }
        }
        if let Err(err) = self.store.delete_backup(&backup.id).await {
            tracing::warn!(error = %err, backup_id = %backup.id, "failed to delete backup row");
            return backup.state;
        }
        backup.delete_at = now_millis();
        BackupState::Deleted
    }

    async fn backing_cluster(
        &self,
        backup: &InstallationBackup,
    ) -> Result<anchorage_model::Cluster> {
        if backup.cluster_installation_id.is_empty() {
            bail!("backup {} has no cluster installation", backup.id);
        }
        let ci = self
            .store
            .get_cluster_installation(&backup.cluster_installation_id)
            .await?
            .with_context(|| {
                format!(
                    "cluster installation {} missing for backup {}",
                    backup.cluster_installation_id, backup.id
                )
            })?;
        self.store
            .get_cluster(&ci.cluster_id)
            .await?
            .with_context(|| format!("cluster {} missing for binding {}", ci.cluster_id, ci.id))
    }
}

/// Backups run inside the workload, so the installation must be settled and
/// its filestore must live in an object store the job can stream to.
fn ensure_installation_ready_for_backup(installation: &Installation) -> Result<()> {
    if !matches!(
        installation.state,
        InstallationState::Stable | InstallationState::Hibernating
    ) {
        bail!(
            "installation {} is {}, not stable or hibernating",
            installation.id,
            installation.state
        );
    }
    if !matches!(
        installation.filestore,
        FilestoreKind::S3 | FilestoreKind::MultiTenantS3
    ) {
        bail!(
            "installation {} filestore {} does not support backups",
            installation.id,
            installation.filestore
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorage_model::{
        Affinity, Cluster, ClusterInstallationState, ClusterState, DataResidence, DatabaseKind,
        KopsMetadata, ProvisionerKind, ProvisionerMetadata,
    };
    use anchorage_store::InMemoryStore;

    use crate::dev::{DevObjectStore, DevProvisioner, JobStatus};

    struct Fixture {
        store: Arc<InMemoryStore>,
        supervisor: BackupSupervisor,
        provisioner: Arc<DevProvisioner>,
        object_store: Arc<DevObjectStore>,
    }

    fn fixture() -> Fixture {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let provisioner = Arc::new(DevProvisioner::new());
        let registry =
            ProvisionerRegistry::new().register(ProvisionerKind::Kops, provisioner.clone());
        let events = Arc::new(EventProducer::new(store.clone()));
        let webhooks = Arc::new(WebhookSender::new(store.clone(), "test".to_string()));
        let object_store = Arc::new(DevObjectStore::default());
        let supervisor = BackupSupervisor::new(
            store.clone(),
            registry,
            events,
            webhooks,
            object_store.clone(),
        );
        Fixture {
            store,
            supervisor,
            provisioner,
            object_store,
        }
    }

    async fn seed(store: &InMemoryStore, state: BackupState) -> InstallationBackup {
        store
            .create_cluster(&Cluster {
                id: "c1".to_string(),
                state: ClusterState::Stable,
                provisioner: ProvisionerKind::Kops,
                provisioner_metadata: ProvisionerMetadata::Kops(KopsMetadata::default()),
                allow_installations: true,
                annotations: vec![],
                has_aws_infrastructure: true,
                create_at: now_millis(),
                delete_at: 0,
                lock_acquired_by: None,
                lock_acquired_at: 0,
            })
            .await
            .unwrap();
        store
            .create_installation(&Installation {
                id: "i1".to_string(),
                owner_id: "owner".to_string(),
                version: "9.5.0".to_string(),
                cr_version: "v1beta1".to_string(),
                size: anchorage_model::InstallationSize::Users100,
                affinity: Affinity::MultiTenant,
                database: DatabaseKind::MultiTenantRds,
                filestore: anchorage_model::FilestoreKind::S3,
                group_id: None,
                group_sequence: None,
                annotations: vec![],
                requires_aws_infrastructure: false,
                keep_database_data: false,
                keep_filestore_data: false,
                volumes: None,
                state: InstallationState::Hibernating,
                create_at: now_millis(),
                delete_at: 0,
                lock_acquired_by: None,
                lock_acquired_at: 0,
            })
            .await
            .unwrap();
        store
            .create_cluster_installation(&ClusterInstallation {
                id: "ci1".to_string(),
                cluster_id: "c1".to_string(),
                installation_id: "i1".to_string(),
                namespace: "i1".to_string(),
                is_active: true,
                state: ClusterInstallationState::Stable,
                create_at: now_millis(),
                delete_at: 0,
                lock_acquired_by: None,
                lock_acquired_at: 0,
            })
            .await
            .unwrap();
        let ci_id = if state == BackupState::BackupRequested {
            String::new()
        } else {
            "ci1".to_string()
        };
        let residence = if state == BackupState::BackupRequested {
            None
        } else {
            Some(DataResidence {
                url: "s3://anchorage-backups/i1/b1".to_string(),
                region: "us-east-1".to_string(),
                bucket: "anchorage-backups".to_string(),
                path_prefix: "i1".to_string(),
                object_key: "b1".to_string(),
            })
        };
        let backup = InstallationBackup {
            id: "b1".to_string(),
            installation_id: "i1".to_string(),
            cluster_installation_id: ci_id,
            data_residence: residence,
            state,
            start_at: 0,
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        };
        store.create_backup(&backup).await.unwrap();
        backup
    }

    async fn stored(store: &InMemoryStore) -> InstallationBackup {
        store.get_backup("b1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn requested_backup_is_triggered_and_claims_a_binding() {
        let f = fixture();
        let backup = seed(&f.store, BackupState::BackupRequested).await;

        f.supervisor.supervise(&backup).await;
        let stored = stored(&f.store).await;
        assert_eq!(stored.state, BackupState::BackupInProgress);
        assert_eq!(stored.cluster_installation_id, "ci1");
        let residence = stored.data_residence.expect("residence recorded");
        assert!(residence.is_object_store());
        // The claimed binding was released after the trigger.
        let ci = f
            .store
            .get_cluster_installation("ci1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ci.lock_acquired_at, 0);
    }

    #[tokio::test]
    async fn backup_of_busy_installation_waits() {
        let f = fixture();
        let backup = seed(&f.store, BackupState::BackupRequested).await;
        let mut installation = f.store.get_installation("i1").await.unwrap().unwrap();
        installation.state = InstallationState::UpdateInProgress;
        f.store.update_installation(&installation).await.unwrap();

        f.supervisor.supervise(&backup).await;
        assert_eq!(stored(&f.store).await.state, BackupState::BackupRequested);
    }

    #[tokio::test]
    async fn finished_job_records_start_timestamp() {
        let f = fixture();
        *f.provisioner.state.backup_status.lock().unwrap() = JobStatus::Done(1234);
        let backup = seed(&f.store, BackupState::BackupInProgress).await;

        f.supervisor.supervise(&backup).await;
        let stored = stored(&f.store).await;
        assert_eq!(stored.state, BackupState::BackupSucceeded);
        assert_eq!(stored.start_at, 1234);
    }

    #[tokio::test]
    async fn running_job_stays_in_progress() {
        let f = fixture();
        *f.provisioner.state.backup_status.lock().unwrap() = JobStatus::Running;
        let backup = seed(&f.store, BackupState::BackupInProgress).await;

        f.supervisor.supervise(&backup).await;
        assert_eq!(stored(&f.store).await.state, BackupState::BackupInProgress);
    }

    #[tokio::test]
    async fn backoff_limit_fails_the_backup() {
        let f = fixture();
        *f.provisioner.state.backup_status.lock().unwrap() = JobStatus::BackoffLimitReached;
        let backup = seed(&f.store, BackupState::BackupInProgress).await;

        f.supervisor.supervise(&backup).await;
        assert_eq!(stored(&f.store).await.state, BackupState::BackupFailed);
    }

    #[tokio::test]
    async fn deletion_removes_the_object_and_the_row() {
        let f = fixture();
        let backup = seed(&f.store, BackupState::DeletionRequested).await;

        f.supervisor.supervise(&backup).await;
        let stored = stored(&f.store).await;
        assert_eq!(stored.state, BackupState::Deleted);
        assert!(stored.delete_at > 0);
        assert_eq!(
            f.object_store.deleted.lock().unwrap().as_slice(),
            &["s3://anchorage-backups/i1/b1".to_string()]
        );
    }

    #[tokio::test]
    async fn non_object_store_residence_cannot_be_deleted() {
        let f = fixture();
        let mut backup = seed(&f.store, BackupState::DeletionRequested).await;
        backup.data_residence = Some(DataResidence {
            url: "file:///var/backups/b1".to_string(),
            region: String::new(),
            bucket: String::new(),
            path_prefix: String::new(),
            object_key: String::new(),
        });
        f.store.update_backup(&backup).await.unwrap();

        f.supervisor.supervise(&backup).await;
        assert_eq!(stored(&f.store).await.state, BackupState::DeletionFailed);
        assert!(f.object_store.deleted.lock().unwrap().is_empty());
    }
}
