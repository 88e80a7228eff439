//! DB restoration supervisor: restores an installation's database from a
//! finished backup, then parks the installation in the operation's target
//! state.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use anchorage_common::{new_id, now_millis, resource_types};
use anchorage_model::{
    BackupState, Cluster, ClusterInstallation, InstallationBackup,
    InstallationDbRestorationOperation, InstallationState, RestorationState,
};
use anchorage_store::*;

use crate::error::is_backoff_limit_reached;
use crate::events::EventProducer;
use crate::metrics;
use crate::provisioner::ProvisionerRegistry;
use crate::scheduler::Doer;
use crate::webhooks::WebhookSender;

pub struct RestorationSupervisor {
    store: Arc<dyn Store>,
    provisioners: ProvisionerRegistry,
    events: Arc<EventProducer>,
    webhooks: Arc<WebhookSender>,
    instance_id: String,
}

#[async_trait]
impl Doer for RestorationSupervisor {
    async fn do_work(&self) -> Result<()> {
        let operations = self.store.get_unlocked_restorations_pending_work().await?;
        for op in operations {
            self.supervise(&op).await;
        }
        Ok(())
    }

    async fn shutdown(&self) {}
}

impl RestorationSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        provisioners: ProvisionerRegistry,
        events: Arc<EventProducer>,
        webhooks: Arc<WebhookSender>,
    ) -> Self {
        Self {
            store,
            provisioners,
            events,
            webhooks,
            instance_id: new_id(),
        }
    }

    pub async fn supervise(&self, op: &InstallationDbRestorationOperation) {
        match self.store.lock_restoration(&op.id, &self.instance_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::warn!(error = %err, restoration_id = %op.id, "failed to lock restoration");
                return;
            }
        }
        let result = self.supervise_locked(op).await;
        if let Err(err) = self
            .store
            .unlock_restoration(&op.id, &self.instance_id, false)
            .await
        {
            tracing::error!(error = %err, restoration_id = %op.id, "failed to unlock restoration");
        }
        if let Err(err) = result {
            tracing::error!(error = %err, restoration_id = %op.id, "restoration supervision failed");
        }
    }

    async fn supervise_locked(&self, observed: &InstallationDbRestorationOperation) -> Result<()> {
        let Some(mut op) = self.store.get_restoration(&observed.id).await? else {
            bail!("restoration {} vanished from the store", observed.id);
        };
        if op.state != observed.state {
            tracing::debug!(
                restoration_id = %op.id,
                observed = %observed.state,
                stored = %op.state,
                "restoration state changed underneath us; skipping"
            );
            return Ok(());
        }

        let old_state = op.state;
        let new_state = self.transition(&mut op).await;
        if new_state == old_state {
            return Ok(());
        }

        op.state = new_state;
        self.store.update_restoration(&op).await?;
        self.events
            .produce_restoration_state_change_event(&op, old_state)
            .await;
        metrics::record_transition(
            resource_types::INSTALLATION_DB_RESTORATION,
            old_state.as_str(),
            new_state.as_str(),
        );
        let payload = self.webhooks.payload(
            resource_types::INSTALLATION_DB_RESTORATION,
            &op.id,
            new_state.as_str(),
            old_state.as_str(),
        );
        self.webhooks.send_to_all_webhooks(&payload).await;
        tracing::info!(
            restoration_id = %op.id,
            old_state = %old_state,
            new_state = %new_state,
            "restoration transitioned"
        );
        Ok(())
    }

    async fn transition(
        &self,
        op: &mut InstallationDbRestorationOperation,
    ) -> RestorationState {
        match op.state {
            RestorationState::Requested => self.handle_requested(op).await,
            RestorationState::InProgress => self.handle_in_progress(op).await,
            RestorationState::Finalizing => self.handle_finalizing(op).await,
            RestorationState::Failing => self.handle_failing(op).await,
            RestorationState::DeletionRequested => self.handle_deletion(op).await,
            _ => {
                tracing::error!(
                    restoration_id = %op.id,
                    state = %op.state,
                    "unexpected restoration state; no transition"
                );
                op.state
            }
        }
    }

    async fn handle_requested(
        &self,
        op: &mut InstallationDbRestorationOperation,
    ) -> RestorationState {
        let installation = match self.store.get_installation(&op.installation_id).await {
            Ok(Some(installation)) => installation,
            Ok(None) => {
                tracing::error!(
                    restoration_id = %op.id,
                    installation_id = %op.installation_id,
                    "installation missing"
                );
                return RestorationState::Invalid;
            }
            Err(err) => {
                tracing::warn!(error = %err, restoration_id = %op.id, "failed to fetch installation");
                return op.state;
            }
        };
        let backup = match self.store.get_backup(&op.backup_id).await {
            Ok(Some(backup)) => backup,
            Ok(None) => {
                tracing::error!(restoration_id = %op.id, backup_id = %op.backup_id, "backup missing");
                return RestorationState::Invalid;
            }
            Err(err) => {
                tracing::warn!(error = %err, restoration_id = %op.id, "failed to fetch backup");
                return op.state;
            }
        };
        if backup.state != BackupState::BackupSucceeded {
            tracing::error!(
                restoration_id = %op.id,
                backup_id = %backup.id,
                backup_state = %backup.state,
                "backup is not restorable"
            );
            return RestorationState::Invalid;
        }

        // Hold the installation lock across the trigger so its state flip
        // and the job launch are one unit from the other supervisors' view.
        match self
            .store
            .lock_installation(&installation.id, &self.instance_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(restoration_id = %op.id, "installation locked elsewhere");
                return op.state;
            }
            Err(err) => {
                tracing::warn!(error = %err, restoration_id = %op.id, "failed to lock installation");
                return op.state;
            }
        }
        let result = self.trigger_restore(op, &installation, &backup).await;
        if let Err(err) = self
            .store
            .unlock_installation(&installation.id, &self.instance_id, false)
            .await
        {
            tracing::error!(error = %err, installation_id = %installation.id, "failed to unlock installation");
        }
        match result {
            Ok(()) => RestorationState::InProgress,
            Err(err) => {
                tracing::warn!(error = %err, restoration_id = %op.id, "failed to trigger restore");
                op.state
            }
        }
    }

    async fn trigger_restore(
        &self,
        op: &mut InstallationDbRestorationOperation,
        installation: &anchorage_model::Installation,
        backup: &InstallationBackup,
    ) -> Result<()> {
        let ci = self.claim_cluster_installation(op, backup).await?;
        let cluster = self
            .store
            .get_cluster(&ci.cluster_id)
            .await?
            .with_context(|| format!("cluster {} missing for binding {}", ci.cluster_id, ci.id))?;
        let provisioner = self.provisioners.for_cluster(&cluster)?;
        provisioner
            .trigger_restore(installation, backup, &ci, &cluster)
            .await?;
        op.cluster_installation_id = ci.id.clone();

        let mut updated = installation.clone();
        let old_state = updated.state;
        updated.state = InstallationState::DbRestorationInProgress;
        self.store.update_installation(&updated).await?;
        self.events
            .produce_installation_state_change_event(&updated, old_state)
            .await;
        Ok(())
    }

    /// Prefer the binding the backup ran on; fall back to any live binding.
    async fn claim_cluster_installation(
        &self,
        op: &InstallationDbRestorationOperation,
        backup: &InstallationBackup,
    ) -> Result<ClusterInstallation> {
        if !backup.cluster_installation_id.is_empty() {
            if let Some(ci) = self
                .store
                .get_cluster_installation(&backup.cluster_installation_id)
                .await?
                && !ci.is_deleted()
            {
                return Ok(ci);
            }
        }
        self.store
            .get_cluster_installations_for_installation(&op.installation_id)
            .await?
            .into_iter()
            .find(|ci| !ci.is_deleted())
            .with_context(|| {
                format!(
                    "installation {} has no live cluster installation",
                    op.installation_id
                )
            })
    }

    async fn handle_in_progress(
        &self,
        op: &mut InstallationDbRestorationOperation,
    ) -> RestorationState {
        let cluster = match self.backing_cluster(op).await {
            Ok(cluster) => cluster,
            Err(err) => {
                tracing::error!(error = %err, restoration_id = %op.id, "restoration lost its cluster");
                return RestorationState::Failing;
            }
        };
        let provisioner = match self.provisioners.for_cluster(&cluster) {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(error = %err, restoration_id = %op.id, "no provisioner");
                return op.state;
            }
        };
        match provisioner.check_restore_status(op, &cluster).await {
            Ok(0) => op.state,
            Ok(complete_at) => {
                op.complete_at = complete_at;
                RestorationState::Finalizing
            }
            Err(err) if is_backoff_limit_reached(&err) => {
                tracing::error!(restoration_id = %op.id, "restore job exhausted its retries");
                RestorationState::Failing
            }
            Err(err) => {
                tracing::warn!(error = %err, restoration_id = %op.id, "failed to check restore status");
                op.state
            }
        }
    }

    async fn handle_finalizing(
        &self,
        op: &mut InstallationDbRestorationOperation,
    ) -> RestorationState {
        match self
            .set_installation_state(op, op.target_installation_state)
            .await
        {
            Ok(()) => RestorationState::Succeeded,
            Err(err) => {
                tracing::warn!(error = %err, restoration_id = %op.id, "failed to finalize restoration");
                op.state
            }
        }
    }

    async fn handle_failing(
        &self,
        op: &mut InstallationDbRestorationOperation,
    ) -> RestorationState {
        match self
            .set_installation_state(op, InstallationState::DbRestorationFailed)
            .await
        {
            Ok(()) => RestorationState::Failed,
            Err(err) => {
                tracing::warn!(error = %err, restoration_id = %op.id, "failed to mark installation failed");
                op.state
            }
        }
    }

    async fn handle_deletion(
        &self,
        op: &mut InstallationDbRestorationOperation,
    ) -> RestorationState {
        // Best-effort job cleanup while the hosting cluster still exists.
        if let Ok(cluster) = self.backing_cluster(op).await
            && let Ok(provisioner) = self.provisioners.for_cluster(&cluster)
            && let Err(err) = provisioner.cleanup_restore_job(op, &cluster).await
        {
            tracing::warn!(error = %err, restoration_id = %op.id, "failed to clean up restore job");
            return op.state;
        }
        if let Err(err) = self.store.delete_restoration(&op.id).await {
            tracing::warn!(error = %err, restoration_id = %op.id, "failed to delete restoration row");
            return op.state;
        }
        op.delete_at = now_millis();
        RestorationState::Deleted
    }

    async fn set_installation_state(
        &self,
        op: &InstallationDbRestorationOperation,
        state: InstallationState,
    ) -> Result<()> {
        if !self
            .store
            .lock_installation(&op.installation_id, &self.instance_id)
            .await?
        {
            bail!("installation {} locked elsewhere", op.installation_id);
        }
        let result = async {
            let mut installation = self
                .store
                .get_installation(&op.installation_id)
                .await?
                .with_context(|| format!("installation {} missing", op.installation_id))?;
            let old_state = installation.state;
            installation.state = state;
            self.store.update_installation(&installation).await?;
            self.events
                .produce_installation_state_change_event(&installation, old_state)
                .await;
            Ok(())
        }
        .await;
        if let Err(err) = self
            .store
            .unlock_installation(&op.installation_id, &self.instance_id, false)
            .await
        {
            tracing::error!(error = %err, installation_id = %op.installation_id, "failed to unlock installation");
        }
        result
    }

    async fn backing_cluster(&self, op: &InstallationDbRestorationOperation) -> Result<Cluster> {
        if op.cluster_installation_id.is_empty() {
            bail!("restoration {} has no cluster installation", op.id);
        }
        let ci = self
            .store
            .get_cluster_installation(&op.cluster_installation_id)
            .await?
            .with_context(|| {
                format!(
                    "cluster installation {} missing for restoration {}",
                    op.cluster_installation_id, op.id
                )
            })?;
        self.store
            .get_cluster(&ci.cluster_id)
            .await?
            .with_context(|| format!("cluster {} missing for binding {}", ci.cluster_id, ci.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorage_model::{
        Affinity, ClusterInstallationState, ClusterState, DataResidence, DatabaseKind,
        FilestoreKind, Installation, InstallationSize, KopsMetadata, ProvisionerKind,
        ProvisionerMetadata,
    };
    use anchorage_store::InMemoryStore;

    use crate::dev::{DevProvisioner, JobStatus};

    struct Fixture {
        store: Arc<InMemoryStore>,
        supervisor: RestorationSupervisor,
        provisioner: Arc<DevProvisioner>,
    }

    fn fixture() -> Fixture {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let provisioner = Arc::new(DevProvisioner::new());
        let registry =
            ProvisionerRegistry::new().register(ProvisionerKind::Kops, provisioner.clone());
        let events = Arc::new(EventProducer::new(store.clone()));
        let webhooks = Arc::new(WebhookSender::new(store.clone(), "test".to_string()));
        let supervisor = RestorationSupervisor::new(store.clone(), registry, events, webhooks);
        Fixture {
            store,
            supervisor,
            provisioner,
        }
    }

    async fn seed(
        store: &InMemoryStore,
        state: RestorationState,
    ) -> InstallationDbRestorationOperation {
        store
            .create_cluster(&anchorage_model::Cluster {
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
                size: InstallationSize::Users100,
                affinity: Affinity::MultiTenant,
                database: DatabaseKind::MultiTenantRds,
                filestore: FilestoreKind::S3,
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
        store
            .create_backup(&InstallationBackup {
                id: "b1".to_string(),
                installation_id: "i1".to_string(),
                cluster_installation_id: "ci1".to_string(),
                data_residence: Some(DataResidence {
                    url: "s3://anchorage-backups/i1/b1".to_string(),
                    region: "us-east-1".to_string(),
                    bucket: "anchorage-backups".to_string(),
                    path_prefix: "i1".to_string(),
                    object_key: "b1".to_string(),
                }),
                state: BackupState::BackupSucceeded,
                start_at: now_millis(),
                create_at: now_millis(),
                delete_at: 0,
                lock_acquired_by: None,
                lock_acquired_at: 0,
            })
            .await
            .unwrap();
        let op = InstallationDbRestorationOperation {
            id: "r1".to_string(),
            installation_id: "i1".to_string(),
            backup_id: "b1".to_string(),
            cluster_installation_id: if state == RestorationState::Requested {
                String::new()
            } else {
                "ci1".to_string()
            },
            target_installation_state: InstallationState::Hibernating,
            complete_at: 0,
            state,
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        };
        store.create_restoration(&op).await.unwrap();
        op
    }

    async fn stored(store: &InMemoryStore) -> InstallationDbRestorationOperation {
        store.get_restoration("r1").await.unwrap().unwrap()
    }

    async fn installation_state(store: &InMemoryStore) -> InstallationState {
        store.get_installation("i1").await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn requested_restoration_triggers_and_parks_the_installation() {
        let f = fixture();
        let op = seed(&f.store, RestorationState::Requested).await;

        f.supervisor.supervise(&op).await;
        let stored = stored(&f.store).await;
        assert_eq!(stored.state, RestorationState::InProgress);
        assert_eq!(stored.cluster_installation_id, "ci1");
        assert_eq!(
            installation_state(&f.store).await,
            InstallationState::DbRestorationInProgress
        );
    }

    #[tokio::test]
    async fn unfinished_backup_invalidates_the_operation() {
        let f = fixture();
        let op = seed(&f.store, RestorationState::Requested).await;
        let mut backup = f.store.get_backup("b1").await.unwrap().unwrap();
        backup.state = BackupState::BackupInProgress;
        f.store.update_backup(&backup).await.unwrap();

        f.supervisor.supervise(&op).await;
        assert_eq!(stored(&f.store).await.state, RestorationState::Invalid);
    }

    #[tokio::test]
    async fn completion_timestamp_moves_to_finalizing_then_succeeds() {
        let f = fixture();
        *f.provisioner.state.restore_status.lock().unwrap() = JobStatus::Done(4321);
        let op = seed(&f.store, RestorationState::InProgress).await;

        f.supervisor.supervise(&op).await;
        let after_poll = stored(&f.store).await;
        assert_eq!(after_poll.state, RestorationState::Finalizing);
        assert_eq!(after_poll.complete_at, 4321);

        f.supervisor.supervise(&after_poll).await;
        assert_eq!(stored(&f.store).await.state, RestorationState::Succeeded);
        assert_eq!(
            installation_state(&f.store).await,
            InstallationState::Hibernating
        );
    }

    #[tokio::test]
    async fn backoff_limit_fails_installation_and_operation() {
        let f = fixture();
        *f.provisioner.state.restore_status.lock().unwrap() = JobStatus::BackoffLimitReached;
        let op = seed(&f.store, RestorationState::InProgress).await;

        f.supervisor.supervise(&op).await;
        assert_eq!(stored(&f.store).await.state, RestorationState::Failing);

        let op = stored(&f.store).await;
        f.supervisor.supervise(&op).await;
        assert_eq!(stored(&f.store).await.state, RestorationState::Failed);
        assert_eq!(
            installation_state(&f.store).await,
            InstallationState::DbRestorationFailed
        );
    }

    #[tokio::test]
    async fn deletion_tombstones_the_operation() {
        let f = fixture();
        let op = seed(&f.store, RestorationState::DeletionRequested).await;

        f.supervisor.supervise(&op).await;
        let stored = stored(&f.store).await;
        assert_eq!(stored.state, RestorationState::Deleted);
        assert!(stored.delete_at > 0);
    }
}
