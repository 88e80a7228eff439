//! Cluster-installation supervisor: reconciles the materialization of a
//! tenant on a specific cluster.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;

use anchorage_common::{new_id, now_millis, resource_types};
use anchorage_model::{ClusterInstallation, ClusterInstallationState};
use anchorage_store::*;

use crate::events::EventProducer;
use crate::metrics;
use crate::provisioner::ProvisionerRegistry;
use crate::scheduler::Doer;

/// CR schema version assumed when the owning installation row is gone by
/// the time the binding is torn down.
const DEFAULT_CR_VERSION: &str = "v1beta1";

pub struct ClusterInstallationSupervisor {
    store: Arc<dyn Store>,
    provisioners: ProvisionerRegistry,
    events: Arc<EventProducer>,
    instance_id: String,
}

#[async_trait]
impl Doer for ClusterInstallationSupervisor {
    async fn do_work(&self) -> Result<()> {
        let cluster_installations = self
            .store
            .get_unlocked_cluster_installations_pending_work()
            .await?;
        for ci in cluster_installations {
            self.supervise(&ci).await;
        }
        Ok(())
    }

    async fn shutdown(&self) {}
}

impl ClusterInstallationSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        provisioners: ProvisionerRegistry,
        events: Arc<EventProducer>,
    ) -> Self {
        Self {
            store,
            provisioners,
            events,
            instance_id: new_id(),
        }
    }

    pub async fn supervise(&self, ci: &ClusterInstallation) {
        match self
            .store
            .lock_cluster_installation(&ci.id, &self.instance_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::warn!(error = %err, ci_id = %ci.id, "failed to lock cluster installation");
                return;
            }
        }
        let result = self.supervise_locked(ci).await;
        if let Err(err) = self
            .store
            .unlock_cluster_installation(&ci.id, &self.instance_id, false)
            .await
        {
            tracing::error!(error = %err, ci_id = %ci.id, "failed to unlock cluster installation");
        }
        if let Err(err) = result {
            tracing::error!(error = %err, ci_id = %ci.id, "cluster installation supervision failed");
        }
    }

    async fn supervise_locked(&self, observed: &ClusterInstallation) -> Result<()> {
        let Some(mut ci) = self.store.get_cluster_installation(&observed.id).await? else {
            bail!("cluster installation {} vanished from the store", observed.id);
        };
        if ci.state != observed.state {
            tracing::debug!(
                ci_id = %ci.id,
                observed = %observed.state,
                stored = %ci.state,
                "cluster installation state changed underneath us; skipping"
            );
            return Ok(());
        }

        let old_state = ci.state;
        let new_state = self.transition(&mut ci).await;
        if new_state == old_state {
            return Ok(());
        }

        ci.state = new_state;
        self.store.update_cluster_installation(&ci).await?;
        self.events
            .produce_cluster_installation_state_change_event(&ci, Some(old_state))
            .await;
        metrics::record_transition(
            resource_types::CLUSTER_INSTALLATION,
            old_state.as_str(),
            new_state.as_str(),
        );
        if matches!(
            new_state,
            ClusterInstallationState::Stable | ClusterInstallationState::Deleted
        ) {
            metrics::record_lifecycle_duration(
                self.store.as_ref(),
                resource_types::CLUSTER_INSTALLATION,
                &ci.id,
                &["creation-requested", "deletion-requested"],
                new_state.as_str(),
            )
            .await;
        }
        tracing::info!(
            ci_id = %ci.id,
            old_state = %old_state,
            new_state = %new_state,
            "cluster installation transitioned"
        );
        Ok(())
    }

    async fn transition(&self, ci: &mut ClusterInstallation) -> ClusterInstallationState {
        match ci.state {
            ClusterInstallationState::CreationRequested => self.handle_creation(ci).await,
            ClusterInstallationState::Reconciling | ClusterInstallationState::Ready => {
                self.handle_reconciling(ci).await
            }
            ClusterInstallationState::DeletionRequested => self.handle_deletion(ci).await,
            _ => {
                tracing::error!(
                    ci_id = %ci.id,
                    state = %ci.state,
                    "unexpected cluster installation state; no transition"
                );
                ci.state
            }
        }
    }

    async fn handle_creation(&self, ci: &mut ClusterInstallation) -> ClusterInstallationState {
        let cluster = match self.store.get_cluster(&ci.cluster_id).await {
            Ok(Some(cluster)) => cluster,
            Ok(None) => {
                tracing::error!(ci_id = %ci.id, cluster_id = %ci.cluster_id, "cluster missing");
                return ClusterInstallationState::CreationFailed;
            }
            Err(err) => {
                tracing::warn!(error = %err, ci_id = %ci.id, "failed to fetch cluster");
                return ci.state;
            }
        };
        let installation = match self.store.get_installation(&ci.installation_id).await {
            Ok(Some(installation)) => installation,
            Ok(None) => {
                tracing::error!(
                    ci_id = %ci.id,
                    installation_id = %ci.installation_id,
                    "installation missing"
                );
                return ClusterInstallationState::CreationFailed;
            }
            Err(err) => {
                tracing::warn!(error = %err, ci_id = %ci.id, "failed to fetch installation");
                return ci.state;
            }
        };
        let provisioner = match self.provisioners.for_cluster(&cluster) {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(error = %err, ci_id = %ci.id, "no provisioner");
                return ci.state;
            }
        };
        let cip = provisioner.cluster_installation_provisioner(&installation.cr_version);
        if let Err(err) = cip
            .create_cluster_installation(&cluster, &installation, ci)
            .await
        {
            tracing::warn!(error = %err, ci_id = %ci.id, "failed to create workload resources");
            return ci.state;
        }
        ClusterInstallationState::Reconciling
    }

    async fn handle_reconciling(&self, ci: &mut ClusterInstallation) -> ClusterInstallationState {
        let cluster = match self.store.get_cluster(&ci.cluster_id).await {
            Ok(Some(cluster)) => cluster,
            Ok(None) => {
                tracing::error!(ci_id = %ci.id, cluster_id = %ci.cluster_id, "cluster missing");
                return ClusterInstallationState::CreationFailed;
            }
            Err(err) => {
                tracing::warn!(error = %err, ci_id = %ci.id, "failed to fetch cluster");
                return ci.state;
            }
        };
        let cr_version = match self.store.get_installation(&ci.installation_id).await {
            Ok(Some(installation)) => installation.cr_version,
            _ => DEFAULT_CR_VERSION.to_string(),
        };
        let provisioner = match self.provisioners.for_cluster(&cluster) {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(error = %err, ci_id = %ci.id, "no provisioner");
                return ci.state;
            }
        };
        let cip = provisioner.cluster_installation_provisioner(&cr_version);
        match cip.is_resource_ready_and_stable(&cluster, ci).await {
            Ok((_, true)) => ClusterInstallationState::Stable,
            Ok((true, false)) => ClusterInstallationState::Ready,
            Ok((false, false)) => ClusterInstallationState::Reconciling,
            Err(err) => {
                tracing::warn!(error = %err, ci_id = %ci.id, "failed to check workload status");
                ci.state
            }
        }
    }

    async fn handle_deletion(&self, ci: &mut ClusterInstallation) -> ClusterInstallationState {
        // An in-flight backup pins its cluster installation; deleting the
        // binding underneath the job would orphan it.
        match self
            .store
            .get_active_backups_for_cluster_installation(&ci.id)
            .await
        {
            Ok(backups) if !backups.is_empty() => {
                tracing::warn!(
                    ci_id = %ci.id,
                    backups = backups.len(),
                    "refusing to delete cluster installation with active backups"
                );
                return ci.state;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, ci_id = %ci.id, "failed to check active backups");
                return ci.state;
            }
        }
        let cluster = match self.store.get_cluster(&ci.cluster_id).await {
            Ok(Some(cluster)) => cluster,
            Ok(None) => {
                tracing::error!(ci_id = %ci.id, cluster_id = %ci.cluster_id, "cluster missing");
                return ClusterInstallationState::DeletionFailed;
            }
            Err(err) => {
                tracing::warn!(error = %err, ci_id = %ci.id, "failed to fetch cluster");
                return ci.state;
            }
        };
        let cr_version = match self.store.get_installation(&ci.installation_id).await {
            Ok(Some(installation)) => installation.cr_version,
            _ => DEFAULT_CR_VERSION.to_string(),
        };
        let provisioner = match self.provisioners.for_cluster(&cluster) {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(error = %err, ci_id = %ci.id, "no provisioner");
                return ci.state;
            }
        };
        let cip = provisioner.cluster_installation_provisioner(&cr_version);
        if let Err(err) = cip.delete_cluster_installation(&cluster, ci).await {
            tracing::warn!(error = %err, ci_id = %ci.id, "failed to delete workload resources");
            return ci.state;
        }
        ci.is_active = false;
        ci.delete_at = now_millis();
        ClusterInstallationState::Deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorage_model::{
        Affinity, BackupState, Cluster, ClusterState, DatabaseKind, FilestoreKind, Installation,
        InstallationBackup, InstallationSize, InstallationState, KopsMetadata, ProvisionerKind,
        ProvisionerMetadata,
    };
    use anchorage_store::InMemoryStore;

    use crate::dev::DevProvisioner;

    fn fixture() -> (
        Arc<InMemoryStore>,
        ClusterInstallationSupervisor,
        Arc<DevProvisioner>,
    ) {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let provisioner = Arc::new(DevProvisioner::new());
        let registry =
            ProvisionerRegistry::new().register(ProvisionerKind::Kops, provisioner.clone());
        let events = Arc::new(EventProducer::new(store.clone()));
        let supervisor = ClusterInstallationSupervisor::new(store.clone(), registry, events);
        (store, supervisor, provisioner)
    }

    async fn seed(store: &InMemoryStore, state: ClusterInstallationState) -> ClusterInstallation {
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
                state: InstallationState::CreationInProgress,
                create_at: now_millis(),
                delete_at: 0,
                lock_acquired_by: None,
                lock_acquired_at: 0,
            })
            .await
            .unwrap();
        let ci = ClusterInstallation {
            id: "ci1".to_string(),
            cluster_id: "c1".to_string(),
            installation_id: "i1".to_string(),
            namespace: "i1".to_string(),
            is_active: true,
            state,
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        };
        store.create_cluster_installation(&ci).await.unwrap();
        ci
    }

    async fn stored_state(store: &InMemoryStore, id: &str) -> ClusterInstallationState {
        store
            .get_cluster_installation(id)
            .await
            .unwrap()
            .unwrap()
            .state
    }

    #[tokio::test]
    async fn creation_reconciles_then_stabilizes() {
        let (store, supervisor, _) = fixture();
        let ci = seed(&store, ClusterInstallationState::CreationRequested).await;

        supervisor.supervise(&ci).await;
        assert_eq!(
            stored_state(&store, "ci1").await,
            ClusterInstallationState::Reconciling
        );

        let ci = store.get_cluster_installation("ci1").await.unwrap().unwrap();
        supervisor.supervise(&ci).await;
        assert_eq!(
            stored_state(&store, "ci1").await,
            ClusterInstallationState::Stable
        );
    }

    #[tokio::test]
    async fn ready_binding_stays_pending_until_stable() {
        let (store, supervisor, provisioner) = fixture();
        *provisioner.state.ready_and_stable.lock().unwrap() = (true, false);
        let ci = seed(&store, ClusterInstallationState::Reconciling).await;

        supervisor.supervise(&ci).await;
        assert_eq!(
            stored_state(&store, "ci1").await,
            ClusterInstallationState::Ready
        );

        // Ready is still pending work: the next full pass picks the binding
        // up again and converges it once the workload settles.
        let pending = store
            .get_unlocked_cluster_installations_pending_work()
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "ci1");

        *provisioner.state.ready_and_stable.lock().unwrap() = (true, true);
        supervisor.do_work().await.unwrap();
        assert_eq!(
            stored_state(&store, "ci1").await,
            ClusterInstallationState::Stable
        );
    }

    #[tokio::test]
    async fn deletion_refused_while_backup_is_active() {
        let (store, supervisor, _) = fixture();
        let ci = seed(&store, ClusterInstallationState::DeletionRequested).await;
        store
            .create_backup(&InstallationBackup {
                id: "b1".to_string(),
                installation_id: "i1".to_string(),
                cluster_installation_id: "ci1".to_string(),
                data_residence: None,
                state: BackupState::BackupInProgress,
                start_at: 0,
                create_at: now_millis(),
                delete_at: 0,
                lock_acquired_by: None,
                lock_acquired_at: 0,
            })
            .await
            .unwrap();

        supervisor.supervise(&ci).await;
        assert_eq!(
            stored_state(&store, "ci1").await,
            ClusterInstallationState::DeletionRequested
        );
    }

    #[tokio::test]
    async fn deletion_marks_the_binding_deleted() {
        let (store, supervisor, _) = fixture();
        let ci = seed(&store, ClusterInstallationState::DeletionRequested).await;

        supervisor.supervise(&ci).await;
        let stored = store.get_cluster_installation("ci1").await.unwrap().unwrap();
        assert_eq!(stored.state, ClusterInstallationState::Deleted);
        assert!(stored.delete_at > 0);
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn deletion_with_missing_cluster_fails_terminally() {
        let (store, supervisor, _) = fixture();
        let mut ci = seed(&store, ClusterInstallationState::DeletionRequested).await;
        ci.cluster_id = "gone".to_string();
        store.update_cluster_installation(&ci).await.unwrap();

        supervisor.supervise(&ci).await;
        assert_eq!(
            stored_state(&store, "ci1").await,
            ClusterInstallationState::DeletionFailed
        );
    }
}
