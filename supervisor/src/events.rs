//! State-change event production. Events are best-effort: a failed write is
//! logged and never blocks the transition that produced it.

use std::sync::Arc;

use anchorage_common::{new_id, now_millis, resource_types};
use anchorage_model::{
    BackupState, Cluster, ClusterInstallation, ClusterInstallationState, ClusterState,
    Installation, InstallationBackup, InstallationDbMigrationOperation,
    InstallationDbRestorationOperation, InstallationState, MigrationState, RestorationState,
    StateChangeEvent,
};
use anchorage_store::*;

pub struct EventProducer {
    store: Arc<dyn Store>,
}

impl EventProducer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn produce_cluster_state_change_event(
        &self,
        cluster: &Cluster,
        old_state: ClusterState,
    ) {
        self.produce(
            resource_types::CLUSTER,
            &cluster.id,
            old_state.as_str(),
            cluster.state.as_str(),
        )
        .await;
    }

    pub async fn produce_installation_state_change_event(
        &self,
        installation: &Installation,
        old_state: InstallationState,
    ) {
        self.produce(
            resource_types::INSTALLATION,
            &installation.id,
            old_state.as_str(),
            installation.state.as_str(),
        )
        .await;
    }

    pub async fn produce_cluster_installation_state_change_event(
        &self,
        cluster_installation: &ClusterInstallation,
        old_state: Option<ClusterInstallationState>,
    ) {
        self.produce(
            resource_types::CLUSTER_INSTALLATION,
            &cluster_installation.id,
            old_state.map(|s| s.as_str()).unwrap_or("n/a"),
            cluster_installation.state.as_str(),
        )
        .await;
    }

    pub async fn produce_backup_state_change_event(
        &self,
        backup: &InstallationBackup,
        old_state: BackupState,
    ) {
        self.produce(
            resource_types::INSTALLATION_BACKUP,
            &backup.id,
            old_state.as_str(),
            backup.state.as_str(),
        )
        .await;
    }

    pub async fn produce_restoration_state_change_event(
        &self,
        restoration: &InstallationDbRestorationOperation,
        old_state: RestorationState,
    ) {
        self.produce(
            resource_types::INSTALLATION_DB_RESTORATION,
            &restoration.id,
            old_state.as_str(),
            restoration.state.as_str(),
        )
        .await;
    }

    pub async fn produce_migration_state_change_event(
        &self,
        migration: &InstallationDbMigrationOperation,
        old_state: MigrationState,
    ) {
        self.produce(
            resource_types::INSTALLATION_DB_MIGRATION,
            &migration.id,
            old_state.as_str(),
            migration.state.as_str(),
        )
        .await;
    }

    async fn produce(&self, resource_type: &str, resource_id: &str, old: &str, new: &str) {
        let event = StateChangeEvent {
            id: new_id(),
            resource_id: resource_id.to_string(),
            resource_type: resource_type.to_string(),
            old_state: old.to_string(),
            new_state: new.to_string(),
            timestamp: now_millis(),
        };
        if let Err(err) = self.store.create_state_change_event(&event).await {
            tracing::warn!(
                error = %err,
                resource_type,
                resource_id,
                "failed to record state change event"
            );
        }
    }
}
