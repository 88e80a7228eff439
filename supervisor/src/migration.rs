//! DB migration supervisor: moves an installation's database between
//! backends through a backup → switch → restore → reconfigure pipeline,
//! with rollback and artifact teardown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use anchorage_common::{new_id, now_millis, resource_types};
use anchorage_model::{
    BackupState, Cluster, ClusterInstallation, Installation, InstallationBackup,
    InstallationDbMigrationOperation, InstallationDbRestorationOperation, InstallationState,
    MigrationState, RestorationState,
};
use anchorage_store::*;

use crate::database::DatabaseRegistry;
use crate::events::EventProducer;
use crate::metrics;
use crate::provisioner::ProvisionerRegistry;
use crate::scheduler::Doer;
use crate::webhooks::WebhookSender;

/// Servers older than this rewrite their datasource with a single in-pod
/// config command; newer ones need the boot-ping-configure-stop dance.
const LEGACY_CONFIG_EXEC_PREFIX: &str = "5.";

const CONFIG_PING_ATTEMPTS: usize = 12;
const CONFIG_PING_INTERVAL: Duration = Duration::from_secs(5);

pub struct MigrationSupervisor {
    store: Arc<dyn Store>,
    provisioners: ProvisionerRegistry,
    databases: DatabaseRegistry,
    events: Arc<EventProducer>,
    webhooks: Arc<WebhookSender>,
    instance_id: String,
}

#[async_trait]
impl Doer for MigrationSupervisor {
    async fn do_work(&self) -> Result<()> {
        let operations = self.store.get_unlocked_migrations_pending_work().await?;
        for op in operations {
            self.supervise(&op).await;
        }
        Ok(())
    }

    async fn shutdown(&self) {}
}

impl MigrationSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        provisioners: ProvisionerRegistry,
        databases: DatabaseRegistry,
        events: Arc<EventProducer>,
        webhooks: Arc<WebhookSender>,
    ) -> Self {
        Self {
            store,
            provisioners,
            databases,
            events,
            webhooks,
            instance_id: new_id(),
        }
    }

    pub async fn supervise(&self, op: &InstallationDbMigrationOperation) {
        match self.store.lock_migration(&op.id, &self.instance_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::warn!(error = %err, migration_id = %op.id, "failed to lock migration");
                return;
            }
        }
        let result = self.supervise_locked(op).await;
        if let Err(err) = self
            .store
            .unlock_migration(&op.id, &self.instance_id, false)
            .await
        {
            tracing::error!(error = %err, migration_id = %op.id, "failed to unlock migration");
        }
        if let Err(err) = result {
            tracing::error!(error = %err, migration_id = %op.id, "migration supervision failed");
        }
    }

    async fn supervise_locked(&self, observed: &InstallationDbMigrationOperation) -> Result<()> {
        let Some(mut op) = self.store.get_migration(&observed.id).await? else {
            bail!("migration {} vanished from the store", observed.id);
        };
        if op.state != observed.state {
            tracing::debug!(
                migration_id = %op.id,
                observed = %observed.state,
                stored = %op.state,
                "migration state changed underneath us; skipping"
            );
            return Ok(());
        }

        let old_state = op.state;
        let new_state = self.transition(&mut op).await;
        if new_state == old_state {
            return Ok(());
        }

        op.state = new_state;
        self.store.update_migration(&op).await?;
        self.events
            .produce_migration_state_change_event(&op, old_state)
            .await;
        metrics::record_transition(
            resource_types::INSTALLATION_DB_MIGRATION,
            old_state.as_str(),
            new_state.as_str(),
        );
        let payload = self.webhooks.payload(
            resource_types::INSTALLATION_DB_MIGRATION,
            &op.id,
            new_state.as_str(),
            old_state.as_str(),
        );
        self.webhooks.send_to_all_webhooks(&payload).await;
        tracing::info!(
            migration_id = %op.id,
            old_state = %old_state,
            new_state = %new_state,
            "migration transitioned"
        );
        Ok(())
    }

    async fn transition(&self, op: &mut InstallationDbMigrationOperation) -> MigrationState {
        match op.state {
            MigrationState::Requested => self.handle_requested(op).await,
            MigrationState::BackupInProgress => self.handle_backup_in_progress(op).await,
            MigrationState::DatabaseSwitch => self.handle_database_switch(op).await,
            MigrationState::RefreshSecrets => self.handle_refresh_secrets(op).await,
            MigrationState::TriggerRestoration => self.handle_trigger_restoration(op).await,
            MigrationState::RestorationInProgress => {
                self.handle_restoration_in_progress(op).await
            }
            MigrationState::UpdatingInstallationConfig => {
                self.handle_updating_installation_config(op).await
            }
            MigrationState::Finalizing => self.handle_finalizing(op).await,
            MigrationState::Failing => self.handle_failing(op).await,
            MigrationState::RollbackRequested => self.handle_rollback(op).await,
            MigrationState::DeletionRequested => self.handle_deletion(op).await,
            _ => {
                tracing::error!(
                    migration_id = %op.id,
                    state = %op.state,
                    "unexpected migration state; no transition"
                );
                op.state
            }
        }
    }

    /// Kick the pipeline off by requesting a fresh backup; the backup
    /// supervisor runs the job.
    async fn handle_requested(&self, op: &mut InstallationDbMigrationOperation) -> MigrationState {
        let installation = match self.installation(op).await {
            Ok(installation) => installation,
            Err(err) => {
                tracing::error!(error = %err, migration_id = %op.id, "installation missing");
                return MigrationState::Failing;
            }
        };
        if installation.state != InstallationState::Hibernating
            && installation.state != InstallationState::DbMigrationInProgress
        {
            tracing::warn!(
                migration_id = %op.id,
                installation_state = %installation.state,
                "installation must hibernate before its database can move"
            );
            return op.state;
        }
        let backup = InstallationBackup {
            id: new_id(),
            installation_id: op.installation_id.clone(),
            cluster_installation_id: String::new(),
            data_residence: None,
            state: BackupState::BackupRequested,
            start_at: 0,
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        };
        if let Err(err) = self.store.create_backup(&backup).await {
            tracing::warn!(error = %err, migration_id = %op.id, "failed to request backup");
            return op.state;
        }
        op.backup_id = backup.id;
        MigrationState::BackupInProgress
    }

    async fn handle_backup_in_progress(
        &self,
        op: &mut InstallationDbMigrationOperation,
    ) -> MigrationState {
        match self.store.get_backup(&op.backup_id).await {
            Ok(Some(backup)) => match backup.state {
                BackupState::BackupSucceeded => MigrationState::DatabaseSwitch,
                BackupState::BackupFailed => {
                    tracing::error!(migration_id = %op.id, backup_id = %backup.id, "backup failed");
                    MigrationState::Failing
                }
                _ => op.state,
            },
            Ok(None) => {
                tracing::error!(migration_id = %op.id, backup_id = %op.backup_id, "backup missing");
                MigrationState::Failing
            }
            Err(err) => {
                tracing::warn!(error = %err, migration_id = %op.id, "failed to fetch backup");
                op.state
            }
        }
    }

    /// Detach from the source backend, attach to the destination, and flip
    /// the installation's database tag.
    async fn handle_database_switch(
        &self,
        op: &mut InstallationDbMigrationOperation,
    ) -> MigrationState {
        let installation = match self.installation(op).await {
            Ok(installation) => installation,
            Err(err) => {
                tracing::error!(error = %err, migration_id = %op.id, "installation missing");
                return MigrationState::Failing;
            }
        };
        let source = match self.databases.get(op.source_database) {
            Ok(db) => db,
            Err(err) => {
                tracing::error!(error = %err, migration_id = %op.id, "no source database provider");
                return op.state;
            }
        };
        let destination = match self.databases.get(op.destination_database) {
            Ok(db) => db,
            Err(err) => {
                tracing::error!(error = %err, migration_id = %op.id, "no destination database provider");
                return op.state;
            }
        };

        if !self.try_lock_installation(&installation.id).await {
            return op.state;
        }
        let result = async {
            source.migrate_out(&installation, op).await?;
            destination.migrate_to(&installation, op).await?;
            let mut updated = installation.clone();
            updated.database = op.destination_database;
            self.store.update_installation(&updated).await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        self.unlock_installation(&installation.id).await;
        match result {
            Ok(()) => MigrationState::RefreshSecrets,
            Err(err) => {
                tracing::warn!(error = %err, migration_id = %op.id, "database switch failed");
                op.state
            }
        }
    }

    /// Regenerate workload secrets so pods see the destination database.
    async fn handle_refresh_secrets(
        &self,
        op: &mut InstallationDbMigrationOperation,
    ) -> MigrationState {
        let installation = match self.installation(op).await {
            Ok(installation) => installation,
            Err(err) => {
                tracing::error!(error = %err, migration_id = %op.id, "installation missing");
                return MigrationState::Failing;
            }
        };
        match self.refresh_cluster_installation_secrets(&installation).await {
            Ok(()) => MigrationState::TriggerRestoration,
            Err(err) => {
                tracing::warn!(error = %err, migration_id = %op.id, "secret refresh failed");
                op.state
            }
        }
    }

    async fn handle_trigger_restoration(
        &self,
        op: &mut InstallationDbMigrationOperation,
    ) -> MigrationState {
        let restoration = InstallationDbRestorationOperation {
            id: new_id(),
            installation_id: op.installation_id.clone(),
            backup_id: op.backup_id.clone(),
            cluster_installation_id: String::new(),
            target_installation_state: InstallationState::DbMigrationInProgress,
            complete_at: 0,
            state: RestorationState::Requested,
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        };
        if let Err(err) = self.store.create_restoration(&restoration).await {
            tracing::warn!(error = %err, migration_id = %op.id, "failed to request restoration");
            return op.state;
        }
        op.installation_db_restoration_operation_id = restoration.id;
        MigrationState::RestorationInProgress
    }

    async fn handle_restoration_in_progress(
        &self,
        op: &mut InstallationDbMigrationOperation,
    ) -> MigrationState {
        match self
            .store
            .get_restoration(&op.installation_db_restoration_operation_id)
            .await
        {
            Ok(Some(restoration)) => match restoration.state {
                RestorationState::Succeeded => MigrationState::UpdatingInstallationConfig,
                RestorationState::Failed | RestorationState::Invalid => {
                    tracing::error!(
                        migration_id = %op.id,
                        restoration_id = %restoration.id,
                        restoration_state = %restoration.state,
                        "restoration failed"
                    );
                    MigrationState::Failing
                }
                _ => op.state,
            },
            Ok(None) => {
                tracing::error!(
                    migration_id = %op.id,
                    restoration_id = %op.installation_db_restoration_operation_id,
                    "restoration missing"
                );
                MigrationState::Failing
            }
            Err(err) => {
                tracing::warn!(error = %err, migration_id = %op.id, "failed to fetch restoration");
                op.state
            }
        }
    }

    async fn handle_updating_installation_config(
        &self,
        op: &mut InstallationDbMigrationOperation,
    ) -> MigrationState {
        let installation = match self.installation(op).await {
            Ok(installation) => installation,
            Err(err) => {
                tracing::error!(error = %err, migration_id = %op.id, "installation missing");
                return MigrationState::Failing;
            }
        };
        match self.update_installation_config(&installation).await {
            Ok(()) => MigrationState::Finalizing,
            Err(err) => {
                tracing::warn!(error = %err, migration_id = %op.id, "datasource rewrite failed");
                op.state
            }
        }
    }

    /// Rewrite the server's `SqlSettings.DataSource` from the mounted config
    /// secret, in whichever way this server version supports.
    async fn update_installation_config(&self, installation: &Installation) -> Result<()> {
        let (cluster, ci) = self.target_binding(installation).await?;
        let provisioner = self.provisioners.for_cluster(&cluster)?;

        if installation
            .version
            .starts_with(LEGACY_CONFIG_EXEC_PREFIX)
        {
            let args = string_args(&[
                "server",
                "config",
                "set",
                "SqlSettings.DataSource",
                "--from-secret",
            ]);
            return provisioner
                .exec_cluster_installation_job(&cluster, &ci, &args)
                .await;
        }

        // Newer servers refuse config writes while clustered: boot a
        // single-node server as a background job, wait for it to answer
        // pings, rewrite the config locally, then stop the job.
        provisioner
            .exec_cluster_installation_job(
                &cluster,
                &ci,
                &string_args(&[
                    "server",
                    "start",
                    "--disable-clustering",
                    "--background-job",
                ]),
            )
            .await?;
        let ping = string_args(&["server", "ping"]);
        let mut attempt = 0;
        loop {
            match provisioner
                .exec_cluster_installation_job(&cluster, &ci, &ping)
                .await
            {
                Ok(()) => break,
                Err(err) if attempt < CONFIG_PING_ATTEMPTS => {
                    attempt += 1;
                    tracing::debug!(error = %err, attempt, "waiting for single-node server");
                    tokio::time::sleep(CONFIG_PING_INTERVAL).await;
                }
                Err(err) => return Err(err).context("single-node server never answered pings"),
            }
        }
        let rewrite = provisioner
            .exec_cluster_installation_job(
                &cluster,
                &ci,
                &string_args(&[
                    "server",
                    "config",
                    "set",
                    "SqlSettings.DataSource",
                    "--from-secret",
                    "--local",
                ]),
            )
            .await;
        // The background job is stopped even when the rewrite failed.
        let stop = provisioner
            .exec_cluster_installation_job(
                &cluster,
                &ci,
                &string_args(&["server", "stop", "--background-job"]),
            )
            .await;
        rewrite?;
        stop
    }

    /// Park the installation back in hibernation and stamp completion.
    async fn handle_finalizing(&self, op: &mut InstallationDbMigrationOperation) -> MigrationState {
        match self
            .set_installation_state(op, InstallationState::Hibernating)
            .await
        {
            Ok(()) => {
                op.complete_at = now_millis();
                MigrationState::Succeeded
            }
            Err(err) => {
                tracing::warn!(error = %err, migration_id = %op.id, "failed to finalize migration");
                op.state
            }
        }
    }

    async fn handle_failing(&self, op: &mut InstallationDbMigrationOperation) -> MigrationState {
        match self
            .set_installation_state(op, InstallationState::DbMigrationFailed)
            .await
        {
            Ok(()) => MigrationState::Failed,
            Err(err) => {
                tracing::warn!(error = %err, migration_id = %op.id, "failed to mark installation failed");
                op.state
            }
        }
    }

    /// Undo the destination attach, flip the database tag back, refresh
    /// secrets, and restore hibernation.
    async fn handle_rollback(&self, op: &mut InstallationDbMigrationOperation) -> MigrationState {
        let installation = match self.installation(op).await {
            Ok(installation) => installation,
            Err(err) => {
                tracing::error!(error = %err, migration_id = %op.id, "installation missing");
                return op.state;
            }
        };
        let destination = match self.databases.get(op.destination_database) {
            Ok(db) => db,
            Err(err) => {
                tracing::error!(error = %err, migration_id = %op.id, "no destination database provider");
                return op.state;
            }
        };
        if !self.try_lock_installation(&installation.id).await {
            return op.state;
        }
        let result = async {
            destination.rollback(&installation, op).await?;
            let mut updated = installation.clone();
            updated.database = op.source_database;
            let old_state = updated.state;
            updated.state = InstallationState::Hibernating;
            self.store.update_installation(&updated).await?;
            if old_state != updated.state {
                self.events
                    .produce_installation_state_change_event(&updated, old_state)
                    .await;
            }
            self.refresh_cluster_installation_secrets(&updated).await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        self.unlock_installation(&installation.id).await;
        match result {
            Ok(()) => MigrationState::RollbackFinished,
            Err(err) => {
                tracing::warn!(error = %err, migration_id = %op.id, "rollback failed");
                op.state
            }
        }
    }

    /// Tear down the source backend's migration artifacts and remove the
    /// operation row.
    async fn handle_deletion(&self, op: &mut InstallationDbMigrationOperation) -> MigrationState {
        if let Ok(installation) = self.installation(op).await {
            let source = match self.databases.get(op.source_database) {
                Ok(db) => db,
                Err(err) => {
                    tracing::error!(error = %err, migration_id = %op.id, "no source database provider");
                    return op.state;
                }
            };
            if let Err(err) = source.teardown_migrated(&installation, op).await {
                tracing::warn!(error = %err, migration_id = %op.id, "failed to tear down migration artifacts");
                return op.state;
            }
        }
        if let Err(err) = self.store.delete_migration(&op.id).await {
            tracing::warn!(error = %err, migration_id = %op.id, "failed to delete migration row");
            return op.state;
        }
        op.delete_at = now_millis();
        MigrationState::Deleted
    }

    async fn installation(&self, op: &InstallationDbMigrationOperation) -> Result<Installation> {
        self.store
            .get_installation(&op.installation_id)
            .await?
            .with_context(|| format!("installation {} missing", op.installation_id))
    }

    async fn target_binding(
        &self,
        installation: &Installation,
    ) -> Result<(Cluster, ClusterInstallation)> {
        let ci = self
            .store
            .get_cluster_installations_for_installation(&installation.id)
            .await?
            .into_iter()
            .find(|ci| !ci.is_deleted())
            .with_context(|| {
                format!(
                    "installation {} has no live cluster installation",
                    installation.id
                )
            })?;
        let cluster = self
            .store
            .get_cluster(&ci.cluster_id)
            .await?
            .with_context(|| format!("cluster {} missing for binding {}", ci.cluster_id, ci.id))?;
        Ok((cluster, ci))
    }

    async fn refresh_cluster_installation_secrets(
        &self,
        installation: &Installation,
    ) -> Result<()> {
        let cluster_installations = self
            .store
            .get_cluster_installations_for_installation(&installation.id)
            .await?;
        for ci in cluster_installations.iter().filter(|ci| !ci.is_deleted()) {
            let cluster = self
                .store
                .get_cluster(&ci.cluster_id)
                .await?
                .with_context(|| {
                    format!("cluster {} missing for binding {}", ci.cluster_id, ci.id)
                })?;
            let provisioner = self.provisioners.for_cluster(&cluster)?;
            let cip = provisioner.cluster_installation_provisioner(&installation.cr_version);
            cip.refresh_secrets(&cluster, installation, ci).await?;
        }
        Ok(())
    }

    async fn set_installation_state(
        &self,
        op: &InstallationDbMigrationOperation,
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
            let mut installation = self.installation(op).await?;
            let old_state = installation.state;
            installation.state = state;
            self.store.update_installation(&installation).await?;
            self.events
                .produce_installation_state_change_event(&installation, old_state)
                .await;
            Ok(())
        }
        .await;
        self.unlock_installation(&op.installation_id).await;
        result
    }

    async fn try_lock_installation(&self, installation_id: &str) -> bool {
        match self
            .store
            .lock_installation(installation_id, &self.instance_id)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!(installation_id, "installation locked elsewhere");
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, installation_id, "failed to lock installation");
                false
            }
        }
    }

    async fn unlock_installation(&self, installation_id: &str) {
        if let Err(err) = self
            .store
            .unlock_installation(installation_id, &self.instance_id, false)
            .await
        {
            tracing::error!(error = %err, installation_id, "failed to unlock installation");
        }
    }
}

fn string_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorage_model::{
        Affinity, ClusterInstallationState, ClusterState, DatabaseKind, FilestoreKind,
        InstallationSize, KopsMetadata, ProvisionerKind, ProvisionerMetadata,
    };
    use anchorage_store::InMemoryStore;

    use crate::backup::BackupSupervisor;
    use crate::dev::{DevDatabase, DevObjectStore, DevProvisioner};
    use crate::restoration::RestorationSupervisor;

    struct Fixture {
        store: Arc<InMemoryStore>,
        migrations: MigrationSupervisor,
        backups: BackupSupervisor,
        restorations: RestorationSupervisor,
        source_db: Arc<DevDatabase>,
        destination_db: Arc<DevDatabase>,
        provisioner: Arc<DevProvisioner>,
    }

    fn fixture() -> Fixture {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let provisioner = Arc::new(DevProvisioner::new());
        let registry =
            ProvisionerRegistry::new().register(ProvisionerKind::Kops, provisioner.clone());
        let source_db = Arc::new(DevDatabase::default());
        let destination_db = Arc::new(DevDatabase::default());
        let databases = DatabaseRegistry::new()
            .register(DatabaseKind::MultiTenantRds, source_db.clone())
            .register(DatabaseKind::SingleTenantRds, destination_db.clone());
        let events = Arc::new(EventProducer::new(store.clone()));
        let webhooks = Arc::new(WebhookSender::new(store.clone(), "test".to_string()));
        let migrations = MigrationSupervisor::new(
            store.clone(),
            registry.clone(),
            databases,
            events.clone(),
            webhooks.clone(),
        );
        let backups = BackupSupervisor::new(
            store.clone(),
            registry.clone(),
            events.clone(),
            webhooks.clone(),
            Arc::new(DevObjectStore::default()),
        );
        let restorations =
            RestorationSupervisor::new(store.clone(), registry, events, webhooks);
        Fixture {
            store,
            migrations,
            backups,
            restorations,
            source_db,
            destination_db,
            provisioner,
        }
    }

    async fn seed(store: &InMemoryStore) -> InstallationDbMigrationOperation {
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
        let op = InstallationDbMigrationOperation {
            id: "m1".to_string(),
            installation_id: "i1".to_string(),
            source_database: DatabaseKind::MultiTenantRds,
            destination_database: DatabaseKind::SingleTenantRds,
            backup_id: String::new(),
            installation_db_restoration_operation_id: String::new(),
            complete_at: 0,
            state: MigrationState::Requested,
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        };
        store.create_migration(&op).await.unwrap();
        op
    }

    async fn stored(store: &InMemoryStore) -> InstallationDbMigrationOperation {
        store.get_migration("m1").await.unwrap().unwrap()
    }

    async fn step(f: &Fixture) -> MigrationState {
        let op = stored(&f.store).await;
        f.migrations.supervise(&op).await;
        stored(&f.store).await.state
    }

    #[tokio::test]
    async fn happy_path_advances_one_stage_per_pass() {
        let f = fixture();
        seed(&f.store).await;

        assert_eq!(step(&f).await, MigrationState::BackupInProgress);
        let op = stored(&f.store).await;
        assert!(!op.backup_id.is_empty());

        // Backup still requested: the migration holds position.
        assert_eq!(step(&f).await, MigrationState::BackupInProgress);

        // Let the backup supervisor run the job to completion.
        f.backups.do_work().await.unwrap();
        f.backups.do_work().await.unwrap();
        assert_eq!(
            f.store.get_backup(&op.backup_id).await.unwrap().unwrap().state,
            BackupState::BackupSucceeded
        );

        assert_eq!(step(&f).await, MigrationState::DatabaseSwitch);
        assert_eq!(step(&f).await, MigrationState::RefreshSecrets);
        let installation = f.store.get_installation("i1").await.unwrap().unwrap();
        assert_eq!(installation.database, DatabaseKind::SingleTenantRds);
        assert!(
            f.source_db
                .calls
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.starts_with("migrate-out"))
        );
        assert!(
            f.destination_db
                .calls
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.starts_with("migrate-to"))
        );

        assert_eq!(step(&f).await, MigrationState::TriggerRestoration);
        assert_eq!(step(&f).await, MigrationState::RestorationInProgress);
        let op = stored(&f.store).await;
        assert!(!op.installation_db_restoration_operation_id.is_empty());

        // Drive the restoration to completion.
        for _ in 0..4 {
            f.restorations.do_work().await.unwrap();
        }
        assert_eq!(
            f.store
                .get_restoration(&op.installation_db_restoration_operation_id)
                .await
                .unwrap()
                .unwrap()
                .state,
            RestorationState::Succeeded
        );

        assert_eq!(step(&f).await, MigrationState::UpdatingInstallationConfig);
        assert_eq!(step(&f).await, MigrationState::Finalizing);
        // The newer exec variant ran: background start, ping, rewrite, stop.
        let execs = f.provisioner.state.exec_log.lock().unwrap().clone();
        assert!(execs.iter().any(|args| args.contains(&"start".to_string())));
        assert!(execs.iter().any(|args| args.contains(&"--local".to_string())));
        assert!(execs.iter().any(|args| args.contains(&"stop".to_string())));

        assert_eq!(step(&f).await, MigrationState::Succeeded);
        let op = stored(&f.store).await;
        assert!(op.complete_at > 0);
        assert_eq!(
            f.store.get_installation("i1").await.unwrap().unwrap().state,
            InstallationState::Hibernating
        );
    }

    #[tokio::test]
    async fn failed_backup_fails_the_migration_and_the_installation() {
        let f = fixture();
        seed(&f.store).await;
        assert_eq!(step(&f).await, MigrationState::BackupInProgress);

        let op = stored(&f.store).await;
        let mut backup = f.store.get_backup(&op.backup_id).await.unwrap().unwrap();
        backup.state = BackupState::BackupFailed;
        f.store.update_backup(&backup).await.unwrap();

        assert_eq!(step(&f).await, MigrationState::Failing);
        assert_eq!(step(&f).await, MigrationState::Failed);
        assert_eq!(
            f.store.get_installation("i1").await.unwrap().unwrap().state,
            InstallationState::DbMigrationFailed
        );
    }

    #[tokio::test]
    async fn legacy_versions_use_the_single_exec_variant() {
        let f = fixture();
        seed(&f.store).await;
        let mut installation = f.store.get_installation("i1").await.unwrap().unwrap();
        installation.version = "5.39.2".to_string();
        f.store.update_installation(&installation).await.unwrap();

        let mut op = stored(&f.store).await;
        op.state = MigrationState::UpdatingInstallationConfig;
        f.store.update_migration(&op).await.unwrap();

        assert_eq!(step(&f).await, MigrationState::Finalizing);
        let execs = f.provisioner.state.exec_log.lock().unwrap().clone();
        assert_eq!(execs.len(), 1);
        assert!(!execs[0].contains(&"--local".to_string()));
    }

    #[tokio::test]
    async fn rollback_restores_the_source_database() {
        let f = fixture();
        seed(&f.store).await;
        let mut installation = f.store.get_installation("i1").await.unwrap().unwrap();
        installation.database = DatabaseKind::SingleTenantRds;
        f.store.update_installation(&installation).await.unwrap();
        let mut op = stored(&f.store).await;
        op.state = MigrationState::RollbackRequested;
        f.store.update_migration(&op).await.unwrap();

        assert_eq!(step(&f).await, MigrationState::RollbackFinished);
        let installation = f.store.get_installation("i1").await.unwrap().unwrap();
        assert_eq!(installation.database, DatabaseKind::MultiTenantRds);
        assert!(
            f.destination_db
                .calls
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.starts_with("rollback"))
        );
    }

    #[tokio::test]
    async fn deletion_tears_down_artifacts_and_tombstones() {
        let f = fixture();
        seed(&f.store).await;
        let mut op = stored(&f.store).await;
        op.state = MigrationState::DeletionRequested;
        f.store.update_migration(&op).await.unwrap();

        assert_eq!(step(&f).await, MigrationState::Deleted);
        let op = stored(&f.store).await;
        assert!(op.delete_at > 0);
        assert!(
            f.source_db
                .calls
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.starts_with("teardown-migrated"))
        );
    }
}
