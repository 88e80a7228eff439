//! Installation supervisor: the top-level tenant lifecycle. Placement, DNS,
//! hibernation, updates with group-config drift detection, and the deletion
//! cascade all live here.

mod cache;
mod placement;

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use anchorage_common::{new_id, now_millis, resource_types};
use anchorage_model::{
    BackupState, ClusterInstallation, ClusterInstallationState, Installation, InstallationState,
    MigrationState, RestorationState,
};
use anchorage_store::*;

use crate::database::DatabaseRegistry;
use crate::dns::DnsProvider;
use crate::events::EventProducer;
use crate::filestore::FilestoreRegistry;
use crate::metrics;
use crate::options::SchedulingOptions;
use crate::provisioner::ProvisionerRegistry;
use crate::scheduler::Doer;

pub use cache::ClusterResourceCache;
use placement::PlacementOutcome;

/// CR schema version new and updated installations are reconciled against.
const LATEST_CR_VERSION: &str = "v1beta1";

pub struct InstallationSupervisor {
    store: Arc<dyn Store>,
    provisioners: ProvisionerRegistry,
    databases: DatabaseRegistry,
    filestores: FilestoreRegistry,
    dns: Arc<dyn DnsProvider>,
    events: Arc<EventProducer>,
    options: SchedulingOptions,
    cache: Arc<ClusterResourceCache>,
    cache_cancel: CancellationToken,
    cache_refresher: Mutex<Option<JoinHandle<()>>>,
    instance_id: String,
}

/// How the CI bindings settle during a poll.
enum CiPollResult {
    AllSettled,
    Waiting,
    Failed,
}

/// The per-binding operation rolled out under the batched lock.
enum Rollout {
    Update,
    Hibernate,
}

#[async_trait]
impl Doer for InstallationSupervisor {
    async fn do_work(&self) -> Result<()> {
        let installations = self.store.get_unlocked_installations_pending_work().await?;
        for installation in installations {
            self.supervise(&installation).await;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.cache_cancel.cancel();
        let handle = self.cache_refresher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl InstallationSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        provisioners: ProvisionerRegistry,
        databases: DatabaseRegistry,
        filestores: FilestoreRegistry,
        dns: Arc<dyn DnsProvider>,
        events: Arc<EventProducer>,
        options: SchedulingOptions,
    ) -> Self {
        let cache = Arc::new(ClusterResourceCache::new());
        let cache_cancel = CancellationToken::new();
        let cache_refresher = if options.balance_installations {
            Some(cache::spawn_refresher(
                cache.clone(),
                store.clone(),
                provisioners.clone(),
                cache_cancel.clone(),
            ))
        } else {
            None
        };
        Self {
            store,
            provisioners,
            databases,
            filestores,
            dns,
            events,
            options,
            cache,
            cache_cancel,
            cache_refresher: Mutex::new(cache_refresher),
            instance_id: new_id(),
        }
    }

    pub async fn supervise(&self, installation: &Installation) {
        match self
            .store
            .lock_installation(&installation.id, &self.instance_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::warn!(error = %err, installation_id = %installation.id, "failed to lock installation");
                return;
            }
        }
        let result = self.supervise_locked(installation).await;
        if let Err(err) = self
            .store
            .unlock_installation(&installation.id, &self.instance_id, false)
            .await
        {
            tracing::error!(error = %err, installation_id = %installation.id, "failed to unlock installation");
        }
        if let Err(err) = result {
            tracing::error!(error = %err, installation_id = %installation.id, "installation supervision failed");
        }
    }

    async fn supervise_locked(&self, observed: &Installation) -> Result<()> {
        let Some(mut installation) = self.store.get_installation(&observed.id).await? else {
            bail!("installation {} vanished from the store", observed.id);
        };
        if installation.state != observed.state {
            tracing::debug!(
                installation_id = %installation.id,
                observed = %observed.state,
                stored = %installation.state,
                "installation state changed underneath us; skipping"
            );
            return Ok(());
        }

        // The creation pipeline is chased through in one pass: each
        // transition persists, then expedited states run again immediately
        // rather than waiting a scheduler tick.
        loop {
            let old_state = installation.state;
            let new_state = self.transition(&mut installation).await;
            if new_state == old_state {
                return Ok(());
            }
            installation.state = new_state;
            self.store.update_installation(&installation).await?;
            self.events
                .produce_installation_state_change_event(&installation, old_state)
                .await;
            metrics::record_transition(
                resource_types::INSTALLATION,
                old_state.as_str(),
                new_state.as_str(),
            );
            if matches!(
                new_state,
                InstallationState::Stable
                    | InstallationState::Hibernating
                    | InstallationState::Deleted
            ) {
                let request_states: Vec<&str> = InstallationState::REQUEST_STATES
                    .iter()
                    .map(|s| s.as_str())
                    .collect();
                metrics::record_lifecycle_duration(
                    self.store.as_ref(),
                    resource_types::INSTALLATION,
                    &installation.id,
                    &request_states,
                    new_state.as_str(),
                )
                .await;
            }
            tracing::info!(
                installation_id = %installation.id,
                old_state = %old_state,
                new_state = %new_state,
                "installation transitioned"
            );
            if !new_state.is_expedited() {
                return Ok(());
            }
        }
    }

    async fn transition(&self, installation: &mut Installation) -> InstallationState {
        match installation.state {
            InstallationState::CreationRequested
            | InstallationState::CreationNoCompatibleClusters => {
                self.handle_creation(installation).await
            }
            InstallationState::CreationPreProvisioning => {
                self.handle_pre_provisioning(installation).await
            }
            InstallationState::CreationDns => self.handle_creation_dns(installation).await,
            InstallationState::CreationInProgress => {
                self.handle_creation_in_progress(installation).await
            }
            InstallationState::CreationFinalTasks => self.finalize_stable(installation).await,
            InstallationState::UpdateRequested => self.handle_update_requested(installation).await,
            InstallationState::UpdateInProgress => {
                self.handle_update_in_progress(installation).await
            }
            InstallationState::HibernationRequested => {
                self.handle_hibernation_requested(installation).await
            }
            InstallationState::HibernationInProgress => {
                self.handle_hibernation_in_progress(installation).await
            }
            InstallationState::WakeUpRequested
            | InstallationState::DeletionCancellationRequested => {
                self.handle_wake_up(installation).await
            }
            InstallationState::DnsMigrationHibernating => {
                self.handle_dns_migration_hibernating(installation).await
            }
            InstallationState::DeletionPendingRequested => {
                self.handle_deletion_pending_requested(installation).await
            }
            InstallationState::DeletionPendingInProgress => {
                self.handle_deletion_pending_in_progress(installation).await
            }
            InstallationState::DeletionRequested | InstallationState::DeletionInProgress => {
                self.handle_deletion(installation).await
            }
            InstallationState::DeletionFinalCleanup => {
                self.handle_final_cleanup(installation).await
            }
            _ => {
                tracing::error!(
                    installation_id = %installation.id,
                    state = %installation.state,
                    "unexpected installation state; no transition"
                );
                installation.state
            }
        }
    }

    async fn handle_creation(&self, installation: &mut Installation) -> InstallationState {
        match self.place_installation(installation).await {
            Ok(PlacementOutcome::Placed(_)) => InstallationState::CreationPreProvisioning,
            Ok(PlacementOutcome::ScalingTriggered) => installation.state,
            Ok(PlacementOutcome::NoCompatibleClusters) => {
                InstallationState::CreationNoCompatibleClusters
            }
            Err(err) => {
                tracing::warn!(error = %err, installation_id = %installation.id, "placement failed");
                installation.state
            }
        }
    }

    async fn handle_pre_provisioning(&self, installation: &mut Installation) -> InstallationState {
        // Shared cluster utilities come up first so database and filestore
        // provisioning have something to target.
        match self.prepare_cluster_utilities(installation).await {
            Ok(()) => {}
            Err(err) => {
                tracing::warn!(error = %err, installation_id = %installation.id, "cluster utility preparation failed");
                return installation.state;
            }
        }
        let database = match self.databases.get(installation.database) {
            Ok(database) => database,
            Err(err) => {
                tracing::error!(error = %err, installation_id = %installation.id, "no database provider");
                return installation.state;
            }
        };
        if let Err(err) = database.provision(installation).await {
            tracing::warn!(error = %err, installation_id = %installation.id, "database provisioning failed");
            return installation.state;
        }
        let filestore = match self.filestores.get(installation.filestore) {
            Ok(filestore) => filestore,
            Err(err) => {
                tracing::error!(error = %err, installation_id = %installation.id, "no filestore provider");
                return installation.state;
            }
        };
        if let Err(err) = filestore.provision(installation).await {
            tracing::warn!(error = %err, installation_id = %installation.id, "filestore provisioning failed");
            return installation.state;
        }
        InstallationState::CreationDns
    }

    async fn handle_creation_dns(&self, installation: &mut Installation) -> InstallationState {
        if let Err(err) = self.configure_dns(installation).await {
            tracing::warn!(error = %err, installation_id = %installation.id, "dns configuration failed");
            return installation.state;
        }
        InstallationState::CreationInProgress
    }

    async fn handle_creation_in_progress(
        &self,
        installation: &mut Installation,
    ) -> InstallationState {
        match self.poll_cluster_installations(installation).await {
            Ok(CiPollResult::AllSettled) => InstallationState::CreationFinalTasks,
            Ok(CiPollResult::Waiting) => installation.state,
            Ok(CiPollResult::Failed) => InstallationState::CreationFailed,
            Err(err) => {
                tracing::warn!(error = %err, installation_id = %installation.id, "failed to poll cluster installations");
                installation.state
            }
        }
    }

    /// Group-sequence guard on any transition to Stable: if the group moved
    /// while we reconciled, the installation goes back around instead.
    async fn finalize_stable(&self, installation: &mut Installation) -> InstallationState {
        let Some(group_id) = installation.group_id.clone() else {
            return InstallationState::Stable;
        };
        match self.store.lock_group(&group_id, &self.instance_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(group_id = %group_id, "group locked elsewhere; retrying next tick");
                return installation.state;
            }
            Err(err) => {
                tracing::warn!(error = %err, group_id = %group_id, "failed to lock group");
                return installation.state;
            }
        }
        let group = self.store.get_group(&group_id).await;
        if let Err(err) = self
            .store
            .unlock_group(&group_id, &self.instance_id, false)
            .await
        {
            tracing::error!(error = %err, group_id = %group_id, "failed to unlock group");
        }
        match group {
            Ok(Some(group)) => {
                if installation.group_sequence != Some(group.sequence) {
                    tracing::info!(
                        installation_id = %installation.id,
                        group_id = %group_id,
                        "group sequence drifted during reconciliation; re-queueing update"
                    );
                    InstallationState::UpdateRequested
                } else {
                    InstallationState::Stable
                }
            }
            Ok(None) => {
                tracing::error!(
                    installation_id = %installation.id,
                    group_id = %group_id,
                    "group missing; finalizing without it"
                );
                InstallationState::Stable
            }
            Err(err) => {
                tracing::warn!(error = %err, group_id = %group_id, "failed to read group");
                installation.state
            }
        }
    }

    async fn handle_update_requested(&self, installation: &mut Installation) -> InstallationState {
        // Merge group configuration and record the sequence we built against.
        if let Some(group_id) = installation.group_id.clone() {
            match self.store.get_group(&group_id).await {
                Ok(Some(group)) => {
                    if !group.version.is_empty() {
                        installation.version = group.version.clone();
                    }
                    installation.group_sequence = Some(group.sequence);
                }
                Ok(None) => {
                    tracing::error!(installation_id = %installation.id, group_id = %group_id, "group missing");
                }
                Err(err) => {
                    tracing::warn!(error = %err, group_id = %group_id, "failed to read group");
                    return installation.state;
                }
            }
        }
        if installation.cr_version != LATEST_CR_VERSION {
            tracing::info!(
                installation_id = %installation.id,
                from = %installation.cr_version,
                to = LATEST_CR_VERSION,
                "upgrading custom resource version"
            );
            installation.cr_version = LATEST_CR_VERSION.to_string();
        }

        match self.rollout(installation, Rollout::Update).await {
            Ok(()) => InstallationState::UpdateInProgress,
            Err(err) => {
                tracing::warn!(error = %err, installation_id = %installation.id, "update rollout failed");
                installation.state
            }
        }
    }

    async fn handle_update_in_progress(
        &self,
        installation: &mut Installation,
    ) -> InstallationState {
        // Drift check first: a group mutation mid-update restarts the update
        // rather than finalizing against stale configuration.
        if let Some(group_id) = installation.group_id.clone() {
            match self.store.get_group(&group_id).await {
                Ok(Some(group)) if installation.group_sequence != Some(group.sequence) => {
                    return InstallationState::UpdateRequested;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, group_id = %group_id, "failed to read group");
                    return installation.state;
                }
            }
        }
        match self.poll_cluster_installations(installation).await {
            Ok(CiPollResult::AllSettled) => {
                if let Err(err) = self.configure_dns(installation).await {
                    tracing::warn!(error = %err, installation_id = %installation.id, "dns re-upsert failed");
                }
                self.finalize_stable(installation).await
            }
            Ok(CiPollResult::Waiting) => installation.state,
            Ok(CiPollResult::Failed) => InstallationState::UpdateFailed,
            Err(err) => {
                tracing::warn!(error = %err, installation_id = %installation.id, "failed to poll cluster installations");
                installation.state
            }
        }
    }

    async fn handle_hibernation_requested(
        &self,
        installation: &mut Installation,
    ) -> InstallationState {
        match self.begin_hibernation(installation).await {
            Ok(()) => InstallationState::HibernationInProgress,
            Err(err) => {
                tracing::warn!(error = %err, installation_id = %installation.id, "hibernation rollout failed");
                installation.state
            }
        }
    }

    async fn handle_hibernation_in_progress(
        &self,
        installation: &mut Installation,
    ) -> InstallationState {
        match self.poll_cluster_installations(installation).await {
            Ok(CiPollResult::AllSettled) => InstallationState::Hibernating,
            Ok(CiPollResult::Waiting) => installation.state,
            Ok(CiPollResult::Failed) => InstallationState::UpdateFailed,
            Err(err) => {
                tracing::warn!(error = %err, installation_id = %installation.id, "failed to poll cluster installations");
                installation.state
            }
        }
    }

    async fn handle_wake_up(&self, installation: &mut Installation) -> InstallationState {
        let database = match self.databases.get(installation.database) {
            Ok(database) => database,
            Err(err) => {
                tracing::error!(error = %err, installation_id = %installation.id, "no database provider");
                return installation.state;
            }
        };
        if let Err(err) = database.refresh_metadata(installation).await {
            tracing::warn!(error = %err, installation_id = %installation.id, "database metadata refresh failed");
            return installation.state;
        }
        // The update pipeline drives the installation back to Stable.
        InstallationState::UpdateRequested
    }

    async fn handle_dns_migration_hibernating(
        &self,
        installation: &mut Installation,
    ) -> InstallationState {
        if let Err(err) = self.configure_dns(installation).await {
            tracing::warn!(error = %err, installation_id = %installation.id, "dns configuration failed");
            return installation.state;
        }
        match self.poll_cluster_installations(installation).await {
            Ok(CiPollResult::AllSettled) => InstallationState::Hibernating,
            Ok(CiPollResult::Waiting) => installation.state,
            Ok(CiPollResult::Failed) => InstallationState::UpdateFailed,
            Err(err) => {
                tracing::warn!(error = %err, installation_id = %installation.id, "failed to poll cluster installations");
                installation.state
            }
        }
    }

    async fn handle_deletion_pending_requested(
        &self,
        installation: &mut Installation,
    ) -> InstallationState {
        match self.begin_hibernation(installation).await {
            Ok(()) => InstallationState::DeletionPendingInProgress,
            Err(err) => {
                tracing::warn!(error = %err, installation_id = %installation.id, "pre-deletion hibernation failed");
                installation.state
            }
        }
    }

    async fn handle_deletion_pending_in_progress(
        &self,
        installation: &mut Installation,
    ) -> InstallationState {
        match self.poll_cluster_installations(installation).await {
            Ok(CiPollResult::AllSettled) => InstallationState::DeletionPending,
            Ok(CiPollResult::Waiting) => installation.state,
            Ok(CiPollResult::Failed) => InstallationState::DeletionFailed,
            Err(err) => {
                tracing::warn!(error = %err, installation_id = %installation.id, "failed to poll cluster installations");
                installation.state
            }
        }
    }

    /// Mark every binding for deletion and wait for the cascade.
    async fn handle_deletion(&self, installation: &mut Installation) -> InstallationState {
        let cluster_installations = match self
            .store
            .get_cluster_installations_for_installation(&installation.id)
            .await
        {
            Ok(cis) => cis,
            Err(err) => {
                tracing::warn!(error = %err, installation_id = %installation.id, "failed to list cluster installations");
                return installation.state;
            }
        };

        let mut waiting = 0;
        let mut failed = 0;
        for ci in &cluster_installations {
            match ci.state {
                ClusterInstallationState::Deleted => {}
                ClusterInstallationState::DeletionFailed => failed += 1,
                ClusterInstallationState::DeletionRequested => waiting += 1,
                _ => {
                    let mut marked = ci.clone();
                    let old_state = marked.state;
                    marked.state = ClusterInstallationState::DeletionRequested;
                    if let Err(err) = self.store.update_cluster_installation(&marked).await {
                        tracing::warn!(error = %err, ci_id = %ci.id, "failed to mark binding for deletion");
                        return installation.state;
                    }
                    self.events
                        .produce_cluster_installation_state_change_event(&marked, Some(old_state))
                        .await;
                    waiting += 1;
                }
            }
        }

        if failed > 0 && installation.state == InstallationState::DeletionInProgress {
            tracing::error!(
                installation_id = %installation.id,
                failed,
                "cluster installation deletion failed"
            );
            return InstallationState::DeletionFailed;
        }
        if waiting > 0 {
            return InstallationState::DeletionInProgress;
        }
        InstallationState::DeletionFinalCleanup
    }

    async fn handle_final_cleanup(&self, installation: &mut Installation) -> InstallationState {
        match self.final_cleanup(installation).await {
            Ok(true) => InstallationState::Deleted,
            Ok(false) => installation.state,
            Err(err) => {
                tracing::warn!(error = %err, installation_id = %installation.id, "final cleanup incomplete");
                installation.state
            }
        }
    }

    /// Idempotent teardown of everything hanging off the installation. The
    /// state stays `DeletionFinalCleanup` until every step reports done.
    async fn final_cleanup(&self, installation: &mut Installation) -> Result<bool> {
        // DNS records: provider-side delete for live records, then the row.
        // Already-tombstoned records skip the provider call.
        let records = self
            .store
            .get_dns_records_for_installation(&installation.id)
            .await?;
        for record in records {
            if record.delete_at == 0 {
                self.dns
                    .delete_dns_records(std::slice::from_ref(&record.domain_name))
                    .await?;
            }
            self.store.delete_dns_record(&record.id).await?;
        }

        if !installation.keep_filestore_data && !self.delete_backups(installation).await? {
            return Ok(false);
        }
        if !self.delete_db_operations(installation).await? {
            return Ok(false);
        }
        self.delete_volume_secrets(installation).await?;

        let database = self.databases.get(installation.database)?;
        database
            .teardown(installation, installation.keep_database_data)
            .await?;
        let filestore = self.filestores.get(installation.filestore)?;
        filestore
            .teardown(installation, installation.keep_filestore_data)
            .await?;

        self.store.delete_installation(&installation.id).await?;
        installation.delete_at = now_millis();
        Ok(true)
    }

    /// Marks live backups for deletion; true once none remain.
    async fn delete_backups(&self, installation: &Installation) -> Result<bool> {
        let backups = self
            .store
            .get_backups_for_installation(&installation.id)
            .await?;
        let mut waiting = false;
        for backup in backups {
            match backup.state {
                BackupState::Deleted => {}
                BackupState::DeletionRequested => waiting = true,
                BackupState::DeletionFailed => {
                    tracing::error!(
                        backup_id = %backup.id,
                        "backup deletion failed; blocking final cleanup"
                    );
                    waiting = true;
                }
                _ => {
                    let mut marked = backup.clone();
                    let old_state = marked.state;
                    marked.state = BackupState::DeletionRequested;
                    self.store.update_backup(&marked).await?;
                    self.events
                        .produce_backup_state_change_event(&marked, old_state)
                        .await;
                    waiting = true;
                }
            }
        }
        Ok(!waiting)
    }

    /// Marks live migration and restoration operations for deletion; true
    /// once none remain.
    async fn delete_db_operations(&self, installation: &Installation) -> Result<bool> {
        let mut waiting = false;
        for migration in self
            .store
            .get_migrations_for_installation(&installation.id)
            .await?
        {
            match migration.state {
                MigrationState::Deleted => {}
                MigrationState::DeletionRequested => waiting = true,
                _ => {
                    let mut marked = migration.clone();
                    let old_state = marked.state;
                    marked.state = MigrationState::DeletionRequested;
                    self.store.update_migration(&marked).await?;
                    self.events
                        .produce_migration_state_change_event(&marked, old_state)
                        .await;
                    waiting = true;
                }
            }
        }
        for restoration in self
            .store
            .get_restorations_for_installation(&installation.id)
            .await?
        {
            match restoration.state {
                RestorationState::Deleted => {}
                RestorationState::DeletionRequested => waiting = true,
                _ => {
                    let mut marked = restoration.clone();
                    let old_state = marked.state;
                    marked.state = RestorationState::DeletionRequested;
                    self.store.update_restoration(&marked).await?;
                    self.events
                        .produce_restoration_state_change_event(&marked, old_state)
                        .await;
                    waiting = true;
                }
            }
        }
        Ok(!waiting)
    }

    async fn delete_volume_secrets(&self, installation: &Installation) -> Result<()> {
        let Some(volumes) = &installation.volumes else {
            return Ok(());
        };
        if volumes.is_empty() {
            return Ok(());
        }
        // Bindings are all Deleted by now; their rows still name the
        // clusters the secrets were written into.
        let cluster_installations = self
            .store
            .get_cluster_installations_for_installation(&installation.id)
            .await?;
        for ci in &cluster_installations {
            let Some(cluster) = self.store.get_cluster(&ci.cluster_id).await? else {
                tracing::warn!(
                    ci_id = %ci.id,
                    cluster_id = %ci.cluster_id,
                    "cluster gone; skipping volume secret cleanup"
                );
                continue;
            };
            let provisioner = self.provisioners.for_cluster(&cluster)?;
            let cip = provisioner.cluster_installation_provisioner(&installation.cr_version);
            cip.delete_installation_volume_secrets(&cluster, installation, ci)
                .await?;
        }
        Ok(())
    }

    /// Refresh database metadata, then hibernate every live binding.
    async fn begin_hibernation(&self, installation: &Installation) -> Result<()> {
        let database = self.databases.get(installation.database)?;
        database.refresh_metadata(installation).await?;
        self.rollout(installation, Rollout::Hibernate).await
    }

    /// Batch-lock the live bindings, run the rollout operation against each
    /// with its cluster and CR adapter, flip them to Reconciling, and always
    /// release the batch.
    async fn active_cluster_installations(
        &self,
        installation: &Installation,
    ) -> Result<Vec<ClusterInstallation>> {
        Ok(self
            .store
            .get_cluster_installations_for_installation(&installation.id)
            .await?
            .into_iter()
            .filter(|ci| !ci.is_deleted())
            .collect())
    }

    async fn rollout(&self, installation: &Installation, rollout: Rollout) -> Result<()> {
        let cluster_installations = self.active_cluster_installations(installation).await?;
        if cluster_installations.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = cluster_installations
            .iter()
            .map(|ci| ci.id.clone())
            .collect();
        if !self
            .store
            .lock_cluster_installations(&ids, &self.instance_id)
            .await?
        {
            bail!("cluster installations are locked elsewhere");
        }
        let result = self
            .rollout_locked(installation, &cluster_installations, rollout)
            .await;
        if let Err(err) = self
            .store
            .unlock_cluster_installations(&ids, &self.instance_id, false)
            .await
        {
            tracing::error!(error = %err, installation_id = %installation.id, "failed to unlock cluster installations");
        }
        result
    }

    async fn rollout_locked(
        &self,
        installation: &Installation,
        cluster_installations: &[ClusterInstallation],
        rollout: Rollout,
    ) -> Result<()> {
        for ci in cluster_installations {
            let cluster = self
                .store
                .get_cluster(&ci.cluster_id)
                .await?
                .with_context(|| {
                    format!("cluster {} missing for binding {}", ci.cluster_id, ci.id)
                })?;
            let provisioner = self.provisioners.for_cluster(&cluster)?;
            let cip = provisioner.cluster_installation_provisioner(&installation.cr_version);
            match rollout {
                Rollout::Update => {
                    cip.ensure_cr_migrated(&cluster, installation).await?;
                    cip.update_cluster_installation(&cluster, installation, ci)
                        .await?;
                }
                Rollout::Hibernate => {
                    cip.hibernate_cluster_installation(&cluster, installation, ci)
                        .await?;
                }
            }
            if ci.state != ClusterInstallationState::Reconciling {
                let mut reconciling = ci.clone();
                let old_state = reconciling.state;
                reconciling.state = ClusterInstallationState::Reconciling;
                self.store.update_cluster_installation(&reconciling).await?;
                self.events
                    .produce_cluster_installation_state_change_event(&reconciling, Some(old_state))
                    .await;
            }
        }
        Ok(())
    }

    /// Checks whether every live binding has settled. Ready counts as
    /// settled here; full convergence is the CI supervisor's business.
    async fn poll_cluster_installations(
        &self,
        installation: &Installation,
    ) -> Result<CiPollResult> {
        let cluster_installations = self
            .store
            .get_cluster_installations_for_installation(&installation.id)
            .await?;
        let live: Vec<&ClusterInstallation> = cluster_installations
            .iter()
            .filter(|ci| !ci.is_deleted())
            .collect();
        if live.is_empty() {
            bail!(
                "installation {} has no live cluster installations to poll",
                installation.id
            );
        }
        if live.iter().any(|ci| {
            matches!(
                ci.state,
                ClusterInstallationState::CreationFailed
                    | ClusterInstallationState::DeletionFailed
            )
        }) {
            return Ok(CiPollResult::Failed);
        }
        if live.iter().all(|ci| ci.state.is_stable(true)) {
            Ok(CiPollResult::AllSettled)
        } else {
            Ok(CiPollResult::Waiting)
        }
    }

    /// Upsert one record per live DNS name, pointing at the public load
    /// balancer of every active binding's cluster. The provider call is
    /// idempotent, so this can run on every pass.
    async fn configure_dns(&self, installation: &Installation) -> Result<()> {
        let records = self
            .store
            .get_dns_records_for_installation(&installation.id)
            .await?;
        let names: Vec<String> = records
            .iter()
            .filter(|r| !r.is_deleted())
            .map(|r| r.domain_name.clone())
            .collect();
        if names.is_empty() {
            return Ok(());
        }
        let cluster_installations = self
            .store
            .get_cluster_installations_for_installation(&installation.id)
            .await?;
        let mut endpoints = Vec::new();
        for ci in cluster_installations
            .iter()
            .filter(|ci| ci.is_active && !ci.is_deleted())
        {
            let cluster = self
                .store
                .get_cluster(&ci.cluster_id)
                .await?
                .with_context(|| {
                    format!("cluster {} missing for binding {}", ci.cluster_id, ci.id)
                })?;
            let provisioner = self.provisioners.for_cluster(&cluster)?;
            endpoints.push(
                provisioner
                    .get_public_load_balancer_endpoint(&cluster)
                    .await?,
            );
        }
        if endpoints.is_empty() {
            bail!(
                "installation {} has no active cluster installation endpoints",
                installation.id
            );
        }
        self.dns.create_dns_records(&names, &endpoints).await
    }
}

#[cfg(test)]
mod tests;
