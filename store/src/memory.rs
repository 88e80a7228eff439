//! HashBacked store used by unit tests and `--store memory` local runs. It
//! implements the exact lock and pending-work semantics of the Postgres
//! backend, with rows kept in creation order so priority sorts are stable.

use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;

use anchorage_common::now_millis;
use anchorage_model::*;

use crate::{
    BackupStore, ClusterInstallationStore, ClusterStore, DnsRecordStore, EventStore, GroupStore,
    InstallationStore, MigrationStore, RestorationStore, WebhookStore,
};

#[derive(Default)]
struct Inner {
    clusters: Vec<Cluster>,
    installations: Vec<Installation>,
    groups: Vec<Group>,
    cluster_installations: Vec<ClusterInstallation>,
    backups: Vec<InstallationBackup>,
    restorations: Vec<InstallationDbRestorationOperation>,
    migrations: Vec<InstallationDbMigrationOperation>,
    events: Vec<StateChangeEvent>,
    webhooks: Vec<Webhook>,
    dns_records: Vec<InstallationDnsRecord>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn try_lock(lock_acquired_by: &mut Option<String>, lock_acquired_at: &mut i64, locker: &str) -> bool {
    match lock_acquired_by {
        Some(holder) if holder != locker => false,
        _ => {
            *lock_acquired_by = Some(locker.to_string());
            *lock_acquired_at = now_millis();
            true
        }
    }
}

fn try_unlock(
    lock_acquired_by: &mut Option<String>,
    lock_acquired_at: &mut i64,
    locker: &str,
    force: bool,
) -> bool {
    let held_by_caller = lock_acquired_by.as_deref() == Some(locker);
    if held_by_caller || (force && lock_acquired_by.is_some()) {
        *lock_acquired_by = None;
        *lock_acquired_at = 0;
        true
    } else {
        false
    }
}

/// Stable sort, highest priority first.
fn sort_by_priority<T, F: Fn(&T) -> i64>(items: &mut [T], priority: F) {
    items.sort_by_key(|i| std::cmp::Reverse(priority(i)));
}

macro_rules! find {
    ($vec:expr, $id:expr) => {
        $vec.iter_mut().find(|r| r.id == $id)
    };
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn get_cluster(&self, id: &str) -> Result<Option<Cluster>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.clusters.iter().find(|c| c.id == id).cloned())
    }

    async fn get_clusters(&self) -> Result<Vec<Cluster>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .clusters
            .iter()
            .filter(|c| c.delete_at == 0)
            .cloned()
            .collect())
    }

    async fn get_unlocked_clusters_pending_work(&self) -> Result<Vec<Cluster>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Cluster> = inner
            .clusters
            .iter()
            .filter(|c| c.lock_acquired_at == 0 && ClusterState::PENDING_WORK.contains(&c.state))
            .cloned()
            .collect();
        sort_by_priority(&mut out, |c: &Cluster| c.state.work_priority());
        Ok(out)
    }

    async fn create_cluster(&self, cluster: &Cluster) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.clusters.iter().any(|c| c.id == cluster.id) {
            bail!("cluster {} already exists", cluster.id);
        }
        inner.clusters.push(cluster.clone());
        Ok(())
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match find!(inner.clusters, cluster.id) {
            Some(existing) => {
                // Lock columns are owned by the lock protocol; a record
                // update never touches them (matching the SQL backend).
                let lock_acquired_by = existing.lock_acquired_by.clone();
                let lock_acquired_at = existing.lock_acquired_at;
                *existing = cluster.clone();
                existing.lock_acquired_by = lock_acquired_by;
                existing.lock_acquired_at = lock_acquired_at;
                Ok(())
            }
            None => bail!("cluster {} not found", cluster.id),
        }
    }

    async fn delete_cluster(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match find!(inner.clusters, id) {
            Some(existing) => {
                existing.delete_at = now_millis();
                Ok(())
            }
            None => bail!("cluster {id} not found"),
        }
    }

    async fn lock_cluster(&self, id: &str, locker_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(find!(inner.clusters, id)
            .map(|c| try_lock(&mut c.lock_acquired_by, &mut c.lock_acquired_at, locker_id))
            .unwrap_or(false))
    }

    async fn unlock_cluster(&self, id: &str, locker_id: &str, force: bool) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(find!(inner.clusters, id)
            .map(|c| try_unlock(&mut c.lock_acquired_by, &mut c.lock_acquired_at, locker_id, force))
            .unwrap_or(false))
    }
}

#[async_trait]
impl InstallationStore for InMemoryStore {
    async fn get_installation(&self, id: &str) -> Result<Option<Installation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.installations.iter().find(|i| i.id == id).cloned())
    }

    async fn get_unlocked_installations_pending_work(&self) -> Result<Vec<Installation>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Installation> = inner
            .installations
            .iter()
            .filter(|i| {
                i.lock_acquired_at == 0 && InstallationState::PENDING_WORK.contains(&i.state)
            })
            .cloned()
            .collect();
        sort_by_priority(&mut out, |i: &Installation| i.state.work_priority());
        Ok(out)
    }

    async fn create_installation(&self, installation: &Installation) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.installations.iter().any(|i| i.id == installation.id) {
            bail!("installation {} already exists", installation.id);
        }
        inner.installations.push(installation.clone());
        Ok(())
    }

    async fn update_installation(&self, installation: &Installation) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match find!(inner.installations, installation.id) {
            Some(existing) => {
                // Lock columns are owned by the lock protocol; a record
                // update never touches them (matching the SQL backend).
                let lock_acquired_by = existing.lock_acquired_by.clone();
                let lock_acquired_at = existing.lock_acquired_at;
                *existing = installation.clone();
                existing.lock_acquired_by = lock_acquired_by;
                existing.lock_acquired_at = lock_acquired_at;
                Ok(())
            }
            None => bail!("installation {} not found", installation.id),
        }
    }

    async fn delete_installation(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match find!(inner.installations, id) {
            Some(existing) => {
                existing.delete_at = now_millis();
                Ok(())
            }
            None => bail!("installation {id} not found"),
        }
    }

    async fn lock_installation(&self, id: &str, locker_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(find!(inner.installations, id)
            .map(|i| try_lock(&mut i.lock_acquired_by, &mut i.lock_acquired_at, locker_id))
            .unwrap_or(false))
    }

    async fn unlock_installation(&self, id: &str, locker_id: &str, force: bool) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(find!(inner.installations, id)
            .map(|i| try_unlock(&mut i.lock_acquired_by, &mut i.lock_acquired_at, locker_id, force))
            .unwrap_or(false))
    }
}

#[async_trait]
impl GroupStore for InMemoryStore {
    async fn get_group(&self, id: &str) -> Result<Option<Group>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.groups.iter().find(|g| g.id == id).cloned())
    }

    async fn create_group(&self, group: &Group) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.groups.iter().any(|g| g.id == group.id) {
            bail!("group {} already exists", group.id);
        }
        inner.groups.push(group.clone());
        Ok(())
    }

    async fn update_group(&self, group: &Group) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match find!(inner.groups, group.id) {
            Some(existing) => {
                // Lock columns are owned by the lock protocol; a record
                // update never touches them (matching the SQL backend).
                let lock_acquired_by = existing.lock_acquired_by.clone();
                let lock_acquired_at = existing.lock_acquired_at;
                *existing = group.clone();
                existing.lock_acquired_by = lock_acquired_by;
                existing.lock_acquired_at = lock_acquired_at;
                Ok(())
            }
            None => bail!("group {} not found", group.id),
        }
    }

    async fn lock_group(&self, id: &str, locker_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(find!(inner.groups, id)
            .map(|g| try_lock(&mut g.lock_acquired_by, &mut g.lock_acquired_at, locker_id))
            .unwrap_or(false))
    }

    async fn unlock_group(&self, id: &str, locker_id: &str, force: bool) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(find!(inner.groups, id)
            .map(|g| try_unlock(&mut g.lock_acquired_by, &mut g.lock_acquired_at, locker_id, force))
            .unwrap_or(false))
    }
}

#[async_trait]
impl ClusterInstallationStore for InMemoryStore {
    async fn get_cluster_installation(&self, id: &str) -> Result<Option<ClusterInstallation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .cluster_installations
            .iter()
            .find(|ci| ci.id == id)
            .cloned())
    }

    async fn get_cluster_installations_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<ClusterInstallation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .cluster_installations
            .iter()
            .filter(|ci| ci.installation_id == installation_id)
            .cloned()
            .collect())
    }

    async fn get_cluster_installations_for_cluster(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<ClusterInstallation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .cluster_installations
            .iter()
            .filter(|ci| ci.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    async fn get_unlocked_cluster_installations_pending_work(
        &self,
    ) -> Result<Vec<ClusterInstallation>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<ClusterInstallation> = inner
            .cluster_installations
            .iter()
            .filter(|ci| {
                ci.lock_acquired_at == 0
                    && ClusterInstallationState::PENDING_WORK.contains(&ci.state)
            })
            .cloned()
            .collect();
        sort_by_priority(&mut out, |ci: &ClusterInstallation| ci.state.work_priority());
        Ok(out)
    }

    async fn create_cluster_installation(&self, ci: &ClusterInstallation) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.cluster_installations.iter().any(|c| c.id == ci.id) {
            bail!("cluster installation {} already exists", ci.id);
        }
        inner.cluster_installations.push(ci.clone());
        Ok(())
    }

    async fn update_cluster_installation(&self, ci: &ClusterInstallation) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match find!(inner.cluster_installations, ci.id) {
            Some(existing) => {
                // Lock columns are owned by the lock protocol; a record
                // update never touches them (matching the SQL backend).
                let lock_acquired_by = existing.lock_acquired_by.clone();
                let lock_acquired_at = existing.lock_acquired_at;
                *existing = ci.clone();
                existing.lock_acquired_by = lock_acquired_by;
                existing.lock_acquired_at = lock_acquired_at;
                Ok(())
            }
            None => bail!("cluster installation {} not found", ci.id),
        }
    }

    async fn lock_cluster_installation(&self, id: &str, locker_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(find!(inner.cluster_installations, id)
            .map(|ci| try_lock(&mut ci.lock_acquired_by, &mut ci.lock_acquired_at, locker_id))
            .unwrap_or(false))
    }

    async fn unlock_cluster_installation(
        &self,
        id: &str,
        locker_id: &str,
        force: bool,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(find!(inner.cluster_installations, id)
            .map(|ci| {
                try_unlock(&mut ci.lock_acquired_by, &mut ci.lock_acquired_at, locker_id, force)
            })
            .unwrap_or(false))
    }

    async fn lock_cluster_installations(&self, ids: &[String], locker_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        // All-or-nothing: verify every row is currently lockable before
        // touching any of them.
        let lockable = ids.iter().all(|id| {
            inner
                .cluster_installations
                .iter()
                .find(|ci| &ci.id == id)
                .map(|ci| {
                    ci.lock_acquired_by.is_none()
                        || ci.lock_acquired_by.as_deref() == Some(locker_id)
                })
                .unwrap_or(false)
        });
        if !lockable {
            return Ok(false);
        }
        for id in ids {
            if let Some(ci) = find!(inner.cluster_installations, *id) {
                try_lock(&mut ci.lock_acquired_by, &mut ci.lock_acquired_at, locker_id);
            }
        }
        Ok(true)
    }

    async fn unlock_cluster_installations(
        &self,
        ids: &[String],
        locker_id: &str,
        force: bool,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let mut all = true;
        for id in ids {
            let ok = find!(inner.cluster_installations, *id)
                .map(|ci| {
                    try_unlock(&mut ci.lock_acquired_by, &mut ci.lock_acquired_at, locker_id, force)
                })
                .unwrap_or(false);
            all = all && ok;
        }
        Ok(all)
    }
}

#[async_trait]
impl BackupStore for InMemoryStore {
    async fn get_backup(&self, id: &str) -> Result<Option<InstallationBackup>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.backups.iter().find(|b| b.id == id).cloned())
    }

    async fn get_backups_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<InstallationBackup>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .backups
            .iter()
            .filter(|b| b.installation_id == installation_id && b.delete_at == 0)
            .cloned()
            .collect())
    }

    async fn get_active_backups_for_cluster_installation(
        &self,
        cluster_installation_id: &str,
    ) -> Result<Vec<InstallationBackup>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .backups
            .iter()
            .filter(|b| b.cluster_installation_id == cluster_installation_id && b.is_active())
            .cloned()
            .collect())
    }

    async fn get_unlocked_backups_pending_work(&self) -> Result<Vec<InstallationBackup>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<InstallationBackup> = inner
            .backups
            .iter()
            .filter(|b| b.lock_acquired_at == 0 && BackupState::PENDING_WORK.contains(&b.state))
            .cloned()
            .collect();
        sort_by_priority(&mut out, |b: &InstallationBackup| b.state.work_priority());
        Ok(out)
    }

    async fn create_backup(&self, backup: &InstallationBackup) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.backups.iter().any(|b| b.id == backup.id) {
            bail!("backup {} already exists", backup.id);
        }
        inner.backups.push(backup.clone());
        Ok(())
    }

    async fn update_backup(&self, backup: &InstallationBackup) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match find!(inner.backups, backup.id) {
            Some(existing) => {
                // Lock columns are owned by the lock protocol; a record
                // update never touches them (matching the SQL backend).
                let lock_acquired_by = existing.lock_acquired_by.clone();
                let lock_acquired_at = existing.lock_acquired_at;
                *existing = backup.clone();
                existing.lock_acquired_by = lock_acquired_by;
                existing.lock_acquired_at = lock_acquired_at;
                Ok(())
            }
            None => bail!("backup {} not found", backup.id),
        }
    }

    async fn delete_backup(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match find!(inner.backups, id) {
            Some(existing) => {
                existing.delete_at = now_millis();
                Ok(())
            }
            None => bail!("backup {id} not found"),
        }
    }

    async fn lock_backup(&self, id: &str, locker_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(find!(inner.backups, id)
            .map(|b| try_lock(&mut b.lock_acquired_by, &mut b.lock_acquired_at, locker_id))
            .unwrap_or(false))
    }

    async fn unlock_backup(&self, id: &str, locker_id: &str, force: bool) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(find!(inner.backups, id)
            .map(|b| try_unlock(&mut b.lock_acquired_by, &mut b.lock_acquired_at, locker_id, force))
            .unwrap_or(false))
    }
}

#[async_trait]
impl RestorationStore for InMemoryStore {
    async fn get_restoration(
        &self,
        id: &str,
    ) -> Result<Option<InstallationDbRestorationOperation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.restorations.iter().find(|r| r.id == id).cloned())
    }

    async fn get_restorations_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<InstallationDbRestorationOperation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .restorations
            .iter()
            .filter(|r| r.installation_id == installation_id && r.delete_at == 0)
            .cloned()
            .collect())
    }

    async fn get_unlocked_restorations_pending_work(
        &self,
    ) -> Result<Vec<InstallationDbRestorationOperation>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<InstallationDbRestorationOperation> = inner
            .restorations
            .iter()
            .filter(|r| {
                r.lock_acquired_at == 0 && RestorationState::PENDING_WORK.contains(&r.state)
            })
            .cloned()
            .collect();
        sort_by_priority(&mut out, |r: &InstallationDbRestorationOperation| {
            r.state.work_priority()
        });
        Ok(out)
    }

    async fn create_restoration(&self, op: &InstallationDbRestorationOperation) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.restorations.iter().any(|r| r.id == op.id) {
            bail!("restoration {} already exists", op.id);
        }
        inner.restorations.push(op.clone());
        Ok(())
    }

    async fn update_restoration(&self, op: &InstallationDbRestorationOperation) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match find!(inner.restorations, op.id) {
            Some(existing) => {
                // Lock columns are owned by the lock protocol; a record
                // update never touches them (matching the SQL backend).
                let lock_acquired_by = existing.lock_acquired_by.clone();
                let lock_acquired_at = existing.lock_acquired_at;
                *existing = op.clone();
                existing.lock_acquired_by = lock_acquired_by;
                existing.lock_acquired_at = lock_acquired_at;
                Ok(())
            }
            None => bail!("restoration {} not found", op.id),
        }
    }

    async fn delete_restoration(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match find!(inner.restorations, id) {
            Some(existing) => {
                existing.delete_at = now_millis();
                Ok(())
            }
            None => bail!("restoration {id} not found"),
        }
    }

    async fn lock_restoration(&self, id: &str, locker_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(find!(inner.restorations, id)
            .map(|r| try_lock(&mut r.lock_acquired_by, &mut r.lock_acquired_at, locker_id))
            .unwrap_or(false))
    }

    async fn unlock_restoration(&self, id: &str, locker_id: &str, force: bool) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(find!(inner.restorations, id)
            .map(|r| try_unlock(&mut r.lock_acquired_by, &mut r.lock_acquired_at, locker_id, force))
            .unwrap_or(false))
    }
}

#[async_trait]
impl MigrationStore for InMemoryStore {
    async fn get_migration(&self, id: &str) -> Result<Option<InstallationDbMigrationOperation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.migrations.iter().find(|m| m.id == id).cloned())
    }

    async fn get_migrations_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<InstallationDbMigrationOperation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .migrations
            .iter()
            .filter(|m| m.installation_id == installation_id && m.delete_at == 0)
            .cloned()
            .collect())
    }

    async fn get_unlocked_migrations_pending_work(
        &self,
    ) -> Result<Vec<InstallationDbMigrationOperation>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<InstallationDbMigrationOperation> = inner
            .migrations
            .iter()
            .filter(|m| m.lock_acquired_at == 0 && MigrationState::PENDING_WORK.contains(&m.state))
            .cloned()
            .collect();
        sort_by_priority(&mut out, |m: &InstallationDbMigrationOperation| {
            m.state.work_priority()
        });
        Ok(out)
    }

    async fn create_migration(&self, op: &InstallationDbMigrationOperation) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.migrations.iter().any(|m| m.id == op.id) {
            bail!("migration {} already exists", op.id);
        }
        inner.migrations.push(op.clone());
        Ok(())
    }

    async fn update_migration(&self, op: &InstallationDbMigrationOperation) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match find!(inner.migrations, op.id) {
            Some(existing) => {
                // Lock columns are owned by the lock protocol; a record
                // update never touches them (matching the SQL backend).
                let lock_acquired_by = existing.lock_acquired_by.clone();
                let lock_acquired_at = existing.lock_acquired_at;
                *existing = op.clone();
                existing.lock_acquired_by = lock_acquired_by;
                existing.lock_acquired_at = lock_acquired_at;
                Ok(())
            }
            None => bail!("migration {} not found", op.id),
        }
    }

    async fn delete_migration(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match find!(inner.migrations, id) {
            Some(existing) => {
                existing.delete_at = now_millis();
                Ok(())
            }
            None => bail!("migration {id} not found"),
        }
    }

    async fn lock_migration(&self, id: &str, locker_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(find!(inner.migrations, id)
            .map(|m| try_lock(&mut m.lock_acquired_by, &mut m.lock_acquired_at, locker_id))
            .unwrap_or(false))
    }

    async fn unlock_migration(&self, id: &str, locker_id: &str, force: bool) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(find!(inner.migrations, id)
            .map(|m| try_unlock(&mut m.lock_acquired_by, &mut m.lock_acquired_at, locker_id, force))
            .unwrap_or(false))
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn create_state_change_event(&self, event: &StateChangeEvent) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.events.push(event.clone());
        Ok(())
    }

    async fn get_state_change_events(
        &self,
        filter: &StateChangeEventFilter,
    ) -> Result<Vec<StateChangeEvent>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<StateChangeEvent> = inner
            .events
            .iter()
            .filter(|e| {
                filter
                    .resource_id
                    .as_ref()
                    .is_none_or(|id| &e.resource_id == id)
                    && filter
                        .resource_type
                        .as_ref()
                        .is_none_or(|t| &e.resource_type == t)
                    && (filter.new_states.is_empty()
                        || filter.new_states.contains(&e.new_state))
            })
            .cloned()
            .collect();
        out.reverse(); // append-only log, so reverse insertion order is newest-first
        if filter.max_results > 0 {
            out.truncate(filter.max_results);
        }
        Ok(out)
    }
}

#[async_trait]
impl WebhookStore for InMemoryStore {
    async fn get_webhooks(&self) -> Result<Vec<Webhook>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .webhooks
            .iter()
            .filter(|w| !w.is_deleted())
            .cloned()
            .collect())
    }

    async fn create_webhook(&self, webhook: &Webhook) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.webhooks.push(webhook.clone());
        Ok(())
    }
}

#[async_trait]
impl DnsRecordStore for InMemoryStore {
    async fn get_dns_records_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<InstallationDnsRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .dns_records
            .iter()
            .filter(|r| r.installation_id == installation_id)
            .cloned()
            .collect())
    }

    async fn create_dns_record(&self, record: &InstallationDnsRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.dns_records.push(record.clone());
        Ok(())
    }

    async fn delete_dns_record(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.dns_records.retain(|r| r.id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(id: &str, state: ClusterState) -> Cluster {
        Cluster {
            id: id.to_string(),
            state,
            provisioner: ProvisionerKind::Kops,
            provisioner_metadata: ProvisionerMetadata::Kops(KopsMetadata::default()),
            allow_installations: true,
            annotations: vec![],
            has_aws_infrastructure: true,
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        }
    }

    #[tokio::test]
    async fn lock_is_exclusive_and_reentrant_for_the_holder() {
        let store = InMemoryStore::new();
        store
            .create_cluster(&cluster("c1", ClusterState::Stable))
            .await
            .unwrap();

        assert!(store.lock_cluster("c1", "a").await.unwrap());
        assert!(!store.lock_cluster("c1", "b").await.unwrap());
        assert!(store.lock_cluster("c1", "a").await.unwrap());

        // Non-holder unlock is a no-op unless forced.
        assert!(!store.unlock_cluster("c1", "b", false).await.unwrap());
        assert!(store.unlock_cluster("c1", "b", true).await.unwrap());
        assert!(store.lock_cluster("c1", "b").await.unwrap());
    }

    #[tokio::test]
    async fn pending_work_excludes_locked_and_settled_rows() {
        let store = InMemoryStore::new();
        store
            .create_cluster(&cluster("stable", ClusterState::Stable))
            .await
            .unwrap();
        store
            .create_cluster(&cluster("requested", ClusterState::CreationRequested))
            .await
            .unwrap();
        store
            .create_cluster(&cluster("locked", ClusterState::CreationRequested))
            .await
            .unwrap();
        store.lock_cluster("locked", "holder").await.unwrap();

        let work = store.get_unlocked_clusters_pending_work().await.unwrap();
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].id, "requested");
    }

    #[tokio::test]
    async fn pending_work_orders_by_priority() {
        let store = InMemoryStore::new();
        store
            .create_cluster(&cluster("new", ClusterState::CreationRequested))
            .await
            .unwrap();
        store
            .create_cluster(&cluster("inflight", ClusterState::ProvisionInProgress))
            .await
            .unwrap();

        let work = store.get_unlocked_clusters_pending_work().await.unwrap();
        assert_eq!(work[0].id, "inflight");
        assert_eq!(work[1].id, "new");
    }

    #[tokio::test]
    async fn batched_ci_lock_is_all_or_nothing() {
        let store = InMemoryStore::new();
        for id in ["ci1", "ci2"] {
            store
                .create_cluster_installation(&ClusterInstallation {
                    id: id.to_string(),
                    cluster_id: "c1".to_string(),
                    installation_id: "i1".to_string(),
                    namespace: "ns".to_string(),
                    is_active: true,
                    state: ClusterInstallationState::Stable,
                    create_at: now_millis(),
                    delete_at: 0,
                    lock_acquired_by: None,
                    lock_acquired_at: 0,
                })
                .await
                .unwrap();
        }
        store
            .lock_cluster_installation("ci2", "other")
            .await
            .unwrap();

        let ids = vec!["ci1".to_string(), "ci2".to_string()];
        assert!(!store.lock_cluster_installations(&ids, "me").await.unwrap());
        // ci1 must not have been left locked by the failed batch.
        let ci1 = store.get_cluster_installation("ci1").await.unwrap().unwrap();
        assert_eq!(ci1.lock_acquired_at, 0);
    }

    #[tokio::test]
    async fn events_come_back_newest_first() {
        let store = InMemoryStore::new();
        for (n, new_state) in ["a", "b", "c"].iter().enumerate() {
            store
                .create_state_change_event(&StateChangeEvent {
                    id: format!("e{n}"),
                    resource_id: "r1".to_string(),
                    resource_type: "cluster".to_string(),
                    old_state: "x".to_string(),
                    new_state: new_state.to_string(),
                    timestamp: n as i64,
                })
                .await
                .unwrap();
        }
        let events = store
            .get_state_change_events(&StateChangeEventFilter {
                resource_id: Some("r1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events[0].new_state, "c");
        assert_eq!(events[2].new_state, "a");
    }
}
