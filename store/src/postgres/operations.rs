use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::Row;

use anchorage_model::{
    BackupState, InstallationBackup, InstallationDbMigrationOperation,
    InstallationDbRestorationOperation, MigrationState, RestorationState,
};

use crate::{BackupStore, MigrationStore, RestorationStore};

use super::{PostgresStore, parse_state, parse_tag, sort_by_priority};

const BACKUP_COLUMNS: &str = "id, installation_id, cluster_installation_id, data_residence, \
                              state, start_at, create_at, delete_at, lock_acquired_by, \
                              lock_acquired_at";

fn backup_from_row(row: &Row) -> Result<InstallationBackup> {
    let state: String = row.get("state");
    let residence: Option<serde_json::Value> = row.get("data_residence");
    Ok(InstallationBackup {
        id: row.get("id"),
        installation_id: row.get("installation_id"),
        cluster_installation_id: row.get("cluster_installation_id"),
        data_residence: residence
            .map(serde_json::from_value)
            .transpose()
            .context("failed to decode data residence")?,
        state: parse_state(&state, "backup")?,
        start_at: row.get("start_at"),
        create_at: row.get("create_at"),
        delete_at: row.get("delete_at"),
        lock_acquired_by: row.get("lock_acquired_by"),
        lock_acquired_at: row.get("lock_acquired_at"),
    })
}

#[async_trait]
impl BackupStore for PostgresStore {
    async fn get_backup(&self, id: &str) -> Result<Option<InstallationBackup>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let row = client
            .query_opt(
                &format!("SELECT {BACKUP_COLUMNS} FROM installation_backups WHERE id = $1"),
                &[&id],
            )
            .await
            .context("failed to query backup")?;
        row.as_ref().map(backup_from_row).transpose()
    }

    async fn get_backups_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<InstallationBackup>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let rows = client
            .query(
                &format!(
                    "SELECT {BACKUP_COLUMNS} FROM installation_backups \
                     WHERE installation_id = $1 AND delete_at = 0 \
                     ORDER BY create_at"
                ),
                &[&installation_id],
            )
            .await
            .context("failed to query backups for installation")?;
        rows.iter().map(backup_from_row).collect()
    }

    async fn get_active_backups_for_cluster_installation(
        &self,
        cluster_installation_id: &str,
    ) -> Result<Vec<InstallationBackup>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let active = vec![
            BackupState::BackupRequested.as_str(),
            BackupState::BackupInProgress.as_str(),
        ];
        let rows = client
            .query(
                &format!(
                    "SELECT {BACKUP_COLUMNS} FROM installation_backups \
                     WHERE cluster_installation_id = $1 AND state = ANY($2)"
                ),
                &[&cluster_installation_id, &active],
            )
            .await
            .context("failed to query active backups")?;
        rows.iter().map(backup_from_row).collect()
    }

    async fn get_unlocked_backups_pending_work(&self) -> Result<Vec<InstallationBackup>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let states: Vec<&str> = BackupState::PENDING_WORK.iter().map(|s| s.as_str()).collect();
        let rows = client
            .query(
                &format!(
                    "SELECT {BACKUP_COLUMNS} FROM installation_backups \
                     WHERE lock_acquired_at = 0 AND state = ANY($1) \
                     ORDER BY create_at"
                ),
                &[&states],
            )
            .await
            .context("failed to query backups pending work")?;
        let mut out: Vec<InstallationBackup> =
            rows.iter().map(backup_from_row).collect::<Result<_>>()?;
        sort_by_priority(&mut out, |b: &InstallationBackup| b.state.work_priority());
        Ok(out)
    }

    async fn create_backup(&self, backup: &InstallationBackup) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let residence = backup
            .data_residence
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("failed to encode data residence")?;
        client
            .execute(
                r#"
                INSERT INTO installation_backups (id, installation_id, cluster_installation_id,
                    data_residence, state, start_at, create_at, delete_at,
                    lock_acquired_by, lock_acquired_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
                &[
                    &backup.id,
                    &backup.installation_id,
                    &backup.cluster_installation_id,
                    &residence,
                    &backup.state.as_str(),
                    &backup.start_at,
                    &backup.create_at,
                    &backup.delete_at,
                    &backup.lock_acquired_by,
                    &backup.lock_acquired_at,
                ],
            )
            .await
            .context("failed to insert backup")?;
        Ok(())
    }

    async fn update_backup(&self, backup: &InstallationBackup) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let residence = backup
            .data_residence
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("failed to encode data residence")?;
        client
            .execute(
                r#"
                UPDATE installation_backups
                SET cluster_installation_id = $2, data_residence = $3, state = $4,
                    start_at = $5, delete_at = $6
                WHERE id = $1
                "#,
                &[
                    &backup.id,
                    &backup.cluster_installation_id,
                    &residence,
                    &backup.state.as_str(),
                    &backup.start_at,
                    &backup.delete_at,
                ],
            )
            .await
            .context("failed to update backup")?;
        Ok(())
    }

    async fn delete_backup(&self, id: &str) -> Result<()> {
        self.tombstone_row("installation_backups", id).await
    }

    async fn lock_backup(&self, id: &str, locker_id: &str) -> Result<bool> {
        self.lock_row("installation_backups", id, locker_id).await
    }

    async fn unlock_backup(&self, id: &str, locker_id: &str, force: bool) -> Result<bool> {
        self.unlock_row("installation_backups", id, locker_id, force)
            .await
    }
}

const RESTORATION_COLUMNS: &str = "id, installation_id, backup_id, cluster_installation_id, \
                                   target_installation_state, complete_at, state, create_at, \
                                   delete_at, lock_acquired_by, lock_acquired_at";

fn restoration_from_row(row: &Row) -> Result<InstallationDbRestorationOperation> {
    let state: String = row.get("state");
    let target: String = row.get("target_installation_state");
    Ok(InstallationDbRestorationOperation {
        id: row.get("id"),
        installation_id: row.get("installation_id"),
        backup_id: row.get("backup_id"),
        cluster_installation_id: row.get("cluster_installation_id"),
        target_installation_state: parse_state(&target, "installation")?,
        complete_at: row.get("complete_at"),
        state: parse_state(&state, "restoration")?,
        create_at: row.get("create_at"),
        delete_at: row.get("delete_at"),
        lock_acquired_by: row.get("lock_acquired_by"),
        lock_acquired_at: row.get("lock_acquired_at"),
    })
}

#[async_trait]
impl RestorationStore for PostgresStore {
    async fn get_restoration(
        &self,
        id: &str,
    ) -> Result<Option<InstallationDbRestorationOperation>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {RESTORATION_COLUMNS} FROM installation_db_restoration_operations \
                     WHERE id = $1"
                ),
                &[&id],
            )
            .await
            .context("failed to query restoration")?;
        row.as_ref().map(restoration_from_row).transpose()
    }

    async fn get_restorations_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<InstallationDbRestorationOperation>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let rows = client
            .query(
                &format!(
                    "SELECT {RESTORATION_COLUMNS} FROM installation_db_restoration_operations \
                     WHERE installation_id = $1 AND delete_at = 0 \
                     ORDER BY create_at"
                ),
                &[&installation_id],
            )
            .await
            .context("failed to query restorations for installation")?;
        rows.iter().map(restoration_from_row).collect()
    }

    async fn get_unlocked_restorations_pending_work(
        &self,
    ) -> Result<Vec<InstallationDbRestorationOperation>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let states: Vec<&str> = RestorationState::PENDING_WORK
            .iter()
            .map(|s| s.as_str())
            .collect();
        let rows = client
            .query(
                &format!(
                    "SELECT {RESTORATION_COLUMNS} FROM installation_db_restoration_operations \
                     WHERE lock_acquired_at = 0 AND state = ANY($1) \
                     ORDER BY create_at"
                ),
                &[&states],
            )
            .await
            .context("failed to query restorations pending work")?;
        let mut out: Vec<InstallationDbRestorationOperation> =
            rows.iter().map(restoration_from_row).collect::<Result<_>>()?;
        sort_by_priority(&mut out, |r: &InstallationDbRestorationOperation| {
            r.state.work_priority()
        });
        Ok(out)
    }

    async fn create_restoration(&self, op: &InstallationDbRestorationOperation) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        client
            .execute(
                r#"
                INSERT INTO installation_db_restoration_operations (id, installation_id,
                    backup_id, cluster_installation_id, target_installation_state, complete_at,
                    state, create_at, delete_at, lock_acquired_by, lock_acquired_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
                &[
                    &op.id,
                    &op.installation_id,
                    &op.backup_id,
                    &op.cluster_installation_id,
                    &op.target_installation_state.as_str(),
                    &op.complete_at,
                    &op.state.as_str(),
                    &op.create_at,
                    &op.delete_at,
                    &op.lock_acquired_by,
                    &op.lock_acquired_at,
                ],
            )
            .await
            .context("failed to insert restoration")?;
        Ok(())
    }

    async fn update_restoration(&self, op: &InstallationDbRestorationOperation) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        client
            .execute(
                r#"
                UPDATE installation_db_restoration_operations
                SET backup_id = $2, cluster_installation_id = $3,
                    target_installation_state = $4, complete_at = $5, state = $6,
                    delete_at = $7
                WHERE id = $1
                "#,
                &[
                    &op.id,
                    &op.backup_id,
                    &op.cluster_installation_id,
                    &op.target_installation_state.as_str(),
                    &op.complete_at,
                    &op.state.as_str(),
                    &op.delete_at,
                ],
            )
            .await
            .context("failed to update restoration")?;
        Ok(())
    }

    async fn delete_restoration(&self, id: &str) -> Result<()> {
        self.tombstone_row("installation_db_restoration_operations", id)
            .await
    }

    async fn lock_restoration(&self, id: &str, locker_id: &str) -> Result<bool> {
        self.lock_row("installation_db_restoration_operations", id, locker_id)
            .await
    }

    async fn unlock_restoration(&self, id: &str, locker_id: &str, force: bool) -> Result<bool> {
        self.unlock_row("installation_db_restoration_operations", id, locker_id, force)
            .await
    }
}

const MIGRATION_COLUMNS: &str = "id, installation_id, source_database, destination_database, \
                                 backup_id, installation_db_restoration_operation_id, \
                                 complete_at, state, create_at, delete_at, lock_acquired_by, \
                                 lock_acquired_at";

fn migration_from_row(row: &Row) -> Result<InstallationDbMigrationOperation> {
    let state: String = row.get("state");
    let source: String = row.get("source_database");
    let destination: String = row.get("destination_database");
    Ok(InstallationDbMigrationOperation {
        id: row.get("id"),
        installation_id: row.get("installation_id"),
        source_database: parse_tag(&source, "database")?,
        destination_database: parse_tag(&destination, "database")?,
        backup_id: row.get("backup_id"),
        installation_db_restoration_operation_id: row
            .get("installation_db_restoration_operation_id"),
        complete_at: row.get("complete_at"),
        state: parse_state(&state, "migration")?,
        create_at: row.get("create_at"),
        delete_at: row.get("delete_at"),
        lock_acquired_by: row.get("lock_acquired_by"),
        lock_acquired_at: row.get("lock_acquired_at"),
    })
}

#[async_trait]
impl MigrationStore for PostgresStore {
    async fn get_migration(&self, id: &str) -> Result<Option<InstallationDbMigrationOperation>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {MIGRATION_COLUMNS} FROM installation_db_migration_operations \
                     WHERE id = $1"
                ),
                &[&id],
            )
            .await
            .context("failed to query migration")?;
        row.as_ref().map(migration_from_row).transpose()
    }

    async fn get_migrations_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<InstallationDbMigrationOperation>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let rows = client
            .query(
                &format!(
                    "SELECT {MIGRATION_COLUMNS} FROM installation_db_migration_operations \
                     WHERE installation_id = $1 AND delete_at = 0 \
                     ORDER BY create_at"
                ),
                &[&installation_id],
            )
            .await
            .context("failed to query migrations for installation")?;
        rows.iter().map(migration_from_row).collect()
    }

    async fn get_unlocked_migrations_pending_work(
        &self,
    ) -> Result<Vec<InstallationDbMigrationOperation>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let states: Vec<&str> = MigrationState::PENDING_WORK
            .iter()
            .map(|s| s.as_str())
            .collect();
        let rows = client
            .query(
                &format!(
                    "SELECT {MIGRATION_COLUMNS} FROM installation_db_migration_operations \
                     WHERE lock_acquired_at = 0 AND state = ANY($1) \
                     ORDER BY create_at"
                ),
                &[&states],
            )
            .await
            .context("failed to query migrations pending work")?;
        let mut out: Vec<InstallationDbMigrationOperation> =
            rows.iter().map(migration_from_row).collect::<Result<_>>()?;
        sort_by_priority(&mut out, |m: &InstallationDbMigrationOperation| {
            m.state.work_priority()
        });
        Ok(out)
    }

    async fn create_migration(&self, op: &InstallationDbMigrationOperation) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        client
            .execute(
                r#"
                INSERT INTO installation_db_migration_operations (id, installation_id,
                    source_database, destination_database, backup_id,
                    installation_db_restoration_operation_id, complete_at, state, create_at,
                    delete_at, lock_acquired_by, lock_acquired_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
                &[
                    &op.id,
                    &op.installation_id,
                    &op.source_database.as_str(),
                    &op.destination_database.as_str(),
                    &op.backup_id,
                    &op.installation_db_restoration_operation_id,
                    &op.complete_at,
                    &op.state.as_str(),
                    &op.create_at,
                    &op.delete_at,
                    &op.lock_acquired_by,
                    &op.lock_acquired_at,
                ],
            )
            .await
            .context("failed to insert migration")?;
        Ok(())
    }

    async fn update_migration(&self, op: &InstallationDbMigrationOperation) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        client
            .execute(
                r#"
                UPDATE installation_db_migration_operations
                SET backup_id = $2, installation_db_restoration_operation_id = $3,
                    complete_at = $4, state = $5, delete_at = $6
                WHERE id = $1
                "#,
                &[
                    &op.id,
                    &op.backup_id,
                    &op.installation_db_restoration_operation_id,
                    &op.complete_at,
                    &op.state.as_str(),
                    &op.delete_at,
                ],
            )
            .await
            .context("failed to update migration")?;
        Ok(())
    }

    async fn delete_migration(&self, id: &str) -> Result<()> {
        self.tombstone_row("installation_db_migration_operations", id)
            .await
    }

    async fn lock_migration(&self, id: &str, locker_id: &str) -> Result<bool> {
        self.lock_row("installation_db_migration_operations", id, locker_id)
            .await
    }

    async fn unlock_migration(&self, id: &str, locker_id: &str, force: bool) -> Result<bool> {
        self.unlock_row("installation_db_migration_operations", id, locker_id, force)
            .await
    }
}
