use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::Row;

use anchorage_model::{Group, Installation, InstallationState};

use crate::{GroupStore, InstallationStore};

use super::{PostgresStore, parse_state, parse_tag, sort_by_priority};

const COLUMNS: &str = "id, owner_id, version, cr_version, size, affinity, database_kind, \
                       filestore_kind, group_id, group_sequence, annotations, \
                       requires_aws_infrastructure, keep_database_data, keep_filestore_data, \
                       volumes, state, create_at, delete_at, \
                       lock_acquired_by, lock_acquired_at";

fn installation_from_row(row: &Row) -> Result<Installation> {
    let size: String = row.get("size");
    let affinity: String = row.get("affinity");
    let database: String = row.get("database_kind");
    let filestore: String = row.get("filestore_kind");
    let state: String = row.get("state");
    let volumes: Option<serde_json::Value> = row.get("volumes");
    Ok(Installation {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        version: row.get("version"),
        cr_version: row.get("cr_version"),
        size: parse_tag(&size, "installation size")?,
        affinity: parse_tag(&affinity, "affinity")?,
        database: parse_tag(&database, "database")?,
        filestore: parse_tag(&filestore, "filestore")?,
        group_id: row.get("group_id"),
        group_sequence: row.get("group_sequence"),
        annotations: row.get("annotations"),
        requires_aws_infrastructure: row.get("requires_aws_infrastructure"),
        keep_database_data: row.get("keep_database_data"),
        keep_filestore_data: row.get("keep_filestore_data"),
        volumes: volumes
            .map(serde_json::from_value)
            .transpose()
            .context("failed to decode volumes")?,
        state: parse_state(&state, "installation")?,
        create_at: row.get("create_at"),
        delete_at: row.get("delete_at"),
        lock_acquired_by: row.get("lock_acquired_by"),
        lock_acquired_at: row.get("lock_acquired_at"),
    })
}

#[async_trait]
impl InstallationStore for PostgresStore {
    async fn get_installation(&self, id: &str) -> Result<Option<Installation>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let row = client
            .query_opt(
                &format!("SELECT {COLUMNS} FROM installations WHERE id = $1"),
                &[&id],
            )
            .await
            .context("failed to query installation")?;
        row.as_ref().map(installation_from_row).transpose()
    }

    async fn get_unlocked_installations_pending_work(&self) -> Result<Vec<Installation>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let states: Vec<&str> = InstallationState::PENDING_WORK
            .iter()
            .map(|s| s.as_str())
            .collect();
        let rows = client
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM installations \
                     WHERE lock_acquired_at = 0 AND state = ANY($1) \
                     ORDER BY create_at"
                ),
                &[&states],
            )
            .await
            .context("failed to query installations pending work")?;
        let mut out: Vec<Installation> =
            rows.iter().map(installation_from_row).collect::<Result<_>>()?;
        sort_by_priority(&mut out, |i: &Installation| i.state.work_priority());
        Ok(out)
    }

    async fn create_installation(&self, installation: &Installation) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let volumes = installation
            .volumes
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("failed to encode volumes")?;
        client
            .execute(
                r#"
                INSERT INTO installations (id, owner_id, version, cr_version, size, affinity,
                    database_kind, filestore_kind, group_id, group_sequence, annotations,
                    requires_aws_infrastructure, keep_database_data, keep_filestore_data,
                    volumes, state, create_at, delete_at,
                    lock_acquired_by, lock_acquired_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20)
                "#,
                &[
                    &installation.id,
                    &installation.owner_id,
                    &installation.version,
                    &installation.cr_version,
                    &installation.size.as_str(),
                    &installation.affinity.as_str(),
                    &installation.database.as_str(),
                    &installation.filestore.as_str(),
                    &installation.group_id,
                    &installation.group_sequence,
                    &installation.annotations,
                    &installation.requires_aws_infrastructure,
                    &installation.keep_database_data,
                    &installation.keep_filestore_data,
                    &volumes,
                    &installation.state.as_str(),
                    &installation.create_at,
                    &installation.delete_at,
                    &installation.lock_acquired_by,
                    &installation.lock_acquired_at,
                ],
            )
            .await
            .context("failed to insert installation")?;
        Ok(())
    }

    async fn update_installation(&self, installation: &Installation) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let volumes = installation
            .volumes
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("failed to encode volumes")?;
        client
            .execute(
                r#"
                UPDATE installations
                SET owner_id = $2, version = $3, cr_version = $4, size = $5, affinity = $6,
                    database_kind = $7, filestore_kind = $8, group_id = $9,
                    group_sequence = $10, annotations = $11,
                    requires_aws_infrastructure = $12, keep_database_data = $13,
                    keep_filestore_data = $14, volumes = $15, state = $16,
                    delete_at = $17
                WHERE id = $1
                "#,
                &[
                    &installation.id,
                    &installation.owner_id,
                    &installation.version,
                    &installation.cr_version,
                    &installation.size.as_str(),
                    &installation.affinity.as_str(),
                    &installation.database.as_str(),
                    &installation.filestore.as_str(),
                    &installation.group_id,
                    &installation.group_sequence,
                    &installation.annotations,
                    &installation.requires_aws_infrastructure,
                    &installation.keep_database_data,
                    &installation.keep_filestore_data,
                    &volumes,
                    &installation.state.as_str(),
                    &installation.delete_at,
                ],
            )
            .await
            .context("failed to update installation")?;
        Ok(())
    }

    async fn delete_installation(&self, id: &str) -> Result<()> {
        self.tombstone_row("installations", id).await
    }

    async fn lock_installation(&self, id: &str, locker_id: &str) -> Result<bool> {
        self.lock_row("installations", id, locker_id).await
    }

    async fn unlock_installation(&self, id: &str, locker_id: &str, force: bool) -> Result<bool> {
        self.unlock_row("installations", id, locker_id, force).await
    }
}

fn group_from_row(row: &Row) -> Result<Group> {
    let env: serde_json::Value = row.get("env_overrides");
    let env_overrides: BTreeMap<String, String> =
        serde_json::from_value(env).context("failed to decode group env overrides")?;
    Ok(Group {
        id: row.get("id"),
        name: row.get("name"),
        sequence: row.get("sequence"),
        version: row.get("version"),
        env_overrides,
        create_at: row.get("create_at"),
        delete_at: row.get("delete_at"),
        lock_acquired_by: row.get("lock_acquired_by"),
        lock_acquired_at: row.get("lock_acquired_at"),
    })
}

#[async_trait]
impl GroupStore for PostgresStore {
    async fn get_group(&self, id: &str) -> Result<Option<Group>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let row = client
            .query_opt(
                r#"
                SELECT id, name, sequence, version, env_overrides, create_at, delete_at,
                       lock_acquired_by, lock_acquired_at
                FROM groups WHERE id = $1
                "#,
                &[&id],
            )
            .await
            .context("failed to query group")?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn create_group(&self, group: &Group) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let env = serde_json::to_value(&group.env_overrides)
            .context("failed to encode group env overrides")?;
        client
            .execute(
                r#"
                INSERT INTO groups (id, name, sequence, version, env_overrides, create_at,
                    delete_at, lock_acquired_by, lock_acquired_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
                &[
                    &group.id,
                    &group.name,
                    &group.sequence,
                    &group.version,
                    &env,
                    &group.create_at,
                    &group.delete_at,
                    &group.lock_acquired_by,
                    &group.lock_acquired_at,
                ],
            )
            .await
            .context("failed to insert group")?;
        Ok(())
    }

    async fn update_group(&self, group: &Group) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let env = serde_json::to_value(&group.env_overrides)
            .context("failed to encode group env overrides")?;
        client
            .execute(
                r#"
                UPDATE groups
                SET name = $2, sequence = $3, version = $4, env_overrides = $5, delete_at = $6
                WHERE id = $1
                "#,
                &[
                    &group.id,
                    &group.name,
                    &group.sequence,
                    &group.version,
                    &env,
                    &group.delete_at,
                ],
            )
            .await
            .context("failed to update group")?;
        Ok(())
    }

    async fn lock_group(&self, id: &str, locker_id: &str) -> Result<bool> {
        self.lock_row("groups", id, locker_id).await
    }

    async fn unlock_group(&self, id: &str, locker_id: &str, force: bool) -> Result<bool> {
        self.unlock_row("groups", id, locker_id, force).await
    }
}
