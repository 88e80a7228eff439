use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::Row;

use anchorage_common::now_millis;
use anchorage_model::{ClusterInstallation, ClusterInstallationState};

use crate::ClusterInstallationStore;

use super::{PostgresStore, parse_state, sort_by_priority};

const COLUMNS: &str = "id, cluster_id, installation_id, namespace, is_active, state, \
                       create_at, delete_at, lock_acquired_by, lock_acquired_at";

fn ci_from_row(row: &Row) -> Result<ClusterInstallation> {
    let state: String = row.get("state");
    Ok(ClusterInstallation {
        id: row.get("id"),
        cluster_id: row.get("cluster_id"),
        installation_id: row.get("installation_id"),
        namespace: row.get("namespace"),
        is_active: row.get("is_active"),
        state: parse_state(&state, "cluster installation")?,
        create_at: row.get("create_at"),
        delete_at: row.get("delete_at"),
        lock_acquired_by: row.get("lock_acquired_by"),
        lock_acquired_at: row.get("lock_acquired_at"),
    })
}

#[async_trait]
impl ClusterInstallationStore for PostgresStore {
    async fn get_cluster_installation(&self, id: &str) -> Result<Option<ClusterInstallation>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let row = client
            .query_opt(
                &format!("SELECT {COLUMNS} FROM cluster_installations WHERE id = $1"),
                &[&id],
            )
            .await
            .context("failed to query cluster installation")?;
        row.as_ref().map(ci_from_row).transpose()
    }

    async fn get_cluster_installations_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<ClusterInstallation>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let rows = client
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM cluster_installations \
                     WHERE installation_id = $1 \
                     ORDER BY create_at"
                ),
                &[&installation_id],
            )
            .await
            .context("failed to query cluster installations for installation")?;
        rows.iter().map(ci_from_row).collect()
    }

    async fn get_cluster_installations_for_cluster(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<ClusterInstallation>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let rows = client
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM cluster_installations \
                     WHERE cluster_id = $1 \
                     ORDER BY create_at"
                ),
                &[&cluster_id],
            )
            .await
            .context("failed to query cluster installations for cluster")?;
        rows.iter().map(ci_from_row).collect()
    }

    async fn get_unlocked_cluster_installations_pending_work(
        &self,
    ) -> Result<Vec<ClusterInstallation>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let states: Vec<&str> = ClusterInstallationState::PENDING_WORK
            .iter()
            .map(|s| s.as_str())
            .collect();
        let rows = client
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM cluster_installations \
                     WHERE lock_acquired_at = 0 AND state = ANY($1) \
                     ORDER BY create_at"
                ),
                &[&states],
            )
            .await
            .context("failed to query cluster installations pending work")?;
        let mut out: Vec<ClusterInstallation> =
            rows.iter().map(ci_from_row).collect::<Result<_>>()?;
        sort_by_priority(&mut out, |ci: &ClusterInstallation| ci.state.work_priority());
        Ok(out)
    }

    async fn create_cluster_installation(&self, ci: &ClusterInstallation) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        client
            .execute(
                r#"
                INSERT INTO cluster_installations (id, cluster_id, installation_id, namespace,
                    is_active, state, create_at, delete_at, lock_acquired_by, lock_acquired_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
                &[
                    &ci.id,
                    &ci.cluster_id,
                    &ci.installation_id,
                    &ci.namespace,
                    &ci.is_active,
                    &ci.state.as_str(),
                    &ci.create_at,
                    &ci.delete_at,
                    &ci.lock_acquired_by,
                    &ci.lock_acquired_at,
                ],
            )
            .await
            .context("failed to insert cluster installation")?;
        Ok(())
    }

    async fn update_cluster_installation(&self, ci: &ClusterInstallation) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        client
            .execute(
                r#"
                UPDATE cluster_installations
                SET namespace = $2, is_active = $3, state = $4, delete_at = $5
                WHERE id = $1
                "#,
                &[
                    &ci.id,
                    &ci.namespace,
                    &ci.is_active,
                    &ci.state.as_str(),
                    &ci.delete_at,
                ],
            )
            .await
            .context("failed to update cluster installation")?;
        Ok(())
    }

    async fn lock_cluster_installation(&self, id: &str, locker_id: &str) -> Result<bool> {
        self.lock_row("cluster_installations", id, locker_id).await
    }

    async fn unlock_cluster_installation(
        &self,
        id: &str,
        locker_id: &str,
        force: bool,
    ) -> Result<bool> {
        self.unlock_row("cluster_installations", id, locker_id, force)
            .await
    }

    async fn lock_cluster_installations(&self, ids: &[String], locker_id: &str) -> Result<bool> {
        if ids.is_empty() {
            return Ok(true);
        }
        let client = self.pool.get().await.context("failed to get db connection")?;
        let now = now_millis();
        let n = client
            .execute(
                r#"
                UPDATE cluster_installations
                SET lock_acquired_by = $1, lock_acquired_at = $2
                WHERE id = ANY($3) AND (lock_acquired_at = 0 OR lock_acquired_by = $1)
                "#,
                &[&locker_id, &now, &ids],
            )
            .await
            .context("failed to batch-lock cluster installations")?;
        if n as usize == ids.len() {
            return Ok(true);
        }
        // Partial acquisition: release exactly what this attempt took so the
        // batch stays all-or-nothing.
        client
            .execute(
                r#"
                UPDATE cluster_installations
                SET lock_acquired_by = NULL, lock_acquired_at = 0
                WHERE id = ANY($1) AND lock_acquired_by = $2 AND lock_acquired_at = $3
                "#,
                &[&ids, &locker_id, &now],
            )
            .await
            .context("failed to revert partial batch lock")?;
        Ok(false)
    }

    async fn unlock_cluster_installations(
        &self,
        ids: &[String],
        locker_id: &str,
        force: bool,
    ) -> Result<bool> {
        if ids.is_empty() {
            return Ok(true);
        }
        let client = self.pool.get().await.context("failed to get db connection")?;
        let n = if force {
            client
                .execute(
                    r#"
                    UPDATE cluster_installations
                    SET lock_acquired_by = NULL, lock_acquired_at = 0
                    WHERE id = ANY($1) AND lock_acquired_at <> 0
                    "#,
                    &[&ids],
                )
                .await
        } else {
            client
                .execute(
                    r#"
                    UPDATE cluster_installations
                    SET lock_acquired_by = NULL, lock_acquired_at = 0
                    WHERE id = ANY($1) AND lock_acquired_by = $2
                    "#,
                    &[&ids, &locker_id],
                )
                .await
        }
        .context("failed to batch-unlock cluster installations")?;
        Ok(n as usize == ids.len())
    }
}
