use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::Row;

use anchorage_model::{Cluster, ClusterState};

use crate::ClusterStore;

use super::{PostgresStore, parse_state, parse_tag, sort_by_priority};

const COLUMNS: &str = "id, state, provisioner, provisioner_metadata, allow_installations, \
                       annotations, has_aws_infrastructure, create_at, delete_at, \
                       lock_acquired_by, lock_acquired_at";

fn cluster_from_row(row: &Row) -> Result<Cluster> {
    let state: String = row.get("state");
    let provisioner: String = row.get("provisioner");
    let metadata: serde_json::Value = row.get("provisioner_metadata");
    Ok(Cluster {
        id: row.get("id"),
        state: parse_state(&state, "cluster")?,
        provisioner: parse_tag(&provisioner, "provisioner")?,
        provisioner_metadata: serde_json::from_value(metadata)
            .context("failed to decode provisioner metadata")?,
        allow_installations: row.get("allow_installations"),
        annotations: row.get("annotations"),
        has_aws_infrastructure: row.get("has_aws_infrastructure"),
        create_at: row.get("create_at"),
        delete_at: row.get("delete_at"),
        lock_acquired_by: row.get("lock_acquired_by"),
        lock_acquired_at: row.get("lock_acquired_at"),
    })
}

#[async_trait]
impl ClusterStore for PostgresStore {
    async fn get_cluster(&self, id: &str) -> Result<Option<Cluster>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let row = client
            .query_opt(
                &format!("SELECT {COLUMNS} FROM clusters WHERE id = $1"),
                &[&id],
            )
            .await
            .context("failed to query cluster")?;
        row.as_ref().map(cluster_from_row).transpose()
    }

    async fn get_clusters(&self) -> Result<Vec<Cluster>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let rows = client
            .query(
                &format!("SELECT {COLUMNS} FROM clusters WHERE delete_at = 0 ORDER BY create_at"),
                &[],
            )
            .await
            .context("failed to query clusters")?;
        rows.iter().map(cluster_from_row).collect()
    }

    async fn get_unlocked_clusters_pending_work(&self) -> Result<Vec<Cluster>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let states: Vec<&str> = ClusterState::PENDING_WORK.iter().map(|s| s.as_str()).collect();
        let rows = client
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM clusters \
                     WHERE lock_acquired_at = 0 AND state = ANY($1) \
                     ORDER BY create_at"
                ),
                &[&states],
            )
            .await
            .context("failed to query clusters pending work")?;
        let mut out: Vec<Cluster> = rows.iter().map(cluster_from_row).collect::<Result<_>>()?;
        sort_by_priority(&mut out, |c: &Cluster| c.state.work_priority());
        Ok(out)
    }

    async fn create_cluster(&self, cluster: &Cluster) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let metadata = serde_json::to_value(&cluster.provisioner_metadata)
            .context("failed to encode provisioner metadata")?;
        client
            .execute(
                r#"
                INSERT INTO clusters (id, state, provisioner, provisioner_metadata,
                    allow_installations, annotations, has_aws_infrastructure,
                    create_at, delete_at, lock_acquired_by, lock_acquired_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
                &[
                    &cluster.id,
                    &cluster.state.as_str(),
                    &cluster.provisioner.as_str(),
                    &metadata,
                    &cluster.allow_installations,
                    &cluster.annotations,
                    &cluster.has_aws_infrastructure,
                    &cluster.create_at,
                    &cluster.delete_at,
                    &cluster.lock_acquired_by,
                    &cluster.lock_acquired_at,
                ],
            )
            .await
            .context("failed to insert cluster")?;
        Ok(())
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let metadata = serde_json::to_value(&cluster.provisioner_metadata)
            .context("failed to encode provisioner metadata")?;
        client
            .execute(
                r#"
                UPDATE clusters
                SET state = $2, provisioner = $3, provisioner_metadata = $4,
                    allow_installations = $5, annotations = $6,
                    has_aws_infrastructure = $7, delete_at = $8
                WHERE id = $1
                "#,
                &[
                    &cluster.id,
                    &cluster.state.as_str(),
                    &cluster.provisioner.as_str(),
                    &metadata,
                    &cluster.allow_installations,
                    &cluster.annotations,
                    &cluster.has_aws_infrastructure,
                    &cluster.delete_at,
                ],
            )
            .await
            .context("failed to update cluster")?;
        Ok(())
    }

    async fn delete_cluster(&self, id: &str) -> Result<()> {
        self.tombstone_row("clusters", id).await
    }

    async fn lock_cluster(&self, id: &str, locker_id: &str) -> Result<bool> {
        self.lock_row("clusters", id, locker_id).await
    }

    async fn unlock_cluster(&self, id: &str, locker_id: &str, force: bool) -> Result<bool> {
        self.unlock_row("clusters", id, locker_id, force).await
    }
}
