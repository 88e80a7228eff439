//! Postgres-backed store. Schema init is idempotent; rows map scalar
//! attributes to columns and variant-shaped sub-records to JSONB. Lock
//! acquisition is a single conditional UPDATE so it is atomic under
//! concurrent replicas.

use anyhow::{Context, Result, anyhow};
use deadpool_postgres::Pool;
use std::str::FromStr;

use anchorage_common::now_millis;

mod cluster;
mod cluster_installation;
mod events;
mod installation;
mod operations;

pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema, creating tables if they don't exist.
    pub async fn init_schema(&self) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;

        client
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS clusters (
                    id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    provisioner TEXT NOT NULL,
                    provisioner_metadata JSONB NOT NULL,
                    allow_installations BOOLEAN NOT NULL,
                    annotations TEXT[] NOT NULL DEFAULT '{}',
                    has_aws_infrastructure BOOLEAN NOT NULL DEFAULT FALSE,
                    create_at BIGINT NOT NULL,
                    delete_at BIGINT NOT NULL DEFAULT 0,
                    lock_acquired_by TEXT,
                    lock_acquired_at BIGINT NOT NULL DEFAULT 0
                )
                "#,
                &[],
            )
            .await
            .context("failed to create clusters table")?;

        client
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS installations (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    version TEXT NOT NULL,
                    cr_version TEXT NOT NULL,
                    size TEXT NOT NULL,
                    affinity TEXT NOT NULL,
                    database_kind TEXT NOT NULL,
                    filestore_kind TEXT NOT NULL,
                    group_id TEXT,
                    group_sequence BIGINT,
                    annotations TEXT[] NOT NULL DEFAULT '{}',
                    requires_aws_infrastructure BOOLEAN NOT NULL DEFAULT FALSE,
                    keep_database_data BOOLEAN NOT NULL DEFAULT FALSE,
                    keep_filestore_data BOOLEAN NOT NULL DEFAULT FALSE,
                    volumes JSONB,
                    state TEXT NOT NULL,
                    create_at BIGINT NOT NULL,
                    delete_at BIGINT NOT NULL DEFAULT 0,
                    lock_acquired_by TEXT,
                    lock_acquired_at BIGINT NOT NULL DEFAULT 0
                )
                "#,
                &[],
            )
            .await
            .context("failed to create installations table")?;

        client
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS groups (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    sequence BIGINT NOT NULL DEFAULT 0,
                    version TEXT NOT NULL DEFAULT '',
                    env_overrides JSONB NOT NULL DEFAULT '{}',
                    create_at BIGINT NOT NULL,
                    delete_at BIGINT NOT NULL DEFAULT 0,
                    lock_acquired_by TEXT,
                    lock_acquired_at BIGINT NOT NULL DEFAULT 0
                )
                "#,
                &[],
            )
            .await
            .context("failed to create groups table")?;

        client
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS cluster_installations (
                    id TEXT PRIMARY KEY,
                    cluster_id TEXT NOT NULL,
                    installation_id TEXT NOT NULL,
                    namespace TEXT NOT NULL,
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    state TEXT NOT NULL,
                    create_at BIGINT NOT NULL,
                    delete_at BIGINT NOT NULL DEFAULT 0,
                    lock_acquired_by TEXT,
                    lock_acquired_at BIGINT NOT NULL DEFAULT 0
                )
                "#,
                &[],
            )
            .await
            .context("failed to create cluster_installations table")?;

        client
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS installation_backups (
                    id TEXT PRIMARY KEY,
                    installation_id TEXT NOT NULL,
                    cluster_installation_id TEXT NOT NULL DEFAULT '',
                    data_residence JSONB,
                    state TEXT NOT NULL,
                    start_at BIGINT NOT NULL DEFAULT 0,
                    create_at BIGINT NOT NULL,
                    delete_at BIGINT NOT NULL DEFAULT 0,
                    lock_acquired_by TEXT,
                    lock_acquired_at BIGINT NOT NULL DEFAULT 0
                )
                "#,
                &[],
            )
            .await
            .context("failed to create installation_backups table")?;

        client
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS installation_db_restoration_operations (
                    id TEXT PRIMARY KEY,
                    installation_id TEXT NOT NULL,
                    backup_id TEXT NOT NULL,
                    cluster_installation_id TEXT NOT NULL DEFAULT '',
                    target_installation_state TEXT NOT NULL,
                    complete_at BIGINT NOT NULL DEFAULT 0,
                    state TEXT NOT NULL,
                    create_at BIGINT NOT NULL,
                    delete_at BIGINT NOT NULL DEFAULT 0,
                    lock_acquired_by TEXT,
                    lock_acquired_at BIGINT NOT NULL DEFAULT 0
                )
                "#,
                &[],
            )
            .await
            .context("failed to create installation_db_restoration_operations table")?;

        client
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS installation_db_migration_operations (
                    id TEXT PRIMARY KEY,
                    installation_id TEXT NOT NULL,
                    source_database TEXT NOT NULL,
                    destination_database TEXT NOT NULL,
                    backup_id TEXT NOT NULL DEFAULT '',
                    installation_db_restoration_operation_id TEXT NOT NULL DEFAULT '',
                    complete_at BIGINT NOT NULL DEFAULT 0,
                    state TEXT NOT NULL,
                    create_at BIGINT NOT NULL,
                    delete_at BIGINT NOT NULL DEFAULT 0,
                    lock_acquired_by TEXT,
                    lock_acquired_at BIGINT NOT NULL DEFAULT 0
                )
                "#,
                &[],
            )
            .await
            .context("failed to create installation_db_migration_operations table")?;

        client
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS state_change_events (
                    id TEXT PRIMARY KEY,
                    resource_id TEXT NOT NULL,
                    resource_type TEXT NOT NULL,
                    old_state TEXT NOT NULL,
                    new_state TEXT NOT NULL,
                    timestamp BIGINT NOT NULL
                )
                "#,
                &[],
            )
            .await
            .context("failed to create state_change_events table")?;

        client
            .execute(
                r#"
                CREATE INDEX IF NOT EXISTS idx_state_change_events_resource
                ON state_change_events (resource_id, timestamp DESC)
                "#,
                &[],
            )
            .await
            .context("failed to create state_change_events index")?;

        client
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS webhooks (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    url TEXT NOT NULL,
                    create_at BIGINT NOT NULL,
                    delete_at BIGINT NOT NULL DEFAULT 0
                )
                "#,
                &[],
            )
            .await
            .context("failed to create webhooks table")?;

        client
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS installation_dns_records (
                    id TEXT PRIMARY KEY,
                    installation_id TEXT NOT NULL,
                    domain_name TEXT NOT NULL,
                    is_primary BOOLEAN NOT NULL DEFAULT FALSE,
                    create_at BIGINT NOT NULL,
                    delete_at BIGINT NOT NULL DEFAULT 0
                )
                "#,
                &[],
            )
            .await
            .context("failed to create installation_dns_records table")?;

        Ok(())
    }

    /// Atomic lock acquisition: succeeds iff the row is unlocked or already
    /// held by `locker_id`.
    async fn lock_row(&self, table: &str, id: &str, locker_id: &str) -> Result<bool> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let now = now_millis();
        let n = client
            .execute(
                &format!(
                    "UPDATE {table} \
                     SET lock_acquired_by = $1, lock_acquired_at = $2 \
                     WHERE id = $3 AND (lock_acquired_at = 0 OR lock_acquired_by = $1)"
                ),
                &[&locker_id, &now, &id],
            )
            .await
            .with_context(|| format!("failed to lock {table} row"))?;
        Ok(n == 1)
    }

    async fn unlock_row(&self, table: &str, id: &str, locker_id: &str, force: bool) -> Result<bool> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let n = if force {
            client
                .execute(
                    &format!(
                        "UPDATE {table} \
                         SET lock_acquired_by = NULL, lock_acquired_at = 0 \
                         WHERE id = $1 AND lock_acquired_at <> 0"
                    ),
                    &[&id],
                )
                .await
        } else {
            client
                .execute(
                    &format!(
                        "UPDATE {table} \
                         SET lock_acquired_by = NULL, lock_acquired_at = 0 \
                         WHERE id = $1 AND lock_acquired_by = $2"
                    ),
                    &[&id, &locker_id],
                )
                .await
        }
        .with_context(|| format!("failed to unlock {table} row"))?;
        Ok(n == 1)
    }

    /// Tombstone a row by setting `delete_at`.
    async fn tombstone_row(&self, table: &str, id: &str) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let now = now_millis();
        let n = client
            .execute(
                &format!("UPDATE {table} SET delete_at = $1 WHERE id = $2"),
                &[&now, &id],
            )
            .await
            .with_context(|| format!("failed to delete {table} row"))?;
        if n != 1 {
            return Err(anyhow!("{table} row {id} not found"));
        }
        Ok(())
    }
}

fn parse_state<T: FromStr>(value: &str, kind: &str) -> Result<T> {
    T::from_str(value).map_err(|_| anyhow!("unknown {kind} state {value:?}"))
}

fn parse_tag<T: FromStr>(value: &str, kind: &str) -> Result<T> {
    T::from_str(value).map_err(|_| anyhow!("unknown {kind} tag {value:?}"))
}

/// Stable sort, highest work priority first; row order from the query is
/// preserved inside each priority band.
fn sort_by_priority<T, F: Fn(&T) -> i64>(items: &mut [T], priority: F) {
    items.sort_by_key(|i| std::cmp::Reverse(priority(i)));
}
