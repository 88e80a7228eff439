use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::Row;

use anchorage_model::{
    InstallationDnsRecord, StateChangeEvent, StateChangeEventFilter, Webhook,
};

use crate::{DnsRecordStore, EventStore, WebhookStore};

use super::PostgresStore;

fn event_from_row(row: &Row) -> StateChangeEvent {
    StateChangeEvent {
        id: row.get("id"),
        resource_id: row.get("resource_id"),
        resource_type: row.get("resource_type"),
        old_state: row.get("old_state"),
        new_state: row.get("new_state"),
        timestamp: row.get("timestamp"),
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn create_state_change_event(&self, event: &StateChangeEvent) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        client
            .execute(
                r#"
                INSERT INTO state_change_events (id, resource_id, resource_type, old_state,
                    new_state, timestamp)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
                &[
                    &event.id,
                    &event.resource_id,
                    &event.resource_type,
                    &event.old_state,
                    &event.new_state,
                    &event.timestamp,
                ],
            )
            .await
            .context("failed to insert state change event")?;
        Ok(())
    }

    async fn get_state_change_events(
        &self,
        filter: &StateChangeEventFilter,
    ) -> Result<Vec<StateChangeEvent>> {
        let client = self.pool.get().await.context("failed to get db connection")?;

        let mut conditions = Vec::new();
        let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = Vec::new();
        let mut param_idx = 1;

        if let Some(ref id) = filter.resource_id {
            conditions.push(format!("resource_id = ${param_idx}"));
            params.push(id);
            param_idx += 1;
        }
        if let Some(ref t) = filter.resource_type {
            conditions.push(format!("resource_type = ${param_idx}"));
            params.push(t);
            param_idx += 1;
        }
        if !filter.new_states.is_empty() {
            conditions.push(format!("new_state = ANY(${param_idx})"));
            params.push(&filter.new_states);
        }

        let mut query = String::from(
            "SELECT id, resource_id, resource_type, old_state, new_state, timestamp \
             FROM state_change_events",
        );
        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }
        query.push_str(" ORDER BY timestamp DESC, id DESC");
        if filter.max_results > 0 {
            query.push_str(&format!(" LIMIT {}", filter.max_results));
        }

        let rows = client
            .query(&query, &params)
            .await
            .context("failed to query state change events")?;
        Ok(rows.iter().map(event_from_row).collect())
    }
}

#[async_trait]
impl WebhookStore for PostgresStore {
    async fn get_webhooks(&self) -> Result<Vec<Webhook>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let rows = client
            .query(
                "SELECT id, owner_id, url, create_at, delete_at FROM webhooks \
                 WHERE delete_at = 0 ORDER BY create_at",
                &[],
            )
            .await
            .context("failed to query webhooks")?;
        Ok(rows
            .iter()
            .map(|r| Webhook {
                id: r.get("id"),
                owner_id: r.get("owner_id"),
                url: r.get("url"),
                create_at: r.get("create_at"),
                delete_at: r.get("delete_at"),
            })
            .collect())
    }

    async fn create_webhook(&self, webhook: &Webhook) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        client
            .execute(
                r#"
                INSERT INTO webhooks (id, owner_id, url, create_at, delete_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
                &[
                    &webhook.id,
                    &webhook.owner_id,
                    &webhook.url,
                    &webhook.create_at,
                    &webhook.delete_at,
                ],
            )
            .await
            .context("failed to insert webhook")?;
        Ok(())
    }
}

#[async_trait]
impl DnsRecordStore for PostgresStore {
    async fn get_dns_records_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Vec<InstallationDnsRecord>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let rows = client
            .query(
                "SELECT id, installation_id, domain_name, is_primary, create_at, delete_at \
                 FROM installation_dns_records WHERE installation_id = $1 ORDER BY create_at",
                &[&installation_id],
            )
            .await
            .context("failed to query dns records")?;
        Ok(rows
            .iter()
            .map(|r| InstallationDnsRecord {
                id: r.get("id"),
                installation_id: r.get("installation_id"),
                domain_name: r.get("domain_name"),
                is_primary: r.get("is_primary"),
                create_at: r.get("create_at"),
                delete_at: r.get("delete_at"),
            })
            .collect())
    }

    async fn create_dns_record(&self, record: &InstallationDnsRecord) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        client
            .execute(
                r#"
                INSERT INTO installation_dns_records (id, installation_id, domain_name,
                    is_primary, create_at, delete_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
                &[
                    &record.id,
                    &record.installation_id,
                    &record.domain_name,
                    &record.is_primary,
                    &record.create_at,
                    &record.delete_at,
                ],
            )
            .await
            .context("failed to insert dns record")?;
        Ok(())
    }

    async fn delete_dns_record(&self, id: &str) -> Result<()> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        client
            .execute("DELETE FROM installation_dns_records WHERE id = $1", &[&id])
            .await
            .context("failed to delete dns record")?;
        Ok(())
    }
}
