//! Cluster supervisor: drives compute substrates through creation,
//! provisioning, upgrade, resize and deletion.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;

use anchorage_common::{new_id, now_millis, resource_types};
use anchorage_model::{Cluster, ClusterState, ProvisionerMetadata};
use anchorage_store::*;

use crate::events::EventProducer;
use crate::metrics;
use crate::provisioner::{ClusterProvisioner, ProvisionerRegistry};
use crate::scheduler::Doer;

pub struct ClusterSupervisor {
    store: Arc<dyn Store>,
    provisioners: ProvisionerRegistry,
    events: Arc<EventProducer>,
    instance_id: String,
}

#[async_trait]
impl Doer for ClusterSupervisor {
    async fn do_work(&self) -> Result<()> {
        let clusters = self.store.get_unlocked_clusters_pending_work().await?;
        for cluster in clusters {
            self.supervise(&cluster).await;
        }
        Ok(())
    }

    async fn shutdown(&self) {}
}

impl ClusterSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        provisioners: ProvisionerRegistry,
        events: Arc<EventProducer>,
    ) -> Self {
        Self {
            store,
            provisioners,
            events,
            instance_id: new_id(),
        }
    }

    pub async fn supervise(&self, cluster: &Cluster) {
        match self.store.lock_cluster(&cluster.id, &self.instance_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::warn!(error = %err, cluster_id = %cluster.id, "failed to lock cluster");
                return;
            }
        }
        let result = self.supervise_locked(cluster).await;
        if let Err(err) = self
            .store
            .unlock_cluster(&cluster.id, &self.instance_id, false)
            .await
        {
            tracing::error!(error = %err, cluster_id = %cluster.id, "failed to unlock cluster");
        }
        if let Err(err) = result {
            tracing::error!(error = %err, cluster_id = %cluster.id, "cluster supervision failed");
        }
    }

    async fn supervise_locked(&self, observed: &Cluster) -> Result<()> {
        let Some(mut cluster) = self.store.get_cluster(&observed.id).await? else {
            bail!("cluster {} vanished from the store", observed.id);
        };
        // Stale-state guard: another replica advanced this cluster between
        // the pending-work query and our lock.
        if cluster.state != observed.state {
            tracing::debug!(
                cluster_id = %cluster.id,
                observed = %observed.state,
                stored = %cluster.state,
                "cluster state changed underneath us; skipping"
            );
            return Ok(());
        }

        let old_state = cluster.state;
        let new_state = self.transition(&mut cluster).await;
        if new_state == old_state {
            return Ok(());
        }

        cluster.state = new_state;
        self.store.update_cluster(&cluster).await?;
        self.events
            .produce_cluster_state_change_event(&cluster, old_state)
            .await;
        metrics::record_transition(
            resource_types::CLUSTER,
            old_state.as_str(),
            new_state.as_str(),
        );
        if matches!(new_state, ClusterState::Stable | ClusterState::Deleted) {
            let request_states: Vec<&str> = ClusterState::REQUEST_STATES
                .iter()
                .map(|s| s.as_str())
                .collect();
            metrics::record_lifecycle_duration(
                self.store.as_ref(),
                resource_types::CLUSTER,
                &cluster.id,
                &request_states,
                new_state.as_str(),
            )
            .await;
        }
        tracing::info!(
            cluster_id = %cluster.id,
            old_state = %old_state,
            new_state = %new_state,
            "cluster transitioned"
        );
        Ok(())
    }

    async fn transition(&self, cluster: &mut Cluster) -> ClusterState {
        let provisioner = match self.provisioners.for_cluster(cluster) {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(error = %err, cluster_id = %cluster.id, "no provisioner");
                return cluster.state;
            }
        };
        match cluster.state {
            ClusterState::CreationRequested => {
                self.handle_creation_requested(cluster, &provisioner).await
            }
            ClusterState::CreationInProgress => {
                self.check_cluster_created(cluster, &provisioner).await
            }
            ClusterState::WaitingForNodes => {
                self.handle_waiting_for_nodes(cluster, &provisioner).await
            }
            // Both states run the same handler; the distinction exists so
            // pending-work queries prioritize them differently.
            ClusterState::ProvisioningRequested | ClusterState::ProvisionInProgress => {
                self.handle_provision(cluster, &provisioner).await
            }
            ClusterState::UpgradeRequested => self.handle_upgrade(cluster, &provisioner).await,
            ClusterState::ResizeRequested => self.handle_resize(cluster, &provisioner).await,
            ClusterState::RefreshMetadata => {
                self.handle_refresh_metadata(cluster, &provisioner).await
            }
            ClusterState::DeletionRequested => self.handle_deletion(cluster, &provisioner).await,
            _ => {
                tracing::error!(
                    cluster_id = %cluster.id,
                    state = %cluster.state,
                    "unexpected cluster state; no transition"
                );
                cluster.state
            }
        }
    }

    async fn handle_creation_requested(
        &self,
        cluster: &mut Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> ClusterState {
        if let Err(err) = provisioner.prepare_cluster(cluster).await {
            tracing::error!(error = %err, cluster_id = %cluster.id, "failed to prepare cluster");
            return ClusterState::CreationFailed;
        }
        if let Err(err) = provisioner.create_cluster(cluster).await {
            tracing::error!(error = %err, cluster_id = %cluster.id, "failed to create cluster");
            return ClusterState::CreationFailed;
        }
        self.check_cluster_created(cluster, provisioner).await
    }

    async fn check_cluster_created(
        &self,
        cluster: &mut Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> ClusterState {
        match provisioner.check_cluster_created(cluster).await {
            Ok(false) => ClusterState::CreationInProgress,
            Ok(true) => match provisioner.create_nodegroups(cluster).await {
                Ok(()) => ClusterState::WaitingForNodes,
                Err(err) => {
                    tracing::warn!(error = %err, cluster_id = %cluster.id, "failed to create nodegroups");
                    ClusterState::CreationInProgress
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, cluster_id = %cluster.id, "failed to check cluster creation");
                ClusterState::CreationInProgress
            }
        }
    }

    async fn handle_waiting_for_nodes(
        &self,
        cluster: &mut Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> ClusterState {
        match provisioner.check_nodegroups_created(cluster).await {
            Ok(true) => ClusterState::ProvisionInProgress,
            Ok(false) => ClusterState::WaitingForNodes,
            Err(err) => {
                tracing::warn!(error = %err, cluster_id = %cluster.id, "failed to check nodegroups");
                ClusterState::WaitingForNodes
            }
        }
    }

    async fn handle_provision(
        &self,
        cluster: &mut Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> ClusterState {
        match provisioner.provision_cluster(cluster).await {
            Ok(()) => ClusterState::RefreshMetadata,
            Err(err) => {
                tracing::error!(error = %err, cluster_id = %cluster.id, "failed to provision cluster");
                ClusterState::ProvisioningFailed
            }
        }
    }

    async fn handle_upgrade(
        &self,
        cluster: &mut Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> ClusterState {
        match provisioner.upgrade_cluster(cluster).await {
            Ok(()) => ClusterState::RefreshMetadata,
            Err(err) => {
                tracing::error!(error = %err, cluster_id = %cluster.id, "failed to upgrade cluster");
                ClusterState::UpgradeFailed
            }
        }
    }

    async fn handle_resize(
        &self,
        cluster: &mut Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> ClusterState {
        match provisioner.resize_cluster(cluster).await {
            Ok(()) => ClusterState::RefreshMetadata,
            Err(err) => {
                tracing::error!(error = %err, cluster_id = %cluster.id, "failed to resize cluster");
                ClusterState::ResizeFailed
            }
        }
    }

    async fn handle_refresh_metadata(
        &self,
        cluster: &mut Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> ClusterState {
        if let Err(err) = provisioner.refresh_cluster_metadata(cluster).await {
            tracing::warn!(error = %err, cluster_id = %cluster.id, "failed to refresh cluster metadata");
            return ClusterState::RefreshMetadata;
        }
        // A satisfied change request is folded into the refreshed metadata.
        match &mut cluster.provisioner_metadata {
            ProvisionerMetadata::Kops(m) => m.change_request = None,
            ProvisionerMetadata::Eks(m) => m.change_request = None,
            ProvisionerMetadata::External(_) => {}
        }
        ClusterState::Stable
    }

    async fn handle_deletion(
        &self,
        cluster: &mut Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> ClusterState {
        match provisioner.delete_cluster(cluster).await {
            Ok(true) => {
                cluster.delete_at = now_millis();
                ClusterState::Deleted
            }
            Ok(false) => ClusterState::DeletionRequested,
            Err(err) => {
                tracing::error!(error = %err, cluster_id = %cluster.id, "failed to delete cluster");
                ClusterState::DeletionFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorage_model::{KopsMetadata, ProvisionerKind, StateChangeEventFilter};
    use anchorage_store::InMemoryStore;

    use crate::dev::DevProvisioner;

    fn fixture() -> (Arc<InMemoryStore>, ClusterSupervisor, Arc<DevProvisioner>) {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let provisioner = Arc::new(DevProvisioner::new());
        let registry =
            ProvisionerRegistry::new().register(ProvisionerKind::Kops, provisioner.clone());
        let events = Arc::new(EventProducer::new(store.clone()));
        let supervisor = ClusterSupervisor::new(store.clone(), registry, events);
        (store, supervisor, provisioner)
    }

    fn cluster(id: &str, state: ClusterState) -> Cluster {
        Cluster {
            id: id.to_string(),
            state,
            provisioner: ProvisionerKind::Kops,
            provisioner_metadata: ProvisionerMetadata::Kops(KopsMetadata {
                name: format!("kops-{id}"),
                version: "1.29.0".to_string(),
                node_instance_type: "m5.large".to_string(),
                node_min_count: 3,
                node_max_count: 10,
                change_request: None,
            }),
            allow_installations: true,
            annotations: vec![],
            has_aws_infrastructure: true,
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        }
    }

    async fn stored_state(store: &InMemoryStore, id: &str) -> ClusterState {
        store.get_cluster(id).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn creation_walks_through_to_stable() {
        let (store, supervisor, _) = fixture();
        let c = cluster("c1", ClusterState::CreationRequested);
        store.create_cluster(&c).await.unwrap();

        supervisor.supervise(&c).await;
        assert_eq!(
            stored_state(&store, "c1").await,
            ClusterState::WaitingForNodes
        );

        let c = store.get_cluster("c1").await.unwrap().unwrap();
        supervisor.supervise(&c).await;
        assert_eq!(
            stored_state(&store, "c1").await,
            ClusterState::ProvisionInProgress
        );

        let c = store.get_cluster("c1").await.unwrap().unwrap();
        supervisor.supervise(&c).await;
        assert_eq!(
            stored_state(&store, "c1").await,
            ClusterState::RefreshMetadata
        );

        let c = store.get_cluster("c1").await.unwrap().unwrap();
        supervisor.supervise(&c).await;
        assert_eq!(stored_state(&store, "c1").await, ClusterState::Stable);

        // The lock was released at every step.
        let c = store.get_cluster("c1").await.unwrap().unwrap();
        assert_eq!(c.lock_acquired_at, 0);
    }

    #[tokio::test]
    async fn slow_cluster_creation_stays_in_progress() {
        let (store, supervisor, provisioner) = fixture();
        provisioner
            .state
            .cluster_created
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let c = cluster("c1", ClusterState::CreationRequested);
        store.create_cluster(&c).await.unwrap();

        supervisor.supervise(&c).await;
        assert_eq!(
            stored_state(&store, "c1").await,
            ClusterState::CreationInProgress
        );

        // Still waiting: no further transition, so no second event.
        let c = store.get_cluster("c1").await.unwrap().unwrap();
        supervisor.supervise(&c).await;
        let events = store
            .get_state_change_events(&StateChangeEventFilter {
                resource_id: Some("c1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn deletion_tombstones_the_row() {
        let (store, supervisor, _) = fixture();
        let c = cluster("c1", ClusterState::DeletionRequested);
        store.create_cluster(&c).await.unwrap();

        supervisor.supervise(&c).await;
        let stored = store.get_cluster("c1").await.unwrap().unwrap();
        assert_eq!(stored.state, ClusterState::Deleted);
        assert!(stored.delete_at > 0);
    }

    #[tokio::test]
    async fn stale_state_is_a_no_op() {
        let (store, supervisor, _) = fixture();
        let mut c = cluster("c1", ClusterState::ProvisionInProgress);
        store.create_cluster(&c).await.unwrap();

        // Caller still believes the cluster is in creation-requested.
        c.state = ClusterState::CreationRequested;
        supervisor.supervise(&c).await;

        assert_eq!(
            stored_state(&store, "c1").await,
            ClusterState::ProvisionInProgress
        );
        let events = store
            .get_state_change_events(&StateChangeEventFilter {
                resource_id: Some("c1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn unexpected_state_is_preserved() {
        let (store, supervisor, _) = fixture();
        let c = cluster("c1", ClusterState::Stable);
        store.create_cluster(&c).await.unwrap();

        supervisor.supervise(&c).await;
        assert_eq!(stored_state(&store, "c1").await, ClusterState::Stable);
    }

    #[tokio::test]
    async fn locked_cluster_is_skipped() {
        let (store, supervisor, _) = fixture();
        let c = cluster("c1", ClusterState::CreationRequested);
        store.create_cluster(&c).await.unwrap();
        assert!(store.lock_cluster("c1", "someone-else").await.unwrap());

        supervisor.supervise(&c).await;
        assert_eq!(
            stored_state(&store, "c1").await,
            ClusterState::CreationRequested
        );
    }

    #[tokio::test]
    async fn refresh_metadata_clears_the_change_request() {
        let (store, supervisor, _) = fixture();
        let mut c = cluster("c1", ClusterState::RefreshMetadata);
        if let ProvisionerMetadata::Kops(ref mut m) = c.provisioner_metadata {
            m.change_request = Some(anchorage_model::KopsChangeRequest {
                node_min_count: Some(5),
                node_max_count: None,
                version: None,
            });
        }
        store.create_cluster(&c).await.unwrap();

        supervisor.supervise(&c).await;
        let stored = store.get_cluster("c1").await.unwrap().unwrap();
        assert_eq!(stored.state, ClusterState::Stable);
        match stored.provisioner_metadata {
            ProvisionerMetadata::Kops(m) => assert!(m.change_request.is_none()),
            _ => panic!("unexpected metadata variant"),
        }
    }
}
