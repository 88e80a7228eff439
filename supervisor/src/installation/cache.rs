//! Advisory in-memory cache of cluster resource snapshots, owned by the
//! installation supervisor. Entries for clusters that are not `Stable` are
//! evicted because their resources are volatile mid-transition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use anchorage_model::{ClusterResources, ClusterState};
use anchorage_store::*;

use crate::provisioner::ProvisionerRegistry;

const REFRESH_INTERVAL: Duration = Duration::from_secs(180);

#[derive(Default)]
pub struct ClusterResourceCache {
    entries: Mutex<HashMap<String, ClusterResources>>,
}

impl ClusterResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cluster_id: &str) -> Option<ClusterResources> {
        self.entries.lock().unwrap().get(cluster_id).copied()
    }

    pub fn insert(&self, cluster_id: &str, resources: ClusterResources) {
        self.entries
            .lock()
            .unwrap()
            .insert(cluster_id.to_string(), resources);
    }

    pub fn evict(&self, cluster_id: &str) {
        self.entries.lock().unwrap().remove(cluster_id);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Periodically refreshes the cache until cancelled; the cache is emptied on
/// the way out.
pub fn spawn_refresher(
    cache: Arc<ClusterResourceCache>,
    store: Arc<dyn Store>,
    provisioners: ProvisionerRegistry,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    cache.clear();
                    return;
                }
                _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
            }
            refresh_once(&cache, store.as_ref(), &provisioners).await;
        }
    })
}

async fn refresh_once(
    cache: &ClusterResourceCache,
    store: &dyn Store,
    provisioners: &ProvisionerRegistry,
) {
    let clusters = match store.get_clusters().await {
        Ok(clusters) => clusters,
        Err(err) => {
            tracing::warn!(error = %err, "resource cache refresh: failed to list clusters");
            return;
        }
    };
    for cluster in clusters {
        if cluster.state != ClusterState::Stable {
            cache.evict(&cluster.id);
            continue;
        }
        let provisioner = match provisioners.for_cluster(&cluster) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(error = %err, cluster_id = %cluster.id, "resource cache refresh");
                cache.evict(&cluster.id);
                continue;
            }
        };
        match provisioner.get_cluster_resources(&cluster).await {
            Ok(resources) => cache.insert(&cluster.id, resources),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    cluster_id = %cluster.id,
                    "resource cache refresh: evicting after fetch error"
                );
                cache.evict(&cluster.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorage_common::now_millis;
    use anchorage_model::{Cluster, KopsMetadata, ProvisionerKind, ProvisionerMetadata};
    use anchorage_store::{ClusterStore, InMemoryStore};

    use crate::dev::DevProvisioner;

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
    async fn refresh_inserts_stable_and_evicts_transitioning_clusters() {
        let store = InMemoryStore::new();
        store
            .create_cluster(&cluster("stable", ClusterState::Stable))
            .await
            .unwrap();
        store
            .create_cluster(&cluster("busy", ClusterState::ProvisionInProgress))
            .await
            .unwrap();

        let provisioner = Arc::new(DevProvisioner::new());
        let registry =
            ProvisionerRegistry::new().register(ProvisionerKind::Kops, provisioner.clone());
        let cache = ClusterResourceCache::new();
        cache.insert("busy", ClusterResources::default());

        refresh_once(&cache, &store, &registry).await;

        assert!(cache.get("stable").is_some());
        assert!(cache.get("busy").is_none());
    }

    #[tokio::test]
    async fn cancelled_refresher_clears_the_cache() {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let registry = ProvisionerRegistry::new();
        let cache = Arc::new(ClusterResourceCache::new());
        cache.insert("c1", ClusterResources::default());

        let cancel = CancellationToken::new();
        let handle = spawn_refresher(cache.clone(), store, registry, cancel.clone());
        cancel.cancel();
        handle.await.unwrap();

        assert!(cache.get("c1").is_none());
    }
}
