//! Placement: choosing a cluster for an installation and creating the
//! binding. Ordering is best-effort and cache-assisted; the per-candidate
//! final check runs under the cluster lock and is authoritative.

use anyhow::{Context, Result};

use anchorage_common::{new_id, now_millis};
use anchorage_model::{
    Affinity, Cluster, ClusterInstallation, ClusterInstallationState, ClusterResources,
    ClusterState, Installation,
};
use anchorage_store::*;

use super::InstallationSupervisor;

/// What a placement attempt produced.
pub(super) enum PlacementOutcome {
    Placed(ClusterInstallation),
    /// A cluster was asked to grow instead; the installation waits where it
    /// is until the capacity lands.
    ScalingTriggered,
    NoCompatibleClusters,
}

enum CandidateOutcome {
    Placed(ClusterInstallation),
    ScaleUp,
    Rejected,
}

impl InstallationSupervisor {
    /// Try to place `installation` onto some cluster.
    pub(super) async fn place_installation(
        &self,
        installation: &Installation,
    ) -> Result<PlacementOutcome> {
        let clusters = self.store.get_clusters().await?;
        let candidates: Vec<Cluster> = clusters
            .into_iter()
            .filter(|c| installation.annotations_subset_of(&c.annotations))
            .collect();

        let ordered = self.order_candidates(candidates, installation).await;
        let mut scaling_triggered = false;
        for cluster in ordered {
            match self.try_place_on_cluster(&cluster, installation).await? {
                CandidateOutcome::Placed(ci) => return Ok(PlacementOutcome::Placed(ci)),
                CandidateOutcome::ScaleUp => scaling_triggered = true,
                CandidateOutcome::Rejected => {}
            }
        }
        if scaling_triggered {
            Ok(PlacementOutcome::ScalingTriggered)
        } else {
            Ok(PlacementOutcome::NoCompatibleClusters)
        }
    }

    /// Best-effort utilization ordering (unlocked, cache-assisted). The head
    /// of the returned list is the lowest-utilized candidate at observation
    /// time; the tail is only loosely ordered.
    async fn order_candidates(
        &self,
        candidates: Vec<Cluster>,
        installation: &Installation,
    ) -> Vec<Cluster> {
        let requests = installation.resources();
        let mut ordered: Vec<Cluster> = Vec::with_capacity(candidates.len());
        let mut lowest_seen = f64::MAX;
        for cluster in candidates {
            match self.can_be_scheduled(&cluster, installation).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, cluster_id = %cluster.id, "scheduling pre-check failed");
                    continue;
                }
            }
            let resources = match self.cluster_resources(&cluster).await {
                Ok(resources) => resources,
                Err(err) => {
                    tracing::warn!(error = %err, cluster_id = %cluster.id, "failed to fetch cluster resources");
                    self.cache.evict(&cluster.id);
                    continue;
                }
            };
            let combined = resources.combined_percent_with(&requests);
            if combined < lowest_seen {
                lowest_seen = combined;
                ordered.insert(0, cluster);
            } else {
                ordered.push(cluster);
            }
        }
        if self.options.prefer_stable_clusters {
            let (stable, rest): (Vec<Cluster>, Vec<Cluster>) = ordered
                .into_iter()
                .partition(|c| c.state == ClusterState::Stable);
            ordered = stable;
            ordered.extend(rest);
        }
        ordered
    }

    /// Configuration- and state-only check, safe to run without a lock.
    pub(super) async fn can_be_scheduled(
        &self,
        cluster: &Cluster,
        installation: &Installation,
    ) -> Result<bool> {
        if !cluster.can_schedule_installations() {
            return Ok(false);
        }
        if installation.requires_aws_infrastructure && !cluster.has_aws_infrastructure {
            return Ok(false);
        }
        if !installation.annotations_subset_of(&cluster.annotations) {
            return Ok(false);
        }
        let existing: Vec<ClusterInstallation> = self
            .store
            .get_cluster_installations_for_cluster(&cluster.id)
            .await?
            .into_iter()
            .filter(|ci| !ci.is_deleted())
            .collect();
        match installation.affinity {
            Affinity::Isolated => Ok(existing.is_empty()),
            Affinity::MultiTenant => {
                if existing.len() == 1 {
                    let other = self
                        .store
                        .get_installation(&existing[0].installation_id)
                        .await?
                        .with_context(|| {
                            format!(
                                "installation {} referenced by cluster installation {} missing",
                                existing[0].installation_id, existing[0].id
                            )
                        })?;
                    Ok(other.affinity == Affinity::MultiTenant)
                } else {
                    Ok(true)
                }
            }
        }
    }

    /// Cache-assisted resource lookup; a miss falls through to the
    /// provisioner directly.
    pub(super) async fn cluster_resources(&self, cluster: &Cluster) -> Result<ClusterResources> {
        if let Some(resources) = self.cache.get(&cluster.id) {
            return Ok(resources);
        }
        let provisioner = self.provisioners.for_cluster(cluster)?;
        provisioner.get_cluster_resources(cluster).await
    }

    async fn try_place_on_cluster(
        &self,
        cluster: &Cluster,
        installation: &Installation,
    ) -> Result<CandidateOutcome> {
        if !self
            .store
            .lock_cluster(&cluster.id, &self.instance_id)
            .await?
        {
            return Ok(CandidateOutcome::Rejected);
        }
        let result = self.try_place_locked(cluster, installation).await;
        if let Err(err) = self
            .store
            .unlock_cluster(&cluster.id, &self.instance_id, false)
            .await
        {
            tracing::error!(error = %err, cluster_id = %cluster.id, "failed to unlock cluster after placement");
        }
        result
    }

    /// The authoritative check, re-run with the cluster locked so the
    /// scaling decision and the binding creation cannot race another
    /// placement.
    async fn try_place_locked(
        &self,
        cluster: &Cluster,
        installation: &Installation,
    ) -> Result<CandidateOutcome> {
        let cluster = self
            .store
            .get_cluster(&cluster.id)
            .await?
            .with_context(|| format!("cluster {} vanished during placement", cluster.id))?;
        if !self.can_be_scheduled(&cluster, installation).await? {
            return Ok(CandidateOutcome::Rejected);
        }

        let requests = installation.resources();
        let resources = self.cluster_resources(&cluster).await?;
        let cpu = resources.cpu_percent_with(requests.cpu_requests_millis);
        let memory = resources.memory_percent_with(requests.memory_requests_mib);
        let pods = resources.pod_percent_with(requests.pod_count);
        let over_threshold = cpu > self.options.cluster_resource_threshold_cpu as f64
            || memory > self.options.cluster_resource_threshold_memory as f64
            || pods > self.options.cluster_resource_threshold_pod_count as f64;

        let bypass_resource_gate =
            cluster.is_externally_managed() && self.options.always_schedule_external_clusters;

        if over_threshold && !bypass_resource_gate {
            if cluster.state == ClusterState::Stable
                && self.options.cluster_resource_threshold_scale_value > 0
                && cluster.node_min_count() < cluster.node_max_count()
            {
                self.trigger_scale_up(cluster).await?;
                return Ok(CandidateOutcome::ScaleUp);
            }
            tracing::debug!(
                cluster_id = %cluster.id,
                cpu, memory, pods,
                "candidate rejected: over resource threshold"
            );
            return Ok(CandidateOutcome::Rejected);
        }

        let ci = ClusterInstallation {
            id: new_id(),
            cluster_id: cluster.id.clone(),
            installation_id: installation.id.clone(),
            namespace: installation.id.clone(),
            is_active: true,
            state: ClusterInstallationState::CreationRequested,
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        };
        self.store.create_cluster_installation(&ci).await?;
        self.events
            .produce_cluster_installation_state_change_event(&ci, None)
            .await;
        tracing::info!(
            installation_id = %installation.id,
            cluster_id = %cluster.id,
            ci_id = %ci.id,
            "placed installation"
        );
        Ok(CandidateOutcome::Placed(ci))
    }

    /// Ask the cluster supervisor for more nodes by writing a resize request
    /// directly onto the cluster row. The installation is not placed here
    /// this cycle even though capacity is coming.
    async fn trigger_scale_up(&self, mut cluster: Cluster) -> Result<()> {
        let scale_value = self.options.cluster_resource_threshold_scale_value;
        if !cluster.apply_scale_up(scale_value) {
            tracing::warn!(cluster_id = %cluster.id, "cluster cannot be scaled up");
            return Ok(());
        }
        let old_state = cluster.state;
        cluster.state = ClusterState::ResizeRequested;
        self.store.update_cluster(&cluster).await?;
        self.events
            .produce_cluster_state_change_event(&cluster, old_state)
            .await;
        self.cache.evict(&cluster.id);
        tracing::info!(
            cluster_id = %cluster.id,
            scale_value,
            "triggered cluster scale-up for placement headroom"
        );
        Ok(())
    }
}
