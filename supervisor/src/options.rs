/// Placement configuration. Immutable after construction; shared by the
/// installation supervisor and its resource cache refresher.
#[derive(Debug, Clone)]
pub struct SchedulingOptions {
    /// Enables the background cluster-resource cache refresher.
    pub balance_installations: bool,
    /// Stably partition candidates so `Stable` clusters are tried first.
    pub prefer_stable_clusters: bool,
    /// Externally managed clusters skip the resource gate entirely.
    pub always_schedule_external_clusters: bool,
    /// Per-resource utilization gates, in percent.
    pub cluster_resource_threshold_cpu: i64,
    pub cluster_resource_threshold_memory: i64,
    pub cluster_resource_threshold_pod_count: i64,
    /// Node-count increment used by the placement scale-up trigger. Zero
    /// disables autoscaling.
    pub cluster_resource_threshold_scale_value: i64,
}

impl Default for SchedulingOptions {
    fn default() -> Self {
        Self {
            balance_installations: false,
            prefer_stable_clusters: false,
            always_schedule_external_clusters: false,
            cluster_resource_threshold_cpu: 80,
            cluster_resource_threshold_memory: 80,
            cluster_resource_threshold_pod_count: 80,
            cluster_resource_threshold_scale_value: 0,
        }
    }
}

/// Process-wide supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Environment tag stamped into webhook payloads.
    pub environment: String,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
        }
    }
}
