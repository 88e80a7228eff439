use clap::{Parser, Subcommand};

use anchorage_common::args::{MetricsArgs, PostgresArgs};

#[derive(Parser, Debug)]
#[command(name = "anchorage-supervisor")]
#[command(about = "Reconciliation supervisors for the anchorage control plane")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the supervisors until terminated
    Server(ServerArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// Store backend: "postgres" or "memory" (memory is for local
    /// development only)
    #[arg(long, env = "STORE", default_value = "postgres")]
    pub store: String,

    /// Seconds between supervisor passes; 0 disables the timer
    #[arg(long, env = "POLL_SECONDS", default_value_t = 30)]
    pub poll_seconds: u64,

    /// Environment tag stamped into webhook payloads
    #[arg(long, env = "ENVIRONMENT", default_value = "dev")]
    pub environment: String,

    #[clap(flatten)]
    pub scheduling: SchedulingArgs,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub metrics: MetricsArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct SchedulingArgs {
    /// Keep a background refresher of cluster resource snapshots
    #[arg(long, env = "BALANCE_INSTALLATIONS", default_value_t = false)]
    pub balance_installations: bool,

    /// Try stable clusters before transitioning ones during placement
    #[arg(long, env = "PREFER_STABLE_CLUSTERS", default_value_t = false)]
    pub prefer_stable_clusters: bool,

    /// Externally managed clusters skip the placement resource gate
    #[arg(long, env = "ALWAYS_SCHEDULE_EXTERNAL_CLUSTERS", default_value_t = false)]
    pub always_schedule_external_clusters: bool,

    /// Reject placement when projected CPU utilization exceeds this percent
    #[arg(long, env = "CLUSTER_RESOURCE_THRESHOLD_CPU", default_value_t = 80)]
    pub cluster_resource_threshold_cpu: i64,

    /// Reject placement when projected memory utilization exceeds this percent
    #[arg(long, env = "CLUSTER_RESOURCE_THRESHOLD_MEMORY", default_value_t = 80)]
    pub cluster_resource_threshold_memory: i64,

    /// Reject placement when projected pod-count utilization exceeds this percent
    #[arg(long, env = "CLUSTER_RESOURCE_THRESHOLD_POD_COUNT", default_value_t = 80)]
    pub cluster_resource_threshold_pod_count: i64,

    /// Node-count increment for the placement scale-up trigger; 0 disables it
    #[arg(long, env = "CLUSTER_RESOURCE_THRESHOLD_SCALE_VALUE", default_value_t = 0)]
    pub cluster_resource_threshold_scale_value: i64,
}

impl SchedulingArgs {
    pub fn to_options(&self) -> anchorage_supervisor::SchedulingOptions {
        anchorage_supervisor::SchedulingOptions {
            balance_installations: self.balance_installations,
            prefer_stable_clusters: self.prefer_stable_clusters,
            always_schedule_external_clusters: self.always_schedule_external_clusters,
            cluster_resource_threshold_cpu: self.cluster_resource_threshold_cpu,
            cluster_resource_threshold_memory: self.cluster_resource_threshold_memory,
            cluster_resource_threshold_pod_count: self.cluster_resource_threshold_pod_count,
            cluster_resource_threshold_scale_value: self.cluster_resource_threshold_scale_value,
        }
    }
}
