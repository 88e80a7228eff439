use serde::{Deserialize, Serialize};

/// Concrete requests an installation size maps to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallationResources {
    pub cpu_requests_millis: i64,
    pub memory_requests_mib: i64,
    pub pod_count: i64,
}

/// A snapshot of a cluster's capacity and current usage, as reported by the
/// provisioner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ClusterResources {
    pub total_cpu_millis: i64,
    pub used_cpu_millis: i64,
    pub total_memory_mib: i64,
    pub used_memory_mib: i64,
    pub total_pod_count: i64,
    pub used_pod_count: i64,
}

impl ClusterResources {
    /// CPU utilization percentage after adding `extra` millis of requests.
    pub fn cpu_percent_with(&self, extra: i64) -> f64 {
        percent(self.used_cpu_millis + extra, self.total_cpu_millis)
    }

    /// Memory utilization percentage after adding `extra` MiB of requests.
    pub fn memory_percent_with(&self, extra: i64) -> f64 {
        percent(self.used_memory_mib + extra, self.total_memory_mib)
    }

    /// Pod-count utilization percentage after adding `extra` pods.
    pub fn pod_percent_with(&self, extra: i64) -> f64 {
        percent(self.used_pod_count + extra, self.total_pod_count)
    }

    /// Mean of the three expected post-placement utilization percentages.
    /// Used only to order candidates; the per-resource gate is separate.
    pub fn combined_percent_with(&self, requests: &InstallationResources) -> f64 {
        (self.cpu_percent_with(requests.cpu_requests_millis)
            + self.memory_percent_with(requests.memory_requests_mib)
            + self.pod_percent_with(requests.pod_count))
            / 3.0
    }
}

/// A zero-capacity dimension reads as fully utilized so it can never pass a
/// resource gate.
fn percent(used: i64, total: i64) -> f64 {
    if total <= 0 {
        return 100.0;
    }
    (used as f64 / total as f64) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources() -> ClusterResources {
        ClusterResources {
            total_cpu_millis: 10_000,
            used_cpu_millis: 2_000,
            total_memory_mib: 20_000,
            used_memory_mib: 5_000,
            total_pod_count: 100,
            used_pod_count: 10,
        }
    }

    #[test]
    fn percentages_include_the_candidate() {
        let r = resources();
        assert_eq!(r.cpu_percent_with(3_000), 50.0);
        assert_eq!(r.memory_percent_with(5_000), 50.0);
        assert_eq!(r.pod_percent_with(40), 50.0);
    }

    #[test]
    fn combined_is_the_mean_of_the_three() {
        let r = resources();
        let requests = InstallationResources {
            cpu_requests_millis: 3_000,
            memory_requests_mib: 5_000,
            pod_count: 40,
        };
        assert_eq!(r.combined_percent_with(&requests), 50.0);
    }

    #[test]
    fn zero_capacity_reads_full() {
        let r = ClusterResources::default();
        assert_eq!(r.cpu_percent_with(0), 100.0);
        assert_eq!(r.pod_percent_with(5), 100.0);
    }
}
