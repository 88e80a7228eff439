use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A provisioned compute substrate that installations are placed onto.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: String,
    pub state: ClusterState,
    pub provisioner: ProvisionerKind,
    pub provisioner_metadata: ProvisionerMetadata,
    /// Scheduling gate: placement never considers a cluster with this unset.
    pub allow_installations: bool,
    pub annotations: Vec<String>,
    pub has_aws_infrastructure: bool,
    /// Unix epoch timestamp in milliseconds.
    pub create_at: i64,
    /// Unix epoch timestamp in milliseconds. Zero means not deleted.
    pub delete_at: i64,
    pub lock_acquired_by: Option<String>,
    /// Unix epoch timestamp in milliseconds. Zero means unlocked.
    pub lock_acquired_at: i64,
}

impl Cluster {
    pub fn is_deleted(&self) -> bool {
        self.delete_at > 0
    }

    pub fn is_externally_managed(&self) -> bool {
        self.provisioner == ProvisionerKind::External
    }

    /// Composite scheduling gate: the gate flag plus a state that is neither
    /// terminal nor failing.
    pub fn can_schedule_installations(&self) -> bool {
        self.allow_installations && self.state.allows_scheduling()
    }

    pub fn node_min_count(&self) -> i64 {
        match &self.provisioner_metadata {
            ProvisionerMetadata::Kops(m) => m.node_min_count,
            ProvisionerMetadata::Eks(m) => m.node_groups.values().map(|g| g.min_count).sum(),
            ProvisionerMetadata::External(_) => 0,
        }
    }

    pub fn node_max_count(&self) -> i64 {
        match &self.provisioner_metadata {
            ProvisionerMetadata::Kops(m) => m.node_max_count,
            ProvisionerMetadata::Eks(m) => m.node_groups.values().map(|g| g.max_count).sum(),
            ProvisionerMetadata::External(_) => 0,
        }
    }

    /// Record a pending scale-up in the change-request shape the cluster's
    /// provisioner expects. Returns false when the provisioner variant cannot
    /// be resized this way (externally managed clusters).
    pub fn apply_scale_up(&mut self, scale_value: i64) -> bool {
        match &mut self.provisioner_metadata {
            ProvisionerMetadata::Kops(m) => {
                let new_min = (m.node_min_count + scale_value).min(m.node_max_count);
                m.change_request = Some(KopsChangeRequest {
                    node_min_count: Some(new_min),
                    node_max_count: None,
                    version: None,
                });
                true
            }
            ProvisionerMetadata::Eks(m) => {
                // EKS scales per node group; spread the increment across all
                // groups that still have headroom.
                let mut requests = BTreeMap::new();
                let mut remaining = scale_value;
                for (name, group) in &m.node_groups {
                    if remaining <= 0 {
                        break;
                    }
                    let headroom = group.max_count - group.min_count;
                    if headroom <= 0 {
                        continue;
                    }
                    let grant = remaining.min(headroom);
                    requests.insert(name.clone(), group.min_count + grant);
                    remaining -= grant;
                }
                if requests.is_empty() {
                    return false;
                }
                m.change_request = Some(EksChangeRequest {
                    node_group_min_counts: requests,
                    version: None,
                });
                true
            }
            ProvisionerMetadata::External(_) => false,
        }
    }
}

/// Tag selecting the provisioner adapter responsible for a cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionerKind {
    Kops,
    Eks,
    External,
}

impl ProvisionerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionerKind::Kops => "kops",
            ProvisionerKind::Eks => "eks",
            ProvisionerKind::External => "external",
        }
    }
}

impl fmt::Display for ProvisionerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProvisionerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kops" => Ok(ProvisionerKind::Kops),
            "eks" => Ok(ProvisionerKind::Eks),
            "external" => Ok(ProvisionerKind::External),
            _ => Err(()),
        }
    }
}

/// Per-provisioner cluster metadata, including the in-flight change request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProvisionerMetadata {
    Kops(KopsMetadata),
    Eks(EksMetadata),
    External(ExternalMetadata),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct KopsMetadata {
    pub name: String,
    pub version: String,
    pub node_instance_type: String,
    pub node_min_count: i64,
    pub node_max_count: i64,
    pub change_request: Option<KopsChangeRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct KopsChangeRequest {
    pub node_min_count: Option<i64>,
    pub node_max_count: Option<i64>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EksMetadata {
    pub name: String,
    pub version: String,
    pub node_groups: BTreeMap<String, EksNodeGroup>,
    pub change_request: Option<EksChangeRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EksNodeGroup {
    pub instance_type: String,
    pub min_count: i64,
    pub max_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EksChangeRequest {
    pub node_group_min_counts: BTreeMap<String, i64>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExternalMetadata {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterState {
    CreationRequested,
    CreationInProgress,
    WaitingForNodes,
    ProvisioningRequested,
    ProvisionInProgress,
    UpgradeRequested,
    ResizeRequested,
    RefreshMetadata,
    Stable,
    DeletionRequested,
    Deleted,
    CreationFailed,
    ProvisioningFailed,
    UpgradeFailed,
    ResizeFailed,
    DeletionFailed,
}

impl ClusterState {
    /// States eligible for supervisor work. Stable and terminal states are
    /// never returned by pending-work queries.
    pub const PENDING_WORK: &'static [ClusterState] = &[
        ClusterState::CreationRequested,
        ClusterState::CreationInProgress,
        ClusterState::WaitingForNodes,
        ClusterState::ProvisioningRequested,
        ClusterState::ProvisionInProgress,
        ClusterState::UpgradeRequested,
        ClusterState::ResizeRequested,
        ClusterState::RefreshMetadata,
        ClusterState::DeletionRequested,
    ];

    /// Ordering weight for pending-work queries; higher is drained first.
    /// In-flight work outranks new requests so partially provisioned
    /// clusters converge before new ones start.
    pub fn work_priority(&self) -> i64 {
        match self {
            ClusterState::RefreshMetadata => 90,
            ClusterState::ProvisionInProgress => 80,
            ClusterState::WaitingForNodes => 70,
            ClusterState::CreationInProgress => 60,
            ClusterState::ProvisioningRequested => 50,
            ClusterState::UpgradeRequested => 40,
            ClusterState::ResizeRequested => 40,
            ClusterState::DeletionRequested => 30,
            ClusterState::CreationRequested => 20,
            _ => 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ClusterState::CreationFailed
                | ClusterState::ProvisioningFailed
                | ClusterState::UpgradeFailed
                | ClusterState::ResizeFailed
                | ClusterState::DeletionFailed
        )
    }

    pub fn allows_scheduling(&self) -> bool {
        !self.is_failed()
            && !matches!(
                self,
                ClusterState::DeletionRequested | ClusterState::Deleted
            )
    }

    /// The originating request states used to label lifecycle duration
    /// metrics once a cluster settles.
    pub const REQUEST_STATES: &'static [ClusterState] = &[
        ClusterState::CreationRequested,
        ClusterState::ProvisioningRequested,
        ClusterState::UpgradeRequested,
        ClusterState::ResizeRequested,
        ClusterState::DeletionRequested,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::CreationRequested => "creation-requested",
            ClusterState::CreationInProgress => "creation-in-progress",
            ClusterState::WaitingForNodes => "waiting-for-nodes",
            ClusterState::ProvisioningRequested => "provisioning-requested",
            ClusterState::ProvisionInProgress => "provision-in-progress",
            ClusterState::UpgradeRequested => "upgrade-requested",
            ClusterState::ResizeRequested => "resize-requested",
            ClusterState::RefreshMetadata => "refresh-metadata",
            ClusterState::Stable => "stable",
            ClusterState::DeletionRequested => "deletion-requested",
            ClusterState::Deleted => "deleted",
            ClusterState::CreationFailed => "creation-failed",
            ClusterState::ProvisioningFailed => "provisioning-failed",
            ClusterState::UpgradeFailed => "upgrade-failed",
            ClusterState::ResizeFailed => "resize-failed",
            ClusterState::DeletionFailed => "deletion-failed",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ClusterState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creation-requested" => Ok(ClusterState::CreationRequested),
            "creation-in-progress" => Ok(ClusterState::CreationInProgress),
            "waiting-for-nodes" => Ok(ClusterState::WaitingForNodes),
            "provisioning-requested" => Ok(ClusterState::ProvisioningRequested),
            "provision-in-progress" => Ok(ClusterState::ProvisionInProgress),
            "upgrade-requested" => Ok(ClusterState::UpgradeRequested),
            "resize-requested" => Ok(ClusterState::ResizeRequested),
            "refresh-metadata" => Ok(ClusterState::RefreshMetadata),
            "stable" => Ok(ClusterState::Stable),
            "deletion-requested" => Ok(ClusterState::DeletionRequested),
            "deleted" => Ok(ClusterState::Deleted),
            "creation-failed" => Ok(ClusterState::CreationFailed),
            "provisioning-failed" => Ok(ClusterState::ProvisioningFailed),
            "upgrade-failed" => Ok(ClusterState::UpgradeFailed),
            "resize-failed" => Ok(ClusterState::ResizeFailed),
            "deletion-failed" => Ok(ClusterState::DeletionFailed),
            _ => Err(()),
        }
    }
}
