use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The materialization of one installation on one cluster. Bound to the same
/// cluster and installation for life; deletion flips the state to `Deleted`
/// rather than removing the row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterInstallation {
    pub id: String,
    pub cluster_id: String,
    pub installation_id: String,
    pub namespace: String,
    pub is_active: bool,
    pub state: ClusterInstallationState,
    /// Unix epoch timestamp in milliseconds.
    pub create_at: i64,
    /// Unix epoch timestamp in milliseconds. Zero means not deleted.
    pub delete_at: i64,
    pub lock_acquired_by: Option<String>,
    pub lock_acquired_at: i64,
}

impl ClusterInstallation {
    pub fn is_deleted(&self) -> bool {
        self.state == ClusterInstallationState::Deleted
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterInstallationState {
    CreationRequested,
    CreationFailed,
    Reconciling,
    Ready,
    Stable,
    DeletionRequested,
    DeletionFailed,
    Deleted,
}

impl ClusterInstallationState {
    /// Ready is still pending work: a serving-but-not-converged workload
    /// keeps getting polled until it reaches Stable.
    pub const PENDING_WORK: &'static [ClusterInstallationState] = &[
        ClusterInstallationState::CreationRequested,
        ClusterInstallationState::Reconciling,
        ClusterInstallationState::Ready,
        ClusterInstallationState::DeletionRequested,
    ];

    pub fn work_priority(&self) -> i64 {
        match self {
            ClusterInstallationState::DeletionRequested => 30,
            ClusterInstallationState::Reconciling => 20,
            ClusterInstallationState::Ready => 15,
            ClusterInstallationState::CreationRequested => 10,
            _ => 0,
        }
    }

    /// Ready counts as settled for installation-side polling that tolerates
    /// a workload which is serving but not yet fully converged.
    pub fn is_stable(&self, ready_allowed: bool) -> bool {
        match self {
            ClusterInstallationState::Stable => true,
            ClusterInstallationState::Ready => ready_allowed,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterInstallationState::CreationRequested => "creation-requested",
            ClusterInstallationState::CreationFailed => "creation-failed",
            ClusterInstallationState::Reconciling => "reconciling",
            ClusterInstallationState::Ready => "ready",
            ClusterInstallationState::Stable => "stable",
            ClusterInstallationState::DeletionRequested => "deletion-requested",
            ClusterInstallationState::DeletionFailed => "deletion-failed",
            ClusterInstallationState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ClusterInstallationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ClusterInstallationState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creation-requested" => Ok(ClusterInstallationState::CreationRequested),
            "creation-failed" => Ok(ClusterInstallationState::CreationFailed),
            "reconciling" => Ok(ClusterInstallationState::Reconciling),
            "ready" => Ok(ClusterInstallationState::Ready),
            "stable" => Ok(ClusterInstallationState::Stable),
            "deletion-requested" => Ok(ClusterInstallationState::DeletionRequested),
            "deletion-failed" => Ok(ClusterInstallationState::DeletionFailed),
            "deleted" => Ok(ClusterInstallationState::Deleted),
            _ => Err(()),
        }
    }
}
