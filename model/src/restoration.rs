use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::installation::InstallationState;

/// Restores an installation's database from a finished backup, then parks
/// the installation in `target_installation_state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallationDbRestorationOperation {
    pub id: String,
    pub installation_id: String,
    pub backup_id: String,
    /// The cluster installation claimed to run the restore job; empty until
    /// the restore is triggered.
    pub cluster_installation_id: String,
    /// Where the installation lands once the restoration finalizes.
    pub target_installation_state: InstallationState,
    /// Unix epoch milliseconds, zero until the operation completes.
    pub complete_at: i64,
    pub state: RestorationState,
    /// Unix epoch timestamp in milliseconds.
    pub create_at: i64,
    /// Unix epoch timestamp in milliseconds. Zero means not deleted.
    pub delete_at: i64,
    pub lock_acquired_by: Option<String>,
    pub lock_acquired_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RestorationState {
    Requested,
    InProgress,
    Finalizing,
    Succeeded,
    Failing,
    Failed,
    Invalid,
    DeletionRequested,
    Deleted,
}

impl RestorationState {
    pub const PENDING_WORK: &'static [RestorationState] = &[
        RestorationState::Requested,
        RestorationState::InProgress,
        RestorationState::Finalizing,
        RestorationState::Failing,
        RestorationState::DeletionRequested,
    ];

    pub fn work_priority(&self) -> i64 {
        match self {
            RestorationState::Finalizing => 50,
            RestorationState::Failing => 40,
            RestorationState::InProgress => 30,
            RestorationState::DeletionRequested => 20,
            RestorationState::Requested => 10,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RestorationState::Requested => "requested",
            RestorationState::InProgress => "in-progress",
            RestorationState::Finalizing => "finalizing",
            RestorationState::Succeeded => "succeeded",
            RestorationState::Failing => "failing",
            RestorationState::Failed => "failed",
            RestorationState::Invalid => "invalid",
            RestorationState::DeletionRequested => "deletion-requested",
            RestorationState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for RestorationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RestorationState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(RestorationState::Requested),
            "in-progress" => Ok(RestorationState::InProgress),
            "finalizing" => Ok(RestorationState::Finalizing),
            "succeeded" => Ok(RestorationState::Succeeded),
            "failing" => Ok(RestorationState::Failing),
            "failed" => Ok(RestorationState::Failed),
            "invalid" => Ok(RestorationState::Invalid),
            "deletion-requested" => Ok(RestorationState::DeletionRequested),
            "deleted" => Ok(RestorationState::Deleted),
            _ => Err(()),
        }
    }
}
