use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A point-in-time backup of an installation's data, produced by a job run
/// inside the cluster currently hosting the installation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallationBackup {
    pub id: String,
    pub installation_id: String,
    /// The cluster installation claimed to run the backup job; empty until
    /// the backup is triggered.
    pub cluster_installation_id: String,
    pub data_residence: Option<DataResidence>,
    pub state: BackupState,
    /// Timestamp the backed-up dataset corresponds to, reported by the job.
    /// Unix epoch milliseconds, zero until the backup succeeds.
    pub start_at: i64,
    /// Unix epoch timestamp in milliseconds.
    pub create_at: i64,
    /// Unix epoch timestamp in milliseconds. Zero means not deleted.
    pub delete_at: i64,
    pub lock_acquired_by: Option<String>,
    pub lock_acquired_at: i64,
}

impl InstallationBackup {
    /// An active backup blocks deletion of the cluster installation it runs
    /// on, and of the owning installation.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            BackupState::BackupRequested | BackupState::BackupInProgress
        )
    }
}

/// Where the backup artifacts live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataResidence {
    pub url: String,
    pub region: String,
    pub bucket: String,
    pub path_prefix: String,
    pub object_key: String,
}

impl DataResidence {
    /// Only object-store-backed residences are deletable through the
    /// control plane.
    pub fn is_object_store(&self) -> bool {
        self.url.starts_with("s3://")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BackupState {
    BackupRequested,
    BackupInProgress,
    BackupSucceeded,
    BackupFailed,
    DeletionRequested,
    Deleted,
    DeletionFailed,
}

impl BackupState {
    pub const PENDING_WORK: &'static [BackupState] = &[
        BackupState::BackupRequested,
        BackupState::BackupInProgress,
        BackupState::DeletionRequested,
    ];

    pub fn work_priority(&self) -> i64 {
        match self {
            BackupState::BackupInProgress => 30,
            BackupState::DeletionRequested => 20,
            BackupState::BackupRequested => 10,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupState::BackupRequested => "backup-requested",
            BackupState::BackupInProgress => "backup-in-progress",
            BackupState::BackupSucceeded => "backup-succeeded",
            BackupState::BackupFailed => "backup-failed",
            BackupState::DeletionRequested => "deletion-requested",
            BackupState::Deleted => "deleted",
            BackupState::DeletionFailed => "deletion-failed",
        }
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BackupState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup-requested" => Ok(BackupState::BackupRequested),
            "backup-in-progress" => Ok(BackupState::BackupInProgress),
            "backup-succeeded" => Ok(BackupState::BackupSucceeded),
            "backup-failed" => Ok(BackupState::BackupFailed),
            "deletion-requested" => Ok(BackupState::DeletionRequested),
            "deleted" => Ok(BackupState::Deleted),
            "deletion-failed" => Ok(BackupState::DeletionFailed),
            _ => Err(()),
        }
    }
}
