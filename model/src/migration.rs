use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::installation::DatabaseKind;

/// Moves an installation's database between backends through a
/// backup → switch → restore → reconfigure pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallationDbMigrationOperation {
    pub id: String,
    pub installation_id: String,
    pub source_database: DatabaseKind,
    pub destination_database: DatabaseKind,
    /// Backup created by the pipeline; empty until triggered.
    pub backup_id: String,
    /// Restoration operation created by the pipeline; empty until triggered.
    pub installation_db_restoration_operation_id: String,
    /// Unix epoch milliseconds, zero until the operation completes.
    pub complete_at: i64,
    pub state: MigrationState,
    /// Unix epoch timestamp in milliseconds.
    pub create_at: i64,
    /// Unix epoch timestamp in milliseconds. Zero means not deleted.
    pub delete_at: i64,
    pub lock_acquired_by: Option<String>,
    pub lock_acquired_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationState {
    Requested,
    BackupInProgress,
    DatabaseSwitch,
    RefreshSecrets,
    TriggerRestoration,
    RestorationInProgress,
    UpdatingInstallationConfig,
    Finalizing,
    Succeeded,
    Failing,
    Failed,
    RollbackRequested,
    RollbackFinished,
    DeletionRequested,
    Deleted,
}

impl MigrationState {
    pub const PENDING_WORK: &'static [MigrationState] = &[
        MigrationState::Requested,
        MigrationState::BackupInProgress,
        MigrationState::DatabaseSwitch,
        MigrationState::RefreshSecrets,
        MigrationState::TriggerRestoration,
        MigrationState::RestorationInProgress,
        MigrationState::UpdatingInstallationConfig,
        MigrationState::Finalizing,
        MigrationState::Failing,
        MigrationState::RollbackRequested,
        MigrationState::DeletionRequested,
    ];

    pub fn work_priority(&self) -> i64 {
        match self {
            MigrationState::Finalizing => 100,
            MigrationState::UpdatingInstallationConfig => 90,
            MigrationState::RestorationInProgress => 80,
            MigrationState::TriggerRestoration => 70,
            MigrationState::RefreshSecrets => 60,
            MigrationState::DatabaseSwitch => 50,
            MigrationState::BackupInProgress => 40,
            MigrationState::Failing => 30,
            MigrationState::RollbackRequested => 30,
            MigrationState::DeletionRequested => 20,
            MigrationState::Requested => 10,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Requested => "requested",
            MigrationState::BackupInProgress => "backup-in-progress",
            MigrationState::DatabaseSwitch => "database-switch",
            MigrationState::RefreshSecrets => "refresh-secrets",
            MigrationState::TriggerRestoration => "trigger-restoration",
            MigrationState::RestorationInProgress => "restoration-in-progress",
            MigrationState::UpdatingInstallationConfig => "updating-installation-config",
            MigrationState::Finalizing => "finalizing",
            MigrationState::Succeeded => "succeeded",
            MigrationState::Failing => "failing",
            MigrationState::Failed => "failed",
            MigrationState::RollbackRequested => "rollback-requested",
            MigrationState::RollbackFinished => "rollback-finished",
            MigrationState::DeletionRequested => "deletion-requested",
            MigrationState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MigrationState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(MigrationState::Requested),
            "backup-in-progress" => Ok(MigrationState::BackupInProgress),
            "database-switch" => Ok(MigrationState::DatabaseSwitch),
            "refresh-secrets" => Ok(MigrationState::RefreshSecrets),
            "trigger-restoration" => Ok(MigrationState::TriggerRestoration),
            "restoration-in-progress" => Ok(MigrationState::RestorationInProgress),
            "updating-installation-config" => Ok(MigrationState::UpdatingInstallationConfig),
            "finalizing" => Ok(MigrationState::Finalizing),
            "succeeded" => Ok(MigrationState::Succeeded),
            "failing" => Ok(MigrationState::Failing),
            "failed" => Ok(MigrationState::Failed),
            "rollback-requested" => Ok(MigrationState::RollbackRequested),
            "rollback-finished" => Ok(MigrationState::RollbackFinished),
            "deletion-requested" => Ok(MigrationState::DeletionRequested),
            "deleted" => Ok(MigrationState::Deleted),
            _ => Err(()),
        }
    }
}
