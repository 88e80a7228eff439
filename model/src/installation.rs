use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::resources::InstallationResources;

/// A tenant application instance. The top-level resource of the control
/// plane; everything else hangs off an installation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Installation {
    pub id: String,
    pub owner_id: String,
    pub version: String,
    /// Custom-resource schema version the workload is reconciled against.
    pub cr_version: String,
    pub size: InstallationSize,
    pub affinity: Affinity,
    pub database: DatabaseKind,
    pub filestore: FilestoreKind,
    pub group_id: Option<String>,
    /// The group `sequence` observed when this installation last merged
    /// group configuration. Drift against the live group re-queues an
    /// update.
    pub group_sequence: Option<i64>,
    pub annotations: Vec<String>,
    pub requires_aws_infrastructure: bool,
    /// Deletion cascade leaves the database behind when set.
    pub keep_database_data: bool,
    /// Deletion cascade leaves the filestore and backups behind when set.
    pub keep_filestore_data: bool,
    /// Extra volumes mounted into the workload, name → backing secret.
    pub volumes: Option<BTreeMap<String, Volume>>,
    pub state: InstallationState,
    /// Unix epoch timestamp in milliseconds.
    pub create_at: i64,
    /// Unix epoch timestamp in milliseconds. Zero means not deleted.
    pub delete_at: i64,
    pub lock_acquired_by: Option<String>,
    pub lock_acquired_at: i64,
}

impl Installation {
    pub fn is_deleted(&self) -> bool {
        self.delete_at > 0
    }

    pub fn resources(&self) -> InstallationResources {
        self.size.resources()
    }

    /// Annotation containment: every annotation on the installation must be
    /// present on a candidate cluster.
    pub fn annotations_subset_of(&self, cluster_annotations: &[String]) -> bool {
        self.annotations
            .iter()
            .all(|a| cluster_annotations.contains(a))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub backing_secret: String,
    pub mount_path: String,
}

/// Placement constraint. Isolated tenants get a cluster to themselves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Affinity {
    Isolated,
    MultiTenant,
}

impl Affinity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Affinity::Isolated => "isolated",
            Affinity::MultiTenant => "multi-tenant",
        }
    }
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Affinity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "isolated" => Ok(Affinity::Isolated),
            "multi-tenant" => Ok(Affinity::MultiTenant),
            _ => Err(()),
        }
    }
}

/// T-shirt sizing tag. Maps to concrete CPU/memory/pod requests through a
/// closed table; the tag itself is what persists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstallationSize {
    #[serde(rename = "100users")]
    Users100,
    #[serde(rename = "1000users")]
    Users1000,
    #[serde(rename = "5000users")]
    Users5000,
    #[serde(rename = "10000users")]
    Users10000,
    #[serde(rename = "25000users")]
    Users25000,
}

impl InstallationSize {
    pub fn resources(&self) -> InstallationResources {
        match self {
            InstallationSize::Users100 => InstallationResources {
                cpu_requests_millis: 2_000,
                memory_requests_mib: 4_096,
                pod_count: 12,
            },
            InstallationSize::Users1000 => InstallationResources {
                cpu_requests_millis: 4_000,
                memory_requests_mib: 8_192,
                pod_count: 20,
            },
            InstallationSize::Users5000 => InstallationResources {
                cpu_requests_millis: 8_000,
                memory_requests_mib: 16_384,
                pod_count: 30,
            },
            InstallationSize::Users10000 => InstallationResources {
                cpu_requests_millis: 16_000,
                memory_requests_mib: 32_768,
                pod_count: 45,
            },
            InstallationSize::Users25000 => InstallationResources {
                cpu_requests_millis: 32_000,
                memory_requests_mib: 65_536,
                pod_count: 70,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallationSize::Users100 => "100users",
            InstallationSize::Users1000 => "1000users",
            InstallationSize::Users5000 => "5000users",
            InstallationSize::Users10000 => "10000users",
            InstallationSize::Users25000 => "25000users",
        }
    }
}

impl fmt::Display for InstallationSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for InstallationSize {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "100users" => Ok(InstallationSize::Users100),
            "1000users" => Ok(InstallationSize::Users1000),
            "5000users" => Ok(InstallationSize::Users5000),
            "10000users" => Ok(InstallationSize::Users10000),
            "25000users" => Ok(InstallationSize::Users25000),
            _ => Err(()),
        }
    }
}

/// Backend tag for the tenant's database.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseKind {
    SingleTenantRds,
    MultiTenantRds,
    InCluster,
}

impl DatabaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::SingleTenantRds => "single-tenant-rds",
            DatabaseKind::MultiTenantRds => "multi-tenant-rds",
            DatabaseKind::InCluster => "in-cluster",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DatabaseKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single-tenant-rds" => Ok(DatabaseKind::SingleTenantRds),
            "multi-tenant-rds" => Ok(DatabaseKind::MultiTenantRds),
            "in-cluster" => Ok(DatabaseKind::InCluster),
            _ => Err(()),
        }
    }
}

/// Backend tag for the tenant's file storage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FilestoreKind {
    S3,
    MultiTenantS3,
    InCluster,
}

impl FilestoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilestoreKind::S3 => "s3",
            FilestoreKind::MultiTenantS3 => "multi-tenant-s3",
            FilestoreKind::InCluster => "in-cluster",
        }
    }
}

impl fmt::Display for FilestoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FilestoreKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s3" => Ok(FilestoreKind::S3),
            "multi-tenant-s3" => Ok(FilestoreKind::MultiTenantS3),
            "in-cluster" => Ok(FilestoreKind::InCluster),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum InstallationState {
    CreationRequested,
    CreationPreProvisioning,
    CreationInProgress,
    CreationDns,
    CreationFinalTasks,
    CreationNoCompatibleClusters,
    CreationFailed,
    Stable,
    UpdateRequested,
    UpdateInProgress,
    UpdateFailed,
    HibernationRequested,
    HibernationInProgress,
    Hibernating,
    WakeUpRequested,
    DnsMigrationHibernating,
    DeletionPendingRequested,
    DeletionPendingInProgress,
    DeletionPending,
    DeletionCancellationRequested,
    DeletionRequested,
    DeletionInProgress,
    DeletionFinalCleanup,
    DeletionFailed,
    Deleted,
    DbRestorationInProgress,
    DbMigrationInProgress,
    DbRestorationFailed,
    DbMigrationFailed,
}

impl InstallationState {
    pub const PENDING_WORK: &'static [InstallationState] = &[
        InstallationState::CreationRequested,
        InstallationState::CreationPreProvisioning,
        InstallationState::CreationInProgress,
        InstallationState::CreationDns,
        InstallationState::CreationFinalTasks,
        InstallationState::CreationNoCompatibleClusters,
        InstallationState::UpdateRequested,
        InstallationState::UpdateInProgress,
        InstallationState::HibernationRequested,
        InstallationState::HibernationInProgress,
        InstallationState::WakeUpRequested,
        InstallationState::DnsMigrationHibernating,
        InstallationState::DeletionPendingRequested,
        InstallationState::DeletionPendingInProgress,
        InstallationState::DeletionCancellationRequested,
        InstallationState::DeletionRequested,
        InstallationState::DeletionInProgress,
        InstallationState::DeletionFinalCleanup,
    ];

    /// Ordering weight for pending-work queries; higher drains first.
    /// Deletions and in-flight work outrank fresh requests, and retry
    /// states sit at the bottom so they never starve new work.
    pub fn work_priority(&self) -> i64 {
        match self {
            InstallationState::DeletionFinalCleanup => 100,
            InstallationState::DeletionInProgress => 95,
            InstallationState::DeletionRequested => 90,
            InstallationState::DeletionCancellationRequested => 85,
            InstallationState::CreationFinalTasks => 80,
            InstallationState::CreationDns => 75,
            InstallationState::CreationInProgress => 70,
            InstallationState::CreationPreProvisioning => 65,
            InstallationState::UpdateInProgress => 60,
            InstallationState::HibernationInProgress => 55,
            InstallationState::DeletionPendingInProgress => 55,
            InstallationState::DnsMigrationHibernating => 50,
            InstallationState::UpdateRequested => 45,
            InstallationState::HibernationRequested => 40,
            InstallationState::WakeUpRequested => 40,
            InstallationState::DeletionPendingRequested => 35,
            InstallationState::CreationRequested => 30,
            InstallationState::CreationNoCompatibleClusters => 10,
            _ => 0,
        }
    }

    /// Creation-pipeline states the supervisor chases through in a single
    /// supervise pass instead of waiting a scheduler tick between stages.
    pub fn is_expedited(&self) -> bool {
        matches!(
            self,
            InstallationState::CreationPreProvisioning
                | InstallationState::CreationDns
                | InstallationState::CreationFinalTasks
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            InstallationState::CreationFailed
                | InstallationState::UpdateFailed
                | InstallationState::DeletionFailed
                | InstallationState::DbRestorationFailed
                | InstallationState::DbMigrationFailed
        )
    }

    pub const REQUEST_STATES: &'static [InstallationState] = &[
        InstallationState::CreationRequested,
        InstallationState::UpdateRequested,
        InstallationState::HibernationRequested,
        InstallationState::WakeUpRequested,
        InstallationState::DeletionPendingRequested,
        InstallationState::DeletionCancellationRequested,
        InstallationState::DeletionRequested,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallationState::CreationRequested => "creation-requested",
            InstallationState::CreationPreProvisioning => "creation-pre-provisioning",
            InstallationState::CreationInProgress => "creation-in-progress",
            InstallationState::CreationDns => "creation-dns",
            InstallationState::CreationFinalTasks => "creation-final-tasks",
            InstallationState::CreationNoCompatibleClusters => "creation-no-compatible-clusters",
            InstallationState::CreationFailed => "creation-failed",
            InstallationState::Stable => "stable",
            InstallationState::UpdateRequested => "update-requested",
            InstallationState::UpdateInProgress => "update-in-progress",
            InstallationState::UpdateFailed => "update-failed",
            InstallationState::HibernationRequested => "hibernation-requested",
            InstallationState::HibernationInProgress => "hibernation-in-progress",
            InstallationState::Hibernating => "hibernating",
            InstallationState::WakeUpRequested => "wake-up-requested",
            InstallationState::DnsMigrationHibernating => "dns-migration-hibernating",
            InstallationState::DeletionPendingRequested => "deletion-pending-requested",
            InstallationState::DeletionPendingInProgress => "deletion-pending-in-progress",
            InstallationState::DeletionPending => "deletion-pending",
            InstallationState::DeletionCancellationRequested => "deletion-cancellation-requested",
            InstallationState::DeletionRequested => "deletion-requested",
            InstallationState::DeletionInProgress => "deletion-in-progress",
            InstallationState::DeletionFinalCleanup => "deletion-final-cleanup",
            InstallationState::DeletionFailed => "deletion-failed",
            InstallationState::Deleted => "deleted",
            InstallationState::DbRestorationInProgress => "db-restoration-in-progress",
            InstallationState::DbMigrationInProgress => "db-migration-in-progress",
            InstallationState::DbRestorationFailed => "db-restoration-failed",
            InstallationState::DbMigrationFailed => "db-migration-failed",
        }
    }
}

impl fmt::Display for InstallationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for InstallationState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creation-requested" => Ok(InstallationState::CreationRequested),
            "creation-pre-provisioning" => Ok(InstallationState::CreationPreProvisioning),
            "creation-in-progress" => Ok(InstallationState::CreationInProgress),
            "creation-dns" => Ok(InstallationState::CreationDns),
            "creation-final-tasks" => Ok(InstallationState::CreationFinalTasks),
            "creation-no-compatible-clusters" => {
                Ok(InstallationState::CreationNoCompatibleClusters)
            }
            "creation-failed" => Ok(InstallationState::CreationFailed),
            "stable" => Ok(InstallationState::Stable),
            "update-requested" => Ok(InstallationState::UpdateRequested),
            "update-in-progress" => Ok(InstallationState::UpdateInProgress),
            "update-failed" => Ok(InstallationState::UpdateFailed),
            "hibernation-requested" => Ok(InstallationState::HibernationRequested),
            "hibernation-in-progress" => Ok(InstallationState::HibernationInProgress),
            "hibernating" => Ok(InstallationState::Hibernating),
            "wake-up-requested" => Ok(InstallationState::WakeUpRequested),
            "dns-migration-hibernating" => Ok(InstallationState::DnsMigrationHibernating),
            "deletion-pending-requested" => Ok(InstallationState::DeletionPendingRequested),
            "deletion-pending-in-progress" => Ok(InstallationState::DeletionPendingInProgress),
            "deletion-pending" => Ok(InstallationState::DeletionPending),
            "deletion-cancellation-requested" => {
                Ok(InstallationState::DeletionCancellationRequested)
            }
            "deletion-requested" => Ok(InstallationState::DeletionRequested),
            "deletion-in-progress" => Ok(InstallationState::DeletionInProgress),
            "deletion-final-cleanup" => Ok(InstallationState::DeletionFinalCleanup),
            "deletion-failed" => Ok(InstallationState::DeletionFailed),
            "deleted" => Ok(InstallationState::Deleted),
            "db-restoration-in-progress" => Ok(InstallationState::DbRestorationInProgress),
            "db-migration-in-progress" => Ok(InstallationState::DbMigrationInProgress),
            "db-restoration-failed" => Ok(InstallationState::DbRestorationFailed),
            "db-migration-failed" => Ok(InstallationState::DbMigrationFailed),
            _ => Err(()),
        }
    }
}
