//! Reconciliation core of the anchorage control plane: a family of
//! supervisors, each a state-machine driver for one resource kind, driven by
//! generic schedulers and coordinated across replicas by store-level locks.

pub mod backup;
pub mod cluster;
pub mod cluster_installation;
pub mod database;
pub mod dev;
pub mod dns;
pub mod error;
pub mod events;
pub mod filestore;
pub mod installation;
pub mod metrics;
pub mod migration;
pub mod options;
pub mod provisioner;
pub mod restoration;
pub mod scheduler;
pub mod webhooks;

pub use backup::BackupSupervisor;
pub use cluster::ClusterSupervisor;
pub use cluster_installation::ClusterInstallationSupervisor;
pub use error::JobBackoffLimitReached;
pub use installation::InstallationSupervisor;
pub use migration::MigrationSupervisor;
pub use options::{SchedulingOptions, SupervisorOptions};
pub use restoration::RestorationSupervisor;
pub use scheduler::{Doer, Scheduler};
