use super::*;
use std::collections::BTreeMap;

use anchorage_model::{
    Affinity, Cluster, ClusterResources, ClusterState, DatabaseKind, FilestoreKind, Group,
    InstallationDnsRecord, InstallationSize, KopsChangeRequest, KopsMetadata, ProvisionerKind,
    ProvisionerMetadata, StateChangeEventFilter, Volume,
};
use anchorage_store::InMemoryStore;

use crate::backup::BackupSupervisor;
use crate::cluster_installation::ClusterInstallationSupervisor;
use crate::dev::{DevDatabase, DevDns, DevFilestore, DevObjectStore, DevProvisioner};
use crate::migration::MigrationSupervisor;
use crate::restoration::RestorationSupervisor;
use crate::webhooks::WebhookSender;

struct Fixture {
    store: Arc<InMemoryStore>,
    supervisor: InstallationSupervisor,
    provisioner: Arc<DevProvisioner>,
    database: Arc<DevDatabase>,
    filestore: Arc<DevFilestore>,
    dns: Arc<DevDns>,
}

fn fixture(options: SchedulingOptions) -> Fixture {
    let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
    let provisioner = Arc::new(DevProvisioner::new());
    let registry = ProvisionerRegistry::new()
        .register(ProvisionerKind::Kops, provisioner.clone())
        .register(ProvisionerKind::External, provisioner.clone());
    let database = Arc::new(DevDatabase::default());
    let databases = DatabaseRegistry::new()
        .register(DatabaseKind::MultiTenantRds, database.clone())
        .register(DatabaseKind::SingleTenantRds, database.clone());
    let filestore = Arc::new(DevFilestore::default());
    let filestores = FilestoreRegistry::new().register(FilestoreKind::S3, filestore.clone());
    let dns = Arc::new(DevDns::default());
    let events = Arc::new(EventProducer::new(store.clone()));
    let supervisor = InstallationSupervisor::new(
        store.clone(),
        registry,
        databases,
        filestores,
        dns.clone(),
        events,
        options,
    );
    Fixture {
        store,
        supervisor,
        provisioner,
        database,
        filestore,
        dns,
    }
}

fn kops_cluster(id: &str) -> Cluster {
    Cluster {
        id: id.to_string(),
        state: ClusterState::Stable,
        provisioner: ProvisionerKind::Kops,
        provisioner_metadata: ProvisionerMetadata::Kops(KopsMetadata {
            name: format!("kops-{id}"),
            version: "1.29.0".to_string(),
            node_instance_type: "m5.large".to_string(),
            node_min_count: 3,
            node_max_count: 10,
            change_request: None,
        }),
        allow_installations: true,
        annotations: vec![],
        has_aws_infrastructure: true,
        create_at: now_millis(),
        delete_at: 0,
        lock_acquired_by: None,
        lock_acquired_at: 0,
    }
}

fn installation(id: &str, state: InstallationState, affinity: Affinity) -> Installation {
    Installation {
        id: id.to_string(),
        owner_id: "owner".to_string(),
        version: "9.5.0".to_string(),
        cr_version: LATEST_CR_VERSION.to_string(),
        size: InstallationSize::Users100,
        affinity,
        database: DatabaseKind::MultiTenantRds,
        filestore: FilestoreKind::S3,
        group_id: None,
        group_sequence: None,
        annotations: vec![],
        requires_aws_infrastructure: false,
        keep_database_data: false,
        keep_filestore_data: false,
        volumes: None,
        state,
        create_at: now_millis(),
        delete_at: 0,
        lock_acquired_by: None,
        lock_acquired_at: 0,
    }
}

fn binding(id: &str, cluster_id: &str, installation_id: &str) -> ClusterInstallation {
    ClusterInstallation {
        id: id.to_string(),
        cluster_id: cluster_id.to_string(),
        installation_id: installation_id.to_string(),
        namespace: installation_id.to_string(),
        is_active: true,
        state: ClusterInstallationState::Stable,
        create_at: now_millis(),
        delete_at: 0,
        lock_acquired_by: None,
        lock_acquired_at: 0,
    }
}

async fn stored(store: &InMemoryStore, id: &str) -> Installation {
    store.get_installation(id).await.unwrap().unwrap()
}

#[tokio::test]
async fn creation_on_empty_cluster_reaches_in_progress_in_one_pass() {
    let f = fixture(SchedulingOptions::default());
    f.store.create_cluster(&kops_cluster("c1")).await.unwrap();
    let i1 = installation("i1", InstallationState::CreationRequested, Affinity::Isolated);
    f.store.create_installation(&i1).await.unwrap();

    f.supervisor.supervise(&i1).await;

    let after = stored(&f.store, "i1").await;
    assert_eq!(after.state, InstallationState::CreationInProgress);
    let cis = f
        .store
        .get_cluster_installations_for_installation("i1")
        .await
        .unwrap();
    assert_eq!(cis.len(), 1);
    assert_eq!(cis[0].cluster_id, "c1");
    assert_eq!(cis[0].state, ClusterInstallationState::CreationRequested);
    assert!(cis[0].is_active);
    // Database and filestore were pre-provisioned on the way through.
    assert!(
        f.database
            .calls
            .lock()
            .unwrap()
            .contains(&"provision:i1".to_string())
    );
    assert!(
        f.filestore
            .calls
            .lock()
            .unwrap()
            .contains(&"provision:i1".to_string())
    );
    // The installation lock was released.
    assert_eq!(after.lock_acquired_at, 0);
}

#[tokio::test]
async fn empty_cluster_list_means_no_compatible_clusters() {
    let f = fixture(SchedulingOptions::default());
    let i1 = installation("i1", InstallationState::CreationRequested, Affinity::Isolated);
    f.store.create_installation(&i1).await.unwrap();

    f.supervisor.supervise(&i1).await;
    assert_eq!(
        stored(&f.store, "i1").await.state,
        InstallationState::CreationNoCompatibleClusters
    );
}

#[tokio::test]
async fn multi_tenant_rejected_next_to_an_isolated_tenant() {
    let f = fixture(SchedulingOptions::default());
    f.store.create_cluster(&kops_cluster("c1")).await.unwrap();
    let hermit = installation("hermit", InstallationState::Stable, Affinity::Isolated);
    f.store.create_installation(&hermit).await.unwrap();
    f.store
        .create_cluster_installation(&binding("ci-hermit", "c1", "hermit"))
        .await
        .unwrap();

    let i2 = installation("i2", InstallationState::CreationRequested, Affinity::MultiTenant);
    f.store.create_installation(&i2).await.unwrap();
    f.supervisor.supervise(&i2).await;

    assert_eq!(
        stored(&f.store, "i2").await.state,
        InstallationState::CreationNoCompatibleClusters
    );
    let cis = f
        .store
        .get_cluster_installations_for_cluster("c1")
        .await
        .unwrap();
    assert_eq!(cis.len(), 1);
}

#[tokio::test]
async fn isolated_rejected_on_any_occupied_cluster() {
    let f = fixture(SchedulingOptions::default());
    f.store.create_cluster(&kops_cluster("c1")).await.unwrap();
    let tenant = installation("tenant", InstallationState::Stable, Affinity::MultiTenant);
    f.store.create_installation(&tenant).await.unwrap();
    f.store
        .create_cluster_installation(&binding("ci-tenant", "c1", "tenant"))
        .await
        .unwrap();

    let loner = installation("loner", InstallationState::CreationRequested, Affinity::Isolated);
    f.store.create_installation(&loner).await.unwrap();
    f.supervisor.supervise(&loner).await;

    assert_eq!(
        stored(&f.store, "loner").await.state,
        InstallationState::CreationNoCompatibleClusters
    );
}

#[tokio::test]
async fn aws_infrastructure_requirement_filters_clusters() {
    let f = fixture(SchedulingOptions::default());
    let mut cluster = kops_cluster("c1");
    cluster.has_aws_infrastructure = false;
    f.store.create_cluster(&cluster).await.unwrap();

    let mut i1 = installation("i1", InstallationState::CreationRequested, Affinity::Isolated);
    i1.requires_aws_infrastructure = true;
    f.store.create_installation(&i1).await.unwrap();

    f.supervisor.supervise(&i1).await;
    assert_eq!(
        stored(&f.store, "i1").await.state,
        InstallationState::CreationNoCompatibleClusters
    );
}

#[tokio::test]
async fn annotations_must_be_contained_in_the_cluster() {
    let f = fixture(SchedulingOptions::default());
    let mut cluster = kops_cluster("c1");
    cluster.annotations = vec!["tier=general".to_string()];
    f.store.create_cluster(&cluster).await.unwrap();

    let mut i1 = installation("i1", InstallationState::CreationRequested, Affinity::Isolated);
    i1.annotations = vec!["customer=acme".to_string()];
    f.store.create_installation(&i1).await.unwrap();

    f.supervisor.supervise(&i1).await;
    assert_eq!(
        stored(&f.store, "i1").await.state,
        InstallationState::CreationNoCompatibleClusters
    );
}

#[tokio::test]
async fn placement_prefers_the_least_utilized_cluster() {
    let f = fixture(SchedulingOptions::default());
    f.store.create_cluster(&kops_cluster("busy")).await.unwrap();
    f.store.create_cluster(&kops_cluster("idle")).await.unwrap();
    f.provisioner.state.set_cluster_resources(
        "busy",
        ClusterResources {
            total_cpu_millis: 100_000,
            used_cpu_millis: 70_000,
            total_memory_mib: 200_000,
            used_memory_mib: 140_000,
            total_pod_count: 500,
            used_pod_count: 350,
        },
    );
    f.provisioner.state.set_cluster_resources(
        "idle",
        ClusterResources {
            total_cpu_millis: 100_000,
            used_cpu_millis: 1_000,
            total_memory_mib: 200_000,
            used_memory_mib: 2_000,
            total_pod_count: 500,
            used_pod_count: 5,
        },
    );

    let i1 = installation("i1", InstallationState::CreationRequested, Affinity::MultiTenant);
    f.store.create_installation(&i1).await.unwrap();
    f.supervisor.supervise(&i1).await;

    let cis = f
        .store
        .get_cluster_installations_for_installation("i1")
        .await
        .unwrap();
    assert_eq!(cis.len(), 1);
    assert_eq!(cis[0].cluster_id, "idle");
}

#[tokio::test]
async fn over_threshold_stable_cluster_triggers_scale_up() {
    let options = SchedulingOptions {
        cluster_resource_threshold_scale_value: 2,
        ..SchedulingOptions::default()
    };
    let f = fixture(options);
    f.store.create_cluster(&kops_cluster("c1")).await.unwrap();
    // Any placement tips all three dimensions over 80%.
    f.provisioner.state.set_cluster_resources(
        "c1",
        ClusterResources {
            total_cpu_millis: 2_500,
            used_cpu_millis: 2_400,
            total_memory_mib: 4_500,
            used_memory_mib: 4_300,
            total_pod_count: 20,
            used_pod_count: 18,
        },
    );

    let i3 = installation("i3", InstallationState::CreationRequested, Affinity::Isolated);
    f.store.create_installation(&i3).await.unwrap();
    f.supervisor.supervise(&i3).await;

    // The cluster was asked to grow and the installation waits in place.
    let cluster = f.store.get_cluster("c1").await.unwrap().unwrap();
    assert_eq!(cluster.state, ClusterState::ResizeRequested);
    match cluster.provisioner_metadata {
        ProvisionerMetadata::Kops(m) => {
            assert_eq!(
                m.change_request,
                Some(KopsChangeRequest {
                    node_min_count: Some(5),
                    node_max_count: None,
                    version: None,
                })
            );
        }
        _ => panic!("unexpected metadata variant"),
    }
    assert_eq!(
        stored(&f.store, "i3").await.state,
        InstallationState::CreationRequested
    );
    assert!(
        f.store
            .get_cluster_installations_for_installation("i3")
            .await
            .unwrap()
            .is_empty()
    );
    let events = f
        .store
        .get_state_change_events(&StateChangeEventFilter {
            resource_id: Some("c1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].new_state, "resize-requested");
}

#[tokio::test]
async fn zero_scale_value_disables_autoscaling() {
    let f = fixture(SchedulingOptions::default());
    f.store.create_cluster(&kops_cluster("c1")).await.unwrap();
    f.provisioner.state.set_cluster_resources(
        "c1",
        ClusterResources {
            total_cpu_millis: 2_500,
            used_cpu_millis: 2_400,
            total_memory_mib: 4_500,
            used_memory_mib: 4_300,
            total_pod_count: 20,
            used_pod_count: 18,
        },
    );

    let i1 = installation("i1", InstallationState::CreationRequested, Affinity::Isolated);
    f.store.create_installation(&i1).await.unwrap();
    f.supervisor.supervise(&i1).await;

    assert_eq!(
        f.store.get_cluster("c1").await.unwrap().unwrap().state,
        ClusterState::Stable
    );
    assert_eq!(
        stored(&f.store, "i1").await.state,
        InstallationState::CreationNoCompatibleClusters
    );
}

#[tokio::test]
async fn externally_managed_clusters_can_bypass_the_resource_gate() {
    let options = SchedulingOptions {
        always_schedule_external_clusters: true,
        ..SchedulingOptions::default()
    };
    let f = fixture(options);
    let mut cluster = kops_cluster("c1");
    cluster.provisioner = ProvisionerKind::External;
    cluster.provisioner_metadata = ProvisionerMetadata::External(Default::default());
    f.store.create_cluster(&cluster).await.unwrap();
    f.provisioner.state.set_cluster_resources(
        "c1",
        ClusterResources {
            total_cpu_millis: 1_000,
            used_cpu_millis: 999,
            total_memory_mib: 1_000,
            used_memory_mib: 999,
            total_pod_count: 10,
            used_pod_count: 9,
        },
    );

    let i1 = installation("i1", InstallationState::CreationRequested, Affinity::Isolated);
    f.store.create_installation(&i1).await.unwrap();
    f.supervisor.supervise(&i1).await;

    assert_eq!(
        stored(&f.store, "i1").await.state,
        InstallationState::CreationInProgress
    );
}

#[tokio::test]
async fn stale_state_is_a_no_op() {
    let f = fixture(SchedulingOptions::default());
    let mut i1 = installation("i1", InstallationState::UpdateInProgress, Affinity::Isolated);
    f.store.create_installation(&i1).await.unwrap();

    i1.state = InstallationState::CreationRequested;
    f.supervisor.supervise(&i1).await;

    assert_eq!(
        stored(&f.store, "i1").await.state,
        InstallationState::UpdateInProgress
    );
    let events = f
        .store
        .get_state_change_events(&StateChangeEventFilter {
            resource_id: Some("i1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn creation_completes_to_stable_once_bindings_settle() {
    let f = fixture(SchedulingOptions::default());
    f.store.create_cluster(&kops_cluster("c1")).await.unwrap();
    let i1 = installation("i1", InstallationState::CreationInProgress, Affinity::Isolated);
    f.store.create_installation(&i1).await.unwrap();
    f.store
        .create_cluster_installation(&binding("ci1", "c1", "i1"))
        .await
        .unwrap();

    f.supervisor.supervise(&i1).await;
    assert_eq!(stored(&f.store, "i1").await.state, InstallationState::Stable);
}

#[tokio::test]
async fn update_rolls_group_config_into_the_workload() {
    let f = fixture(SchedulingOptions::default());
    f.store.create_cluster(&kops_cluster("c1")).await.unwrap();
    f.store
        .create_group(&Group {
            id: "g1".to_string(),
            name: "ring-1".to_string(),
            sequence: 7,
            version: "9.6.1".to_string(),
            env_overrides: BTreeMap::new(),
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        })
        .await
        .unwrap();
    let mut i1 = installation("i1", InstallationState::UpdateRequested, Affinity::Isolated);
    i1.group_id = Some("g1".to_string());
    i1.group_sequence = Some(3);
    f.store.create_installation(&i1).await.unwrap();
    f.store
        .create_cluster_installation(&binding("ci1", "c1", "i1"))
        .await
        .unwrap();

    f.supervisor.supervise(&i1).await;

    let after = stored(&f.store, "i1").await;
    assert_eq!(after.state, InstallationState::UpdateInProgress);
    assert_eq!(after.version, "9.6.1");
    assert_eq!(after.group_sequence, Some(7));
    let ci = f
        .store
        .get_cluster_installation("ci1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ci.state, ClusterInstallationState::Reconciling);
    assert_eq!(ci.lock_acquired_at, 0);
    let calls = f.provisioner.state.calls.lock().unwrap().clone();
    assert!(calls.contains(&"ensure-cr-migrated:i1".to_string()));
    assert!(calls.contains(&"update-ci:ci1".to_string()));
}

#[tokio::test]
async fn group_drift_mid_update_restarts_the_update() {
    let f = fixture(SchedulingOptions::default());
    f.store.create_cluster(&kops_cluster("c1")).await.unwrap();
    f.store
        .create_group(&Group {
            id: "g1".to_string(),
            name: "ring-1".to_string(),
            sequence: 8,
            version: String::new(),
            env_overrides: BTreeMap::new(),
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        })
        .await
        .unwrap();
    let mut i1 = installation("i1", InstallationState::UpdateInProgress, Affinity::Isolated);
    i1.group_id = Some("g1".to_string());
    i1.group_sequence = Some(7);
    f.store.create_installation(&i1).await.unwrap();
    f.store
        .create_cluster_installation(&binding("ci1", "c1", "i1"))
        .await
        .unwrap();

    f.supervisor.supervise(&i1).await;
    assert_eq!(
        stored(&f.store, "i1").await.state,
        InstallationState::UpdateRequested
    );
}

#[tokio::test]
async fn finalize_stable_guard_catches_drift_at_the_finish_line() {
    let f = fixture(SchedulingOptions::default());
    f.store
        .create_group(&Group {
            id: "g1".to_string(),
            name: "ring-1".to_string(),
            sequence: 9,
            version: String::new(),
            env_overrides: BTreeMap::new(),
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        })
        .await
        .unwrap();
    let mut i1 = installation("i1", InstallationState::CreationFinalTasks, Affinity::Isolated);
    i1.group_id = Some("g1".to_string());
    i1.group_sequence = Some(8);
    f.store.create_installation(&i1).await.unwrap();

    f.supervisor.supervise(&i1).await;
    assert_eq!(
        stored(&f.store, "i1").await.state,
        InstallationState::UpdateRequested
    );
}

#[tokio::test]
async fn hibernation_rolls_through_and_settles() {
    let f = fixture(SchedulingOptions::default());
    f.store.create_cluster(&kops_cluster("c1")).await.unwrap();
    let i1 = installation("i1", InstallationState::HibernationRequested, Affinity::Isolated);
    f.store.create_installation(&i1).await.unwrap();
    f.store
        .create_cluster_installation(&binding("ci1", "c1", "i1"))
        .await
        .unwrap();

    f.supervisor.supervise(&i1).await;
    assert_eq!(
        stored(&f.store, "i1").await.state,
        InstallationState::HibernationInProgress
    );
    assert!(
        f.database
            .calls
            .lock()
            .unwrap()
            .contains(&"refresh-metadata:i1".to_string())
    );
    assert!(
        f.provisioner
            .state
            .calls
            .lock()
            .unwrap()
            .contains(&"hibernate-ci:ci1".to_string())
    );

    // The workload settles; the next pass parks the installation.
    let mut ci = f
        .store
        .get_cluster_installation("ci1")
        .await
        .unwrap()
        .unwrap();
    ci.state = ClusterInstallationState::Stable;
    f.store.update_cluster_installation(&ci).await.unwrap();

    let current = stored(&f.store, "i1").await;
    f.supervisor.supervise(&current).await;
    assert_eq!(
        stored(&f.store, "i1").await.state,
        InstallationState::Hibernating
    );
}

#[tokio::test]
async fn wake_up_goes_back_through_the_update_pipeline() {
    let f = fixture(SchedulingOptions::default());
    let i1 = installation("i1", InstallationState::WakeUpRequested, Affinity::Isolated);
    f.store.create_installation(&i1).await.unwrap();

    f.supervisor.supervise(&i1).await;
    assert_eq!(
        stored(&f.store, "i1").await.state,
        InstallationState::UpdateRequested
    );
    assert!(
        f.database
            .calls
            .lock()
            .unwrap()
            .contains(&"refresh-metadata:i1".to_string())
    );
}

#[tokio::test]
async fn deletion_marks_bindings_and_waits_for_the_cascade() {
    let f = fixture(SchedulingOptions::default());
    f.store.create_cluster(&kops_cluster("c1")).await.unwrap();
    let i1 = installation("i1", InstallationState::DeletionRequested, Affinity::Isolated);
    f.store.create_installation(&i1).await.unwrap();
    f.store
        .create_cluster_installation(&binding("ci1", "c1", "i1"))
        .await
        .unwrap();

    f.supervisor.supervise(&i1).await;
    assert_eq!(
        stored(&f.store, "i1").await.state,
        InstallationState::DeletionInProgress
    );
    assert_eq!(
        f.store
            .get_cluster_installation("ci1")
            .await
            .unwrap()
            .unwrap()
            .state,
        ClusterInstallationState::DeletionRequested
    );
}

#[tokio::test]
async fn failed_binding_deletion_fails_the_installation() {
    let f = fixture(SchedulingOptions::default());
    f.store.create_cluster(&kops_cluster("c1")).await.unwrap();
    let i1 = installation("i1", InstallationState::DeletionInProgress, Affinity::Isolated);
    f.store.create_installation(&i1).await.unwrap();
    let mut ci = binding("ci1", "c1", "i1");
    ci.state = ClusterInstallationState::DeletionFailed;
    f.store.create_cluster_installation(&ci).await.unwrap();

    f.supervisor.supervise(&i1).await;
    assert_eq!(
        stored(&f.store, "i1").await.state,
        InstallationState::DeletionFailed
    );
}

/// Place-then-delete law: driving every supervisor until quiescence leaves
/// no live rows behind.
#[tokio::test]
async fn deletion_cascade_leaves_no_live_rows() {
    let f = fixture(SchedulingOptions::default());
    f.store.create_cluster(&kops_cluster("c1")).await.unwrap();

    let mut i1 = installation("i1", InstallationState::DeletionRequested, Affinity::Isolated);
    i1.volumes = Some(BTreeMap::from([(
        "license".to_string(),
        Volume {
            backing_secret: "license-secret".to_string(),
            mount_path: "/mnt/license".to_string(),
        },
    )]));
    f.store.create_installation(&i1).await.unwrap();
    f.store
        .create_cluster_installation(&binding("ci1", "c1", "i1"))
        .await
        .unwrap();
    f.store
        .create_dns_record(&InstallationDnsRecord {
            id: "dns1".to_string(),
            installation_id: "i1".to_string(),
            domain_name: "acme.example.com".to_string(),
            is_primary: true,
            create_at: now_millis(),
            delete_at: 0,
        })
        .await
        .unwrap();
    f.store
        .create_backup(&anchorage_model::InstallationBackup {
            id: "b1".to_string(),
            installation_id: "i1".to_string(),
            cluster_installation_id: "ci1".to_string(),
            data_residence: Some(anchorage_model::DataResidence {
                url: "s3://anchorage-backups/i1/b1".to_string(),
                region: "us-east-1".to_string(),
                bucket: "anchorage-backups".to_string(),
                path_prefix: "i1".to_string(),
                object_key: "b1".to_string(),
            }),
            state: BackupState::BackupSucceeded,
            start_at: now_millis(),
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        })
        .await
        .unwrap();
    f.store
        .create_restoration(&anchorage_model::InstallationDbRestorationOperation {
            id: "r1".to_string(),
            installation_id: "i1".to_string(),
            backup_id: "b1".to_string(),
            cluster_installation_id: "ci1".to_string(),
            target_installation_state: InstallationState::Hibernating,
            complete_at: now_millis(),
            state: RestorationState::Succeeded,
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        })
        .await
        .unwrap();
    f.store
        .create_migration(&anchorage_model::InstallationDbMigrationOperation {
            id: "m1".to_string(),
            installation_id: "i1".to_string(),
            source_database: DatabaseKind::MultiTenantRds,
            destination_database: DatabaseKind::SingleTenantRds,
            backup_id: "b1".to_string(),
            installation_db_restoration_operation_id: "r1".to_string(),
            complete_at: now_millis(),
            state: MigrationState::Succeeded,
            create_at: now_millis(),
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        })
        .await
        .unwrap();

    // The sibling supervisors that the cascade hands work to.
    let registry = ProvisionerRegistry::new()
        .register(ProvisionerKind::Kops, f.provisioner.clone());
    let events = Arc::new(EventProducer::new(f.store.clone()));
    let webhooks = Arc::new(WebhookSender::new(f.store.clone(), "test".to_string()));
    let ci_supervisor = ClusterInstallationSupervisor::new(
        f.store.clone(),
        registry.clone(),
        events.clone(),
    );
    let backup_supervisor = BackupSupervisor::new(
        f.store.clone(),
        registry.clone(),
        events.clone(),
        webhooks.clone(),
        Arc::new(DevObjectStore::default()),
    );
    let restoration_supervisor = RestorationSupervisor::new(
        f.store.clone(),
        registry.clone(),
        events.clone(),
        webhooks.clone(),
    );
    let migration_supervisor = MigrationSupervisor::new(
        f.store.clone(),
        registry,
        DatabaseRegistry::new()
            .register(DatabaseKind::MultiTenantRds, Arc::new(DevDatabase::default())),
        events,
        webhooks,
    );

    for _ in 0..12 {
        f.supervisor.do_work().await.unwrap();
        ci_supervisor.do_work().await.unwrap();
        backup_supervisor.do_work().await.unwrap();
        restoration_supervisor.do_work().await.unwrap();
        migration_supervisor.do_work().await.unwrap();
        if stored(&f.store, "i1").await.state == InstallationState::Deleted {
            break;
        }
    }

    let after = stored(&f.store, "i1").await;
    assert_eq!(after.state, InstallationState::Deleted);
    assert!(after.delete_at > 0);
    assert!(
        f.store
            .get_cluster_installations_for_installation("i1")
            .await
            .unwrap()
            .iter()
            .all(|ci| ci.is_deleted())
    );
    assert!(
        f.store
            .get_backups_for_installation("i1")
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        f.store
            .get_restorations_for_installation("i1")
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        f.store
            .get_migrations_for_installation("i1")
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        f.store
            .get_dns_records_for_installation("i1")
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        f.dns.deleted.lock().unwrap().as_slice(),
        &["acme.example.com".to_string()]
    );
    assert!(
        f.provisioner
            .state
            .calls
            .lock()
            .unwrap()
            .contains(&"delete-volume-secrets:i1".to_string())
    );
    assert!(
        f.database
            .calls
            .lock()
            .unwrap()
            .contains(&"teardown:i1:keep=false".to_string())
    );
    assert!(
        f.filestore
            .calls
            .lock()
            .unwrap()
            .contains(&"teardown:i1:keep=false".to_string())
    );
}
