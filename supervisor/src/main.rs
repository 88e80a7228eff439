use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use owo_colors::OwoColorize;

use anchorage_common::args::PostgresArgs;
use anchorage_common::{metrics, postgres, shutdown};
use anchorage_model::{DatabaseKind, FilestoreKind, ProvisionerKind};
use anchorage_store::{InMemoryStore, PostgresStore, Store};
use anchorage_supervisor::database::DatabaseRegistry;
use anchorage_supervisor::dev::{DevDatabase, DevDns, DevFilestore, DevObjectStore, DevProvisioner};
use anchorage_supervisor::events::EventProducer;
use anchorage_supervisor::filestore::FilestoreRegistry;
use anchorage_supervisor::provisioner::ProvisionerRegistry;
use anchorage_supervisor::webhooks::WebhookSender;
use anchorage_supervisor::{
    BackupSupervisor, ClusterInstallationSupervisor, ClusterSupervisor, InstallationSupervisor,
    MigrationSupervisor, RestorationSupervisor, Scheduler,
};

mod args;

use args::{Cli, Commands, ServerArgs};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server(server_args) => run_server(server_args).await,
    }
}

async fn run_server(server_args: ServerArgs) -> Result<()> {
    println!("{}", "⚓ Starting anchorage supervisors...".green());
    metrics::maybe_spawn_metrics_server(server_args.metrics.metrics_port);

    let store = build_store(&server_args.store, server_args.postgres.clone()).await?;

    // Real cloud drivers are linked in by the deployment build and register
    // themselves here; the dev stack stands in everywhere else.
    let provisioner = Arc::new(DevProvisioner::new());
    let provisioners = ProvisionerRegistry::new()
        .register(ProvisionerKind::Kops, provisioner.clone())
        .register(ProvisionerKind::Eks, provisioner.clone())
        .register(ProvisionerKind::External, provisioner);
    let database = Arc::new(DevDatabase::default());
    let databases = DatabaseRegistry::new()
        .register(DatabaseKind::SingleTenantRds, database.clone())
        .register(DatabaseKind::MultiTenantRds, database.clone())
        .register(DatabaseKind::InCluster, database);
    let dev_filestore = Arc::new(DevFilestore::default());
    let filestores = FilestoreRegistry::new()
        .register(FilestoreKind::S3, dev_filestore.clone())
        .register(FilestoreKind::MultiTenantS3, dev_filestore.clone())
        .register(FilestoreKind::InCluster, dev_filestore);
    let dns = Arc::new(DevDns::default());
    let object_store = Arc::new(DevObjectStore::default());

    let events = Arc::new(EventProducer::new(store.clone()));
    let webhooks = Arc::new(WebhookSender::new(
        store.clone(),
        server_args.environment.clone(),
    ));
    let scheduling = server_args.scheduling.to_options();
    let period = Duration::from_secs(server_args.poll_seconds);

    let schedulers = vec![
        Scheduler::start(
            Arc::new(ClusterSupervisor::new(
                store.clone(),
                provisioners.clone(),
                events.clone(),
            )),
            period,
        ),
        Scheduler::start(
            Arc::new(ClusterInstallationSupervisor::new(
                store.clone(),
                provisioners.clone(),
                events.clone(),
            )),
            period,
        ),
        Scheduler::start(
            Arc::new(InstallationSupervisor::new(
                store.clone(),
                provisioners.clone(),
                databases.clone(),
                filestores,
                dns,
                events.clone(),
                scheduling,
            )),
            period,
        ),
        Scheduler::start(
            Arc::new(BackupSupervisor::new(
                store.clone(),
                provisioners.clone(),
                events.clone(),
                webhooks.clone(),
                object_store,
            )),
            period,
        ),
        Scheduler::start(
            Arc::new(RestorationSupervisor::new(
                store.clone(),
                provisioners.clone(),
                events.clone(),
                webhooks.clone(),
            )),
            period,
        ),
        Scheduler::start(
            Arc::new(MigrationSupervisor::new(
                store.clone(),
                provisioners,
                databases,
                events,
                webhooks,
            )),
            period,
        ),
    ];

    anchorage_common::signal_ready();
    println!(
        "{}{}",
        "🌱 Supervisors running • poll=".green(),
        format!("{}s", server_args.poll_seconds).green().dimmed(),
    );

    shutdown::shutdown_signal().await;
    println!("{}", "🛑 Draining supervisors...".red());
    for scheduler in schedulers {
        scheduler.close().await;
    }
    println!("{}", "🛑 Supervisors stopped gracefully".red());
    Ok(())
}

async fn build_store(backend: &str, pg_args: PostgresArgs) -> Result<Arc<dyn Store>> {
    match backend {
        "postgres" => {
            let pool = postgres::create_pool(pg_args).await;
            let store = PostgresStore::new(pool);
            store.init_schema().await?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        other => bail!("unknown store backend {other:?}"),
    }
}
