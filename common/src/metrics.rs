use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use owo_colors::OwoColorize;
use std::sync::OnceLock;
use std::time::Instant;
use tokio::net::TcpListener;

use crate::shutdown::shutdown_signal;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static SERVER_STARTED: OnceLock<()> = OnceLock::new();

fn install_recorder_once() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install global metrics recorder")
    })
}

/// Spawn the Prometheus endpoint if a port was configured. Idempotent; the
/// server and the global recorder are installed at most once per process.
pub fn maybe_spawn_metrics_server(port: Option<u16>) {
    let Some(port) = port else {
        return;
    };
    // A panic on any task must take the whole replica down; a half-alive
    // process would sit on its locks while doing no work. Chain a process
    // exit onto whatever hook is already installed.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    if SERVER_STARTED.set(()).is_ok() {
        let _ = install_recorder_once();
        tokio::spawn(run_metrics_server(port));
    }
}

pub async fn run_metrics_server(port: u16) {
    let handle = install_recorder_once().clone();
    let metrics_route = axum::routing::get(move || async move { handle.render() });
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/metrics", metrics_route);
    let addr = format!("0.0.0.0:{}", port);
    // Failing to serve probes and metrics is fatal on purpose; the panic
    // hook above turns it into a restart.
    let listener = TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind metrics endpoint on {addr}: {err}"));
    println!(
        "{} {}",
        "📈 Metrics endpoint up at".green(),
        addr.green().dimmed(),
    );
    let started = Instant::now();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("serve metrics endpoint");
    println!(
        "{} {}",
        "📉 Metrics endpoint closed after".red(),
        format!("{:.2?}", started.elapsed()).red().dimmed()
    );
}
