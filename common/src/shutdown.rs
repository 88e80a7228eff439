use owo_colors::OwoColorize;

/// Resolves once the process has been asked to stop. Supervisor loops and
/// the metrics server select on this to begin a graceful drain.
pub async fn shutdown_signal() {
    let signal_name = stop_signal().await;
    eprintln!(
        "{}",
        format!("🛑 {signal_name} received, draining").red()
    );
}

/// SIGINT covers interactive use, SIGTERM is what the pod runtime sends.
#[cfg(unix)]
async fn stop_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn stop_signal() -> &'static str {
    tokio::signal::ctrl_c()
        .await
        .expect("install Ctrl+C handler");
    "Ctrl+C"
}
