use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tumbler_api::config::ServerConfig;
use tumbler_api::router::build_app_router;
use tumbler_api::state::AppState;
use tumbler_pipeline::{ShellRunner, Tracker, TrackerConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tumbler_api=debug,tumbler_pipeline=debug,tumbler_events=debug,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    let tracker_config = TrackerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Tracker ---
    let runner = Arc::new(
        ShellRunner::new(tracker_config.runner_shell.clone())
            .with_docker(tracker_config.runner_docker.clone()),
    );
    let tracker = Arc::new(Tracker::new(tracker_config, runner));

    match tracker.config().jobs_home.clone() {
        Some(home) => match tracker.load_catalog(&home).await {
            Ok(count) => tracing::info!(home = %home.display(), count, "Job catalog loaded"),
            Err(e) => tracing::error!(home = %home.display(), error = %e, "Failed to load job catalog"),
        },
        None => tracing::warn!("JOBS_HOME not set, starting with an empty job catalog"),
    }

    // --- Retention ---
    let retention_cancel = CancellationToken::new();
    let retention_handle = tokio::spawn(tumbler_api::background::retention::run(
        Arc::clone(&tracker),
        retention_cancel.clone(),
    ));

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        tracker: Arc::clone(&tracker),
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    // Open event streams only end once their execution is terminal, so the
    // tracker is shut down before the server waits for connections to drain.
    let shutdown_tracker = Arc::clone(&tracker);
    let grace = Duration::from_secs(config.shutdown_timeout_secs);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, cancelling in-flight executions");
            shutdown_tracker.shutdown(grace).await;
        })
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    retention_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), retention_handle).await;
    tracing::info!("Retention job stopped");

    tracing::info!(
        executions = tracker.store().len().await,
        topics = tracker.bus().topic_count(),
        "Graceful shutdown complete"
    );
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
