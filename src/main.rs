use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use request_pipeline::{AppState, Config, build_router, logging, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        // No subscriber yet: fall back to stderr.
        eprintln!("Configuration error: {e}");
        exitcode::CONFIG
    })?;

    logging::init_tracing(&config);
    info!(
        environment = config.environment.as_str(),
        "Starting request pipeline service v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        host = %config.host,
        port = %config.port,
        log_level = config.min_log_level().as_str(),
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        match metrics::init_metrics(metrics_addr) {
            Ok(()) => info!("Prometheus metrics on http://{metrics_addr}/metrics"),
            Err(e) => warn!("Metrics exporter not started: {e}"),
        }
    }

    // Build application state and router
    let state = AppState::new(config.clone()).map_err(|e| {
        error!("Failed to initialize application state: {e}");
        exitcode::CONFIG
    })?;
    let app = build_router(state.clone());

    // Start server
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health         - Health check");
    info!("  GET  /me             - Authenticated caller");
    info!("  POST /consultations  - Open a consultation");
    info!("  GET  /resources      - List resources");

    // Peer addresses feed client address resolution.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    // Gracefully shutdown background tasks
    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
