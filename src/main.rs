use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use request_gate::config::LogFormat;
use request_gate::{AppError, Config, build_app, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // Configuration is loaded first so LOG_FORMAT can shape the subscriber;
    // a load error is reported once logging is up.
    let config = Config::from_env();
    init_tracing(config.as_ref().map(|c| c.log_format).unwrap_or_default());

    info!("Starting request_gate v{}", env!("CARGO_PKG_VERSION"));

    let result = match config {
        Ok(config) => run(config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Run the application until a shutdown signal arrives.
async fn run(config: Config) -> Result<(), AppError> {
    info!(
        host = %config.host,
        port = %config.port,
        rps = config.rate_limit_rps,
        burst = config.rate_limit_burst,
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    }

    let shutdown = CancellationToken::new();
    let app = build_app(&config, &shutdown)?;

    let addr: SocketAddr = config
        .server_addr()
        .parse()
        .map_err(|e| AppError::ConfigError(format!("Invalid server address: {e}")))?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        AppError::Io(e)
    })?;

    info!("Server listening on http://{addr}");
    info!("Endpoints:");
    info!("  GET  /health  - Health check (not gated)");
    info!("  GET  /        - Greeting");
    info!("  GET  /whoami  - Resolved client address");

    let served = axum::serve(
        listener,
        app.router
            .clone()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await;

    // Stop background tasks whether or not the server exited cleanly
    info!("HTTP server stopped, shutting down background tasks...");
    shutdown.cancel();
    app.shutdown().await;

    served.map_err(|e| AppError::Server(e.to_string()))?;
    info!("Server shutdown complete");
    Ok(())
}
