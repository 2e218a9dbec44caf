use anyhow::Result;
use std::net::SocketAddr;

mod handlers;
mod routes;
mod state;

use common::config::Settings;
use common::telemetry;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Settings::load()?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &config.observability.log_level,
        config.observability.tracing_endpoint.as_deref(),
    )?;
    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        "Configuration loaded"
    );

    telemetry::init_metrics(config.observability.metrics_port)?;

    let state = AppState::new(config.clone())?;

    let results = state.import_catalog().await?;
    if !results.is_empty() {
        let imported = results.iter().filter(|r| r.success).count();
        tracing::info!(
            imported = imported,
            skipped = results.len() - imported,
            "Catalog seed loaded"
        );
    }

    let scheduler = state.scheduler.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.start().await });

    let feed = state.feed.clone();
    let feed_task = tokio::spawn(async move { feed.run().await });

    let app = routes::create_router(state.clone());

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));
    tracing::info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.scheduler.stop();
    state.feed.stop();
    for (name, task) in [("scheduler", scheduler_task), ("feed", feed_task)] {
        if let Err(e) = task.await {
            tracing::error!(task = name, error = %e, "Background task failed");
        }
    }

    tracing::info!("Courier server stopped");
    telemetry::shutdown_tracer();
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Initiating graceful shutdown");
}
