use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
mod storage;

use services::cleanup::CleanupJob;
use state::AppState;
use storage::service::ConcreteStorageService;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting filebox with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }
    db::run_migrations(&db)
        .await
        .context("applying schema at startup")?;

    // --- Storage backends ---
    let storage = Arc::new(ConcreteStorageService::from_config(&cfg.storage).await);

    // --- Core services + background cleanup ---
    let addr = cfg.addr();
    let host = cfg.host.clone();
    let port = cfg.port;
    let max_chunk_size = usize::try_from(cfg.transfer.max_chunk_size)
        .context("max chunk size must be non-negative")?;
    let state = AppState::new(cfg, db, storage.clone());

    let shutdown = CancellationToken::new();
    let cleanup = CleanupJob::new(
        state.repo.clone(),
        storage.clone(),
        state.chunks.clone(),
        state.config.transfer.clone(),
    )
    .spawn(shutdown.clone());

    // --- Build router ---
    let app: Router = routes::routes::routes(max_chunk_size).with_state(state);

    // --- Start server ---
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Teardown ---
    shutdown.cancel();
    if let Err(err) = cleanup.await {
        tracing::warn!("cleanup task ended abnormally: {}", err);
    }
    storage.shutdown().await;
    tracing::info!("Shutdown complete.");

    Ok(())
}

/// Resolve on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received.");
}
