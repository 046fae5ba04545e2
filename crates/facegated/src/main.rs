use std::sync::Arc;

use anyhow::{Context, Result};
use facegate_core::{
    open_store, Config, EnrollmentService, MatchPolicy, ModelSlot, VerificationService,
};
use tracing_subscriber::EnvFilter;

mod http;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        bind = %config.bind_addr,
        backend = ?config.store_backend,
        store = %config.store_path.display(),
        models = %config.model_dir.display(),
        threshold = config.match_threshold,
        "configuration loaded"
    );

    let store = open_store(config.store_backend, &config.store_path)
        .context("failed to open identity store")?;
    let models = Arc::new(ModelSlot::new(facegate_models::loader(config.model_dir.clone())));

    if config.preload_models {
        let models = Arc::clone(&models);
        tokio::spawn(async move {
            // The daemon keeps serving; /api/init retries the load.
            if let Err(e) = models.ensure_ready().await {
                tracing::warn!(error = %e, "model preload failed");
            }
        });
    }

    let state = http::AppState {
        enrollment: EnrollmentService::new(
            Arc::clone(&models),
            Arc::clone(&store),
            config.extraction_timeout,
        ),
        verification: VerificationService::new(
            Arc::clone(&models),
            store,
            config.extraction_timeout,
            MatchPolicy::new(config.match_threshold),
        ),
        models,
        max_upload_bytes: config.max_upload_bytes,
    };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "facegated ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("facegated shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
