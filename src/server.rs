/// Server setup and initialization
///
/// Wires together all components: store, type catalog, driver loop and HTTP
/// routes. Provides the application factory used by the binary and the tests.

use crate::{
    api::{create_engine_routes, AppState},
    config::Config,
    datatype::TypeCatalog,
    runtime::{EngineContext, ExecutionEngine},
    workflow::Store,
};
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::watch};

/// Create the main Axum application with all routes
pub fn create_app(ctx: EngineContext) -> Router {
    tracing::debug!("📡 Creating HTTP router with all endpoints");
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        // Execution protocol routes
        .merge(create_engine_routes().with_state(AppState::new(ctx)))
}

/// Open the store and load the type catalog
pub async fn create_context(config: &Config) -> Result<EngineContext> {
    tracing::info!("📋 Opening store: {}", config.database.path);
    let store = Store::connect(&config.database.path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.path))?;
    store.init_schema().await.context("Failed to initialise schema")?;

    let ctx = EngineContext::new(
        store,
        Arc::new(TypeCatalog::new()),
        config.server.advertise_addr.clone(),
        &config.http,
    )
    .context("Failed to create engine context")?;

    tracing::info!("📥 Loading data types from {}", config.registry.url);
    match ctx.catalog.refresh_from_registry(&ctx.http, &config.registry.url).await {
        Ok(()) => tracing::info!("✅ Loaded {} data types", ctx.catalog.len()),
        Err(e) => tracing::error!("❌ Type registry unavailable, only the empty type is known: {}", e),
    }
    Ok(ctx)
}

/// Start the driver loop and the HTTP server with the given configuration
///
/// Runs until Ctrl-C, then stops the loop and drains the server.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowd engine...");

    let ctx = create_context(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = ExecutionEngine::new(ctx.clone(), config.engine.tick_interval());
    let driver = tokio::spawn(async move { engine.run(shutdown_rx).await });

    let app = create_app(ctx);

    // Bind to the configured address
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    tracing::info!("Server listening on http://{} (advertised as {})", bind_addr, config.server.advertise_addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("🛑 Shutting down driver loop");
    let _ = shutdown_tx.send(true);
    driver.await.context("Driver loop panicked")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
