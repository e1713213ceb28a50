// API server clippy configuration
#![allow(clippy::result_large_err)]

//! CRM Billing API Server
//!
//! Receives gateway webhooks and serves the billing and admin routes.

use crm_api::{create_router, AppState, Config};

const LOG_FILTER: &str = "info,crm_api=debug,crm_billing=debug,tower_http=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    crm_shared::init_tracing(LOG_FILTER)?;

    tracing::info!("Starting CRM Billing API v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!(?config, "Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = crm_shared::create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        tracing::info!("Running database migrations...");
        crm_shared::run_migrations(&pool).await?;
        tracing::info!("Database migrations complete");
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS=false)");
    }

    let addr = config.bind_addr;
    let state = AppState::connect(config, pool).await?;
    let app = create_router(state);

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
