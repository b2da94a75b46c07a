//! Key Quota Service - Main Application Entry Point
//!
//! Verifies API keys and meters their usage against per-key budgets.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (async HTTP server)
//! - **Database**: PostgreSQL with sqlx (async queries)
//! - **Consistency**: version-guarded conditional writes per key
//! - **Format**: JSON requests/responses
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Create database connection pool
//! 3. Run database migrations
//! 4. Build the verification engine over the PostgreSQL key store
//! 5. Start server on configured port

use std::sync::Arc;

use key_quota_service::{
    config, db,
    handlers::{self, AppState},
    services::verification::VerificationEngine,
    store::{KeyStore, PgKeyStore},
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads RUST_LOG environment variable (defaults to "info" level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = config::Config::from_env()?;
    tracing::info!(
        ledger_ttl_ms = config.ledger_ttl_ms,
        max_debit_attempts = config.max_debit_attempts,
        "Configuration loaded"
    );

    let pool = db::create_pool(&config.database_url, config.database_max_connections).await?;
    tracing::info!("Database pool created");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let store: Arc<dyn KeyStore> = Arc::new(PgKeyStore::new(pool));
    let engine = Arc::new(VerificationEngine::new(store.clone(), config.engine()));

    let app = handlers::router(AppState::new(engine, store)).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
