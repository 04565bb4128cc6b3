mod config;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use murmur_api::{AppStateInner, router};
use murmur_db::{Database, SqliteStore};
use murmur_fast::MemoryFastStore;
use murmur_gateway::Gateway;

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Stores
    let db = Arc::new(Database::open(&config.db_path)?);
    let fast = MemoryFastStore::new();
    let _sweeper = fast.spawn_sweeper(config.expiry_sweep);

    let gateway = Gateway::new(
        config.gateway.clone(),
        Arc::new(fast),
        Arc::new(SqliteStore::new(db.clone())),
    );

    // Time trigger of the durable buffer
    let _flusher = gateway.buffer.spawn_expiry_listener();

    let app = router(Arc::new(AppStateInner { db, gateway }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Murmur gateway listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
