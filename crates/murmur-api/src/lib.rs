pub mod conversations;
pub mod error;
pub mod socket;
pub mod tenants;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tracing::error;

use murmur_db::Database;
use murmur_gateway::Gateway;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub gateway: Gateway,
}

/// HTTP routes plus the WebSocket upgrade at `/{tenant_code}/conversation`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tenant/new", post(tenants::create_tenant))
        .route("/tenant/items", get(tenants::list_tenants))
        .route("/{tenant_code}/conversation/items", post(conversations::items))
        .route("/{tenant_code}/conversation", get(socket::ws_upgrade))
        .with_state(state)
}

/// Run a database call off the async runtime.
pub(crate) async fn blocking<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(anyhow::anyhow!("database task failed"))
        })?
        .map_err(ApiError::from)
}
