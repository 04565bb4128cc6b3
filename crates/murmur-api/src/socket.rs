use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::rejection::WebSocketUpgradeRejection,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use murmur_gateway::connection;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct HandshakeParams {
    pub uid: Option<String>,
    pub sid: Option<String>,
}

/// `GET /{tenant_code}/conversation?uid=..&sid=..`. Credentials are checked
/// before the upgrade so a rejected client gets a plain 401.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(tenant_code): Path<String>,
    Query(params): Query<HandshakeParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let gateway = state.gateway.clone();
    let (tenant, user) = gateway
        .authenticate(&tenant_code, params.uid.as_deref(), params.sid.as_deref())
        .await
        .inspect_err(|e| warn!("Rejected handshake for tenant {}: {}", tenant_code, e))?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    info!("User {} connecting to {}", user.external_id, tenant.code);
    Ok(ws
        .on_upgrade(move |socket| connection::handle_connection(socket, gateway, tenant, user))
        .into_response())
}
