use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use murmur_fast::FastStore;
use murmur_types::models::{ExternalId, RECENTLY_SEEN_WINDOW};

use crate::config::GatewayConfig;
use crate::error::GatewayResult;

pub fn presence_key(tenant_code: &str, external_id: ExternalId) -> String {
    format!("{}:connection:{}:online", tenant_code, external_id)
}

/// Ids of the user's live sessions, across every gateway instance.
pub fn sessions_key(tenant_code: &str, external_id: ExternalId) -> String {
    format!("{}:connection:{}:sessions", tenant_code, external_id)
}

pub fn typing_key(tenant_code: &str, conversation_id: Uuid) -> String {
    format!("typing:{}:{}", tenant_code, conversation_id)
}

/// Online and typing state, kept in the fast store so that it is visible
/// to every gateway instance and decays on its own when a refresh stops.
#[derive(Clone)]
pub struct Presence {
    fast: Arc<dyn FastStore>,
    ttl: Duration,
    typing_ttl: Duration,
}

impl Presence {
    pub fn new(fast: Arc<dyn FastStore>, config: &GatewayConfig) -> Self {
        Self {
            fast,
            ttl: config.presence_ttl,
            typing_ttl: config.typing_ttl,
        }
    }

    /// Going offline deletes the key right away instead of waiting out the TTL.
    /// Going online also refreshes the session registry, so it decays with
    /// the presence key.
    pub async fn set_online(&self, tenant_code: &str, external_id: ExternalId, online: bool) -> GatewayResult<()> {
        let key = presence_key(tenant_code, external_id);
        if online {
            self.fast.set_ex(&key, "1", self.ttl).await?;
            self.fast.expire(&sessions_key(tenant_code, external_id), self.ttl).await?;
        } else {
            self.fast.del(&key).await?;
        }
        Ok(())
    }

    /// Register a live session and mark its user online.
    pub async fn connect(&self, tenant_code: &str, external_id: ExternalId, session_id: Uuid) -> GatewayResult<()> {
        let sessions = sessions_key(tenant_code, external_id);
        self.fast.sadd(&sessions, &session_id.to_string()).await?;
        self.set_online(tenant_code, external_id, true).await
    }

    /// Unregister a session. The user goes offline only with their last
    /// session; returns whether that happened.
    pub async fn disconnect(&self, tenant_code: &str, external_id: ExternalId, session_id: Uuid) -> GatewayResult<bool> {
        let sessions = sessions_key(tenant_code, external_id);
        self.fast.srem(&sessions, &session_id.to_string()).await?;
        if !self.fast.smembers(&sessions).await?.is_empty() {
            return Ok(false);
        }
        self.set_online(tenant_code, external_id, false).await?;
        Ok(true)
    }

    /// Whether a live presence key exists, i.e. a session refreshed it recently.
    pub async fn is_connected(&self, tenant_code: &str, external_id: ExternalId) -> GatewayResult<bool> {
        Ok(self.fast.exists(&presence_key(tenant_code, external_id)).await?)
    }

    /// The derived online flag: seen within the last five minutes or holding
    /// a presence key.
    pub async fn is_online(
        &self,
        tenant_code: &str,
        external_id: ExternalId,
        last_seen: DateTime<Utc>,
    ) -> GatewayResult<bool> {
        if Utc::now() - last_seen < RECENTLY_SEEN_WINDOW {
            return Ok(true);
        }
        self.is_connected(tenant_code, external_id).await
    }

    /// Add the user to the conversation's typing set and return everyone
    /// currently in it.
    pub async fn start_typing(
        &self,
        tenant_code: &str,
        conversation_id: Uuid,
        external_id: ExternalId,
    ) -> GatewayResult<Vec<ExternalId>> {
        let key = typing_key(tenant_code, conversation_id);
        self.fast.sadd(&key, &external_id.to_string()).await?;
        self.fast.expire(&key, self.typing_ttl).await?;
        self.typing_users(&key).await
    }

    pub async fn stop_typing(
        &self,
        tenant_code: &str,
        conversation_id: Uuid,
        external_id: ExternalId,
    ) -> GatewayResult<Vec<ExternalId>> {
        let key = typing_key(tenant_code, conversation_id);
        self.fast.srem(&key, &external_id.to_string()).await?;
        self.typing_users(&key).await
    }

    async fn typing_users(&self, key: &str) -> GatewayResult<Vec<ExternalId>> {
        let mut users: Vec<ExternalId> = self
            .fast
            .smembers(key)
            .await?
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        users.sort_unstable();
        Ok(users)
    }
}
