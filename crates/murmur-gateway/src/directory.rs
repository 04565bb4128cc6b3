//! Conversation membership lookup.
//!
//! Every inbound event needs to know who is in a conversation. Answers are
//! cached in two tiers in front of the durable store:
//!
//! 1. a process-local map, trusted for `participant_cache_ttl`;
//! 2. a list in the fast store shared by every gateway instance, living for
//!    `participant_shared_ttl` (ten flush intervals).
//!
//! A participant change in the durable store therefore becomes visible to
//! every instance within the longer of the two lifetimes.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use murmur_db::DurableStore;
use murmur_fast::FastStore;
use murmur_types::models::{ExternalId, Tenant, normalize_participants};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};

pub fn participants_key(tenant_code: &str, conversation_id: Uuid) -> String {
    format!("{}:participants:{}", tenant_code, conversation_id)
}

#[derive(Debug, Clone)]
struct LocalEntry {
    participants: Vec<ExternalId>,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct ParticipantDirectory {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    local: Arc<RwLock<HashMap<(Uuid, Uuid), LocalEntry>>>,
    local_ttl: Duration,
    shared_ttl: Duration,
}

impl ParticipantDirectory {
    pub fn new(fast: Arc<dyn FastStore>, durable: Arc<dyn DurableStore>, config: &GatewayConfig) -> Self {
        Self {
            fast,
            durable,
            local: Arc::new(RwLock::new(HashMap::new())),
            local_ttl: config.participant_cache_ttl,
            shared_ttl: config.participant_shared_ttl(),
        }
    }

    /// Participants of `conversation_id`, sorted. Fails with `NotFound` when
    /// the conversation does not exist in this tenant.
    pub async fn resolve(&self, tenant: &Tenant, conversation_id: Uuid) -> GatewayResult<Vec<ExternalId>> {
        if let Some(participants) = self.local_get(tenant.id, conversation_id) {
            trace!("Participants of {} served from process cache", conversation_id);
            return Ok(participants);
        }

        let key = participants_key(&tenant.code, conversation_id);
        if let Some(participants) = self.shared_get(&key).await? {
            trace!("Participants of {} served from fast store", conversation_id);
            self.local_put(tenant.id, conversation_id, participants.clone());
            return Ok(participants);
        }

        let participants = self
            .durable
            .conversation_participants(tenant.id, conversation_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("Conversation {}", conversation_id)))?;

        debug!(
            "Participants of {} loaded from durable store ({} members)",
            conversation_id,
            participants.len()
        );
        self.seed(tenant, conversation_id, &participants).await?;
        Ok(participants)
    }

    /// Write a known participant set through both cache tiers.
    pub async fn seed(&self, tenant: &Tenant, conversation_id: Uuid, participants: &[ExternalId]) -> GatewayResult<()> {
        let key = participants_key(&tenant.code, conversation_id);
        let values = participants.iter().map(|id| id.to_string()).collect();

        self.fast.del(&key).await?;
        self.fast.rpush(&key, values).await?;
        self.fast.expire(&key, self.shared_ttl).await?;

        self.local_put(tenant.id, conversation_id, participants.to_vec());
        Ok(())
    }

    /// Seeds from two instances can interleave and leave the list doubled,
    /// so it is normalized on the way out.
    async fn shared_get(&self, key: &str) -> GatewayResult<Option<Vec<ExternalId>>> {
        let raw = self.fast.lrange(key, 0, -1).await?;
        if raw.is_empty() {
            return Ok(None);
        }

        let parsed: Result<Vec<ExternalId>, _> = raw.iter().map(|v| v.parse::<ExternalId>()).collect();
        match parsed {
            Ok(participants) => Ok(Some(normalize_participants(participants))),
            Err(e) => {
                warn!("Ignoring corrupt participant list at {}: {}", key, e);
                Ok(None)
            }
        }
    }

    fn local_get(&self, tenant_id: Uuid, conversation_id: Uuid) -> Option<Vec<ExternalId>> {
        let local = self.local.read().unwrap_or_else(PoisonError::into_inner);
        local
            .get(&(tenant_id, conversation_id))
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.participants.clone())
    }

    fn local_put(&self, tenant_id: Uuid, conversation_id: Uuid, participants: Vec<ExternalId>) {
        let now = Instant::now();
        let mut local = self.local.write().unwrap_or_else(PoisonError::into_inner);
        local.retain(|_, entry| entry.expires_at > now);
        local.insert(
            (tenant_id, conversation_id),
            LocalEntry {
                participants,
                expires_at: now + self.local_ttl,
            },
        );
    }
}
