pub mod buffer;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod directory;
pub mod error;
pub mod fanout;
pub mod presence;
pub mod session;

#[cfg(test)]
mod test_support;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use murmur_db::DurableStore;
use murmur_fast::FastStore;
use murmur_types::models::{ExternalId, Tenant, User};

pub use buffer::{FlushOutcome, MessageBuffer};
pub use config::GatewayConfig;
pub use conversation::Conversations;
pub use directory::ParticipantDirectory;
pub use error::{GatewayError, GatewayResult};
pub use fanout::FanoutBus;
pub use presence::Presence;
pub use session::Session;

/// Every component of the real-time path, wired to one fast store and one
/// durable store. Cheap to clone; clones share the same caches.
#[derive(Clone)]
pub struct Gateway {
    pub config: GatewayConfig,
    pub durable: Arc<dyn DurableStore>,
    pub directory: ParticipantDirectory,
    pub bus: FanoutBus,
    pub buffer: MessageBuffer,
    pub presence: Presence,
    pub conversations: Conversations,
}

impl Gateway {
    pub fn new(config: GatewayConfig, fast: Arc<dyn FastStore>, durable: Arc<dyn DurableStore>) -> Self {
        let directory = ParticipantDirectory::new(fast.clone(), durable.clone(), &config);
        let bus = FanoutBus::new(fast.clone());
        let buffer = MessageBuffer::new(fast.clone(), durable.clone(), &config);
        let presence = Presence::new(fast, &config);
        let conversations = Conversations::new(durable.clone(), directory.clone(), bus.clone(), buffer.clone());

        Self {
            config,
            durable,
            directory,
            bus,
            buffer,
            presence,
            conversations,
        }
    }

    /// Validate handshake parameters: the tenant code from the path, `uid`
    /// (external user id) and `sid` (tenant secret). The user is created on
    /// first contact; otherwise its `lastSeen` is refreshed.
    pub async fn authenticate(
        &self,
        tenant_code: &str,
        uid: Option<&str>,
        sid: Option<&str>,
    ) -> GatewayResult<(Tenant, User)> {
        let uid = uid
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::Unauthorized("uid is required".into()))?;
        let external_id: ExternalId = uid
            .parse()
            .map_err(|_| GatewayError::Unauthorized("uid must be a numeric user id".into()))?;
        let sid = sid
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::Unauthorized("sid is required".into()))?;

        let tenant = self
            .durable
            .tenant_by_credentials(tenant_code, sid)
            .await?
            .ok_or_else(|| GatewayError::Unauthorized("invalid tenant credentials".into()))?;

        let user = self.durable.upsert_user(tenant.id, external_id, Utc::now()).await?;
        debug!("Authenticated {} in {}", external_id, tenant.code);
        Ok((tenant, user))
    }
}

/// Run `work` as a detached task. Its failure is logged under `label` and
/// never reaches the caller; the handle exists for callers that want to wait.
pub fn best_effort<F, E>(label: &'static str, work: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = work.await {
            warn!("Background {} failed: {}", label, e);
        }
    })
}
