use std::sync::Arc;

use tracing::{trace, warn};

use murmur_fast::{ChannelSubscription, FastStore};
use murmur_types::events::ServerEvent;
use murmur_types::models::ExternalId;

use crate::error::GatewayResult;

/// Per-user delivery channel: every live session of that user listens here.
pub fn channel_name(tenant_code: &str, external_id: ExternalId) -> String {
    format!("{}:connection:{}", tenant_code, external_id)
}

/// Routes server events to user channels through the fast store's pub/sub,
/// so a session on any gateway instance receives them. Delivery is
/// best-effort: nothing is queued for users without a live subscription.
#[derive(Clone)]
pub struct FanoutBus {
    fast: Arc<dyn FastStore>,
}

impl FanoutBus {
    pub fn new(fast: Arc<dyn FastStore>) -> Self {
        Self { fast }
    }

    /// Returns how many sessions received the event.
    pub async fn publish(&self, channel: &str, event: &ServerEvent) -> GatewayResult<usize> {
        let payload = serde_json::to_string(event)?;
        let delivered = self.fast.publish(channel, payload).await?;
        trace!("{} -> {} ({} receivers)", event.name(), channel, delivered);
        Ok(delivered)
    }

    /// Publish the same event to several users of one tenant. Per-channel
    /// failures are logged and skipped.
    pub async fn publish_to(
        &self,
        tenant_code: &str,
        recipients: impl IntoIterator<Item = ExternalId>,
        event: &ServerEvent,
    ) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not encode {} event: {}", event.name(), e);
                return 0;
            }
        };

        let mut delivered = 0;
        for recipient in recipients {
            let channel = channel_name(tenant_code, recipient);
            match self.fast.publish(&channel, payload.clone()).await {
                Ok(n) => delivered += n,
                Err(e) => warn!("Publish of {} to {} failed: {}", event.name(), channel, e),
            }
        }
        delivered
    }

    /// Attach to a user's channel. Dropping the subscription detaches.
    pub async fn subscribe(&self, tenant_code: &str, external_id: ExternalId) -> GatewayResult<ChannelSubscription> {
        let channel = channel_name(tenant_code, external_id);
        Ok(self.fast.subscribe(&channel).await?)
    }
}
