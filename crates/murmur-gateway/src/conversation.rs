use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use murmur_db::{DurableStore, UnreadCounts};
use murmur_types::events::ServerEvent;
use murmur_types::models::{ExternalId, ReadReceipt, Reaction, Tenant, User, normalize_participants};

use crate::best_effort;
use crate::buffer::{MessageBuffer, buffer_key};
use crate::directory::ParticipantDirectory;
use crate::error::{GatewayError, GatewayResult};
use crate::fanout::{FanoutBus, channel_name};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConversation {
    pub id: Uuid,
    pub participants: Vec<ExternalId>,
    pub created: bool,
}

/// Conversation lookup and everything that touches messages after they
/// were accepted: read receipts, edits, deletes and reactions.
#[derive(Clone)]
pub struct Conversations {
    durable: Arc<dyn DurableStore>,
    directory: ParticipantDirectory,
    bus: FanoutBus,
    buffer: MessageBuffer,
}

impl Conversations {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        directory: ParticipantDirectory,
        bus: FanoutBus,
        buffer: MessageBuffer,
    ) -> Self {
        Self {
            durable,
            directory,
            bus,
            buffer,
        }
    }

    /// Find the conversation whose participants are exactly the sender plus
    /// `recipients`, creating it if needed. A creation is announced on the
    /// sender's own channel and seeds the participant directory.
    pub async fn resolve_or_create(
        &self,
        tenant: &Tenant,
        sender: ExternalId,
        recipients: &[ExternalId],
    ) -> GatewayResult<ResolvedConversation> {
        let participants = normalize_participants(std::iter::once(sender).chain(recipients.iter().copied()));
        if participants.len() < 2 {
            return Err(GatewayError::Validation(
                "A conversation needs at least one recipient besides the sender".into(),
            ));
        }

        if let Some(existing) = self
            .durable
            .find_conversation_by_participants(tenant.id, participants.clone())
            .await?
        {
            return Ok(ResolvedConversation {
                id: existing.id,
                participants: existing.participants,
                created: false,
            });
        }

        let (conversation, created) = self
            .durable
            .create_conversation(tenant.id, participants, Utc::now())
            .await?;

        if created {
            info!(
                "Conversation {} created in {} for {:?}",
                conversation.id, tenant.code, conversation.participants
            );
            self.directory
                .seed(tenant, conversation.id, &conversation.participants)
                .await?;
            let event = ServerEvent::ConversationCreated {
                conversation_id: conversation.id,
                participants: conversation.participants.clone(),
            };
            self.bus.publish(&channel_name(&tenant.code, sender), &event).await?;
        }

        Ok(ResolvedConversation {
            id: conversation.id,
            participants: conversation.participants,
            created,
        })
    }

    /// Participants of a conversation the caller belongs to. Membership is
    /// checked so that a session cannot reach into foreign conversations.
    pub async fn participants_for(
        &self,
        tenant: &Tenant,
        conversation_id: Uuid,
        member: ExternalId,
    ) -> GatewayResult<Vec<ExternalId>> {
        let participants = self.directory.resolve(tenant, conversation_id).await?;
        if !participants.contains(&member) {
            return Err(GatewayError::NotFound(format!("Conversation {}", conversation_id)));
        }
        Ok(participants)
    }

    /// Tell the other participants that `reader` read the conversation, then
    /// record the receipts in the background. The returned handle is only
    /// useful to wait for the durable part; failures there are logged.
    pub async fn propagate_read(
        &self,
        tenant: &Tenant,
        reader: &User,
        conversation_id: Uuid,
        participants: &[ExternalId],
    ) -> JoinHandle<()> {
        let read_at = Utc::now();
        let event = ServerEvent::MessageRead {
            sender_id: reader.external_id,
            sender_name: reader.name.clone(),
            conversation_id,
            tenant_id: tenant.id,
            timestamp: read_at,
        };
        let others = participants.iter().copied().filter(|p| *p != reader.external_id);
        self.bus.publish_to(&tenant.code, others, &event).await;

        let buffer = self.buffer.clone();
        let durable = self.durable.clone();
        let key = buffer_key(&tenant.code, conversation_id);
        let tenant_id = tenant.id;
        let receipt = ReadReceipt {
            user_id: reader.id,
            external_id: reader.external_id,
            read_at,
        };

        best_effort("read receipts", async move {
            buffer.settle(&key).await?;
            let marked = durable.mark_read(tenant_id, conversation_id, receipt).await?;
            debug!("Marked {} messages read in {}", marked, conversation_id);
            Ok::<_, GatewayError>(())
        })
    }

    /// Unread and mention counts for one user, including messages still in
    /// the buffer.
    pub async fn unread_counts(
        &self,
        tenant: &Tenant,
        conversation_id: Uuid,
        external_id: ExternalId,
    ) -> GatewayResult<UnreadCounts> {
        self.buffer.settle(&buffer_key(&tenant.code, conversation_id)).await?;
        Ok(self
            .durable
            .unread_counts(tenant.id, conversation_id, external_id)
            .await?)
    }

    pub async fn edit_message(
        &self,
        tenant: &Tenant,
        editor: ExternalId,
        conversation_id: Uuid,
        message_id: Uuid,
        content: String,
    ) -> GatewayResult<ServerEvent> {
        if content.trim().is_empty() {
            return Err(GatewayError::Validation("Message content cannot be empty".into()));
        }
        let participants = self.prepare_mutation(tenant, editor, conversation_id, message_id).await?;

        if !self
            .durable
            .edit_message(tenant.id, message_id, editor, content.clone())
            .await?
        {
            return Err(GatewayError::NotFound(format!("Message {}", message_id)));
        }

        let event = ServerEvent::MessageEdited {
            conversation_id,
            message_id,
            content,
            edited_by: editor,
        };
        self.bus.publish_to(&tenant.code, participants, &event).await;
        Ok(event)
    }

    pub async fn delete_message(
        &self,
        tenant: &Tenant,
        deleter: ExternalId,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> GatewayResult<ServerEvent> {
        let participants = self.prepare_mutation(tenant, deleter, conversation_id, message_id).await?;

        let deleted_at = Utc::now();
        if !self
            .durable
            .soft_delete_message(tenant.id, message_id, deleter, deleted_at)
            .await?
        {
            return Err(GatewayError::NotFound(format!("Message {}", message_id)));
        }

        let event = ServerEvent::MessageDeleted {
            conversation_id,
            message_id,
            deleted_by: deleter,
            deleted_at,
        };
        self.bus.publish_to(&tenant.code, participants, &event).await;
        Ok(event)
    }

    pub async fn react_to_message(
        &self,
        tenant: &Tenant,
        reactor: ExternalId,
        conversation_id: Uuid,
        message_id: Uuid,
        emoji: String,
    ) -> GatewayResult<ServerEvent> {
        if emoji.trim().is_empty() {
            return Err(GatewayError::Validation("Emoji cannot be empty".into()));
        }
        let participants = self.prepare_mutation(tenant, reactor, conversation_id, message_id).await?;

        let reaction = Reaction {
            external_id: reactor,
            emoji,
            created_at: Utc::now(),
        };
        if !self
            .durable
            .add_reaction(tenant.id, message_id, reaction.clone())
            .await?
        {
            return Err(GatewayError::NotFound(format!("Message {}", message_id)));
        }

        let event = ServerEvent::MessageReaction {
            conversation_id,
            message_id,
            external_id: reactor,
            emoji: reaction.emoji,
            created_at: reaction.created_at,
        };
        self.bus.publish_to(&tenant.code, participants, &event).await;
        Ok(event)
    }

    /// Membership check, then settle the buffer so a message that is still
    /// buffered can be found, then confirm it belongs to the conversation.
    async fn prepare_mutation(
        &self,
        tenant: &Tenant,
        actor: ExternalId,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> GatewayResult<Vec<ExternalId>> {
        let participants = self.participants_for(tenant, conversation_id, actor).await?;
        self.buffer.settle(&buffer_key(&tenant.code, conversation_id)).await?;

        match self.durable.message(tenant.id, message_id).await? {
            Some(message) if message.conversation_id == conversation_id => Ok(participants),
            _ => Err(GatewayError::NotFound(format!("Message {}", message_id))),
        }
    }
}
