//! One authenticated client connection.
//!
//! [`Session::open`] marks the user online, starts the presence heartbeat
//! and subscribes to the user's fan-out channel. [`Session::dispatch`] turns
//! each inbound frame into side effects plus the events that go straight
//! back to this client. [`Session::close`] clears presence once the user's
//! last session is gone and records `lastSeen`. The heartbeat task and the
//! channel subscription are both released on drop, so an early return never
//! leaks them.

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_fast::ChannelSubscription;
use murmur_types::events::{ClientEvent, NewMessage, Priority, SendMessage, ServerEvent, UpdateProfile};
use murmur_types::models::{ExternalId, Message, MessageStatus, ReadReceipt, Tenant, User};

use crate::Gateway;
use crate::buffer::buffer_key;
use crate::error::{GatewayError, GatewayResult};
use crate::fanout::channel_name;

/// Aborts the presence heartbeat when dropped.
struct Heartbeat(JoinHandle<()>);

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Session {
    id: Uuid,
    gateway: Gateway,
    tenant: Tenant,
    user: User,
    _heartbeat: Heartbeat,
}

impl Session {
    /// Bring an authenticated user online. The returned subscription carries
    /// every event published to the user's channel.
    pub async fn open(gateway: Gateway, tenant: Tenant, user: User) -> GatewayResult<(Self, ChannelSubscription)> {
        let id = Uuid::new_v4();
        let code = tenant.code.clone();
        let external_id = user.external_id;

        gateway.presence.connect(&code, external_id, id).await?;
        let subscription = gateway.bus.subscribe(&code, external_id).await?;

        let presence = gateway.presence.clone();
        let period = gateway.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = presence.set_online(&code, external_id, true).await {
                    warn!("Presence heartbeat for {} failed: {}", external_id, e);
                }
            }
        });

        info!("{} ({}) connected to {}", user.name, external_id, tenant.code);

        Ok((
            Self {
                id,
                gateway,
                tenant,
                user,
                _heartbeat: Heartbeat(heartbeat),
            },
            subscription,
        ))
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Handle one text frame. Whatever goes wrong is answered with an
    /// `error` event; the session stays usable.
    pub async fn dispatch(&mut self, text: &str) -> Vec<ServerEvent> {
        let event = match ClientEvent::from_frame(text) {
            Ok(event) => event,
            Err(e) => {
                debug!("{} sent a bad frame: {}", self.user.external_id, e);
                return vec![ServerEvent::error(e.to_string())];
            }
        };

        let name = event.name();
        match self.handle(event).await {
            Ok(replies) => replies,
            Err(e) => {
                match &e {
                    GatewayError::NotFound(_) | GatewayError::Validation(_) => {
                        debug!("{} from {} rejected: {}", name, self.user.external_id, e)
                    }
                    _ => warn!("{} from {} failed: {}", name, self.user.external_id, e),
                }
                vec![ServerEvent::error(e.client_message())]
            }
        }
    }

    async fn handle(&mut self, event: ClientEvent) -> GatewayResult<Vec<ServerEvent>> {
        let me = self.user.external_id;
        let conversations = &self.gateway.conversations;

        match event {
            ClientEvent::MessageSend(send) => {
                self.send_message(send).await?;
                Ok(vec![])
            }

            ClientEvent::MessageRead(read) => {
                let participants = conversations
                    .participants_for(&self.tenant, read.conversation_id, me)
                    .await?;
                // Receipts are written in the background.
                let _receipts = conversations
                    .propagate_read(&self.tenant, &self.user, read.conversation_id, &participants)
                    .await;
                Ok(vec![])
            }

            ClientEvent::UserUpdate(profile) => {
                self.update_profile(profile).await?;
                Ok(vec![])
            }

            ClientEvent::TypingStart(typing) => {
                self.typing(typing.conversation_id, true).await?;
                Ok(vec![])
            }

            ClientEvent::TypingStop(typing) => {
                self.typing(typing.conversation_id, false).await?;
                Ok(vec![])
            }

            ClientEvent::MessageEdit(edit) => {
                conversations
                    .edit_message(&self.tenant, me, edit.conversation_id, edit.message_id, edit.content)
                    .await?;
                Ok(vec![])
            }

            ClientEvent::MessageDelete(delete) => {
                conversations
                    .delete_message(&self.tenant, me, delete.conversation_id, delete.message_id)
                    .await?;
                Ok(vec![])
            }

            ClientEvent::MessageReact(react) => {
                conversations
                    .react_to_message(&self.tenant, me, react.conversation_id, react.message_id, react.emoji)
                    .await?;
                Ok(vec![])
            }

            ClientEvent::Ping => Ok(vec![ServerEvent::Pong {
                timestamp: Utc::now().timestamp_millis(),
            }]),
        }
    }

    /// Accept a message: resolve its conversation, then buffer it for the
    /// durable store and deliver it to the other participants at the same
    /// time. Returns the accepted message.
    pub async fn send_message(&self, send: SendMessage) -> GatewayResult<Message> {
        if !send.has_body() {
            return Err(GatewayError::Validation("Message needs content or images".into()));
        }

        let me = self.user.external_id;
        let conversations = &self.gateway.conversations;
        let (conversation_id, participants) = match send.conversation_id {
            Some(id) => (id, conversations.participants_for(&self.tenant, id, me).await?),
            None => {
                let recipients = send.recipients();
                if recipients.is_empty() {
                    return Err(GatewayError::Validation(
                        "conversationId or recipientId is required".into(),
                    ));
                }
                let resolved = conversations
                    .resolve_or_create(&self.tenant, me, &recipients)
                    .await?;
                (resolved.id, resolved.participants)
            }
        };

        let now = Utc::now();
        let sender_name = send
            .sender_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.user.name.clone());

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            tenant_id: self.tenant.id,
            user_id: self.user.id,
            sender_id: me,
            sender_name,
            content: send.content,
            images: send.images,
            mentions: send.mentions,
            mention_all: send.mention_all,
            reply_to: send.reply_to,
            read_by: vec![ReadReceipt {
                user_id: self.user.id,
                external_id: me,
                read_at: now,
            }],
            reactions: vec![],
            status: MessageStatus::Sent,
            deleted_at: None,
            deleted_by: None,
            created_at: now,
        };

        let key = buffer_key(&self.tenant.code, conversation_id);
        let recipients: Vec<ExternalId> = participants.into_iter().filter(|p| *p != me).collect();

        let (buffered, delivered) = tokio::join!(
            self.gateway.buffer.append(&key, &message),
            self.deliver(&message, &recipients),
        );
        let buffered = buffered?;
        debug!(
            "Message {} in {} buffered ({} pending), delivered to {} sessions",
            message.id, conversation_id, buffered, delivered
        );

        Ok(message)
    }

    async fn deliver(&self, message: &Message, recipients: &[ExternalId]) -> usize {
        let mut delivered = 0;
        for &recipient in recipients {
            let priority = if message.notifies(recipient) {
                Priority::High
            } else {
                Priority::Normal
            };
            let event = ServerEvent::MessageNew(NewMessage {
                message: message.clone(),
                priority,
            });
            let channel = channel_name(&self.tenant.code, recipient);
            match self.gateway.bus.publish(&channel, &event).await {
                Ok(n) => delivered += n,
                Err(e) => warn!("Delivery of {} to {} failed: {}", message.id, channel, e),
            }
        }
        delivered
    }

    async fn update_profile(&mut self, profile: UpdateProfile) -> GatewayResult<()> {
        let user = self
            .gateway
            .durable
            .update_profile(self.tenant.id, self.user.external_id, profile, Utc::now())
            .await?;
        debug!("{} updated their profile", user.external_id);
        self.user = user;
        Ok(())
    }

    async fn typing(&self, conversation_id: Uuid, is_typing: bool) -> GatewayResult<()> {
        let me = self.user.external_id;
        let participants = self
            .gateway
            .conversations
            .participants_for(&self.tenant, conversation_id, me)
            .await?;

        let presence = &self.gateway.presence;
        let typing = if is_typing {
            presence.start_typing(&self.tenant.code, conversation_id, me).await?
        } else {
            presence.stop_typing(&self.tenant.code, conversation_id, me).await?
        };

        let event = ServerEvent::Typing {
            conversation_id,
            user_id: me,
            is_typing,
            typing_users: typing.into_iter().filter(|u| *u != me).collect(),
        };
        let others = participants.into_iter().filter(|p| *p != me);
        self.gateway.bus.publish_to(&self.tenant.code, others, &event).await;
        Ok(())
    }

    /// Take the user offline right away, unless another of their sessions is
    /// still open, and persist `lastSeen`. Failures are logged; the
    /// connection is going away regardless.
    pub async fn close(self) {
        let external_id = self.user.external_id;
        match self
            .gateway
            .presence
            .disconnect(&self.tenant.code, external_id, self.id)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!("{} still has other sessions open", external_id),
            Err(e) => warn!("Could not clear presence of {}: {}", external_id, e),
        }
        if let Err(e) = self
            .gateway
            .durable
            .touch_last_seen(self.tenant.id, external_id, Utc::now())
            .await
        {
            warn!("Could not persist lastSeen of {}: {}", external_id, e);
        }
        info!("{} ({}) disconnected from {}", self.user.name, external_id, self.tenant.code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::presence_key;
    use crate::test_support::Fixture;
    use murmur_fast::FastStore;
    use std::time::Duration;

    async fn open(fx: &Fixture, external_id: ExternalId) -> (Session, ChannelSubscription) {
        let user = fx.user(external_id).await;
        Session::open(fx.gateway.clone(), fx.tenant.clone(), user).await.unwrap()
    }

    fn decode(payload: String) -> ServerEvent {
        serde_json::from_str(&payload).unwrap()
    }

    #[tokio::test]
    async fn ping_is_answered_directly() {
        let fx = Fixture::new().await;
        let (mut session, _sub) = open(&fx, 1).await;
        let replies = session.dispatch(r#"{"event":"ping"}"#).await;
        assert!(matches!(replies.as_slice(), [ServerEvent::Pong { .. }]));
    }

    #[tokio::test]
    async fn unknown_event_keeps_session_open() {
        let fx = Fixture::new().await;
        let (mut session, _sub) = open(&fx, 1).await;

        let replies = session.dispatch(r#"{"event":"conversation.join","data":{}}"#).await;
        assert_eq!(replies, vec![ServerEvent::error("Unknown event: conversation.join")]);

        let replies = session.dispatch(r#"{"event":"message.send","data":{"recipientId":2}}"#).await;
        assert_eq!(replies, vec![ServerEvent::error("Message needs content or images")]);

        assert!(matches!(
            session.dispatch(r#"{"event":"ping"}"#).await.as_slice(),
            [ServerEvent::Pong { .. }]
        ));
    }

    #[tokio::test]
    async fn mentioned_recipients_get_high_priority() {
        let fx = Fixture::new().await;
        let conversation = fx.conversation(&[1, 2, 3]).await;
        let (mut session, _own) = open(&fx, 1).await;
        let mut two = fx.gateway.bus.subscribe("acme", 2).await.unwrap();
        let mut three = fx.gateway.bus.subscribe("acme", 3).await.unwrap();

        let frame = serde_json::json!({
            "event": "message.send",
            "data": {"conversationId": conversation, "content": "hey @3", "mentions": [3], "senderId": 99}
        });
        assert!(session.dispatch(&frame.to_string()).await.is_empty());

        match decode(two.recv().await.unwrap()) {
            ServerEvent::MessageNew(new) => {
                assert_eq!(new.priority, Priority::Normal);
                assert_eq!(new.message.sender_id, 1);
                assert!(new.message.is_read_by(1));
            }
            other => panic!("unexpected {:?}", other),
        }
        match decode(three.recv().await.unwrap()) {
            ServerEvent::MessageNew(new) => assert_eq!(new.priority, Priority::High),
            other => panic!("unexpected {:?}", other),
        }

        let key = buffer_key("acme", conversation);
        assert_eq!(fx.gateway.buffer.pending(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn foreign_conversation_is_not_found() {
        let fx = Fixture::new().await;
        let conversation = fx.conversation(&[2, 3]).await;
        let (mut session, _sub) = open(&fx, 1).await;

        let frame = serde_json::json!({
            "event": "message.read",
            "data": {"conversationId": conversation}
        });
        let replies = session.dispatch(&frame.to_string()).await;
        assert_eq!(
            replies,
            vec![ServerEvent::error(format!("Conversation {} not found", conversation))]
        );
    }

    #[tokio::test]
    async fn profile_update_is_persisted() {
        let fx = Fixture::new().await;
        let (mut session, _sub) = open(&fx, 1).await;

        let replies = session
            .dispatch(r#"{"event":"user.update","data":{"senderName":"Alice","status":"away"}}"#)
            .await;
        assert!(replies.is_empty());
        assert_eq!(session.user().name, "Alice");

        let stored = fx.db.find_user(fx.tenant.id, 1).unwrap().unwrap();
        assert_eq!(stored.name, "Alice");
    }

    #[tokio::test]
    async fn typing_reaches_other_participants() {
        let fx = Fixture::new().await;
        let conversation = fx.conversation(&[1, 2]).await;
        let (mut session, mut own) = open(&fx, 1).await;
        let mut two = fx.gateway.bus.subscribe("acme", 2).await.unwrap();

        let frame = serde_json::json!({"event": "typing.start", "data": {"conversationId": conversation}});
        assert!(session.dispatch(&frame.to_string()).await.is_empty());

        match decode(two.recv().await.unwrap()) {
            ServerEvent::Typing { user_id, is_typing, typing_users, .. } => {
                assert_eq!(user_id, 1);
                assert!(is_typing);
                assert!(typing_users.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(own.try_recv().is_none());
    }

    #[tokio::test]
    async fn close_clears_presence_and_subscription() {
        let fx = Fixture::new().await;
        let (session, subscription) = open(&fx, 1).await;
        assert!(fx.fast.exists(&presence_key("acme", 1)).await.unwrap());

        drop(subscription);
        session.close().await;

        assert!(!fx.fast.exists(&presence_key("acme", 1)).await.unwrap());
        assert_eq!(
            fx.gateway
                .bus
                .publish(&channel_name("acme", 1), &ServerEvent::error("x"))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_presence_alive_until_drop() {
        let fx = Fixture::new().await;
        let (session, _sub) = open(&fx, 1).await;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            assert!(fx.gateway.presence.is_connected("acme", 1).await.unwrap());
        }

        drop(session);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!fx.gateway.presence.is_connected("acme", 1).await.unwrap());
    }
}
