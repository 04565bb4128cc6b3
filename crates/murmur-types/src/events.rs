use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ExternalId, Message, ReplyTo, UserStatus};

/// Why an inbound frame could not be turned into a [`ClientEvent`].
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("invalid \"{event}\" payload: {source}")]
    InvalidPayload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub recipient_id: Option<ExternalId>,
    #[serde(default)]
    pub recipient_ids: Vec<ExternalId>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub mentions: Vec<ExternalId>,
    #[serde(default)]
    pub mention_all: bool,
    #[serde(default)]
    pub reply_to: Option<ReplyTo>,
}

impl SendMessage {
    /// `recipientId` wins over `recipientIds` when both are present.
    pub fn recipients(&self) -> Vec<ExternalId> {
        match self.recipient_id {
            Some(id) => vec![id],
            None => self.recipient_ids.clone(),
        }
    }

    pub fn has_body(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.trim().is_empty()) || !self.images.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMessages {
    pub conversation_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfile {
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default, alias = "avatar")]
    pub sender_avatar: Option<String>,
    #[serde(default)]
    pub status: Option<UserStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub conversation_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactMessage {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub emoji: String,
}

/// Events sent FROM client TO server, one JSON object per WebSocket frame:
/// `{ "event": "...", "data": { ... } }`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    MessageSend(SendMessage),
    MessageRead(ReadMessages),
    UserUpdate(UpdateProfile),
    TypingStart(Typing),
    TypingStop(Typing),
    MessageEdit(EditMessage),
    MessageDelete(DeleteMessage),
    MessageReact(ReactMessage),
    Ping,
}

impl ClientEvent {
    /// Decode one text frame. Unknown event kinds and bad payloads are
    /// reported separately so the session can answer with a precise error.
    pub fn from_frame(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(text).map_err(FrameError::Malformed)?;
        let data = raw.data;

        let event = match raw.event.as_str() {
            "message.send" => Self::MessageSend(payload("message.send", data)?),
            "message.read" => Self::MessageRead(payload("message.read", data)?),
            "user.update" => Self::UserUpdate(if data.is_null() {
                UpdateProfile::default()
            } else {
                payload("user.update", data)?
            }),
            "typing.start" => Self::TypingStart(payload("typing.start", data)?),
            "typing.stop" => Self::TypingStop(payload("typing.stop", data)?),
            "message.edit" => Self::MessageEdit(payload("message.edit", data)?),
            "message.delete" => Self::MessageDelete(payload("message.delete", data)?),
            "message.react" => Self::MessageReact(payload("message.react", data)?),
            "ping" => Self::Ping,
            other => return Err(FrameError::UnknownEvent(other.to_string())),
        };

        Ok(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageSend(_) => "message.send",
            Self::MessageRead(_) => "message.read",
            Self::UserUpdate(_) => "user.update",
            Self::TypingStart(_) => "typing.start",
            Self::TypingStop(_) => "typing.stop",
            Self::MessageEdit(_) => "message.edit",
            Self::MessageDelete(_) => "message.delete",
            Self::MessageReact(_) => "message.react",
            Self::Ping => "ping",
        }
    }
}

fn payload<T: DeserializeOwned>(event: &'static str, data: Value) -> Result<T, FrameError> {
    serde_json::from_value(data).map_err(|source| FrameError::InvalidPayload { event, source })
}

/// Delivery priority of a `message.new`; mentioned recipients get `high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(flatten)]
    pub message: Message,
    pub priority: Priority,
}

/// Events sent FROM server TO client. Same envelope as [`ClientEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "message.new")]
    MessageNew(NewMessage),

    #[serde(rename = "message.read")]
    MessageRead {
        sender_id: ExternalId,
        sender_name: String,
        conversation_id: Uuid,
        tenant_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Sent only to the session that caused the conversation to exist.
    #[serde(rename = "conversation.created")]
    ConversationCreated {
        conversation_id: Uuid,
        participants: Vec<ExternalId>,
    },

    #[serde(rename = "typing")]
    Typing {
        conversation_id: Uuid,
        user_id: ExternalId,
        is_typing: bool,
        /// Everyone else currently typing in the conversation.
        typing_users: Vec<ExternalId>,
    },

    #[serde(rename = "message.edited")]
    MessageEdited {
        conversation_id: Uuid,
        message_id: Uuid,
        content: String,
        edited_by: ExternalId,
    },

    #[serde(rename = "message.deleted")]
    MessageDeleted {
        conversation_id: Uuid,
        message_id: Uuid,
        deleted_by: ExternalId,
        deleted_at: DateTime<Utc>,
    },

    #[serde(rename = "message.reaction")]
    MessageReaction {
        conversation_id: Uuid,
        message_id: Uuid,
        external_id: ExternalId,
        emoji: String,
        created_at: DateTime<Utc>,
    },

    #[serde(rename = "pong")]
    Pong { timestamp: i64 },

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageNew(_) => "message.new",
            Self::MessageRead { .. } => "message.read",
            Self::ConversationCreated { .. } => "conversation.created",
            Self::Typing { .. } => "typing",
            Self::MessageEdited { .. } => "message.edited",
            Self::MessageDeleted { .. } => "message.deleted",
            Self::MessageReaction { .. } => "message.reaction",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
        }
    }
}
