use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// External user ids are assigned by the tenant's own system.
pub type ExternalId = i64;

/// A user counts as online for this long after their last activity.
pub const RECENTLY_SEEN_WINDOW: Duration = Duration::minutes(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub secret_key: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    #[default]
    Offline,
    Away,
    Busy,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Away => "away",
            Self::Busy => "busy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "away" => Some(Self::Away),
            "busy" => Some(Self::Busy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_id: ExternalId,
    pub name: String,
    pub avatar: Option<String>,
    pub status: UserStatus,
    pub last_seen: DateTime<Utc>,
}

impl User {
    /// The stored half of the derived `isOnline` flag. The other half is the
    /// presence key in the fast store.
    pub fn seen_recently(&self, now: DateTime<Utc>) -> bool {
        now - self.last_seen < RECENTLY_SEEN_WINDOW
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Sorted, de-duplicated external ids.
    pub participants: Vec<ExternalId>,
    pub external_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Sort and de-duplicate a participant set so that two sets with the same
/// members compare equal.
pub fn normalize_participants(ids: impl IntoIterator<Item = ExternalId>) -> Vec<ExternalId> {
    let mut ids: Vec<ExternalId> = ids.into_iter().collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTo {
    pub message_id: Uuid,
    pub content: Option<String>,
    pub sender_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub user_id: Uuid,
    pub external_id: ExternalId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub external_id: ExternalId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

/// A chat message. The id is assigned by the gateway before buffering so a
/// duplicate insert of the same message is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub sender_id: ExternalId,
    pub sender_name: String,
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
    #[serde(default)]
    pub read_by: Vec<ReadReceipt>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_by: Option<ExternalId>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_read_by(&self, external_id: ExternalId) -> bool {
        self.read_by.iter().any(|r| r.external_id == external_id)
    }

    /// Whether this message counts as unread for `external_id`.
    pub fn is_unread_for(&self, external_id: ExternalId) -> bool {
        self.deleted_at.is_none()
            && self.sender_id != external_id
            && !self.is_read_by(external_id)
    }

    /// Whether this message is an unread mention of `external_id`.
    pub fn is_unread_mention_for(&self, external_id: ExternalId) -> bool {
        self.is_unread_for(external_id) && self.notifies(external_id)
    }

    /// Directly or globally mentioned.
    pub fn notifies(&self, external_id: ExternalId) -> bool {
        self.mention_all || self.mentions.contains(&external_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender_id: ExternalId) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            sender_id,
            sender_name: "alice".into(),
            content: Some("hi".into()),
            images: vec![],
            mentions: vec![],
            mention_all: false,
            reply_to: None,
            read_by: vec![],
            reactions: vec![],
            status: MessageStatus::Sent,
            deleted_at: None,
            deleted_by: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn own_messages_are_never_unread() {
        let msg = message(1);
        assert!(!msg.is_unread_for(1));
        assert!(msg.is_unread_for(2));
    }

    #[test]
    fn read_receipt_clears_unread() {
        let mut msg = message(1);
        msg.read_by.push(ReadReceipt {
            user_id: Uuid::new_v4(),
            external_id: 2,
            read_at: Utc::now(),
        });
        assert!(!msg.is_unread_for(2));
        assert!(msg.is_unread_for(3));
    }

    #[test]
    fn deleted_messages_do_not_count() {
        let mut msg = message(1);
        msg.mention_all = true;
        msg.deleted_at = Some(Utc::now());
        assert!(!msg.is_unread_for(2));
        assert!(!msg.is_unread_mention_for(2));
    }

    #[test]
    fn mention_predicate() {
        let mut msg = message(1);
        msg.mentions = vec![3];
        assert!(msg.is_unread_mention_for(3));
        assert!(!msg.is_unread_mention_for(2));
        msg.mention_all = true;
        assert!(msg.is_unread_mention_for(2));
    }

    #[test]
    fn seen_recently_window() {
        let now = Utc::now();
        let mut user = User {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            external_id: 7,
            name: String::new(),
            avatar: None,
            status: UserStatus::Offline,
            last_seen: now - Duration::minutes(4),
        };
        assert!(user.seen_recently(now));
        user.last_seen = now - Duration::minutes(6);
        assert!(!user.seen_recently(now));
    }

    #[test]
    fn participant_sets_normalize() {
        assert_eq!(normalize_participants([3, 1, 3, 2]), vec![1, 2, 3]);
        assert_eq!(normalize_participants([2, 1]), normalize_participants([1, 2, 2]));
    }

    #[test]
    fn message_wire_shape_is_camel_case() {
        let msg = message(1);
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("conversationId").is_some());
        assert!(value.get("mentionAll").is_some());
        assert_eq!(value["status"], "sent");
    }
}
