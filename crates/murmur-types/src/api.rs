use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ExternalId, UserStatus};

// -- Tenants --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTenantRequest {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTenantResponse {
    pub id: Uuid,
    pub code: String,
    pub secret_key: String,
}

/// Tenant listing entry. The secret key is never listed.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantSummary {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

// -- Conversations --

/// Body of `POST /{tenantCode}/conversation/items`. With `cid` the messages of
/// that conversation are listed, otherwise the caller's conversations.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationItemsRequest {
    pub uid: ExternalId,
    pub sid: String,
    #[serde(default)]
    pub cid: Option<Uuid>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub unread_only: Option<bool>,
    #[serde(default)]
    pub before_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub after_date: Option<DateTime<Utc>>,
    /// Infinite-scroll clients skip the total count.
    #[serde(default)]
    pub scrollable: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantUser {
    pub external_id: ExternalId,
    pub name: String,
    pub avatar: Option<String>,
    pub status: UserStatus,
    pub last_seen: DateTime<Utc>,
    /// Derived from `last_seen` and the presence key; see `Presence::is_online`.
    pub is_online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub id: Uuid,
    pub sender_id: ExternalId,
    pub sender_name: String,
    pub content: Option<String>,
    pub images: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: Uuid,
    pub participants: Vec<ExternalId>,
    pub participant_users: Vec<ParticipantUser>,
    pub last_message: Option<LastMessage>,
    pub unread_count: u64,
    pub mention_count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetadata {
    pub total_records: u64,
    pub total_pages: u64,
    pub page: u32,
    pub has_more: bool,
}

impl PageMetadata {
    pub fn new(total_records: u64, page: u32, limit: u32) -> Self {
        let limit = u64::from(limit.max(1));
        let total_pages = total_records.div_ceil(limit);
        Self {
            total_records,
            total_pages,
            page,
            has_more: u64::from(page) < total_pages,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<PageMetadata>,
}
