/// Query and result types of the durable store that are not part of the
/// shared data model.
use chrono::{DateTime, Utc};
use murmur_types::models::ExternalId;
use uuid::Uuid;

/// Outcome of a batch insert. Whole-batch failures are reported as `Err`
/// instead; this only describes a batch that went through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub written: usize,
    /// Already stored under the same id. Re-inserting a flushed message is harmless.
    pub duplicates: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadCounts {
    pub unread: u64,
    pub mentions: u64,
}

#[derive(Debug, Clone)]
pub struct MessageQuery {
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    /// Case-insensitive match against content or sender name.
    pub search: Option<String>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    pub skip: u64,
    pub limit: u64,
}

#[derive(Debug, Clone)]
pub struct ConversationQuery {
    pub tenant_id: Uuid,
    pub external_id: ExternalId,
    pub unread_only: bool,
    pub skip: u64,
    pub limit: u64,
}
