use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use murmur_types::events::UpdateProfile;
use murmur_types::models::{Conversation, ExternalId, Message, ReadReceipt, Reaction, Tenant, User};

use crate::Database;
use crate::models::{InsertReport, UnreadCounts};

/// The durable side of the gateway. Everything the real-time path needs from
/// the store of record goes through here so the gateway never blocks its
/// runtime on SQLite.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    async fn tenant_by_credentials(&self, code: &str, secret_key: &str) -> Result<Option<Tenant>>;

    async fn upsert_user(&self, tenant_id: Uuid, external_id: ExternalId, now: DateTime<Utc>) -> Result<User>;

    async fn update_profile(
        &self,
        tenant_id: Uuid,
        external_id: ExternalId,
        profile: UpdateProfile,
        now: DateTime<Utc>,
    ) -> Result<User>;

    async fn touch_last_seen(&self, tenant_id: Uuid, external_id: ExternalId, now: DateTime<Utc>) -> Result<()>;

    /// `None` when the conversation does not exist in this tenant.
    async fn conversation_participants(&self, tenant_id: Uuid, conversation_id: Uuid)
    -> Result<Option<Vec<ExternalId>>>;

    async fn find_conversation_by_participants(
        &self,
        tenant_id: Uuid,
        participants: Vec<ExternalId>,
    ) -> Result<Option<Conversation>>;

    async fn create_conversation(
        &self,
        tenant_id: Uuid,
        participants: Vec<ExternalId>,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool)>;

    async fn insert_messages(&self, messages: Vec<Message>) -> Result<InsertReport>;

    async fn mark_read(&self, tenant_id: Uuid, conversation_id: Uuid, receipt: ReadReceipt) -> Result<usize>;

    async fn unread_counts(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        external_id: ExternalId,
    ) -> Result<UnreadCounts>;

    async fn message(&self, tenant_id: Uuid, message_id: Uuid) -> Result<Option<Message>>;

    async fn edit_message(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
        editor: ExternalId,
        content: String,
    ) -> Result<bool>;

    async fn soft_delete_message(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
        deleted_by: ExternalId,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn add_reaction(&self, tenant_id: Uuid, message_id: Uuid, reaction: Reaction) -> Result<bool>;
}

/// [`DurableStore`] backed by the SQLite [`Database`]. Each call runs on the
/// blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn tenant_by_credentials(&self, code: &str, secret_key: &str) -> Result<Option<Tenant>> {
        let (code, secret_key) = (code.to_string(), secret_key.to_string());
        self.blocking(move |db| db.tenant_by_credentials(&code, &secret_key)).await
    }

    async fn upsert_user(&self, tenant_id: Uuid, external_id: ExternalId, now: DateTime<Utc>) -> Result<User> {
        self.blocking(move |db| db.upsert_user(tenant_id, external_id, now)).await
    }

    async fn update_profile(
        &self,
        tenant_id: Uuid,
        external_id: ExternalId,
        profile: UpdateProfile,
        now: DateTime<Utc>,
    ) -> Result<User> {
        self.blocking(move |db| db.update_profile(tenant_id, external_id, &profile, now))
            .await
    }

    async fn touch_last_seen(&self, tenant_id: Uuid, external_id: ExternalId, now: DateTime<Utc>) -> Result<()> {
        self.blocking(move |db| db.touch_last_seen(tenant_id, external_id, now))
            .await
    }

    async fn conversation_participants(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Option<Vec<ExternalId>>> {
        self.blocking(move |db| {
            Ok(db
                .conversation(tenant_id, conversation_id)?
                .map(|c| c.participants))
        })
        .await
    }

    async fn find_conversation_by_participants(
        &self,
        tenant_id: Uuid,
        participants: Vec<ExternalId>,
    ) -> Result<Option<Conversation>> {
        self.blocking(move |db| db.conversation_by_participants(tenant_id, &participants))
            .await
    }

    async fn create_conversation(
        &self,
        tenant_id: Uuid,
        participants: Vec<ExternalId>,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool)> {
        self.blocking(move |db| db.create_conversation(Uuid::new_v4(), tenant_id, &participants, now))
            .await
    }

    async fn insert_messages(&self, messages: Vec<Message>) -> Result<InsertReport> {
        self.blocking(move |db| db.insert_messages(&messages)).await
    }

    async fn mark_read(&self, tenant_id: Uuid, conversation_id: Uuid, receipt: ReadReceipt) -> Result<usize> {
        self.blocking(move |db| db.mark_read(tenant_id, conversation_id, &receipt))
            .await
    }

    async fn unread_counts(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        external_id: ExternalId,
    ) -> Result<UnreadCounts> {
        self.blocking(move |db| db.unread_counts(tenant_id, conversation_id, external_id))
            .await
    }

    async fn message(&self, tenant_id: Uuid, message_id: Uuid) -> Result<Option<Message>> {
        self.blocking(move |db| db.message(tenant_id, message_id)).await
    }

    async fn edit_message(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
        editor: ExternalId,
        content: String,
    ) -> Result<bool> {
        self.blocking(move |db| db.edit_message(tenant_id, message_id, editor, &content))
            .await
    }

    async fn soft_delete_message(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
        deleted_by: ExternalId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.blocking(move |db| db.soft_delete_message(tenant_id, message_id, deleted_by, now))
            .await
    }

    async fn add_reaction(&self, tenant_id: Uuid, message_id: Uuid, reaction: Reaction) -> Result<bool> {
        self.blocking(move |db| db.add_reaction(tenant_id, message_id, &reaction))
            .await
    }
}
