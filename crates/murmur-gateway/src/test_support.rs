use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use murmur_db::{Database, DurableStore, InsertReport, MessageQuery, SqliteStore, UnreadCounts};
use murmur_fast::{ChannelSubscription, FastResult, FastStore, MemoryFastStore};
use murmur_types::events::UpdateProfile;
use murmur_types::models::{
    Conversation, ExternalId, Message, MessageStatus, ReadReceipt, Reaction, Tenant, User,
};

use crate::{Gateway, GatewayConfig};

pub(crate) struct Fixture {
    pub gateway: Gateway,
    pub fast: MemoryFastStore,
    pub db: Arc<Database>,
    pub tenant: Tenant,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(GatewayConfig::default()).await
    }

    pub async fn with_config(config: GatewayConfig) -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: "Acme".into(),
            code: "acme".into(),
            secret_key: "secret-acme".into(),
            is_active: true,
            created_at: Utc::now(),
        };
        db.create_tenant(&tenant).unwrap();

        let fast = MemoryFastStore::new();
        let gateway = Gateway::new(config, Arc::new(fast.clone()), Arc::new(SqliteStore::new(db.clone())));
        Self {
            gateway,
            fast,
            db,
            tenant,
        }
    }

    pub async fn conversation(&self, participants: &[ExternalId]) -> Uuid {
        let (conversation, _) = self
            .db
            .create_conversation(Uuid::new_v4(), self.tenant.id, participants, Utc::now())
            .unwrap();
        conversation.id
    }

    /// Change membership behind the caches' back.
    pub fn add_participant(&self, conversation_id: Uuid, external_id: ExternalId) {
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO conversation_participants (conversation_id, external_id, position)
                     VALUES (?1, ?2, 99)",
                    rusqlite::params![conversation_id.to_string(), external_id],
                )?;
                Ok(())
            })
            .unwrap();
    }

    /// Leave a transaction open so the next batch insert cannot start its own.
    pub fn break_durable_store(&self) {
        self.db.with_conn(|conn| Ok(conn.execute_batch("BEGIN")?)).unwrap();
    }

    pub async fn user(&self, external_id: ExternalId) -> User {
        self.db.upsert_user(self.tenant.id, external_id, Utc::now()).unwrap()
    }

    pub fn message(&self, conversation_id: Uuid, sender_id: ExternalId) -> Message {
        let now = Utc::now();
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            tenant_id: self.tenant.id,
            user_id: Uuid::new_v4(),
            sender_id,
            sender_name: format!("user-{}", sender_id),
            content: Some("hello".into()),
            images: vec![],
            mentions: vec![],
            mention_all: false,
            reply_to: None,
            read_by: vec![ReadReceipt {
                user_id: Uuid::new_v4(),
                external_id: sender_id,
                read_at: now,
            }],
            reactions: vec![],
            status: MessageStatus::Sent,
            deleted_at: None,
            deleted_by: None,
            created_at: now,
        }
    }

    /// Persisted, non-deleted messages of a conversation, newest first.
    pub fn messages(&self, conversation_id: Uuid) -> Vec<Message> {
        self.db
            .list_messages(&MessageQuery {
                tenant_id: self.tenant.id,
                conversation_id,
                search: None,
                before: None,
                after: None,
                skip: 0,
                limit: 1000,
            })
            .unwrap()
    }

    pub fn stored_messages(&self, conversation_id: Uuid) -> usize {
        self.messages(conversation_id).len()
    }
}

/// A fast store that lets another instance's append land right before the
/// next `:ttl` marker is deleted.
pub(crate) struct RacingAppend {
    inner: MemoryFastStore,
    pending: Mutex<Option<(String, String)>>,
    armed: Mutex<Option<bool>>,
    flush_interval: Duration,
}

impl RacingAppend {
    pub fn new(inner: MemoryFastStore, flush_interval: Duration) -> Self {
        Self {
            inner,
            pending: Mutex::new(None),
            armed: Mutex::new(None),
            flush_interval,
        }
    }

    pub fn append_before_timer_delete(&self, buffer_key: &str, message: &Message) {
        let payload = serde_json::to_string(message).unwrap();
        *self.pending.lock().unwrap() = Some((buffer_key.to_string(), payload));
    }

    /// Whether the raced append managed to arm its own marker.
    pub fn raced_append_armed(&self) -> Option<bool> {
        *self.armed.lock().unwrap()
    }
}

#[async_trait]
impl FastStore for RacingAppend {
    async fn get(&self, key: &str) -> FastResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> FastResult<()> {
        self.inner.set_ex(key, value, ttl).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> FastResult<bool> {
        self.inner.set_nx_ex(key, value, ttl).await
    }

    async fn exists(&self, key: &str) -> FastResult<bool> {
        self.inner.exists(key).await
    }

    async fn del(&self, key: &str) -> FastResult<bool> {
        let raced = if key.ends_with(":ttl") {
            self.pending.lock().unwrap().take()
        } else {
            None
        };
        if let Some((list, payload)) = raced {
            self.inner.rpush(&list, vec![payload]).await?;
            let armed = self.inner.set_nx_ex(key, "1", self.flush_interval).await?;
            *self.armed.lock().unwrap() = Some(armed);
        }
        self.inner.del(key).await
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> FastResult<bool> {
        self.inner.del_if_eq(key, expected).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> FastResult<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn rpush(&self, key: &str, values: Vec<String>) -> FastResult<usize> {
        self.inner.rpush(key, values).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> FastResult<Vec<String>> {
        self.inner.lrange(key, start, stop).await
    }

    async fn llen(&self, key: &str) -> FastResult<usize> {
        self.inner.llen(key).await
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> FastResult<()> {
        self.inner.ltrim(key, start, stop).await
    }

    async fn ltrim_if_eq(
        &self,
        key: &str,
        start: isize,
        stop: isize,
        guard: &str,
        expected: &str,
    ) -> FastResult<bool> {
        self.inner.ltrim_if_eq(key, start, stop, guard, expected).await
    }

    async fn sadd(&self, key: &str, member: &str) -> FastResult<bool> {
        self.inner.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> FastResult<bool> {
        self.inner.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> FastResult<Vec<String>> {
        self.inner.smembers(key).await
    }

    async fn publish(&self, channel: &str, payload: String) -> FastResult<usize> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> FastResult<ChannelSubscription> {
        self.inner.subscribe(channel).await
    }

    fn expired_keys(&self) -> broadcast::Receiver<String> {
        self.inner.expired_keys()
    }
}

/// A durable store whose batch inserts stall for `delay` first.
pub(crate) struct SlowInserts {
    inner: Arc<dyn DurableStore>,
    delay: Duration,
}

impl SlowInserts {
    pub fn new(inner: Arc<dyn DurableStore>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl DurableStore for SlowInserts {
    async fn tenant_by_credentials(&self, code: &str, secret_key: &str) -> Result<Option<Tenant>> {
        self.inner.tenant_by_credentials(code, secret_key).await
    }

    async fn upsert_user(&self, tenant_id: Uuid, external_id: ExternalId, now: DateTime<Utc>) -> Result<User> {
        self.inner.upsert_user(tenant_id, external_id, now).await
    }

    async fn update_profile(
        &self,
        tenant_id: Uuid,
        external_id: ExternalId,
        profile: UpdateProfile,
        now: DateTime<Utc>,
    ) -> Result<User> {
        self.inner.update_profile(tenant_id, external_id, profile, now).await
    }

    async fn touch_last_seen(&self, tenant_id: Uuid, external_id: ExternalId, now: DateTime<Utc>) -> Result<()> {
        self.inner.touch_last_seen(tenant_id, external_id, now).await
    }

    async fn conversation_participants(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Option<Vec<ExternalId>>> {
        self.inner.conversation_participants(tenant_id, conversation_id).await
    }

    async fn find_conversation_by_participants(
        &self,
        tenant_id: Uuid,
        participants: Vec<ExternalId>,
    ) -> Result<Option<Conversation>> {
        self.inner.find_conversation_by_participants(tenant_id, participants).await
    }

    async fn create_conversation(
        &self,
        tenant_id: Uuid,
        participants: Vec<ExternalId>,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool)> {
        self.inner.create_conversation(tenant_id, participants, now).await
    }

    async fn insert_messages(&self, messages: Vec<Message>) -> Result<InsertReport> {
        tokio::time::sleep(self.delay).await;
        self.inner.insert_messages(messages).await
    }

    async fn mark_read(&self, tenant_id: Uuid, conversation_id: Uuid, receipt: ReadReceipt) -> Result<usize> {
        self.inner.mark_read(tenant_id, conversation_id, receipt).await
    }

    async fn unread_counts(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        external_id: ExternalId,
    ) -> Result<UnreadCounts> {
        self.inner.unread_counts(tenant_id, conversation_id, external_id).await
    }

    async fn message(&self, tenant_id: Uuid, message_id: Uuid) -> Result<Option<Message>> {
        self.inner.message(tenant_id, message_id).await
    }

    async fn edit_message(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
        editor: ExternalId,
        content: String,
    ) -> Result<bool> {
        self.inner.edit_message(tenant_id, message_id, editor, content).await
    }

    async fn soft_delete_message(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
        deleted_by: ExternalId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.soft_delete_message(tenant_id, message_id, deleted_by, now).await
    }

    async fn add_reaction(&self, tenant_id: Uuid, message_id: Uuid, reaction: Reaction) -> Result<bool> {
        self.inner.add_reaction(tenant_id, message_id, reaction).await
    }
}
