use std::collections::HashMap;

use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use serde::de::DeserializeOwned;
use tracing::warn;
use uuid::Uuid;

use murmur_types::api::{ConversationSummary, LastMessage, ParticipantUser};
use murmur_types::events::UpdateProfile;
use murmur_types::models::{
    Conversation, ExternalId, Message, MessageStatus, ReadReceipt, Reaction, ReplyTo, Tenant,
    User, UserStatus, normalize_participants,
};

use crate::Database;
use crate::models::{ConversationQuery, InsertReport, MessageQuery, UnreadCounts};

const TENANT_COLUMNS: &str = "id, name, code, secret_key, is_active, created_at";
const USER_COLUMNS: &str = "id, tenant_id, external_id, name, avatar, status, last_seen";
const CONVERSATION_COLUMNS: &str = "id, tenant_id, external_id, created_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, tenant_id, user_id, sender_id, sender_name, \
     content, images, mention_all, reply_to, status, deleted_at, deleted_by, created_at";

impl Database {
    // -- Tenants --

    pub fn create_tenant(&self, tenant: &Tenant) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO tenants ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)", TENANT_COLUMNS),
                params![
                    tenant.id.to_string(),
                    tenant.name,
                    tenant.code,
                    tenant.secret_key,
                    tenant.is_active,
                    ts(&tenant.created_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Active tenant whose code and secret key both match.
    pub fn tenant_by_credentials(&self, code: &str, secret_key: &str) -> Result<Option<Tenant>> {
        self.with_conn(|conn| {
            let tenant = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM tenants WHERE code = ?1 AND secret_key = ?2 AND is_active = 1",
                        TENANT_COLUMNS
                    ),
                    params![code, secret_key],
                    tenant_from_row,
                )
                .optional()?;
            Ok(tenant)
        })
    }

    pub fn tenant_by_code(&self, code: &str) -> Result<Option<Tenant>> {
        self.with_conn(|conn| {
            let tenant = conn
                .query_row(
                    &format!("SELECT {} FROM tenants WHERE code = ?1", TENANT_COLUMNS),
                    [code],
                    tenant_from_row,
                )
                .optional()?;
            Ok(tenant)
        })
    }

    pub fn secret_key_exists(&self, secret_key: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row("SELECT 1 FROM tenants WHERE secret_key = ?1", [secret_key], |r| r.get(0))
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn list_tenants(&self) -> Result<Vec<Tenant>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM tenants ORDER BY created_at",
                TENANT_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], tenant_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Users --

    /// Create the user on first connect, otherwise just bump `last_seen`.
    pub fn upsert_user(&self, tenant_id: Uuid, external_id: ExternalId, now: DateTime<Utc>) -> Result<User> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, tenant_id, external_id, last_seen, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(tenant_id, external_id) DO UPDATE SET last_seen = excluded.last_seen",
                params![Uuid::new_v4().to_string(), tenant_id.to_string(), external_id, ts(&now)],
            )?;
            query_user(conn, tenant_id, external_id)?
                .ok_or_else(|| anyhow!("user {} vanished after upsert", external_id))
        })
    }

    /// Upsert the provided profile fields; absent fields keep their value.
    pub fn update_profile(
        &self,
        tenant_id: Uuid,
        external_id: ExternalId,
        profile: &UpdateProfile,
        now: DateTime<Utc>,
    ) -> Result<User> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, tenant_id, external_id, name, avatar, status, last_seen, created_at)
                 VALUES (?1, ?2, ?3, COALESCE(?4, ''), ?5, COALESCE(?6, 'offline'), ?7, ?7)
                 ON CONFLICT(tenant_id, external_id) DO UPDATE SET
                    name = COALESCE(?4, users.name),
                    avatar = COALESCE(?5, users.avatar),
                    status = COALESCE(?6, users.status),
                    last_seen = ?7",
                params![
                    Uuid::new_v4().to_string(),
                    tenant_id.to_string(),
                    external_id,
                    profile.sender_name,
                    profile.sender_avatar,
                    profile.status.map(|s| s.as_str()),
                    ts(&now),
                ],
            )?;
            query_user(conn, tenant_id, external_id)?
                .ok_or_else(|| anyhow!("user {} vanished after profile update", external_id))
        })
    }

    pub fn touch_last_seen(&self, tenant_id: Uuid, external_id: ExternalId, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_seen = ?3 WHERE tenant_id = ?1 AND external_id = ?2",
                params![tenant_id.to_string(), external_id, ts(&now)],
            )?;
            Ok(())
        })
    }

    pub fn find_user(&self, tenant_id: Uuid, external_id: ExternalId) -> Result<Option<User>> {
        self.with_conn(|conn| query_user(conn, tenant_id, external_id))
    }

    pub fn users_by_external_ids(&self, tenant_id: Uuid, external_ids: &[ExternalId]) -> Result<Vec<User>> {
        self.with_conn(|conn| query_users(conn, tenant_id, external_ids))
    }

    // -- Conversations --

    /// Insert a conversation for the given participant set. For 1:1 sets the
    /// database enforces uniqueness; losing that race returns the existing
    /// conversation with `created == false`.
    pub fn create_conversation(
        &self,
        id: Uuid,
        tenant_id: Uuid,
        participants: &[ExternalId],
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool)> {
        let participants = normalize_participants(participants.iter().copied());
        if participants.is_empty() {
            return Err(anyhow!("a conversation needs at least one participant"));
        }
        let key = participant_key(&participants);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT INTO conversations (id, tenant_id, participant_key, participant_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT DO NOTHING",
                params![
                    id.to_string(),
                    tenant_id.to_string(),
                    key,
                    participants.len() as i64,
                    ts(&now),
                ],
            )?;

            if inserted == 0 {
                let existing = query_conversation_by_key(&tx, tenant_id, &key)?
                    .ok_or_else(|| anyhow!("conversation insert ignored but no match for {}", key))?;
                return Ok((existing, false));
            }

            for (position, external_id) in participants.iter().enumerate() {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, external_id, position)
                     VALUES (?1, ?2, ?3)",
                    params![id.to_string(), external_id, position as i64],
                )?;
            }
            tx.commit()?;

            Ok((
                Conversation {
                    id,
                    tenant_id,
                    participants,
                    external_id: None,
                    created_at: now,
                },
                true,
            ))
        })
    }

    pub fn conversation(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| query_conversation(conn, tenant_id, id))
    }

    /// Oldest conversation whose participant set equals `participants` exactly.
    pub fn conversation_by_participants(
        &self,
        tenant_id: Uuid,
        participants: &[ExternalId],
    ) -> Result<Option<Conversation>> {
        let key = participant_key(&normalize_participants(participants.iter().copied()));
        self.with_conn(|conn| query_conversation_by_key(conn, tenant_id, &key))
    }

    /// How many conversations `list_conversations` would page through.
    pub fn count_conversations(&self, query: &ConversationQuery) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id AND p.external_id = ?2
                 WHERE c.tenant_id = ?1
                   AND (?3 = 0 OR EXISTS (
                        SELECT 1 FROM messages m
                         WHERE m.conversation_id = c.id AND m.deleted_at IS NULL AND m.sender_id != ?2
                           AND NOT EXISTS (SELECT 1 FROM message_reads r
                                           WHERE r.message_id = m.id AND r.external_id = ?2)))",
                params![query.tenant_id.to_string(), query.external_id, query.unread_only],
                |r| r.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// The user's conversations with unread and mention counts, most recently
    /// active first.
    /// Summaries with `isOnline` from `lastSeen` only; presence keys live in
    /// the fast store and are the caller's to add.
    pub fn list_conversations(&self, query: &ConversationQuery) -> Result<Vec<ConversationSummary>> {
        let now = Utc::now();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at, last_at, unread, mentions FROM (
                    SELECT c.id, c.created_at,
                        (SELECT MAX(m.created_at) FROM messages m
                          WHERE m.conversation_id = c.id AND m.deleted_at IS NULL) AS last_at,
                        (SELECT COUNT(*) FROM messages m
                          WHERE m.conversation_id = c.id AND m.deleted_at IS NULL AND m.sender_id != ?2
                            AND NOT EXISTS (SELECT 1 FROM message_reads r
                                            WHERE r.message_id = m.id AND r.external_id = ?2)) AS unread,
                        (SELECT COUNT(*) FROM messages m
                          WHERE m.conversation_id = c.id AND m.deleted_at IS NULL AND m.sender_id != ?2
                            AND NOT EXISTS (SELECT 1 FROM message_reads r
                                            WHERE r.message_id = m.id AND r.external_id = ?2)
                            AND (m.mention_all = 1 OR EXISTS (SELECT 1 FROM message_mentions mm
                                            WHERE mm.message_id = m.id AND mm.external_id = ?2))) AS mentions
                    FROM conversations c
                    JOIN conversation_participants p ON p.conversation_id = c.id AND p.external_id = ?2
                    WHERE c.tenant_id = ?1
                 )
                 WHERE ?3 = 0 OR unread > 0
                 ORDER BY last_at IS NULL, last_at DESC, created_at DESC
                 LIMIT ?4 OFFSET ?5",
            )?;

            let rows = stmt
                .query_map(
                    params![
                        query.tenant_id.to_string(),
                        query.external_id,
                        query.unread_only,
                        query.limit as i64,
                        query.skip as i64,
                    ],
                    |row| {
                        Ok((
                            uuid_at(row, 0)?,
                            ts_at(row, 1)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut summaries = Vec::with_capacity(rows.len());
            for (id, created_at, unread, mentions) in rows {
                let participants = query_participants(conn, id)?;
                let participant_users = query_users(conn, query.tenant_id, &participants)?
                    .into_iter()
                    .map(|u| {
                        let is_online = u.seen_recently(now);
                        ParticipantUser {
                            external_id: u.external_id,
                            name: u.name,
                            avatar: u.avatar,
                            status: u.status,
                            is_online,
                            last_seen: u.last_seen,
                        }
                    })
                    .collect();

                summaries.push(ConversationSummary {
                    id,
                    participants,
                    participant_users,
                    last_message: query_last_message(conn, id)?,
                    unread_count: unread as u64,
                    mention_count: mentions as u64,
                    created_at,
                });
            }
            Ok(summaries)
        })
    }

    // -- Messages --

    /// Best-effort batch insert. Each message is written in its own savepoint
    /// so one bad document does not abort the batch; a message id that is
    /// already stored counts as a duplicate, not a failure.
    pub fn insert_messages(&self, messages: &[Message]) -> Result<InsertReport> {
        self.with_conn_mut(|conn| {
            let mut tx = conn.transaction()?;
            let mut report = InsertReport::default();

            for message in messages {
                match insert_message(&mut tx, message) {
                    Ok(true) => report.written += 1,
                    Ok(false) => report.duplicates += 1,
                    Err(e) => {
                        warn!("Failed to persist message {}: {}", message.id, e);
                        report.failed += 1;
                    }
                }
            }

            tx.commit()?;
            Ok(report)
        })
    }

    pub fn message(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let message = conn
                .query_row(
                    &format!("SELECT {} FROM messages WHERE id = ?1 AND tenant_id = ?2", MESSAGE_COLUMNS),
                    params![id.to_string(), tenant_id.to_string()],
                    message_from_row,
                )
                .optional()?;

            let Some(message) = message else {
                return Ok(None);
            };
            let mut messages = vec![message];
            load_children(conn, &mut messages)?;
            Ok(messages.pop())
        })
    }

    /// Non-deleted messages matching the query, newest first.
    pub fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        let (filter, mut values) = message_filter(query);
        values.push(Value::Integer(query.limit as i64));
        values.push(Value::Integer(query.skip as i64));

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE {} ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
                MESSAGE_COLUMNS, filter
            ))?;
            let mut messages = stmt
                .query_map(params_from_iter(values.iter()), message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            load_children(conn, &mut messages)?;
            Ok(messages)
        })
    }

    pub fn count_messages(&self, query: &MessageQuery) -> Result<u64> {
        let (filter, values) = message_filter(query);
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM messages WHERE {}", filter),
                params_from_iter(values.iter()),
                |r| r.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Append `receipt` to every message of the conversation the reader has
    /// not read yet, skipping their own messages. Returns how many messages
    /// were marked.
    pub fn mark_read(&self, tenant_id: Uuid, conversation_id: Uuid, receipt: &ReadReceipt) -> Result<usize> {
        self.with_conn(|conn| {
            let marked = conn.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, external_id, read_at)
                 SELECT m.id, ?3, ?4, ?5 FROM messages m
                 WHERE m.tenant_id = ?1 AND m.conversation_id = ?2 AND m.sender_id != ?4
                   AND NOT EXISTS (SELECT 1 FROM message_reads r
                                   WHERE r.message_id = m.id AND r.external_id = ?4)",
                params![
                    tenant_id.to_string(),
                    conversation_id.to_string(),
                    receipt.user_id.to_string(),
                    receipt.external_id,
                    ts(&receipt.read_at),
                ],
            )?;
            Ok(marked)
        })
    }

    pub fn unread_counts(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        external_id: ExternalId,
    ) -> Result<UnreadCounts> {
        self.with_conn(|conn| {
            let (unread, mentions): (i64, i64) = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN m.mention_all = 1 OR EXISTS (
                                SELECT 1 FROM message_mentions mm
                                WHERE mm.message_id = m.id AND mm.external_id = ?3)
                            THEN 1 ELSE 0 END), 0)
                 FROM messages m
                 WHERE m.tenant_id = ?1 AND m.conversation_id = ?2
                   AND m.deleted_at IS NULL AND m.sender_id != ?3
                   AND NOT EXISTS (SELECT 1 FROM message_reads r
                                   WHERE r.message_id = m.id AND r.external_id = ?3)",
                params![tenant_id.to_string(), conversation_id.to_string(), external_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            Ok(UnreadCounts {
                unread: unread as u64,
                mentions: mentions as u64,
            })
        })
    }

    /// Only the sender may edit, and only while the message is not deleted.
    pub fn edit_message(&self, tenant_id: Uuid, id: Uuid, editor: ExternalId, content: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET content = ?4
                 WHERE id = ?1 AND tenant_id = ?2 AND sender_id = ?3 AND deleted_at IS NULL",
                params![id.to_string(), tenant_id.to_string(), editor, content],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn soft_delete_message(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        deleted_by: ExternalId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET deleted_at = ?4, deleted_by = ?3
                 WHERE id = ?1 AND tenant_id = ?2 AND sender_id = ?3 AND deleted_at IS NULL",
                params![id.to_string(), tenant_id.to_string(), deleted_by, ts(&now)],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn add_reaction(&self, tenant_id: Uuid, message_id: Uuid, reaction: &Reaction) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO message_reactions (message_id, external_id, emoji, created_at)
                 SELECT id, ?3, ?4, ?5 FROM messages
                 WHERE id = ?1 AND tenant_id = ?2 AND deleted_at IS NULL",
                params![
                    message_id.to_string(),
                    tenant_id.to_string(),
                    reaction.external_id,
                    reaction.emoji,
                    ts(&reaction.created_at),
                ],
            )?;
            Ok(changed == 1)
        })
    }
}

/// Canonical form of a participant set, used as the lookup key.
pub fn participant_key(participants: &[ExternalId]) -> String {
    participants
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn insert_message(tx: &mut Transaction<'_>, message: &Message) -> Result<bool> {
    let sp = tx.savepoint()?;
    let id = message.id.to_string();

    let inserted = sp.execute(
        &format!(
            "INSERT INTO messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO NOTHING",
            MESSAGE_COLUMNS
        ),
        params![
            id,
            message.conversation_id.to_string(),
            message.tenant_id.to_string(),
            message.user_id.to_string(),
            message.sender_id,
            message.sender_name,
            message.content,
            serde_json::to_string(&message.images)?,
            message.mention_all,
            message.reply_to.as_ref().map(serde_json::to_string).transpose()?,
            message.status.as_str(),
            message.deleted_at.as_ref().map(ts),
            message.deleted_by,
            ts(&message.created_at),
        ],
    )?;
    if inserted == 0 {
        return Ok(false);
    }

    for external_id in &message.mentions {
        sp.execute(
            "INSERT OR IGNORE INTO message_mentions (message_id, external_id) VALUES (?1, ?2)",
            params![id, external_id],
        )?;
    }
    for receipt in &message.read_by {
        sp.execute(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id, external_id, read_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, receipt.user_id.to_string(), receipt.external_id, ts(&receipt.read_at)],
        )?;
    }
    for reaction in &message.reactions {
        sp.execute(
            "INSERT INTO message_reactions (message_id, external_id, emoji, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, reaction.external_id, reaction.emoji, ts(&reaction.created_at)],
        )?;
    }

    sp.commit()?;
    Ok(true)
}

fn message_filter(query: &MessageQuery) -> (String, Vec<Value>) {
    let mut clauses = vec![
        "tenant_id = ?".to_string(),
        "conversation_id = ?".to_string(),
        "deleted_at IS NULL".to_string(),
    ];
    let mut values = vec![
        Value::Text(query.tenant_id.to_string()),
        Value::Text(query.conversation_id.to_string()),
    ];

    if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
        clauses.push("(content LIKE ? ESCAPE '\\' OR sender_name LIKE ? ESCAPE '\\')".to_string());
        let pattern = format!("%{}%", escape_like(search));
        values.push(Value::Text(pattern.clone()));
        values.push(Value::Text(pattern));
    }
    if let Some(before) = &query.before {
        clauses.push("created_at < ?".to_string());
        values.push(Value::Text(ts(before)));
    }
    if let Some(after) = &query.after {
        clauses.push("created_at > ?".to_string());
        values.push(Value::Text(ts(after)));
    }

    (clauses.join(" AND "), values)
}

fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Batch-fetch mentions, read receipts and reactions for `messages`.
fn load_children(conn: &Connection, messages: &mut [Message]) -> Result<()> {
    if messages.is_empty() {
        return Ok(());
    }

    let ids: Vec<String> = messages.iter().map(|m| m.id.to_string()).collect();
    let index: HashMap<String, usize> = ids.iter().cloned().enumerate().map(|(i, id)| (id, i)).collect();
    let placeholders = vec!["?"; ids.len()].join(", ");

    let mut stmt = conn.prepare(&format!(
        "SELECT message_id, external_id FROM message_mentions WHERE message_id IN ({}) ORDER BY external_id",
        placeholders
    ))?;
    let mentions = stmt
        .query_map(params_from_iter(ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, ExternalId>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (message_id, external_id) in mentions {
        if let Some(&i) = index.get(&message_id) {
            messages[i].mentions.push(external_id);
        }
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT message_id, user_id, external_id, read_at FROM message_reads
         WHERE message_id IN ({}) ORDER BY rowid",
        placeholders
    ))?;
    let reads = stmt
        .query_map(params_from_iter(ids.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                ReadReceipt {
                    user_id: uuid_at(row, 1)?,
                    external_id: row.get(2)?,
                    read_at: ts_at(row, 3)?,
                },
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (message_id, receipt) in reads {
        if let Some(&i) = index.get(&message_id) {
            messages[i].read_by.push(receipt);
        }
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT message_id, external_id, emoji, created_at FROM message_reactions
         WHERE message_id IN ({}) ORDER BY id",
        placeholders
    ))?;
    let reactions = stmt
        .query_map(params_from_iter(ids.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                Reaction {
                    external_id: row.get(1)?,
                    emoji: row.get(2)?,
                    created_at: ts_at(row, 3)?,
                },
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (message_id, reaction) in reactions {
        if let Some(&i) = index.get(&message_id) {
            messages[i].reactions.push(reaction);
        }
    }

    Ok(())
}

fn query_user(conn: &Connection, tenant_id: Uuid, external_id: ExternalId) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE tenant_id = ?1 AND external_id = ?2", USER_COLUMNS),
            params![tenant_id.to_string(), external_id],
            user_from_row,
        )
        .optional()?;
    Ok(user)
}

fn query_users(conn: &Connection, tenant_id: Uuid, external_ids: &[ExternalId]) -> Result<Vec<User>> {
    if external_ids.is_empty() {
        return Ok(vec![]);
    }

    let placeholders = vec!["?"; external_ids.len()].join(", ");
    let mut values = vec![Value::Text(tenant_id.to_string())];
    values.extend(external_ids.iter().map(|id| Value::Integer(*id)));

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM users WHERE tenant_id = ? AND external_id IN ({}) ORDER BY external_id",
        USER_COLUMNS, placeholders
    ))?;
    let users = stmt
        .query_map(params_from_iter(values.iter()), user_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(users)
}

fn query_participants(conn: &Connection, conversation_id: Uuid) -> Result<Vec<ExternalId>> {
    let mut stmt = conn.prepare(
        "SELECT external_id FROM conversation_participants WHERE conversation_id = ?1 ORDER BY position",
    )?;
    let ids = stmt
        .query_map([conversation_id.to_string()], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn query_conversation(conn: &Connection, tenant_id: Uuid, id: Uuid) -> Result<Option<Conversation>> {
    let conversation = conn
        .query_row(
            &format!(
                "SELECT {} FROM conversations WHERE id = ?1 AND tenant_id = ?2",
                CONVERSATION_COLUMNS
            ),
            params![id.to_string(), tenant_id.to_string()],
            conversation_from_row,
        )
        .optional()?;
    with_participants(conn, conversation)
}

fn query_conversation_by_key(conn: &Connection, tenant_id: Uuid, key: &str) -> Result<Option<Conversation>> {
    let conversation = conn
        .query_row(
            &format!(
                "SELECT {} FROM conversations WHERE tenant_id = ?1 AND participant_key = ?2
                 ORDER BY created_at, rowid LIMIT 1",
                CONVERSATION_COLUMNS
            ),
            params![tenant_id.to_string(), key],
            conversation_from_row,
        )
        .optional()?;
    with_participants(conn, conversation)
}

fn with_participants(conn: &Connection, conversation: Option<Conversation>) -> Result<Option<Conversation>> {
    match conversation {
        Some(mut c) => {
            c.participants = query_participants(conn, c.id)?;
            Ok(Some(c))
        }
        None => Ok(None),
    }
}

fn query_last_message(conn: &Connection, conversation_id: Uuid) -> Result<Option<LastMessage>> {
    let last = conn
        .query_row(
            "SELECT id, sender_id, sender_name, content, images, created_at FROM messages
             WHERE conversation_id = ?1 AND deleted_at IS NULL
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            [conversation_id.to_string()],
            |row| {
                Ok(LastMessage {
                    id: uuid_at(row, 0)?,
                    sender_id: row.get(1)?,
                    sender_name: row.get(2)?,
                    content: row.get(3)?,
                    images: json_at(row, 4)?,
                    created_at: ts_at(row, 5)?,
                })
            },
        )
        .optional()?;
    Ok(last)
}

// -- Row mapping --

fn tenant_from_row(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        code: row.get(2)?,
        secret_key: row.get(3)?,
        is_active: row.get(4)?,
        created_at: ts_at(row, 5)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let status: String = row.get(5)?;
    Ok(User {
        id: uuid_at(row, 0)?,
        tenant_id: uuid_at(row, 1)?,
        external_id: row.get(2)?,
        name: row.get(3)?,
        avatar: row.get(4)?,
        status: UserStatus::parse(&status).unwrap_or_default(),
        last_seen: ts_at(row, 6)?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: uuid_at(row, 0)?,
        tenant_id: uuid_at(row, 1)?,
        participants: Vec::new(),
        external_id: row.get(2)?,
        created_at: ts_at(row, 3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let reply_to: Option<String> = row.get(9)?;
    let reply_to = reply_to
        .map(|raw| serde_json::from_str::<ReplyTo>(&raw).map_err(|e| conversion_error(9, e)))
        .transpose()?;
    let status: String = row.get(10)?;
    let deleted_at: Option<String> = row.get(11)?;

    Ok(Message {
        id: uuid_at(row, 0)?,
        conversation_id: uuid_at(row, 1)?,
        tenant_id: uuid_at(row, 2)?,
        user_id: uuid_at(row, 3)?,
        sender_id: row.get(4)?,
        sender_name: row.get(5)?,
        content: row.get(6)?,
        images: json_at(row, 7)?,
        mentions: Vec::new(),
        mention_all: row.get(8)?,
        reply_to,
        read_by: Vec::new(),
        reactions: Vec::new(),
        status: MessageStatus::parse(&status).unwrap_or_default(),
        deleted_at: deleted_at.map(|raw| parse_ts(11, &raw)).transpose()?,
        deleted_by: row.get(12)?,
        created_at: ts_at(row, 13)?,
    })
}

/// Timestamps are stored as fixed-width RFC 3339 UTC strings so that text
/// ordering matches time ordering.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn json_at<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}
