use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE tenants (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                code        TEXT NOT NULL UNIQUE,
                secret_key  TEXT NOT NULL UNIQUE,
                is_active   INTEGER NOT NULL DEFAULT 1,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                tenant_id   TEXT NOT NULL REFERENCES tenants(id),
                external_id INTEGER NOT NULL,
                name        TEXT NOT NULL DEFAULT '',
                avatar      TEXT,
                status      TEXT NOT NULL DEFAULT 'offline',
                last_seen   TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                UNIQUE(tenant_id, external_id)
            );

            CREATE TABLE conversations (
                id                TEXT PRIMARY KEY,
                tenant_id         TEXT NOT NULL REFERENCES tenants(id),
                participant_key   TEXT NOT NULL,
                participant_count INTEGER NOT NULL,
                external_id       INTEGER UNIQUE,
                created_at        TEXT NOT NULL
            );

            -- Only 1:1 conversations are unique per participant set.
            CREATE UNIQUE INDEX idx_conversations_pair
                ON conversations(tenant_id, participant_key)
                WHERE participant_count = 2;

            CREATE INDEX idx_conversations_key
                ON conversations(tenant_id, participant_key);

            CREATE TABLE conversation_participants (
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                external_id     INTEGER NOT NULL,
                position        INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, external_id)
            );

            CREATE INDEX idx_participants_user
                ON conversation_participants(external_id);

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                tenant_id       TEXT NOT NULL,
                user_id         TEXT NOT NULL,
                sender_id       INTEGER NOT NULL,
                sender_name     TEXT NOT NULL,
                content         TEXT,
                images          TEXT NOT NULL DEFAULT '[]',
                mention_all     INTEGER NOT NULL DEFAULT 0,
                reply_to        TEXT,
                status          TEXT NOT NULL DEFAULT 'sent',
                deleted_at      TEXT,
                deleted_by      INTEGER,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at);

            CREATE TABLE message_mentions (
                message_id  TEXT NOT NULL REFERENCES messages(id),
                external_id INTEGER NOT NULL,
                PRIMARY KEY (message_id, external_id)
            );

            -- At most one read receipt per reader and message.
            CREATE TABLE message_reads (
                message_id  TEXT NOT NULL REFERENCES messages(id),
                user_id     TEXT NOT NULL,
                external_id INTEGER NOT NULL,
                read_at     TEXT NOT NULL,
                PRIMARY KEY (message_id, external_id)
            );

            CREATE TABLE message_reactions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id  TEXT NOT NULL REFERENCES messages(id),
                external_id INTEGER NOT NULL,
                emoji       TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_reactions_message
                ON message_reactions(message_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
