use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id                TEXT PRIMARY KEY,
            participant_a     TEXT NOT NULL,
            participant_b     TEXT NOT NULL,
            last_message_id   TEXT,
            last_activity_at  TEXT NOT NULL,
            created_at        TEXT NOT NULL,
            UNIQUE(participant_a, participant_b),
            CHECK(participant_a <= participant_b)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id               TEXT PRIMARY KEY,
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            sender_id        TEXT NOT NULL,
            receiver_id      TEXT NOT NULL,
            content          TEXT NOT NULL,
            created_at       TEXT NOT NULL,
            read_at          TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_unread
            ON messages(receiver_id, read_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
