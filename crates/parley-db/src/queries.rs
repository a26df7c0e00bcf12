use crate::models::{ConversationRow, MessageRow};
use crate::{Database, format_timestamp};
use std::collections::HashSet;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use parley_types::models::canonical_pair;
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

const CONVERSATION_COLUMNS: &str =
    "id, participant_a, participant_b, last_message_id, last_activity_at, created_at";

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, receiver_id, content, created_at, read_at";

impl Database {
    // -- Conversations --

    /// Return the conversation between two users, creating it if needed.
    /// Argument order does not matter.
    pub fn find_or_create_conversation(&self, user_a: &str, user_b: &str) -> Result<ConversationRow> {
        let (first, second) = canonical_pair(user_a, user_b);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = format_timestamp(Utc::now());

            // The unique (participant_a, participant_b) constraint makes this a
            // no-op when another writer created the row first.
            tx.execute(
                "INSERT INTO conversations (id, participant_a, participant_b, last_activity_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(participant_a, participant_b) DO NOTHING",
                rusqlite::params![Uuid::new_v4().to_string(), first, second, now],
            )?;

            let row = query_conversation_by_pair(&tx, first, second)?
                .ok_or_else(|| anyhow!("Conversation vanished: {} / {}", first, second))?;

            tx.commit()?;
            Ok(row)
        })
    }

    pub fn update_conversation_activity(&self, conversation_id: &str, last_message_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let updated = conn.execute(
                "UPDATE conversations SET last_message_id = ?1, last_activity_at = ?2 WHERE id = ?3",
                rusqlite::params![last_message_id, format_timestamp(Utc::now()), conversation_id],
            )?;
            if updated == 0 {
                return Err(anyhow!("Conversation not found: {}", conversation_id));
            }
            Ok(())
        })
    }

    // -- Messages --

    pub fn create_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<MessageRow> {
        let row = MessageRow {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            created_at: format_timestamp(Utc::now()),
            read_at: None,
        };

        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, receiver_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    row.id,
                    row.conversation_id,
                    row.sender_id,
                    row.receiver_id,
                    row.content,
                    row.created_at
                ],
            )?;
            Ok(())
        })?;

        Ok(row)
    }

    /// Most recent messages of a conversation, newest first.
    pub fn get_conversation_messages(&self, conversation_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Read receipts --

    /// Stamp `read_at` on every listed message addressed to `reader_id` that
    /// is still unread. Returns how many rows changed; ids that are unknown,
    /// already read, or addressed to someone else are skipped.
    ///
    /// Large batches are split into chunks of [`ID_CHUNK`] ids, all written
    /// in one transaction with the same stamp.
    pub fn mark_as_read(&self, message_ids: &[String], reader_id: &str, read_at: DateTime<Utc>) -> Result<usize> {
        let ids = distinct_ids(message_ids);
        if ids.is_empty() {
            return Ok(0);
        }

        let stamp = format_timestamp(read_at);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut updated = 0;

            for chunk in ids.chunks(ID_CHUNK) {
                let sql = format!(
                    "UPDATE messages SET read_at = ?1
                     WHERE receiver_id = ?2 AND read_at IS NULL AND id IN ({})",
                    id_placeholders(3, chunk.len())
                );

                let mut params: Vec<&dyn ToSql> = vec![&stamp as &dyn ToSql, &reader_id];
                params.extend(chunk.iter().map(|id| id as &dyn ToSql));

                updated += tx.execute(&sql, params.as_slice())?;
            }

            tx.commit()?;
            Ok(updated)
        })
    }

    /// The subset of `message_ids` that [`Database::mark_as_read`] transitioned
    /// with exactly this `read_at` stamp, oldest first.
    pub fn fetch_just_read(
        &self,
        message_ids: &[String],
        reader_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<Vec<MessageRow>> {
        let ids = distinct_ids(message_ids);
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let stamp = format_timestamp(read_at);
        self.with_conn(|conn| {
            let mut found: Vec<(String, i64, MessageRow)> = Vec::new();

            for chunk in ids.chunks(ID_CHUNK) {
                let sql = format!(
                    "SELECT {}, rowid FROM messages
                     WHERE receiver_id = ?1 AND read_at = ?2 AND id IN ({})",
                    MESSAGE_COLUMNS,
                    id_placeholders(3, chunk.len())
                );

                let mut params: Vec<&dyn ToSql> = vec![&reader_id as &dyn ToSql, &stamp];
                params.extend(chunk.iter().map(|id| id as &dyn ToSql));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params.as_slice(), |row| {
                    let message = message_from_row(row)?;
                    Ok((message.created_at.clone(), row.get::<_, i64>(7)?, message))
                })?;
                for row in rows {
                    found.push(row?);
                }
            }

            // Chunks come back independently; restore one global order
            found.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
            Ok(found.into_iter().map(|(_, _, message)| message).collect())
        })
    }
}

/// Ids bound per statement. Well under SQLite's 32766 host-parameter limit.
const ID_CHUNK: usize = 500;

/// `ids` with repeats removed, first occurrence kept.
fn distinct_ids(ids: &[String]) -> Vec<&String> {
    let mut seen = HashSet::new();
    ids.iter().filter(|id| seen.insert(id.as_str())).collect()
}

/// `?first, ?first+1, ...` for an `IN (...)` list of `count` values.
fn id_placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn query_conversation_by_pair(conn: &Connection, first: &str, second: &str) -> Result<Option<ConversationRow>> {
    let sql = format!(
        "SELECT {} FROM conversations WHERE participant_a = ?1 AND participant_b = ?2",
        CONVERSATION_COLUMNS
    );
    let row = conn
        .query_row(&sql, [first, second], conversation_from_row)
        .optional()?;
    Ok(row)
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        participant_a: row.get(1)?,
        participant_b: row.get(2)?,
        last_message_id: row.get(3)?,
        last_activity_at: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        receiver_id: row.get(3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
        read_at: row.get(6)?,
    })
}
