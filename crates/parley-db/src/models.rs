//! SQLite row shapes, kept apart from the parley-types models so the DB
//! layer stays independent. Conversion parses the stored timestamps.

use anyhow::Result;

use parley_types::models::{Conversation, Message};

use crate::parse_timestamp;

pub struct ConversationRow {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub last_message_id: Option<String>,
    pub last_activity_at: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: String,
    pub read_at: Option<String>,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = anyhow::Error;

    fn try_from(row: ConversationRow) -> Result<Self> {
        Ok(Conversation {
            last_activity_at: parse_timestamp(&row.last_activity_at)?,
            created_at: parse_timestamp(&row.created_at)?,
            id: row.id,
            participant_a: row.participant_a,
            participant_b: row.participant_b,
            last_message_id: row.last_message_id,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Message {
            created_at: parse_timestamp(&row.created_at)?,
            read_at: row.read_at.as_deref().map(parse_timestamp).transpose()?,
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            content: row.content,
        })
    }
}
