use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A direct-message thread between exactly two users.
///
/// `participant_a` is always the lexicographically smaller user id, see
/// [`canonical_pair`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub last_message_id: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Set once when the receiver marks the message read, never cleared.
    pub read_at: Option<DateTime<Utc>>,
}

/// Order two user ids so the smaller one comes first.
///
/// Every conversation lookup and insert goes through this so that (A, B) and
/// (B, A) always resolve to the same row.
pub fn canonical_pair<'a>(user_a: &'a str, user_b: &'a str) -> (&'a str, &'a str) {
    if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    }
}
