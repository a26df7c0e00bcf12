use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use parley_db::Database;
use parley_types::models::{Conversation, Message};

/// Persistence the gateway needs for delivery and read receipts.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Same conversation regardless of argument order.
    async fn find_or_create_conversation(&self, user_a: &str, user_b: &str) -> Result<Conversation>;

    async fn create_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<Message>;

    async fn update_conversation_activity(&self, conversation_id: &str, last_message_id: &str) -> Result<()>;

    /// Set `read_at` on unread messages addressed to `reader_id`.
    /// Returns the number of rows that changed.
    async fn mark_as_read(&self, message_ids: &[String], reader_id: &str, read_at: DateTime<Utc>) -> Result<usize>;

    /// Messages among `message_ids` that carry exactly the `read_at` stamp,
    /// i.e. the ones the matching `mark_as_read` call transitioned.
    async fn fetch_just_read(
        &self,
        message_ids: &[String],
        reader_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<Vec<Message>>;
}

/// [`ChatStore`] over the SQLite [`Database`]. rusqlite is synchronous, so
/// every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db.as_ref())).await?
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn find_or_create_conversation(&self, user_a: &str, user_b: &str) -> Result<Conversation> {
        let (a, b) = (user_a.to_string(), user_b.to_string());
        self.blocking(move |db| db.find_or_create_conversation(&a, &b)?.try_into())
            .await
    }

    async fn create_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<Message> {
        let cid = conversation_id.to_string();
        let sid = sender_id.to_string();
        let rid = receiver_id.to_string();
        let content = content.to_string();
        self.blocking(move |db| db.create_message(&cid, &sid, &rid, &content)?.try_into())
            .await
    }

    async fn update_conversation_activity(&self, conversation_id: &str, last_message_id: &str) -> Result<()> {
        let cid = conversation_id.to_string();
        let mid = last_message_id.to_string();
        self.blocking(move |db| db.update_conversation_activity(&cid, &mid))
            .await
    }

    async fn mark_as_read(&self, message_ids: &[String], reader_id: &str, read_at: DateTime<Utc>) -> Result<usize> {
        let ids = message_ids.to_vec();
        let reader = reader_id.to_string();
        self.blocking(move |db| db.mark_as_read(&ids, &reader, read_at))
            .await
    }

    async fn fetch_just_read(
        &self,
        message_ids: &[String],
        reader_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let ids = message_ids.to_vec();
        let reader = reader_id.to_string();
        self.blocking(move |db| {
            db.fetch_just_read(&ids, &reader, read_at)?
                .into_iter()
                .map(Message::try_from)
                .collect()
        })
        .await
    }
}
