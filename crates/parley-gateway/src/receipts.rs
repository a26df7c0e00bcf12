use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, SubsecRound, Utc};
use tracing::debug;

use parley_types::frames::{ServerEvent, ServerFrame};

use crate::registry::ConnectionRegistry;
use crate::store::ChatStore;

/// Result of one `mark_read` batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadReceiptOutcome {
    /// Rows that went from unread to read in this batch
    pub marked: usize,
    /// Original sender -> ids of their messages that were just read
    pub by_sender: BTreeMap<String, Vec<String>>,
    /// Senders that were online and got a `messages_read` frame
    pub notified: usize,
    pub read_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ReadReceiptResolver {
    store: Arc<dyn ChatStore>,
    registry: ConnectionRegistry,
}

impl ReadReceiptResolver {
    pub fn new(store: Arc<dyn ChatStore>, registry: ConnectionRegistry) -> Self {
        Self { store, registry }
    }

    /// Mark `message_ids` read on behalf of `reader_id` and tell each original
    /// sender once, with all of their ids in one frame.
    pub async fn mark_read(&self, reader_id: &str, message_ids: &[String]) -> Result<ReadReceiptOutcome> {
        // Stored stamps have microsecond precision; truncate up front so the
        // value we match on and report is exactly the stored one.
        let read_at = Utc::now().trunc_subsecs(6);

        let marked = self.store.mark_as_read(message_ids, reader_id, read_at).await?;
        if marked == 0 {
            debug!(reader = %reader_id, requested = message_ids.len(), "Nothing newly read");
            return Ok(ReadReceiptOutcome {
                marked,
                by_sender: BTreeMap::new(),
                notified: 0,
                read_at,
            });
        }

        let just_read = self.store.fetch_just_read(message_ids, reader_id, read_at).await?;

        let mut by_sender: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for message in just_read {
            by_sender.entry(message.sender_id).or_default().push(message.id);
        }

        let mut notified = 0;
        for (sender_id, ids) in &by_sender {
            let frame = ServerFrame::from(ServerEvent::MessagesRead {
                message_ids: ids.clone(),
                read_by: reader_id.to_string(),
                read_at,
            });
            if self.registry.send_to_user(sender_id, frame) {
                notified += 1;
            }
        }

        Ok(ReadReceiptOutcome {
            marked,
            by_sender,
            notified,
            read_at,
        })
    }
}
