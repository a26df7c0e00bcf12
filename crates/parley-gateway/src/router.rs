use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_types::frames::{ChatDelivery, ClientFrame, FrameError, ServerEvent};
use parley_types::models::Message;

use crate::receipts::{ReadReceiptOutcome, ReadReceiptResolver};
use crate::registry::{ConnectionRegistry, FrameReceiver};
use crate::store::ChatStore;
use crate::typing::TypingTracker;

/// Longest slice of a rejected frame that gets logged.
const MAX_LOGGED_FRAME: usize = 200;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),
}

/// What a successfully handled frame did.
#[derive(Debug)]
pub enum Dispatched {
    Chat { message: Message, delivered: bool },
    TypingStarted,
    TypingStopped { was_typing: bool },
    Read(ReadReceiptOutcome),
}

/// Owns all per-process chat state and routes inbound frames.
///
/// Built once at startup and shared (cheaply cloned) by every connection;
/// `shutdown` tears the in-memory state down.
#[derive(Clone)]
pub struct MessageRouter {
    store: Arc<dyn ChatStore>,
    registry: ConnectionRegistry,
    typing: TypingTracker,
    receipts: ReadReceiptResolver,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn ChatStore>, registry: ConnectionRegistry, typing_timeout: Duration) -> Self {
        Self {
            typing: TypingTracker::new(registry.clone(), typing_timeout),
            receipts: ReadReceiptResolver::new(store.clone(), registry.clone()),
            store,
            registry,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    // -- Connection lifecycle --

    pub fn connection_opened(&self, user_id: &str) -> (Uuid, FrameReceiver) {
        let (conn_id, rx) = self.registry.register(user_id);
        info!(user_id = %user_id, %conn_id, online = self.registry.online_count(), "User online");
        (conn_id, rx)
    }

    /// Drop the user's registry entry and typing state, unless a newer
    /// connection for the same user has already taken over.
    pub fn connection_closed(&self, user_id: &str, conn_id: Uuid) {
        if !self.registry.unregister(user_id, conn_id) {
            debug!(user_id = %user_id, %conn_id, "Superseded connection closed");
            return;
        }

        self.typing.clear_sender(user_id);
        info!(user_id = %user_id, %conn_id, online = self.registry.online_count(), "User offline");
    }

    pub fn shutdown(&self) {
        self.typing.shutdown();
        self.registry.clear();
        info!("Message router shut down");
    }

    // -- Inbound frames --

    /// Entry point for a text frame. Never fails: bad frames and store errors
    /// are logged and the connection carries on.
    pub async fn handle_text(&self, user_id: &str, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    error = %e,
                    raw = %text.chars().take(MAX_LOGGED_FRAME).collect::<String>(),
                    "Dropping malformed frame"
                );
                return;
            }
        };

        let kind = frame.kind();
        match self.dispatch(user_id, frame).await {
            Ok(Dispatched::Read(outcome)) => {
                info!(
                    reader = %user_id,
                    marked = outcome.marked,
                    senders = outcome.by_sender.len(),
                    notified = outcome.notified,
                    "Messages marked read"
                );
            }
            Ok(_) => {}
            Err(e) => error!(user_id = %user_id, kind, error = %e, "Frame handling failed"),
        }
    }

    pub async fn dispatch(&self, user_id: &str, frame: ClientFrame) -> Result<Dispatched, RouteError> {
        match frame {
            ClientFrame::Chat {
                recipient_id,
                message,
            } => self.send_chat(user_id, &recipient_id, &message).await,

            ClientFrame::TypingStart { recipient_id } => {
                self.typing.start(user_id, &recipient_id);
                Ok(Dispatched::TypingStarted)
            }

            ClientFrame::TypingStop { recipient_id } => Ok(Dispatched::TypingStopped {
                was_typing: self.typing.stop(user_id, &recipient_id),
            }),

            ClientFrame::MarkRead { message_ids } => {
                let outcome = self
                    .receipts
                    .mark_read(user_id, &message_ids)
                    .await
                    .map_err(RouteError::Persistence)?;
                Ok(Dispatched::Read(outcome))
            }
        }
    }

    async fn send_chat(&self, sender: &str, recipient: &str, content: &str) -> Result<Dispatched, RouteError> {
        let stored = self.persist_chat(sender, recipient, content).await;

        // Sending ends the typing indicator toward this recipient. Done before
        // the delivery push so the stop frame is queued ahead of the message.
        self.typing.stop(sender, recipient);

        let message = match stored {
            Ok(message) => message,
            Err(e) => {
                self.registry.send_to_user(
                    sender,
                    ServerEvent::MessageFailed {
                        recipient_id: recipient.to_string(),
                        reason: "message could not be stored".to_string(),
                    }
                    .into(),
                );
                return Err(RouteError::Persistence(e));
            }
        };

        let delivered = self.registry.send_to_user(
            recipient,
            ChatDelivery {
                from: sender.to_string(),
                message: message.content.clone(),
                message_id: message.id.clone(),
                timestamp: message.created_at,
            }
            .into(),
        );

        self.registry.send_to_user(
            sender,
            ServerEvent::MessageSent {
                message_id: message.id.clone(),
                recipient_id: recipient.to_string(),
                timestamp: message.created_at,
            }
            .into(),
        );

        debug!(
            sender = %sender,
            recipient = %recipient,
            message_id = %message.id,
            delivered,
            "Chat message stored"
        );

        Ok(Dispatched::Chat { message, delivered })
    }

    async fn persist_chat(&self, sender: &str, recipient: &str, content: &str) -> anyhow::Result<Message> {
        let conversation = self.store.find_or_create_conversation(sender, recipient).await?;
        let message = self
            .store
            .create_message(&conversation.id, sender, recipient, content)
            .await?;

        // The message row is the durable record; the conversation's
        // last-message pointer is advisory, so a failure here is not a failed send.
        if let Err(e) = self
            .store
            .update_conversation_activity(&conversation.id, &message.id)
            .await
        {
            warn!(
                conversation_id = %conversation.id,
                message_id = %message.id,
                error = %e,
                "Failed to update conversation activity"
            );
        }

        Ok(message)
    }
}
