use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Send a direct message
    Chat { recipient_id: String, message: String },

    /// Start (or keep) typing toward a recipient
    TypingStart { recipient_id: String },

    /// Explicitly stop typing toward a recipient
    TypingStop { recipient_id: String },

    /// Mark received messages as read
    MarkRead { message_ids: Vec<String> },
}

/// Why an inbound text frame could not be turned into a [`ClientFrame`].
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown frame type `{0}`")]
    UnknownType(String),

    #[error("frame has no type and is not a legacy chat frame")]
    Untyped,

    #[error("`{kind}` frame is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("`{kind}` frame has a malformed `{field}`")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("chat message is empty")]
    EmptyMessage,

    #[error("mark_read frame has no message ids")]
    EmptyMessageIds,
}

/// Loose view of an inbound frame. Payload fields stay untyped until the
/// frame type says which of them it reads; fields a type ignores may hold
/// anything.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    recipient_id: Option<Value>,
    message: Option<Value>,
    message_ids: Option<Value>,
}

impl ClientFrame {
    /// Parse and validate a JSON text frame.
    ///
    /// Frames without a `type` that carry both `recipientId` and `message`
    /// are the pre-typed client format and are always accepted as `chat`.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(text)?;

        match raw.kind.as_deref() {
            Some("chat") => Self::chat(raw),
            Some("typing_start") => Ok(Self::TypingStart {
                recipient_id: required(raw.recipient_id, "typing_start", "recipientId")?,
            }),
            Some("typing_stop") => Ok(Self::TypingStop {
                recipient_id: required(raw.recipient_id, "typing_stop", "recipientId")?,
            }),
            Some("mark_read") => {
                let message_ids: Vec<String> = field(raw.message_ids, "mark_read", "messageIds")?;
                if message_ids.is_empty() {
                    return Err(FrameError::EmptyMessageIds);
                }
                Ok(Self::MarkRead { message_ids })
            }
            Some(other) => Err(FrameError::UnknownType(other.to_string())),
            None if raw.recipient_id.is_some() && raw.message.is_some() => Self::chat(raw),
            None => Err(FrameError::Untyped),
        }
    }

    fn chat(raw: RawFrame) -> Result<Self, FrameError> {
        let recipient_id = required(raw.recipient_id, "chat", "recipientId")?;
        let message: String = field(raw.message, "chat", "message")?;
        if message.trim().is_empty() {
            return Err(FrameError::EmptyMessage);
        }
        Ok(Self::Chat {
            recipient_id,
            message,
        })
    }

    /// Wire name of the frame type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::MarkRead { .. } => "mark_read",
        }
    }
}

/// A field the frame type reads, converted to its expected shape.
fn field<T: DeserializeOwned>(
    value: Option<Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<T, FrameError> {
    let value = value.ok_or(FrameError::MissingField { kind, field })?;
    serde_json::from_value(value).map_err(|_| FrameError::InvalidField { kind, field })
}

/// A non-empty string field.
fn required(
    value: Option<Value>,
    kind: &'static str,
    name: &'static str,
) -> Result<String, FrameError> {
    let value: String = field(value, kind, name)?;
    if value.is_empty() {
        return Err(FrameError::MissingField { kind, field: name });
    }
    Ok(value)
}

/// Frames sent FROM server TO client.
///
/// Chat deliveries carry no `type` tag (clients key off `from` + `message`);
/// every other frame is a tagged [`ServerEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Chat(ChatDelivery),
    Event(ServerEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDelivery {
    pub from: String,
    pub message: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A user started or stopped typing toward the receiving client
    #[serde(rename_all = "camelCase")]
    UserTyping { from: String, is_typing: bool },

    /// Messages the receiving client sent were read
    #[serde(rename_all = "camelCase")]
    MessagesRead {
        message_ids: Vec<String>,
        read_by: String,
        read_at: DateTime<Utc>,
    },

    /// A chat message from the receiving client was stored
    #[serde(rename_all = "camelCase")]
    MessageSent {
        message_id: String,
        recipient_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A chat message from the receiving client could not be stored
    #[serde(rename_all = "camelCase")]
    MessageFailed { recipient_id: String, reason: String },
}

impl ServerFrame {
    pub fn typing(from: &str, is_typing: bool) -> Self {
        Self::Event(ServerEvent::UserTyping {
            from: from.to_string(),
            is_typing,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat(_) => "chat",
            Self::Event(ServerEvent::UserTyping { .. }) => "user_typing",
            Self::Event(ServerEvent::MessagesRead { .. }) => "messages_read",
            Self::Event(ServerEvent::MessageSent { .. }) => "message_sent",
            Self::Event(ServerEvent::MessageFailed { .. }) => "message_failed",
        }
    }
}

impl From<ChatDelivery> for ServerFrame {
    fn from(delivery: ChatDelivery) -> Self {
        Self::Chat(delivery)
    }
}

impl From<ServerEvent> for ServerFrame {
    fn from(event: ServerEvent) -> Self {
        Self::Event(event)
    }
}
