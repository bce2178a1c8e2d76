use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ConversationId, MessageId, UserId};

/// Frame sent FROM client TO server over a conversation socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub message: String,
}

impl ClientFrame {
    /// Parse a text frame. `None` for malformed JSON or blank content;
    /// such frames are dropped without closing the connection.
    pub fn parse(text: &str) -> Option<Self> {
        let frame: Self = serde_json::from_str(text).ok()?;
        if frame.message.trim().is_empty() {
            return None;
        }
        Some(frame)
    }
}

/// A persisted message fanned out to every connection in the conversation,
/// the sender's own included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_username: String,
    /// Display name, falling back to the username.
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}
