use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Actions sent FROM client TO server over a chat WebSocket.
///
/// Frames that fail to deserialize are dropped by the session handler
/// without closing the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ChatAction {
    /// Append one encrypted message to the conversation and fan it out.
    Send { sender: String, ciphertext: String },
}

/// A message pushed to every live subscriber of a conversation, including
/// the sender's own connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePush {
    pub id: Uuid,
    pub ciphertext: String,
    pub sender: String,
    pub created_at: DateTime<Utc>,
}
