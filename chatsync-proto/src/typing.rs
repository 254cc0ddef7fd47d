//! Typing indicator payloads.

use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, UserId};

/// A typing indicator, sent in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingMessage {
    /// The conversation where typing is occurring.
    pub conversation_id: ConversationId,
    /// The user who is typing (or stopped typing).
    pub user_id: UserId,
    /// Whether the user is currently typing (`true`) or stopped (`false`).
    pub is_typing: bool,
}
