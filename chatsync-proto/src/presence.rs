//! Presence payloads pushed when users join or leave a conversation room.

use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, UserId};

/// A presence change for one user in one conversation room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    /// The conversation whose room the user joined or left.
    pub conversation_id: ConversationId,
    /// The user whose presence changed.
    pub user_id: UserId,
    /// `true` when the user joined, `false` when they left.
    pub online: bool,
}
