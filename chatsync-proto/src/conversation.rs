//! Conversation entities and channel routing tags.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, Message, UserId};

/// Logical routing tag selecting which transport a conversation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKey {
    /// Conversations between console admins and users.
    Admin,
    /// Conversations between shops and their customers.
    Shop,
    /// Conversations with the AI assistant.
    Ai,
}

impl ChannelKey {
    /// Every channel, in a stable order.
    pub const ALL: [Self; 3] = [Self::Admin, Self::Shop, Self::Ai];

    /// The tag as it appears on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Shop => "shop",
            Self::Ai => "ai",
        }
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not a known channel tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown channel tag: {0}")]
pub struct UnknownChannel(pub String);

impl std::str::FromStr for ChannelKey {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "shop" => Ok(Self::Shop),
            "ai" => Ok(Self::Ai),
            _ => Err(UnknownChannel(s.to_string())),
        }
    }
}

/// A member of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// The participant's user identifier.
    pub user_id: UserId,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Avatar URL.
    #[serde(default)]
    pub avatar: Option<String>,
}

/// A conversation as listed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Server-assigned identifier.
    pub id: ConversationId,
    /// Raw channel tag (`admin`, `shop`, `ai`). Unknown or missing tags
    /// route to the admin channel.
    #[serde(default)]
    pub channel: Option<String>,
    /// Members, in server order, without duplicates.
    #[serde(default)]
    pub participants: Vec<Participant>,
    /// Denormalized preview of the newest message.
    #[serde(default)]
    pub last_message: Option<Message>,
    /// Messages not yet acknowledged as read.
    #[serde(default)]
    pub unread_count: u32,
    /// Free-form metadata such as a context tag.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Conversation {
    /// Creates an empty conversation on the given channel.
    pub fn new(id: ConversationId, channel: Option<ChannelKey>) -> Self {
        Self {
            id,
            channel: channel.map(|c| c.as_str().to_string()),
            participants: Vec::new(),
            last_message: None,
            unread_count: 0,
            metadata: BTreeMap::new(),
        }
    }

    /// Adds a participant unless one with the same user id is present.
    ///
    /// Returns `true` if the participant was added.
    pub fn add_participant(&mut self, participant: Participant) -> bool {
        if self
            .participants
            .iter()
            .any(|p| p.user_id == participant.user_id)
        {
            return false;
        }
        self.participants.push(participant);
        true
    }

    /// Looks up a participant by user id.
    #[must_use]
    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user_id)
    }
}
