//! Message entities exchanged with the chat server.
//!
//! Identifiers are assigned by the server. The client never fabricates
//! them, so every identifier type here is a thin wrapper over the string
//! the server sent.

use serde::{Deserialize, Serialize};

/// Identifies a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Wraps a server-assigned conversation identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique, server-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps a server-assigned message identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a user (admin, shop owner, customer or AI agent).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wraps a server-assigned user identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Where the file can be downloaded.
    pub url: String,
    /// MIME type reported by the uploader.
    pub mime_type: String,
    /// Original file name.
    #[serde(default)]
    pub name: Option<String>,
}

/// Delivery flags of a message.
///
/// Flags only ever move from `false` to `true`; [`merge`](Self::merge) is a
/// logical OR so applying the same update twice is harmless.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MessageFlags {
    /// The server delivered the message to the recipient.
    pub is_delivered: bool,
    /// The recipient has seen the message.
    pub is_read: bool,
}

impl MessageFlags {
    /// Flags for a message that has been read (and therefore delivered).
    pub const READ: Self = Self {
        is_delivered: true,
        is_read: true,
    };

    /// Combines two flag sets by logical OR.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self {
            is_delivered: self.is_delivered || other.is_delivered,
            is_read: self.is_read || other.is_read,
        }
    }
}

/// A chat message as sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned unique identifier.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Author display name.
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Author avatar URL.
    #[serde(default)]
    pub sender_avatar: Option<String>,
    /// Text body; attachment-only messages have none.
    #[serde(default)]
    pub text: Option<String>,
    /// Attached files.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Creation time assigned by the server.
    pub created_at: Timestamp,
    /// Delivered to the recipient.
    #[serde(default)]
    pub is_delivered: bool,
    /// Seen by the recipient.
    #[serde(default)]
    pub is_read: bool,
}

impl Message {
    /// Returns the current delivery flags.
    #[must_use]
    pub const fn flags(&self) -> MessageFlags {
        MessageFlags {
            is_delivered: self.is_delivered,
            is_read: self.is_read,
        }
    }

    /// Promotes the delivery flags, never demoting them.
    ///
    /// A read message is always considered delivered. Returns `true` if any
    /// flag changed.
    pub fn promote(&mut self, flags: MessageFlags) -> bool {
        let mut merged = self.flags().merge(flags);
        merged.is_delivered |= merged.is_read;
        let changed = merged != self.flags();
        self.is_delivered = merged.is_delivered;
        self.is_read = merged.is_read;
        changed
    }

    /// Short single-line preview used in conversation lists.
    #[must_use]
    pub fn preview(&self) -> String {
        match (&self.text, self.attachments.first()) {
            (Some(text), _) if !text.trim().is_empty() => {
                text.lines().next().unwrap_or_default().to_string()
            }
            (_, Some(att)) => att
                .name
                .clone()
                .unwrap_or_else(|| format!("[{}]", att.mime_type)),
            _ => String::new(),
        }
    }
}
