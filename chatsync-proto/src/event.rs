//! Typed socket protocol.
//!
//! Every frame on the wire is a JSON object of the form
//! `{ "event": "<logical name>", "data": { ... } }`. Client and server
//! events are separate enums so a transport can only send what the
//! client is allowed to send.

use serde::{Deserialize, Serialize};

use crate::message::{Attachment, ConversationId, Message, MessageId};
use crate::presence::PresenceMessage;
use crate::typing::TypingMessage;

/// Payload naming a single conversation room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    /// The conversation whose room is joined or left.
    pub conversation_id: ConversationId,
}

/// Outgoing chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Text body.
    pub message: String,
    /// Attached files, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// A message pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePush {
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// The full message entity.
    pub message: Message,
}

/// Server confirmation that messages were seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadAck {
    /// The acknowledged conversation.
    pub conversation_id: ConversationId,
    /// Messages now marked as read.
    #[serde(default)]
    pub message_ids: Vec<MessageId>,
}

/// Events sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Subscribe to a conversation room.
    #[serde(rename = "conversation.join")]
    Join(RoomRef),
    /// Unsubscribe from a conversation room.
    #[serde(rename = "conversation.leave")]
    Leave(RoomRef),
    /// Post a message.
    #[serde(rename = "message.send")]
    SendMessage(SendMessage),
    /// Local user started or stopped typing.
    #[serde(rename = "typing.changed")]
    Typing(TypingMessage),
}

impl ClientEvent {
    /// Builds a room-join event.
    #[must_use]
    pub const fn join(conversation_id: ConversationId) -> Self {
        Self::Join(RoomRef { conversation_id })
    }

    /// Builds a room-leave event.
    #[must_use]
    pub const fn leave(conversation_id: ConversationId) -> Self {
        Self::Leave(RoomRef { conversation_id })
    }

    /// Logical event name as it appears on the wire.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => "conversation.join",
            Self::Leave(_) => "conversation.leave",
            Self::SendMessage(_) => "message.send",
            Self::Typing(_) => "typing.changed",
        }
    }

    /// The conversation this event is scoped to.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::Join(r) | Self::Leave(r) => &r.conversation_id,
            Self::SendMessage(m) => &m.conversation_id,
            Self::Typing(t) => &t.conversation_id,
        }
    }
}

/// Events pushed from the server to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// A new or updated message.
    #[serde(rename = "message.receive")]
    MessageReceived(MessagePush),
    /// A remote user started or stopped typing.
    #[serde(rename = "typing.changed")]
    TypingChanged(TypingMessage),
    /// A user joined or left a conversation room.
    #[serde(rename = "presence.changed")]
    PresenceChanged(PresenceMessage),
    /// Messages were marked as read.
    #[serde(rename = "read.ack")]
    ReadAck(ReadAck),
}

impl ServerEvent {
    /// Logical event name as it appears on the wire.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MessageReceived(_) => "message.receive",
            Self::TypingChanged(_) => "typing.changed",
            Self::PresenceChanged(_) => "presence.changed",
            Self::ReadAck(_) => "read.ack",
        }
    }

    /// The conversation this event is scoped to.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::MessageReceived(m) => &m.conversation_id,
            Self::TypingChanged(t) => &t.conversation_id,
            Self::PresenceChanged(p) => &p.conversation_id,
            Self::ReadAck(a) => &a.conversation_id,
        }
    }
}
