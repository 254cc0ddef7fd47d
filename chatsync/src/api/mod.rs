//! REST collaborator seam.
//!
//! The engine consumes three calls from the chat API and treats them as
//! opaque async functions. Concrete implementations:
//! - [`http::HttpChatApi`]: JSON over HTTP via `reqwest`
//! - [`memory::InMemoryApi`]: scripted responses for tests and demos

pub mod http;
pub mod memory;

use chatsync_proto::conversation::{ChannelKey, Conversation};
use chatsync_proto::message::{ConversationId, Message, MessageId};

/// Errors returned by the REST collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request could not be sent or the body could not be decoded.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The configured base URL cannot be joined with a path.
    #[error("invalid API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The conversation does not exist.
    #[error("conversation {0} not found")]
    NotFound(ConversationId),

    /// A scripted failure (in-memory API only).
    #[error("{0}")]
    Scripted(String),
}

/// Filter for the conversation list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationQuery {
    /// Only conversations of this channel.
    pub channel: Option<ChannelKey>,
    /// Free-text search.
    pub search: Option<String>,
}

/// One page of history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    /// Return messages older than this one; `None` for the newest page.
    pub before: Option<MessageId>,
    /// Maximum number of messages.
    pub limit: usize,
}

impl MessageQuery {
    /// The newest page.
    #[must_use]
    pub const fn latest(limit: usize) -> Self {
        Self {
            before: None,
            limit,
        }
    }

    /// The page preceding `before`.
    #[must_use]
    pub const fn before(before: MessageId, limit: usize) -> Self {
        Self {
            before: Some(before),
            limit,
        }
    }
}

/// REST calls the engine depends on.
pub trait ChatApi: Send + Sync + 'static {
    /// List conversations.
    fn list_conversations(
        &self,
        query: &ConversationQuery,
    ) -> impl std::future::Future<Output = Result<Vec<Conversation>, ApiError>> + Send;

    /// Fetch a page of messages, ordered oldest first.
    fn list_messages(
        &self,
        conversation: &ConversationId,
        query: &MessageQuery,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, ApiError>> + Send;

    /// Ask the server to mark a conversation as read.
    ///
    /// Success only means the request was accepted; the confirmation
    /// arrives as a `read.ack` socket event.
    fn mark_conversation_read(
        &self,
        conversation: &ConversationId,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send;
}
