//! Scripted in-memory [`ChatApi`].
//!
//! Responses come from data seeded by the caller. History fetches can be
//! held until released (to order completions deterministically) and any
//! call can be made to fail once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use chatsync_proto::conversation::{ChannelKey, Conversation};
use chatsync_proto::message::{ConversationId, Message};

use super::{ApiError, ChatApi, ConversationQuery, MessageQuery};
use crate::transport::router::route_channel;

#[derive(Debug, Default)]
struct ApiState {
    conversations: Vec<Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    holds: HashMap<ConversationId, Arc<Notify>>,
    message_failures: HashMap<ConversationId, VecDeque<String>>,
    list_failures: VecDeque<String>,
    read_failures: VecDeque<String>,
    message_queries: Vec<(ConversationId, MessageQuery)>,
    read_calls: Vec<ConversationId>,
}

/// Handle releasing one held history fetch.
#[derive(Debug, Clone)]
pub struct HistoryGate {
    notify: Arc<Notify>,
}

impl HistoryGate {
    /// Let the held fetch complete. Releasing before the fetch starts is
    /// remembered.
    pub fn release(&self) {
        self.notify.notify_one();
    }
}

/// In-memory chat API. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryApi {
    state: Arc<Mutex<ApiState>>,
}

impl InMemoryApi {
    /// Create an API with no data.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the conversation list.
    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.state.lock().conversations = conversations;
    }

    /// Add one conversation to the list.
    pub fn add_conversation(&self, conversation: Conversation) {
        self.state.lock().conversations.push(conversation);
    }

    /// Replace the stored history of `conversation`.
    pub fn set_messages(&self, conversation: &ConversationId, mut messages: Vec<Message>) {
        messages.sort_by_key(|m| m.created_at);
        self.state
            .lock()
            .messages
            .insert(conversation.clone(), messages);
    }

    /// Hold the next history fetch for `conversation` until the returned
    /// gate is released.
    pub fn hold_messages(&self, conversation: &ConversationId) -> HistoryGate {
        let notify = Arc::new(Notify::new());
        self.state
            .lock()
            .holds
            .insert(conversation.clone(), Arc::clone(&notify));
        HistoryGate { notify }
    }

    /// Fail the next history fetch for `conversation`.
    pub fn fail_messages(&self, conversation: &ConversationId, reason: impl Into<String>) {
        self.state
            .lock()
            .message_failures
            .entry(conversation.clone())
            .or_default()
            .push_back(reason.into());
    }

    /// Fail the next conversation listing.
    pub fn fail_conversations(&self, reason: impl Into<String>) {
        self.state.lock().list_failures.push_back(reason.into());
    }

    /// Fail the next mark-read request.
    pub fn fail_mark_read(&self, reason: impl Into<String>) {
        self.state.lock().read_failures.push_back(reason.into());
    }

    /// Every history query received, in order.
    #[must_use]
    pub fn message_queries(&self) -> Vec<(ConversationId, MessageQuery)> {
        self.state.lock().message_queries.clone()
    }

    /// Every mark-read request received, in order.
    #[must_use]
    pub fn read_calls(&self) -> Vec<ConversationId> {
        self.state.lock().read_calls.clone()
    }
}

impl ChatApi for InMemoryApi {
    async fn list_conversations(
        &self,
        query: &ConversationQuery,
    ) -> Result<Vec<Conversation>, ApiError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.list_failures.pop_front() {
            return Err(ApiError::Scripted(reason));
        }
        Ok(state
            .conversations
            .iter()
            .filter(|c| query.channel.is_none_or(|key: ChannelKey| route_channel(c) == key))
            .filter(|c| {
                query.search.as_deref().is_none_or(|needle| {
                    c.id.as_str().contains(needle)
                        || c.participants
                            .iter()
                            .any(|p| p.name.as_deref().is_some_and(|n| n.contains(needle)))
                })
            })
            .cloned()
            .collect())
    }

    async fn list_messages(
        &self,
        conversation: &ConversationId,
        query: &MessageQuery,
    ) -> Result<Vec<Message>, ApiError> {
        let hold = {
            let mut state = self.state.lock();
            state
                .message_queries
                .push((conversation.clone(), query.clone()));
            state.holds.remove(conversation)
        };
        if let Some(notify) = hold {
            notify.notified().await;
        }

        let mut state = self.state.lock();
        if let Some(reason) = state
            .message_failures
            .get_mut(conversation)
            .and_then(VecDeque::pop_front)
        {
            return Err(ApiError::Scripted(reason));
        }
        let Some(all) = state.messages.get(conversation) else {
            return if state.conversations.iter().any(|c| &c.id == conversation) {
                Ok(Vec::new())
            } else {
                Err(ApiError::NotFound(conversation.clone()))
            };
        };

        let end = match &query.before {
            Some(before) => all.iter().position(|m| &m.id == before).unwrap_or(0),
            None => all.len(),
        };
        let start = end.saturating_sub(query.limit);
        Ok(all[start..end].to_vec())
    }

    async fn mark_conversation_read(&self, conversation: &ConversationId) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.read_calls.push(conversation.clone());
        match state.read_failures.pop_front() {
            Some(reason) => Err(ApiError::Scripted(reason)),
            None => Ok(()),
        }
    }
}
