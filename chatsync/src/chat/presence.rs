//! Online/offline state of participants, scoped to the open conversation.

use std::collections::{BTreeSet, HashMap};

use chatsync_proto::message::{ConversationId, UserId};

/// Tracks which participants are online, per conversation.
///
/// Entries only exist while the engine applies presence events for a
/// conversation; [`clear_conversation`](Self::clear_conversation) drops
/// everything known about it when the conversation is closed.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: HashMap<ConversationId, BTreeSet<UserId>>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a presence change. Returns `true` if the state changed.
    pub fn apply(&mut self, conversation: &ConversationId, user: &UserId, online: bool) -> bool {
        if online {
            self.mark_online(conversation, user)
        } else {
            self.mark_offline(conversation, user)
        }
    }

    /// Mark `user` online. Returns `true` if they were not already.
    pub fn mark_online(&mut self, conversation: &ConversationId, user: &UserId) -> bool {
        self.online
            .entry(conversation.clone())
            .or_default()
            .insert(user.clone())
    }

    /// Mark `user` offline. Returns `true` if they were online.
    pub fn mark_offline(&mut self, conversation: &ConversationId, user: &UserId) -> bool {
        let Some(users) = self.online.get_mut(conversation) else {
            return false;
        };
        let removed = users.remove(user);
        if users.is_empty() {
            self.online.remove(conversation);
        }
        removed
    }

    /// Whether `user` is online in `conversation`.
    #[must_use]
    pub fn is_online(&self, conversation: &ConversationId, user: &UserId) -> bool {
        self.online
            .get(conversation)
            .is_some_and(|users| users.contains(user))
    }

    /// Online users of `conversation`, sorted by id.
    #[must_use]
    pub fn online_users(&self, conversation: &ConversationId) -> Vec<UserId> {
        self.online
            .get(conversation)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget all presence for `conversation`. Returns how many users were
    /// online.
    pub fn clear_conversation(&mut self, conversation: &ConversationId) -> usize {
        self.online.remove(conversation).map_or(0, |users| users.len())
    }
}
