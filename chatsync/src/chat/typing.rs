//! Typing indicators with a time-to-live.
//!
//! A remote "typing" signal is valid for `ttl` unless refreshed. Each
//! entry owns one expiry timer; refreshing replaces (and so cancels) the
//! previous timer, and clearing a conversation cancels all of its timers.
//!
//! Expiry is decided by [`is_typing`](TypingTracker::is_typing) against
//! an explicit `now`, so an entry whose deadline has passed reads as "not
//! typing" even before its timer has been handled. The timer only exists
//! to notify the engine so it can tell the UI.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use chatsync_proto::message::{ConversationId, UserId};

/// Notification that a typing entry reached its deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingExpired {
    /// Conversation of the entry.
    pub conversation_id: ConversationId,
    /// The user who stopped typing.
    pub user_id: UserId,
    /// Deadline the timer was armed for.
    pub deadline: Instant,
}

/// Receives expiry notifications from timer tasks.
pub type ExpirySink = Arc<dyn Fn(TypingExpired) + Send + Sync>;

#[derive(Debug)]
struct TypingEntry {
    deadline: Instant,
    timer: Option<JoinHandle<()>>,
}

impl Drop for TypingEntry {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Per-conversation, per-user typing state.
pub struct TypingTracker {
    ttl: Duration,
    entries: HashMap<ConversationId, HashMap<UserId, TypingEntry>>,
    sink: Option<ExpirySink>,
}

impl std::fmt::Debug for TypingTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypingTracker")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries)
            .field("timers", &self.sink.is_some())
            .finish()
    }
}

impl TypingTracker {
    /// Tracker without timers; expiry is only observed through `now`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            sink: None,
        }
    }

    /// Tracker that arms a timer per entry and reports expiries to `sink`.
    ///
    /// Requires a Tokio runtime when entries are set.
    #[must_use]
    pub fn with_timers(ttl: Duration, sink: ExpirySink) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            sink: Some(sink),
        }
    }

    /// Configured time-to-live.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record that `user` is typing as of `now`.
    ///
    /// Returns `true` if the user was not already typing.
    pub fn set_typing(&mut self, conversation: &ConversationId, user: &UserId, now: Instant) -> bool {
        let deadline = now + self.ttl;
        let timer = self.sink.as_ref().map(|sink| {
            let sink = Arc::clone(sink);
            let expired = TypingExpired {
                conversation_id: conversation.clone(),
                user_id: user.clone(),
                deadline,
            };
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                sink(expired);
            })
        });

        let users = self.entries.entry(conversation.clone()).or_default();
        let previous = users.insert(user.clone(), TypingEntry { deadline, timer });
        previous.is_none_or(|old| old.deadline <= now)
    }

    /// Record that `user` stopped typing. Returns `true` if they were
    /// typing as of `now`.
    pub fn clear_typing(&mut self, conversation: &ConversationId, user: &UserId, now: Instant) -> bool {
        let Some(users) = self.entries.get_mut(conversation) else {
            return false;
        };
        let removed = users.remove(user);
        if users.is_empty() {
            self.entries.remove(conversation);
        }
        removed.is_some_and(|entry| entry.deadline > now)
    }

    /// Whether `user` is typing at `now`.
    #[must_use]
    pub fn is_typing(&self, conversation: &ConversationId, user: &UserId, now: Instant) -> bool {
        self.entries
            .get(conversation)
            .and_then(|users| users.get(user))
            .is_some_and(|entry| entry.deadline > now)
    }

    /// Users typing in `conversation` at `now`, sorted by id.
    #[must_use]
    pub fn typing_users(&self, conversation: &ConversationId, now: Instant) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .entries
            .get(conversation)
            .map(|users| {
                users
                    .iter()
                    .filter(|(_, entry)| entry.deadline > now)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Handle a fired timer.
    ///
    /// Removes the entry only if it still carries the expired deadline, so
    /// a notification racing a refresh is ignored. Returns `true` if an
    /// entry was removed.
    pub fn handle_expired(&mut self, expired: &TypingExpired) -> bool {
        let Some(users) = self.entries.get_mut(&expired.conversation_id) else {
            return false;
        };
        let current = users
            .get(&expired.user_id)
            .is_some_and(|entry| entry.deadline == expired.deadline);
        if !current {
            return false;
        }
        if let Some(mut entry) = users.remove(&expired.user_id) {
            // The timer already completed; nothing to abort.
            entry.timer = None;
        }
        if users.is_empty() {
            self.entries.remove(&expired.conversation_id);
        }
        true
    }

    /// Drop all entries of `conversation`, cancelling their timers.
    ///
    /// Returns how many entries were dropped.
    pub fn clear_conversation(&mut self, conversation: &ConversationId) -> usize {
        self.entries.remove(conversation).map_or(0, |users| users.len())
    }

    /// Number of armed timers that have not completed yet.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.entries
            .values()
            .flat_map(HashMap::values)
            .filter(|entry| entry.timer.as_ref().is_some_and(|t| !t.is_finished()))
            .count()
    }
}
