//! Conversation list with last-message previews and unread counters.
//!
//! The list is kept in activity order: a conversation moves to the front
//! when a newer message is recorded for it. Unread counters only go up
//! through [`ConversationStore::record_message`] and only go to zero
//! through [`ConversationStore::mark_read`], which the engine calls on a
//! server read acknowledgment.

use std::collections::{HashMap, HashSet};

use chatsync_proto::conversation::Conversation;
use chatsync_proto::message::{ConversationId, Message, MessageFlags, MessageId};

/// Result of recording a message against the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The conversation is not in the list.
    Unknown,
    /// The conversation entry was updated.
    Recorded {
        /// `last_message` was replaced or promoted.
        preview_changed: bool,
        /// `unread_count` was incremented.
        counted_unread: bool,
    },
}

/// Conversation list state.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    /// Message ids already counted into each unread counter.
    counted: HashMap<ConversationId, HashSet<MessageId>>,
}

impl ConversationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list with a fresh server snapshot.
    ///
    /// Entries are taken as given; a locally known preview survives only
    /// if it is newer than the snapshot's.
    pub fn replace_all(&mut self, snapshot: Vec<Conversation>) {
        let mut previous: HashMap<ConversationId, Conversation> = self
            .conversations
            .drain(..)
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut seen = HashSet::new();
        for mut incoming in snapshot {
            if !seen.insert(incoming.id.clone()) {
                tracing::debug!(conversation = %incoming.id, "duplicate conversation in snapshot");
                continue;
            }
            if let Some(local) = previous.remove(&incoming.id) {
                keep_newer_preview(&mut incoming, local.last_message);
            }
            self.conversations.push(incoming);
        }
        self.counted.retain(|id, _| seen.contains(id));
    }

    /// Record a message pushed for one of the listed conversations.
    ///
    /// The preview is replaced if the message is at least as new as the
    /// current one; a repeat of the current preview only promotes flags.
    /// With `count_unread` the counter goes up once per distinct message.
    pub fn record_message(&mut self, message: &Message, count_unread: bool) -> RecordOutcome {
        let Some(index) = self.position(&message.conversation_id) else {
            return RecordOutcome::Unknown;
        };

        let counted_unread = count_unread
            && self
                .counted
                .entry(message.conversation_id.clone())
                .or_default()
                .insert(message.id.clone());

        let conversation = &mut self.conversations[index];
        if counted_unread {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }

        let preview_changed = match &mut conversation.last_message {
            Some(last) if last.id == message.id => last.promote(message.flags()),
            Some(last) if last.created_at > message.created_at => false,
            slot => {
                *slot = Some(message.clone());
                true
            }
        };

        if preview_changed && index > 0 {
            let moved = self.conversations.remove(index);
            self.conversations.insert(0, moved);
        }

        RecordOutcome::Recorded {
            preview_changed,
            counted_unread,
        }
    }

    /// Zero the unread counter and mark the preview read.
    ///
    /// Ids already counted stay remembered, so a replayed message does not
    /// raise the counter again.
    ///
    /// `ids` lists the acknowledged messages; empty means all of them.
    /// Returns `false` if the conversation is not listed.
    pub fn mark_read(&mut self, conversation: &ConversationId, ids: &[MessageId]) -> bool {
        let Some(entry) = self.get_mut(conversation) else {
            return false;
        };
        entry.unread_count = 0;
        if let Some(last) = entry.last_message.as_mut()
            && (ids.is_empty() || ids.contains(&last.id))
        {
            last.promote(MessageFlags::READ);
        }
        true
    }

    /// Conversations in activity order.
    #[must_use]
    pub fn list(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Look up one conversation.
    #[must_use]
    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    /// Whether `id` is listed.
    #[must_use]
    pub fn contains(&self, id: &ConversationId) -> bool {
        self.position(id).is_some()
    }

    /// Unread counter of `id`, zero if unlisted.
    #[must_use]
    pub fn unread_count(&self, id: &ConversationId) -> u32 {
        self.get(id).map_or(0, |c| c.unread_count)
    }

    fn position(&self, id: &ConversationId) -> Option<usize> {
        self.conversations.iter().position(|c| &c.id == id)
    }

    fn get_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| &c.id == id)
    }
}

fn keep_newer_preview(incoming: &mut Conversation, local: Option<Message>) {
    let Some(local) = local else {
        return;
    };
    let local_is_newer = incoming
        .last_message
        .as_ref()
        .is_none_or(|remote| local.created_at > remote.created_at);
    if local_is_newer {
        incoming.last_message = Some(local);
    }
}
