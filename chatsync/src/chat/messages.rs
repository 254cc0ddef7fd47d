//! In-memory message log per conversation.
//!
//! Live pushes and paginated history pages arrive out of band and may
//! overlap. Both go through one [`MessageStore::merge`] so that, per
//! conversation:
//!
//! - a message id appears at most once,
//! - messages stay ordered by `created_at`, ties in arrival order,
//! - an already-present message only ever has its delivery flags
//!   promoted; its other fields are kept as first seen.

use std::collections::{HashMap, HashSet};

use chatsync_proto::message::{ConversationId, Message, MessageFlags, MessageId};

/// Where a batch of messages came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    /// A REST history page.
    History,
    /// A socket push.
    Live,
}

/// What a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Messages that were not present before.
    pub inserted: usize,
    /// Present messages whose flags were promoted.
    pub promoted: usize,
    /// Messages skipped because they were already present unchanged or
    /// belong to another conversation.
    pub ignored: usize,
}

impl MergeOutcome {
    /// Whether the log changed at all.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.inserted > 0 || self.promoted > 0
    }
}

#[derive(Debug, Default)]
struct MessageLog {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl MessageLog {
    fn merge_one(&mut self, mut incoming: Message, outcome: &mut MergeOutcome) {
        // A read message is delivered, however it first arrives.
        incoming.is_delivered |= incoming.is_read;
        if self.ids.contains(&incoming.id) {
            let flags = incoming.flags();
            let promoted = self
                .messages
                .iter_mut()
                .find(|m| m.id == incoming.id)
                .is_some_and(|existing| existing.promote(flags));
            if promoted {
                outcome.promoted += 1;
            } else {
                outcome.ignored += 1;
            }
            return;
        }

        let at = self
            .messages
            .partition_point(|m| m.created_at <= incoming.created_at);
        self.ids.insert(incoming.id.clone());
        self.messages.insert(at, incoming);
        outcome.inserted += 1;
    }
}

/// Per-conversation ordered, deduplicated message logs.
#[derive(Debug, Default)]
pub struct MessageStore {
    logs: HashMap<ConversationId, MessageLog>,
}

impl MessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `incoming` into the log of `conversation`.
    ///
    /// Messages whose `conversation_id` differs from `conversation` are
    /// skipped. The same rules apply to both sources; `source` is only
    /// recorded for diagnostics.
    pub fn merge(
        &mut self,
        conversation: &ConversationId,
        incoming: impl IntoIterator<Item = Message>,
        source: MergeSource,
    ) -> MergeOutcome {
        let log = self.logs.entry(conversation.clone()).or_default();
        let mut outcome = MergeOutcome::default();

        for message in incoming {
            if &message.conversation_id != conversation {
                tracing::warn!(
                    conversation = %conversation,
                    message_conversation = %message.conversation_id,
                    message_id = %message.id,
                    "skipping message filed under another conversation"
                );
                outcome.ignored += 1;
                continue;
            }
            log.merge_one(message, &mut outcome);
        }

        tracing::trace!(
            conversation = %conversation,
            ?source,
            inserted = outcome.inserted,
            promoted = outcome.promoted,
            ignored = outcome.ignored,
            "messages merged"
        );
        outcome
    }

    /// Merge a REST history page.
    pub fn merge_history(
        &mut self,
        conversation: &ConversationId,
        page: Vec<Message>,
    ) -> MergeOutcome {
        self.merge(conversation, page, MergeSource::History)
    }

    /// Merge a single live push.
    pub fn append_live(&mut self, message: Message) -> MergeOutcome {
        let conversation = message.conversation_id.clone();
        self.merge(&conversation, [message], MergeSource::Live)
    }

    /// Promote the flags of the listed messages.
    ///
    /// An empty `ids` slice applies to every message of the conversation.
    /// Returns how many messages changed.
    pub fn mark_flags(
        &mut self,
        conversation: &ConversationId,
        ids: &[MessageId],
        flags: MessageFlags,
    ) -> usize {
        let Some(log) = self.logs.get_mut(conversation) else {
            return 0;
        };
        log.messages
            .iter_mut()
            .filter(|m| ids.is_empty() || ids.contains(&m.id))
            .map(|m| m.promote(flags))
            .filter(|changed| *changed)
            .count()
    }

    /// Messages of `conversation` in display order.
    #[must_use]
    pub fn messages(&self, conversation: &ConversationId) -> &[Message] {
        self.logs
            .get(conversation)
            .map_or(&[], |log| log.messages.as_slice())
    }

    /// Look up one message.
    #[must_use]
    pub fn get(&self, conversation: &ConversationId, id: &MessageId) -> Option<&Message> {
        self.logs
            .get(conversation)
            .filter(|log| log.ids.contains(id))
            .and_then(|log| log.messages.iter().find(|m| &m.id == id))
    }

    /// Oldest loaded message, the cursor for the next older page.
    #[must_use]
    pub fn oldest(&self, conversation: &ConversationId) -> Option<&Message> {
        self.messages(conversation).first()
    }

    /// Number of messages held for `conversation`.
    #[must_use]
    pub fn len(&self, conversation: &ConversationId) -> usize {
        self.messages(conversation).len()
    }

    /// Whether `conversation` holds no messages.
    #[must_use]
    pub fn is_empty(&self, conversation: &ConversationId) -> bool {
        self.len(conversation) == 0
    }
}
