//! Read-receipt state per conversation.
//!
//! ```text
//!            guard holds              server read.ack
//! Unviewed ─────────────▶ PendingAck ────────────────▶ Acked
//!    ▲                       │                           │
//!    └──── request failed ───┘                           │
//!    └────────────── new message while open ─────────────┘
//! ```
//!
//! The guard is: the conversation is open, its first history page has
//! loaded, and it has at least one message. Only the transition into
//! `PendingAck` asks the caller to send a mark-read request, so at most one
//! request per conversation is in flight.

use std::collections::HashMap;

use chatsync_proto::message::ConversationId;

/// Read-receipt state of one conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReceiptState {
    /// Content has not been confirmed as read.
    #[default]
    Unviewed,
    /// A mark-read request was sent; waiting for the server.
    PendingAck,
    /// The server confirmed the conversation as read.
    Acked,
}

/// Conditions checked before requesting a read receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadGuard {
    /// The conversation is the open one.
    pub is_active: bool,
    /// Its first history page has loaded.
    pub history_loaded: bool,
    /// It has at least one message.
    pub has_messages: bool,
}

impl ReadGuard {
    /// Whether all conditions hold.
    #[must_use]
    pub const fn holds(&self) -> bool {
        self.is_active && self.history_loaded && self.has_messages
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ReceiptEntry {
    state: ReceiptState,
    /// A message arrived while the request was in flight; the ack will not
    /// cover it.
    stale: bool,
}

/// Drives [`ReceiptState`] transitions for every conversation.
#[derive(Debug, Default)]
pub struct ReceiptCoordinator {
    entries: HashMap<ConversationId, ReceiptEntry>,
}

impl ReceiptCoordinator {
    /// Create a coordinator with every conversation `Unviewed`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of `conversation`.
    #[must_use]
    pub fn state(&self, conversation: &ConversationId) -> ReceiptState {
        self.entries
            .get(conversation)
            .map_or(ReceiptState::Unviewed, |e| e.state)
    }

    /// Move to `PendingAck` if `Unviewed` and the guard holds.
    ///
    /// Returns `true` if the caller must send a mark-read request now.
    pub fn evaluate(&mut self, conversation: &ConversationId, guard: ReadGuard) -> bool {
        if !guard.holds() {
            return false;
        }
        let entry = self.entries.entry(conversation.clone()).or_default();
        if entry.state != ReceiptState::Unviewed {
            return false;
        }
        entry.state = ReceiptState::PendingAck;
        entry.stale = false;
        tracing::debug!(conversation = %conversation, "read receipt requested");
        true
    }

    /// A new message arrived for the open conversation.
    pub fn on_new_message(&mut self, conversation: &ConversationId) {
        let Some(entry) = self.entries.get_mut(conversation) else {
            return;
        };
        match entry.state {
            ReceiptState::Acked => entry.state = ReceiptState::Unviewed,
            ReceiptState::PendingAck => entry.stale = true,
            ReceiptState::Unviewed => {}
        }
    }

    /// The server acknowledged `conversation` as read.
    ///
    /// Returns the resulting state: `Acked`, or `Unviewed` if messages
    /// arrived while the request was in flight.
    pub fn on_ack(&mut self, conversation: &ConversationId) -> ReceiptState {
        let entry = self.entries.entry(conversation.clone()).or_default();
        entry.state = if entry.stale {
            ReceiptState::Unviewed
        } else {
            ReceiptState::Acked
        };
        entry.stale = false;
        entry.state
    }

    /// The mark-read request failed; fall back to `Unviewed`.
    ///
    /// Returns `true` if the conversation was pending.
    pub fn on_request_failed(&mut self, conversation: &ConversationId) -> bool {
        match self.entries.get_mut(conversation) {
            Some(entry) if entry.state == ReceiptState::PendingAck => {
                entry.state = ReceiptState::Unviewed;
                entry.stale = false;
                true
            }
            _ => false,
        }
    }
}
