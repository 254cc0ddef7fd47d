//! The synchronization engine.
//!
//! [`SyncEngine`] owns every piece of client state: the connection
//! registry, the conversation and message stores, the presence and typing
//! trackers, and the read-receipt coordinator. It is driven from a single
//! task; each method runs to completion before the next input is looked
//! at, so no state is ever observed half-updated.
//!
//! Inputs come from two places:
//! - the UI, through the `pub` methods in this module, and
//! - background work (socket pumps, REST calls, timers), which reports
//!   back as [`Inbound`] items fed to [`SyncEngine::handle_inbound`].
//!
//! Outputs are [`EngineEvent`]s telling the UI what to re-render.

pub mod conversations;
pub mod dispatch;
pub mod messages;
pub mod presence;
pub mod receipts;
pub mod typing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use chatsync_proto::conversation::{ChannelKey, Conversation};
use chatsync_proto::event::{ClientEvent, SendMessage, ServerEvent};
use chatsync_proto::message::{Attachment, ConversationId, Message, UserId};
use chatsync_proto::typing::TypingMessage;

use crate::api::{ApiError, ChatApi, ConversationQuery, MessageQuery};
use crate::config::EngineConfig;
use crate::transport::Connector;
use crate::transport::registry::{ConnectionEvent, ConnectionRegistry, ConnectionState};
use crate::transport::router::route_channel;

use self::conversations::ConversationStore;
use self::messages::MessageStore;
use self::presence::PresenceTracker;
use self::receipts::{ReadGuard, ReceiptCoordinator, ReceiptState};
use self::typing::{ExpirySink, TypingExpired, TypingTracker};

/// Errors surfaced by engine operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The channel has no live connection. Nothing was queued.
    #[error("channel {0} is not connected")]
    TransportUnavailable(ChannelKey),

    /// A history request was rejected.
    #[error("could not load history of {conversation}: {reason}")]
    HistoryFetchFailed {
        /// The conversation whose history failed.
        conversation: ConversationId,
        /// Error reported by the API.
        reason: String,
    },

    /// Reconnection gave up.
    #[error("channel {channel} disconnected after {attempts} reconnect attempts")]
    ReconnectExhausted {
        /// The affected channel.
        channel: ChannelKey,
        /// How many attempts were made.
        attempts: u32,
    },

    /// The conversation is not in the conversation list.
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),

    /// The operation needs an open conversation.
    #[error("no conversation is open")]
    NoActiveConversation,

    /// A message needs text or at least one attachment.
    #[error("message is empty")]
    EmptyMessage,
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The conversation list, a preview or an unread counter changed.
    ConversationsChanged,
    /// The message log of a conversation changed.
    MessagesChanged {
        /// The affected conversation.
        conversation_id: ConversationId,
    },
    /// The set of typing users changed.
    TypingChanged {
        /// The affected conversation.
        conversation_id: ConversationId,
        /// Users currently typing, sorted by id.
        users: Vec<UserId>,
    },
    /// A participant went online or offline.
    PresenceChanged {
        /// The affected conversation.
        conversation_id: ConversationId,
        /// The participant.
        user_id: UserId,
        /// New state.
        online: bool,
    },
    /// A channel connected or lost its connection.
    ConnectionStatus {
        /// The affected channel.
        channel: ChannelKey,
        /// Whether it is connected now.
        connected: bool,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// The affected channel.
        channel: ChannelKey,
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Reconnection gave up; the channel stays down until retried.
    Disconnected {
        /// The affected channel.
        channel: ChannelKey,
        /// How many attempts were made.
        attempts: u32,
    },
    /// A user-visible notice, such as a send on a dead connection.
    Notification(String),
    /// A history page failed to load.
    HistoryFetchFailed {
        /// The affected conversation.
        conversation_id: ConversationId,
        /// Error reported by the API.
        reason: String,
    },
}

/// Which history page a fetch asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// The newest page, fetched when a conversation is opened.
    Latest,
    /// The page before the oldest loaded message.
    Older,
    /// The newest page again, after a reconnect.
    Refresh,
}

/// Completions and notifications from background work.
#[derive(Debug)]
pub enum Inbound<T> {
    /// An event pushed by the server on `channel`.
    Server {
        /// The channel it arrived on.
        channel: ChannelKey,
        /// The event.
        event: ServerEvent,
    },
    /// Connection lifecycle news from the registry.
    Connection(ConnectionEvent<T>),
    /// The conversation list request finished.
    ConversationsLoaded(Result<Vec<Conversation>, ApiError>),
    /// A history request finished.
    HistoryLoaded {
        /// The conversation it was for.
        conversation: ConversationId,
        /// Selection generation at request time.
        generation: u64,
        /// Which page was requested.
        kind: PageKind,
        /// The page, oldest first.
        result: Result<Vec<Message>, ApiError>,
    },
    /// A mark-read request finished.
    MarkReadFinished {
        /// The conversation it was for.
        conversation: ConversationId,
        /// Outcome of the request.
        result: Result<(), ApiError>,
    },
    /// A typing indicator reached its deadline.
    TypingExpired(TypingExpired),
}

/// History loading status of one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryStatus {
    /// Never requested.
    NotLoaded,
    /// The first page is in flight.
    Loading,
    /// The first page has been merged.
    Loaded,
    /// The last first-page request failed.
    Failed(String),
}

#[derive(Debug)]
struct HistoryState {
    status: HistoryStatus,
    has_more: bool,
    older_in_flight: bool,
}

impl Default for HistoryState {
    fn default() -> Self {
        Self {
            status: HistoryStatus::NotLoaded,
            has_more: true,
            older_in_flight: false,
        }
    }
}

/// The conversation currently open in the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConversation {
    /// Its id.
    pub id: ConversationId,
    /// The channel serving it.
    pub channel: ChannelKey,
    /// Bumped on every selection; results tagged with an older value are
    /// stale.
    pub generation: u64,
}

/// Single-owner chat synchronization state.
pub struct SyncEngine<C: Connector, A: ChatApi> {
    config: EngineConfig,
    api: Arc<A>,
    registry: ConnectionRegistry<C>,
    conversations: ConversationStore,
    messages: MessageStore,
    presence: PresenceTracker,
    typing: TypingTracker,
    receipts: ReceiptCoordinator,
    history: HashMap<ConversationId, HistoryState>,
    active: Option<ActiveConversation>,
    generation: u64,
    inbound: mpsc::UnboundedSender<Inbound<C::Transport>>,
    events: mpsc::Sender<EngineEvent>,
}

impl<C: Connector, A: ChatApi> SyncEngine<C, A> {
    /// Create an engine.
    ///
    /// Returns the engine, the receiver that must be drained into
    /// [`handle_inbound`](Self::handle_inbound), and the UI event receiver.
    /// Must be called within a Tokio runtime once channels are used.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        connector: C,
        api: A,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Inbound<C::Transport>>,
        mpsc::Receiver<EngineEvent>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);

        let expiry_tx = inbound_tx.clone();
        let sink: ExpirySink = Arc::new(move |expired| {
            if expiry_tx.send(Inbound::TypingExpired(expired)).is_err() {
                tracing::debug!("engine gone, typing expiry dropped");
            }
        });

        let engine = Self {
            registry: ConnectionRegistry::new(connector, config.reconnect.clone(), inbound_tx.clone()),
            typing: TypingTracker::with_timers(config.typing_ttl, sink),
            config,
            api: Arc::new(api),
            conversations: ConversationStore::new(),
            messages: MessageStore::new(),
            presence: PresenceTracker::new(),
            receipts: ReceiptCoordinator::new(),
            history: HashMap::new(),
            active: None,
            generation: 0,
            inbound: inbound_tx,
            events: event_tx,
        };
        (engine, inbound_rx, event_rx)
    }

    // -----------------------------------------------------------------------
    // UI operations
    // -----------------------------------------------------------------------

    /// Request the conversation list. The result arrives as
    /// [`Inbound::ConversationsLoaded`].
    pub fn load_conversations(&self) {
        let api = Arc::clone(&self.api);
        let inbound = self.inbound.clone();
        tokio::spawn(async move {
            let result = api.list_conversations(&ConversationQuery::default()).await;
            if inbound.send(Inbound::ConversationsLoaded(result)).is_err() {
                tracing::debug!("engine gone, conversation list dropped");
            }
        });
    }

    /// Open `id`, closing the previously open conversation first.
    ///
    /// Joins the conversation's room on its channel (connecting the
    /// channel on first use) and requests its newest history page. A
    /// channel that cannot be reached is reported as a notification; the
    /// room is joined once the channel reconnects. Selecting does not
    /// change the unread counter.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownConversation`] if `id` is not listed.
    pub async fn select_conversation(&mut self, id: &ConversationId) -> Result<(), EngineError> {
        let channel = self
            .conversations
            .get(id)
            .map(route_channel)
            .ok_or_else(|| EngineError::UnknownConversation(id.clone()))?;

        if self.active.as_ref().is_some_and(|a| &a.id == id) {
            return Ok(());
        }
        self.close_conversation().await;

        self.generation += 1;
        self.active = Some(ActiveConversation {
            id: id.clone(),
            channel,
            generation: self.generation,
        });
        tracing::info!(conversation = %id, channel = %channel, "conversation selected");

        let was_connected = self.registry.is_connected(channel);
        match self.registry.connect(channel).await {
            Ok(_) if !was_connected => self.emit(EngineEvent::ConnectionStatus {
                channel,
                connected: true,
            }),
            Ok(_) => {}
            Err(e) => self.notify(&e),
        }
        if let Err(e) = self.registry.join(channel, id).await {
            tracing::debug!(conversation = %id, error = %e, "join deferred until reconnect");
        }

        self.history.entry(id.clone()).or_default().status = HistoryStatus::Loading;
        self.fetch_history(id, PageKind::Latest, MessageQuery::latest(self.config.page_size));
        self.emit(EngineEvent::MessagesChanged {
            conversation_id: id.clone(),
        });
        Ok(())
    }

    /// Close the open conversation, if any.
    ///
    /// Leaves its room (the channel connection stays up), cancels its
    /// typing timers and forgets its presence. Results still in flight for
    /// it are discarded when they arrive. Returns the closed id.
    pub async fn close_conversation(&mut self) -> Option<ConversationId> {
        let active = self.active.take()?;
        self.registry.leave(active.channel, &active.id).await;

        let cancelled = self.typing.clear_conversation(&active.id);
        let offline = self.presence.online_users(&active.id);
        self.presence.clear_conversation(&active.id);
        if let Some(state) = self.history.get_mut(&active.id) {
            state.older_in_flight = false;
        }
        tracing::info!(
            conversation = %active.id,
            typing_cancelled = cancelled,
            presence_cleared = offline.len(),
            "conversation closed"
        );
        if cancelled > 0 {
            self.emit(EngineEvent::TypingChanged {
                conversation_id: active.id.clone(),
                users: Vec::new(),
            });
        }
        for user_id in offline {
            self.emit(EngineEvent::PresenceChanged {
                conversation_id: active.id.clone(),
                user_id,
                online: false,
            });
        }
        Some(active.id)
    }

    /// Request the page before the oldest loaded message.
    ///
    /// Returns `false` if nothing was requested: the first page is not in
    /// yet, a request is already running, or the start was reached.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoActiveConversation`] if nothing is open.
    pub fn load_older_messages(&mut self) -> Result<bool, EngineError> {
        let id = self.active_id()?.clone();
        let Some(cursor) = self.messages.oldest(&id).map(|m| m.id.clone()) else {
            return Ok(false);
        };
        let Some(state) = self.history.get_mut(&id) else {
            return Ok(false);
        };
        if state.status != HistoryStatus::Loaded || !state.has_more || state.older_in_flight {
            return Ok(false);
        }
        state.older_in_flight = true;
        self.fetch_history(
            &id,
            PageKind::Older,
            MessageQuery::before(cursor, self.config.page_size),
        );
        Ok(true)
    }

    /// Retry a failed first-page request of the open conversation.
    ///
    /// Returns `false` if the history had not failed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoActiveConversation`] if nothing is open.
    pub fn retry_history(&mut self) -> Result<bool, EngineError> {
        let id = self.active_id()?.clone();
        let state = self.history.entry(id.clone()).or_default();
        if !matches!(state.status, HistoryStatus::Failed(_)) {
            return Ok(false);
        }
        state.status = HistoryStatus::Loading;
        self.fetch_history(&id, PageKind::Latest, MessageQuery::latest(self.config.page_size));
        Ok(true)
    }

    /// Send a message to the open conversation.
    ///
    /// The message is not inserted locally; it appears when the server
    /// echoes it back with its assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoActiveConversation`],
    /// [`EngineError::EmptyMessage`], or
    /// [`EngineError::TransportUnavailable`] (also emitted as a
    /// notification) if the channel is down.
    pub async fn send_message(
        &mut self,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<(), EngineError> {
        let active = self.active.clone().ok_or(EngineError::NoActiveConversation)?;
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(EngineError::EmptyMessage);
        }
        let event = ClientEvent::SendMessage(SendMessage {
            conversation_id: active.id.clone(),
            message: text.to_string(),
            attachments,
        });
        self.registry
            .send(active.channel, &event)
            .await
            .inspect_err(|e| self.notify(e))?;
        tracing::debug!(conversation = %active.id, "message sent");
        Ok(())
    }

    /// Tell the other participants whether the local user is typing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoActiveConversation`] or
    /// [`EngineError::TransportUnavailable`].
    pub async fn set_local_typing(&mut self, is_typing: bool) -> Result<(), EngineError> {
        let active = self.active.clone().ok_or(EngineError::NoActiveConversation)?;
        let event = ClientEvent::Typing(TypingMessage {
            conversation_id: active.id,
            user_id: self.config.local_user.clone(),
            is_typing,
        });
        self.registry.send(active.channel, &event).await
    }

    /// Restart reconnection of a channel that gave up.
    ///
    /// Returns `false` if the channel is connected or already retrying.
    pub fn reconnect(&mut self, channel: ChannelKey) -> bool {
        let started = self.registry.reconnect(channel);
        if started {
            tracing::info!(channel = %channel, "manual reconnect");
        }
        started
    }

    // -----------------------------------------------------------------------
    // Read access for the UI
    // -----------------------------------------------------------------------

    /// The open conversation.
    #[must_use]
    pub const fn active(&self) -> Option<&ActiveConversation> {
        self.active.as_ref()
    }

    /// Conversations in activity order.
    #[must_use]
    pub fn conversations(&self) -> &[Conversation] {
        self.conversations.list()
    }

    /// One conversation.
    #[must_use]
    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    /// Unread counter of `id`.
    #[must_use]
    pub fn unread_count(&self, id: &ConversationId) -> u32 {
        self.conversations.unread_count(id)
    }

    /// Loaded messages of `id`, oldest first.
    #[must_use]
    pub fn messages(&self, id: &ConversationId) -> &[Message] {
        self.messages.messages(id)
    }

    /// Whether `user` is typing in `conversation` right now.
    #[must_use]
    pub fn is_typing(&self, conversation: &ConversationId, user: &UserId) -> bool {
        self.typing.is_typing(conversation, user, Instant::now())
    }

    /// Users typing in `conversation` right now.
    #[must_use]
    pub fn typing_users(&self, conversation: &ConversationId) -> Vec<UserId> {
        self.typing.typing_users(conversation, Instant::now())
    }

    /// Typing timers not yet fired or cancelled.
    #[must_use]
    pub fn pending_typing_timers(&self) -> usize {
        self.typing.pending_timers()
    }

    /// Whether `user` is online in `conversation`.
    #[must_use]
    pub fn is_online(&self, conversation: &ConversationId, user: &UserId) -> bool {
        self.presence.is_online(conversation, user)
    }

    /// Read-receipt state of `conversation`.
    #[must_use]
    pub fn receipt_state(&self, conversation: &ConversationId) -> ReceiptState {
        self.receipts.state(conversation)
    }

    /// History status of `conversation`.
    #[must_use]
    pub fn history_status(&self, conversation: &ConversationId) -> HistoryStatus {
        self.history
            .get(conversation)
            .map_or(HistoryStatus::NotLoaded, |s| s.status.clone())
    }

    /// Whether older pages may exist for `conversation`.
    #[must_use]
    pub fn has_more_history(&self, conversation: &ConversationId) -> bool {
        self.history.get(conversation).is_none_or(|s| s.has_more)
    }

    /// The recorded history failure of `conversation`, if any.
    #[must_use]
    pub fn history_error(&self, conversation: &ConversationId) -> Option<EngineError> {
        match &self.history.get(conversation)?.status {
            HistoryStatus::Failed(reason) => Some(EngineError::HistoryFetchFailed {
                conversation: conversation.clone(),
                reason: reason.clone(),
            }),
            _ => None,
        }
    }

    /// Connection state of `channel`.
    #[must_use]
    pub fn connection_state(&self, channel: ChannelKey) -> ConnectionState {
        self.registry.state(channel)
    }

    /// Why `channel` is down for good, if reconnection gave up.
    #[must_use]
    pub fn connection_error(&self, channel: ChannelKey) -> Option<EngineError> {
        (self.registry.state(channel) == ConnectionState::Disconnected).then(|| {
            EngineError::ReconnectExhausted {
                channel,
                attempts: self.config.reconnect.max_attempts,
            }
        })
    }

    /// Room reference count of `conversation` on `channel`.
    #[must_use]
    pub fn room_refs(&self, channel: ChannelKey, conversation: &ConversationId) -> usize {
        self.registry.room_refs(channel, conversation)
    }

    // -----------------------------------------------------------------------
    // Internals shared with `dispatch`
    // -----------------------------------------------------------------------

    fn active_id(&self) -> Result<&ConversationId, EngineError> {
        self.active
            .as_ref()
            .map(|a| &a.id)
            .ok_or(EngineError::NoActiveConversation)
    }

    fn is_active(&self, id: &ConversationId) -> bool {
        self.active.as_ref().is_some_and(|a| &a.id == id)
    }

    fn fetch_history(&self, id: &ConversationId, kind: PageKind, query: MessageQuery) {
        let Some(generation) = self.active.as_ref().map(|a| a.generation) else {
            return;
        };
        let api = Arc::clone(&self.api);
        let inbound = self.inbound.clone();
        let conversation = id.clone();
        tracing::debug!(conversation = %id, ?kind, before = ?query.before, "requesting history page");
        tokio::spawn(async move {
            let result = api.list_messages(&conversation, &query).await;
            let sent = inbound.send(Inbound::HistoryLoaded {
                conversation,
                generation,
                kind,
                result,
            });
            if sent.is_err() {
                tracing::debug!("engine gone, history page dropped");
            }
        });
    }

    /// Request a read receipt if the guard holds.
    fn evaluate_receipt(&mut self, id: &ConversationId) {
        let guard = ReadGuard {
            is_active: self.is_active(id),
            history_loaded: self
                .history
                .get(id)
                .is_some_and(|s| s.status == HistoryStatus::Loaded),
            has_messages: !self.messages.is_empty(id),
        };
        if !self.receipts.evaluate(id, guard) {
            return;
        }
        let api = Arc::clone(&self.api);
        let inbound = self.inbound.clone();
        let conversation = id.clone();
        tokio::spawn(async move {
            let result = api.mark_conversation_read(&conversation).await;
            let sent = inbound.send(Inbound::MarkReadFinished {
                conversation,
                result,
            });
            if sent.is_err() {
                tracing::debug!("engine gone, read receipt result dropped");
            }
        });
    }

    fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::debug!(error = %e, "engine event dropped");
        }
    }

    pub(crate) fn notify(&self, error: &EngineError) {
        self.emit(EngineEvent::Notification(error.to_string()));
    }
}
