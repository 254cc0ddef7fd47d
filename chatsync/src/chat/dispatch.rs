//! Inbound event dispatch for [`SyncEngine`].
//!
//! Every server push is checked against the open conversation before any
//! store is touched:
//!
//! | event              | open conversation        | any other conversation        |
//! |--------------------|--------------------------|-------------------------------|
//! | `message.receive`  | message log + list entry | list entry only (+1 unread)   |
//! | `typing.changed`   | typing tracker           | dropped                       |
//! | `presence.changed` | presence tracker         | dropped                       |
//! | `read.ack`         | applied                  | applied                       |
//!
//! History pages are accepted only while the conversation they were
//! requested for is still open under the same selection generation.

use tokio::time::Instant;

use chatsync_proto::conversation::{ChannelKey, Conversation};
use chatsync_proto::event::{MessagePush, ReadAck, ServerEvent};
use chatsync_proto::message::{ConversationId, Message, MessageFlags};
use chatsync_proto::presence::PresenceMessage;
use chatsync_proto::typing::TypingMessage;

use crate::api::{ApiError, ChatApi, MessageQuery};
use crate::transport::Connector;
use crate::transport::registry::ConnectionEvent;

use super::conversations::RecordOutcome;
use super::receipts::ReceiptState;
use super::typing::TypingExpired;
use super::{EngineEvent, HistoryStatus, Inbound, PageKind, SyncEngine};

/// What happened to one inbound item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// State was updated.
    Applied,
    /// Only the conversation list was updated; the conversation is not
    /// open.
    ListOnly,
    /// The item belonged to a conversation that is no longer open.
    StaleDropped,
    /// Nothing to do: a duplicate, an unknown conversation, or a
    /// superseded notification.
    Ignored,
}

impl<C: Connector, A: ChatApi> SyncEngine<C, A> {
    /// Apply one item produced by background work.
    pub async fn handle_inbound(&mut self, item: Inbound<C::Transport>) -> DispatchOutcome {
        match item {
            Inbound::Server { channel, event } => self.handle_server_event(channel, event),
            Inbound::Connection(event) => self.handle_connection_event(event).await,
            Inbound::ConversationsLoaded(result) => self.handle_conversations_loaded(result),
            Inbound::HistoryLoaded {
                conversation,
                generation,
                kind,
                result,
            } => self.handle_history_loaded(&conversation, generation, kind, result),
            Inbound::MarkReadFinished {
                conversation,
                result,
            } => self.handle_mark_read_finished(&conversation, result),
            Inbound::TypingExpired(expired) => self.handle_typing_expired(&expired),
        }
    }

    /// Apply one server push.
    pub fn handle_server_event(&mut self, channel: ChannelKey, event: ServerEvent) -> DispatchOutcome {
        tracing::trace!(channel = %channel, event = event.name(), conversation = %event.conversation_id(), "server event");
        match event {
            ServerEvent::MessageReceived(push) => self.on_message(push),
            ServerEvent::TypingChanged(typing) => self.on_typing(typing),
            ServerEvent::PresenceChanged(presence) => self.on_presence(presence),
            ServerEvent::ReadAck(ack) => self.on_read_ack(ack),
        }
    }

    fn on_message(&mut self, push: MessagePush) -> DispatchOutcome {
        let MessagePush {
            conversation_id,
            message,
        } = push;
        if message.conversation_id != conversation_id {
            tracing::warn!(
                conversation = %conversation_id,
                message_conversation = %message.conversation_id,
                "message push with mismatched conversation"
            );
            return DispatchOutcome::Ignored;
        }
        if !self.conversations.contains(&conversation_id) {
            tracing::debug!(conversation = %conversation_id, "message for unlisted conversation, refreshing list");
            self.load_conversations();
            return DispatchOutcome::Ignored;
        }

        let own = message.sender_id == self.config.local_user;
        if !self.is_active(&conversation_id) {
            return match self.conversations.record_message(&message, !own) {
                RecordOutcome::Recorded {
                    preview_changed,
                    counted_unread,
                } if preview_changed || counted_unread => {
                    self.emit(EngineEvent::ConversationsChanged);
                    DispatchOutcome::ListOnly
                }
                _ => DispatchOutcome::Ignored,
            };
        }

        self.on_active_message(&conversation_id, message, own)
    }

    fn on_active_message(
        &mut self,
        conversation: &ConversationId,
        message: Message,
        own: bool,
    ) -> DispatchOutcome {
        let sender = message.sender_id.clone();
        if matches!(
            self.conversations.record_message(&message, false),
            RecordOutcome::Recorded {
                preview_changed: true,
                ..
            }
        ) {
            self.emit(EngineEvent::ConversationsChanged);
        }

        let outcome = self.messages.append_live(message);
        if !outcome.changed() {
            return DispatchOutcome::Ignored;
        }
        self.emit(EngineEvent::MessagesChanged {
            conversation_id: conversation.clone(),
        });

        if self
            .typing
            .clear_typing(conversation, &sender, Instant::now())
        {
            self.emit_typing(conversation);
        }
        if outcome.inserted > 0 && !own {
            self.receipts.on_new_message(conversation);
        }
        self.evaluate_receipt(conversation);
        DispatchOutcome::Applied
    }

    fn on_typing(&mut self, typing: TypingMessage) -> DispatchOutcome {
        let TypingMessage {
            conversation_id,
            user_id,
            is_typing,
        } = typing;
        if !self.is_active(&conversation_id) {
            tracing::debug!(conversation = %conversation_id, "typing event for closed conversation dropped");
            return DispatchOutcome::StaleDropped;
        }
        if user_id == self.config.local_user {
            return DispatchOutcome::Ignored;
        }

        let now = Instant::now();
        let changed = if is_typing {
            self.typing.set_typing(&conversation_id, &user_id, now)
        } else {
            self.typing.clear_typing(&conversation_id, &user_id, now)
        };
        if changed {
            self.emit_typing(&conversation_id);
        }
        DispatchOutcome::Applied
    }

    fn on_presence(&mut self, presence: PresenceMessage) -> DispatchOutcome {
        let PresenceMessage {
            conversation_id,
            user_id,
            online,
        } = presence;
        if !self.is_active(&conversation_id) {
            tracing::debug!(conversation = %conversation_id, "presence event for closed conversation dropped");
            return DispatchOutcome::StaleDropped;
        }

        if self.presence.apply(&conversation_id, &user_id, online) {
            self.emit(EngineEvent::PresenceChanged {
                conversation_id,
                user_id,
                online,
            });
            DispatchOutcome::Applied
        } else {
            DispatchOutcome::Ignored
        }
    }

    fn on_read_ack(&mut self, ack: ReadAck) -> DispatchOutcome {
        let ReadAck {
            conversation_id,
            message_ids,
        } = ack;

        let marked = self
            .messages
            .mark_flags(&conversation_id, &message_ids, MessageFlags::READ);
        let listed = self.conversations.mark_read(&conversation_id, &message_ids);
        let state = self.receipts.on_ack(&conversation_id);
        tracing::debug!(conversation = %conversation_id, marked, ?state, "read acknowledged");

        if marked > 0 {
            self.emit(EngineEvent::MessagesChanged {
                conversation_id: conversation_id.clone(),
            });
        }
        if listed {
            self.emit(EngineEvent::ConversationsChanged);
        }
        if state == ReceiptState::Unviewed {
            self.evaluate_receipt(&conversation_id);
        }
        DispatchOutcome::Applied
    }

    fn handle_conversations_loaded(
        &mut self,
        result: Result<Vec<Conversation>, ApiError>,
    ) -> DispatchOutcome {
        match result {
            Ok(list) => {
                tracing::info!(count = list.len(), "conversation list loaded");
                self.conversations.replace_all(list);
                self.emit(EngineEvent::ConversationsChanged);
                DispatchOutcome::Applied
            }
            Err(e) => {
                tracing::warn!(error = %e, "conversation list failed to load");
                self.emit(EngineEvent::Notification(format!(
                    "could not load conversations: {e}"
                )));
                DispatchOutcome::Ignored
            }
        }
    }

    fn handle_history_loaded(
        &mut self,
        conversation: &ConversationId,
        generation: u64,
        kind: PageKind,
        result: Result<Vec<Message>, ApiError>,
    ) -> DispatchOutcome {
        let current = self
            .active
            .as_ref()
            .is_some_and(|a| &a.id == conversation && a.generation == generation);
        if !current {
            tracing::debug!(conversation = %conversation, generation, ?kind, "stale history page dropped");
            return DispatchOutcome::StaleDropped;
        }

        let page_size = self.config.page_size;
        let state = self.history.entry(conversation.clone()).or_default();
        if kind == PageKind::Older {
            state.older_in_flight = false;
        }

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(conversation = %conversation, ?kind, error = %reason, "history fetch failed");
                if kind == PageKind::Latest {
                    state.status = HistoryStatus::Failed(reason.clone());
                }
                self.emit(EngineEvent::HistoryFetchFailed {
                    conversation_id: conversation.clone(),
                    reason,
                });
                return DispatchOutcome::Applied;
            }
        };

        if kind != PageKind::Refresh {
            state.has_more = page.len() >= page_size;
        }
        state.status = HistoryStatus::Loaded;

        if let Some(newest) = page.last() {
            self.conversations.record_message(newest, false);
        }
        let outcome = self.messages.merge_history(conversation, page);
        tracing::debug!(
            conversation = %conversation,
            ?kind,
            inserted = outcome.inserted,
            promoted = outcome.promoted,
            "history page merged"
        );
        if outcome.changed() || kind == PageKind::Latest {
            self.emit(EngineEvent::MessagesChanged {
                conversation_id: conversation.clone(),
            });
        }
        if kind != PageKind::Older && outcome.inserted > 0 {
            self.receipts.on_new_message(conversation);
        }
        self.evaluate_receipt(conversation);
        DispatchOutcome::Applied
    }

    fn handle_mark_read_finished(
        &mut self,
        conversation: &ConversationId,
        result: Result<(), ApiError>,
    ) -> DispatchOutcome {
        match result {
            Ok(()) => {
                tracing::debug!(conversation = %conversation, "mark-read accepted, awaiting ack");
                DispatchOutcome::Applied
            }
            Err(e) => {
                tracing::warn!(conversation = %conversation, error = %e, "mark-read request failed");
                if self.receipts.on_request_failed(conversation) {
                    DispatchOutcome::Applied
                } else {
                    DispatchOutcome::Ignored
                }
            }
        }
    }

    fn handle_typing_expired(&mut self, expired: &TypingExpired) -> DispatchOutcome {
        if !self.typing.handle_expired(expired) {
            return DispatchOutcome::Ignored;
        }
        self.emit_typing(&expired.conversation_id);
        DispatchOutcome::Applied
    }

    async fn handle_connection_event(
        &mut self,
        event: ConnectionEvent<C::Transport>,
    ) -> DispatchOutcome {
        match event {
            ConnectionEvent::Closed {
                channel,
                generation,
            } => {
                if !self.registry.handle_closed(channel, generation) {
                    return DispatchOutcome::Ignored;
                }
                self.emit(EngineEvent::ConnectionStatus {
                    channel,
                    connected: false,
                });
                self.forget_presence(channel);
                DispatchOutcome::Applied
            }
            ConnectionEvent::Retrying {
                channel,
                attempt,
                delay,
            } => {
                self.registry.handle_retrying(channel, attempt);
                self.emit(EngineEvent::Reconnecting {
                    channel,
                    attempt,
                    delay,
                });
                DispatchOutcome::Applied
            }
            ConnectionEvent::Reconnected { channel, transport } => {
                match self.registry.handle_reconnected(channel, transport).await {
                    Ok(rooms) => {
                        self.emit(EngineEvent::ConnectionStatus {
                            channel,
                            connected: true,
                        });
                        self.catch_up(channel, &rooms);
                    }
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "rejoin after reconnect failed");
                    }
                }
                DispatchOutcome::Applied
            }
            ConnectionEvent::Exhausted { channel, attempts } => {
                self.registry.handle_exhausted(channel);
                self.emit(EngineEvent::Disconnected { channel, attempts });
                DispatchOutcome::Applied
            }
        }
    }

    /// Refetch what may have been missed while `channel` was down.
    fn catch_up(&self, channel: ChannelKey, rooms: &[ConversationId]) {
        self.load_conversations();
        let Some(active) = self.active.as_ref().filter(|a| a.channel == channel) else {
            return;
        };
        if !rooms.contains(&active.id) {
            return;
        }
        if self.history_status(&active.id) == HistoryStatus::Loaded {
            self.fetch_history(
                &active.id,
                PageKind::Refresh,
                MessageQuery::latest(self.config.page_size),
            );
        }
    }

    /// The server drops every room with the connection, so presence of the
    /// open conversation is no longer known.
    fn forget_presence(&mut self, channel: ChannelKey) {
        let Some(id) = self
            .active
            .as_ref()
            .filter(|a| a.channel == channel)
            .map(|a| a.id.clone())
        else {
            return;
        };
        let users = self.presence.online_users(&id);
        self.presence.clear_conversation(&id);
        for user_id in users {
            self.emit(EngineEvent::PresenceChanged {
                conversation_id: id.clone(),
                user_id,
                online: false,
            });
        }
    }

    fn emit_typing(&self, conversation: &ConversationId) {
        self.emit(EngineEvent::TypingChanged {
            conversation_id: conversation.clone(),
            users: self.typing.typing_users(conversation, Instant::now()),
        });
    }
}
