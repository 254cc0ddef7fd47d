//! Connection registry: one shared transport per channel.
//!
//! The registry owns the live connection of every channel, multiplexes
//! conversation rooms over it with reference counts, and supervises
//! reconnection. Everything it learns from the network (pushed events,
//! disconnects, reconnect progress) is forwarded as [`Inbound`] items to
//! the engine loop so that state is only ever mutated from one place.
//!
//! # Room reference counts
//!
//! `join` sends `conversation.join` only on the 0 → 1 transition and
//! `leave` sends `conversation.leave` only on 1 → 0. Leaving never closes
//! the connection. After a reconnect every room with a non-zero count is
//! joined again on the new connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use chatsync_proto::conversation::ChannelKey;
use chatsync_proto::event::ClientEvent;
use chatsync_proto::message::ConversationId;

use crate::chat::{EngineError, Inbound};
use crate::config::ReconnectConfig;

use super::{Connector, Transport};

/// Connection lifecycle of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never dialed.
    Idle,
    /// A live transport is installed.
    Connected,
    /// The connection dropped and backoff retries are running.
    Reconnecting {
        /// Attempt currently scheduled (1-based).
        attempt: u32,
    },
    /// Retries were exhausted; waits for an explicit reconnect.
    Disconnected,
}

/// Events produced by the registry's background tasks.
#[derive(Debug)]
pub enum ConnectionEvent<T> {
    /// A transport for `channel` closed. Stale generations are ignored.
    Closed {
        /// The affected channel.
        channel: ChannelKey,
        /// Connection generation the closing pump belonged to.
        generation: u64,
    },
    /// A reconnect attempt is about to be made after `delay`.
    Retrying {
        /// The affected channel.
        channel: ChannelKey,
        /// 1-based attempt number.
        attempt: u32,
        /// Backoff delay before the attempt.
        delay: Duration,
    },
    /// A reconnect attempt succeeded.
    Reconnected {
        /// The affected channel.
        channel: ChannelKey,
        /// The fresh transport.
        transport: T,
    },
    /// Every reconnect attempt failed.
    Exhausted {
        /// The affected channel.
        channel: ChannelKey,
        /// How many attempts were made.
        attempts: u32,
    },
}

/// Per-channel bookkeeping.
struct ChannelSlot<T> {
    transport: Option<Arc<T>>,
    generation: u64,
    state: ConnectionState,
    /// Room reference counts. `BTreeMap` keeps rejoin order deterministic.
    rooms: BTreeMap<ConversationId, usize>,
    pump: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl<T> ChannelSlot<T> {
    const fn new() -> Self {
        Self {
            transport: None,
            generation: 0,
            state: ConnectionState::Idle,
            rooms: BTreeMap::new(),
            pump: None,
            reconnect: None,
        }
    }
}

impl<T> Drop for ChannelSlot<T> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(reconnect) = self.reconnect.take() {
            reconnect.abort();
        }
    }
}

/// Owns one multiplexed connection per channel.
pub struct ConnectionRegistry<C: Connector> {
    connector: Arc<C>,
    policy: ReconnectConfig,
    slots: HashMap<ChannelKey, ChannelSlot<C::Transport>>,
    inbound: mpsc::UnboundedSender<Inbound<C::Transport>>,
}

impl<C: Connector> ConnectionRegistry<C> {
    /// Create an empty registry. Nothing is dialed until first use.
    pub fn new(
        connector: C,
        policy: ReconnectConfig,
        inbound: mpsc::UnboundedSender<Inbound<C::Transport>>,
    ) -> Self {
        Self {
            connector: Arc::new(connector),
            policy,
            slots: HashMap::new(),
            inbound,
        }
    }

    /// Return the live transport for `channel`, dialing it on first use.
    ///
    /// Repeated calls return the same handle without re-dialing. While a
    /// reconnect is in progress no new dial is made.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TransportUnavailable`] if the dial fails or
    /// the channel is currently reconnecting. A failed first dial starts
    /// the backoff supervisor.
    pub async fn connect(&mut self, channel: ChannelKey) -> Result<Arc<C::Transport>, EngineError> {
        if let Some(transport) = self.live_transport(channel) {
            return Ok(transport);
        }
        if matches!(
            self.state(channel),
            ConnectionState::Reconnecting { .. }
        ) {
            return Err(EngineError::TransportUnavailable(channel));
        }

        match self.connector.connect(channel).await {
            Ok(transport) => {
                tracing::info!(channel = %channel, "channel connected");
                Ok(self.install(channel, transport))
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "channel connect failed");
                self.start_reconnect(channel);
                Err(EngineError::TransportUnavailable(channel))
            }
        }
    }

    /// Increment the room count for `conversation`, joining on first use.
    ///
    /// The room is tracked even if the join frame cannot be sent; it will
    /// be joined when the channel reconnects.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TransportUnavailable`] if this was the first
    /// reference and the join could not be sent.
    pub async fn join(
        &mut self,
        channel: ChannelKey,
        conversation: &ConversationId,
    ) -> Result<(), EngineError> {
        let count = {
            let slot = self.slot_mut(channel);
            let count = slot.rooms.entry(conversation.clone()).or_insert(0);
            *count += 1;
            *count
        };
        tracing::debug!(channel = %channel, conversation = %conversation, count, "room reference added");

        if count == 1 {
            self.send(channel, &ClientEvent::join(conversation.clone()))
                .await?;
        }
        Ok(())
    }

    /// Decrement the room count for `conversation`, leaving on last use.
    ///
    /// The shared connection stays open. A leave that cannot be sent is
    /// only logged: the server drops the room with the dead connection.
    pub async fn leave(&mut self, channel: ChannelKey, conversation: &ConversationId) {
        let remaining = {
            let slot = self.slot_mut(channel);
            match slot.rooms.get_mut(conversation) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    *count
                }
                Some(_) => {
                    slot.rooms.remove(conversation);
                    0
                }
                None => {
                    tracing::debug!(channel = %channel, conversation = %conversation, "leave for untracked room");
                    return;
                }
            }
        };

        if remaining == 0
            && let Err(e) = self
                .send(channel, &ClientEvent::leave(conversation.clone()))
                .await
        {
            tracing::debug!(channel = %channel, conversation = %conversation, error = %e, "room leave not sent");
        }
    }

    /// Send an event on `channel`.
    ///
    /// Nothing is queued: a missing or broken connection is reported to
    /// the caller.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TransportUnavailable`] if the channel has no
    /// live connection or the send fails.
    pub async fn send(&self, channel: ChannelKey, event: &ClientEvent) -> Result<(), EngineError> {
        let Some(transport) = self.live_transport(channel) else {
            tracing::debug!(channel = %channel, event = event.name(), "send while disconnected");
            return Err(EngineError::TransportUnavailable(channel));
        };
        transport.send(event).await.map_err(|e| {
            tracing::warn!(channel = %channel, event = event.name(), error = %e, "send failed");
            EngineError::TransportUnavailable(channel)
        })
    }

    /// React to a closed connection.
    ///
    /// Returns `true` if the backoff supervisor was started; closes from
    /// an older connection generation are ignored.
    pub fn handle_closed(&mut self, channel: ChannelKey, generation: u64) -> bool {
        let Some(slot) = self.slots.get_mut(&channel) else {
            return false;
        };
        if slot.generation != generation || slot.transport.is_none() {
            tracing::debug!(channel = %channel, generation, "ignoring close of stale connection");
            return false;
        }
        slot.transport = None;
        if let Some(pump) = slot.pump.take() {
            pump.abort();
        }
        tracing::warn!(channel = %channel, "channel disconnected");
        self.start_reconnect(channel);
        true
    }

    /// Record that attempt `attempt` is scheduled.
    pub fn handle_retrying(&mut self, channel: ChannelKey, attempt: u32) {
        self.slot_mut(channel).state = ConnectionState::Reconnecting { attempt };
    }

    /// Install a reconnected transport and rejoin every active room.
    ///
    /// Returns the rooms that were rejoined.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TransportUnavailable`] if a rejoin could not
    /// be sent; the registry's pump will report the broken connection.
    pub async fn handle_reconnected(
        &mut self,
        channel: ChannelKey,
        transport: C::Transport,
    ) -> Result<Vec<ConversationId>, EngineError> {
        if let Some(handle) = self.slot_mut(channel).reconnect.take() {
            // The supervisor has already returned; dropping the handle detaches it.
            drop(handle);
        }
        self.install(channel, transport);

        let rooms: Vec<ConversationId> = self.active_rooms(channel);
        for conversation in &rooms {
            self.send(channel, &ClientEvent::join(conversation.clone()))
                .await?;
        }
        tracing::info!(channel = %channel, rooms = rooms.len(), "channel reconnected, rooms rejoined");
        Ok(rooms)
    }

    /// Record that reconnection gave up.
    pub fn handle_exhausted(&mut self, channel: ChannelKey) {
        let slot = self.slot_mut(channel);
        slot.reconnect = None;
        slot.state = ConnectionState::Disconnected;
    }

    /// Restart the backoff supervisor for a disconnected channel.
    ///
    /// Returns `false` if the channel is connected or already retrying.
    pub fn reconnect(&mut self, channel: ChannelKey) -> bool {
        match self.state(channel) {
            ConnectionState::Connected | ConnectionState::Reconnecting { .. } => false,
            ConnectionState::Idle | ConnectionState::Disconnected => {
                self.start_reconnect(channel);
                true
            }
        }
    }

    /// Current state of `channel`.
    #[must_use]
    pub fn state(&self, channel: ChannelKey) -> ConnectionState {
        self.slots
            .get(&channel)
            .map_or(ConnectionState::Idle, |slot| slot.state)
    }

    /// Whether `channel` has a live transport.
    #[must_use]
    pub fn is_connected(&self, channel: ChannelKey) -> bool {
        self.live_transport(channel).is_some()
    }

    /// Rooms on `channel` with a non-zero reference count, in id order.
    #[must_use]
    pub fn active_rooms(&self, channel: ChannelKey) -> Vec<ConversationId> {
        self.slots
            .get(&channel)
            .map(|slot| slot.rooms.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Reference count of a room.
    #[must_use]
    pub fn room_refs(&self, channel: ChannelKey, conversation: &ConversationId) -> usize {
        self.slots
            .get(&channel)
            .and_then(|slot| slot.rooms.get(conversation).copied())
            .unwrap_or(0)
    }

    fn live_transport(&self, channel: ChannelKey) -> Option<Arc<C::Transport>> {
        self.slots
            .get(&channel)
            .and_then(|slot| slot.transport.as_ref())
            .filter(|t| t.is_connected())
            .map(Arc::clone)
    }

    fn slot_mut(&mut self, channel: ChannelKey) -> &mut ChannelSlot<C::Transport> {
        self.slots.entry(channel).or_insert_with(ChannelSlot::new)
    }

    fn install(&mut self, channel: ChannelKey, transport: C::Transport) -> Arc<C::Transport> {
        let inbound = self.inbound.clone();
        let slot = self.slot_mut(channel);
        slot.generation += 1;
        if let Some(old) = slot.pump.take() {
            old.abort();
        }

        let transport = Arc::new(transport);
        slot.pump = Some(tokio::spawn(pump(
            Arc::clone(&transport),
            channel,
            slot.generation,
            inbound,
        )));
        slot.transport = Some(Arc::clone(&transport));
        slot.state = ConnectionState::Connected;
        transport
    }

    fn start_reconnect(&mut self, channel: ChannelKey) {
        let connector = Arc::clone(&self.connector);
        let policy = self.policy.clone();
        let inbound = self.inbound.clone();
        let slot = self.slot_mut(channel);
        if let Some(old) = slot.reconnect.take() {
            old.abort();
        }
        slot.state = ConnectionState::Reconnecting { attempt: 1 };
        slot.reconnect = Some(tokio::spawn(reconnect_with_backoff(
            connector, channel, policy, inbound,
        )));
    }
}

/// Background task: forward every event received on `transport`.
///
/// Ends with a [`ConnectionEvent::Closed`] once the transport reports the
/// connection gone.
async fn pump<T: Transport>(
    transport: Arc<T>,
    channel: ChannelKey,
    generation: u64,
    inbound: mpsc::UnboundedSender<Inbound<T>>,
) {
    loop {
        match transport.recv().await {
            Ok(event) => {
                if inbound.send(Inbound::Server { channel, event }).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(channel = %channel, generation, error = %e, "pump stopped");
                let sent = inbound.send(Inbound::Connection(ConnectionEvent::Closed {
                    channel,
                    generation,
                }));
                if sent.is_err() {
                    tracing::debug!(channel = %channel, "engine gone, close notification dropped");
                }
                return;
            }
        }
    }
}

/// Background task: redial `channel` with exponential backoff.
async fn reconnect_with_backoff<C: Connector>(
    connector: Arc<C>,
    channel: ChannelKey,
    policy: ReconnectConfig,
    inbound: mpsc::UnboundedSender<Inbound<C::Transport>>,
) {
    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_for(attempt);
        if inbound
            .send(Inbound::Connection(ConnectionEvent::Retrying {
                channel,
                attempt,
                delay,
            }))
            .is_err()
        {
            return;
        }
        tokio::time::sleep(delay).await;

        match connector.connect(channel).await {
            Ok(transport) => {
                let sent = inbound.send(Inbound::Connection(ConnectionEvent::Reconnected {
                    channel,
                    transport,
                }));
                if sent.is_err() {
                    tracing::debug!(channel = %channel, "engine gone, reconnected transport dropped");
                }
                return;
            }
            Err(e) => {
                tracing::debug!(channel = %channel, attempt, error = %e, "reconnect attempt failed");
            }
        }
    }

    tracing::warn!(channel = %channel, attempts = policy.max_attempts, "reconnect attempts exhausted");
    let sent = inbound.send(Inbound::Connection(ConnectionEvent::Exhausted {
        channel,
        attempts: policy.max_attempts,
    }));
    if sent.is_err() {
        tracing::debug!(channel = %channel, "engine gone, exhaustion notice dropped");
    }
}
