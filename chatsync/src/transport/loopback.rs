//! Loopback transport for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels to stand in for a chat
//! server connection. [`LoopbackTransport::create_pair`] returns the client
//! transport and a [`LoopbackServer`] handle that pushes server events and
//! observes what the client sent. [`LoopbackConnector`] hands out fresh
//! pairs per channel so reconnects can be exercised.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, mpsc};

use chatsync_proto::conversation::ChannelKey;
use chatsync_proto::event::{ClientEvent, ServerEvent};

use super::{Connector, Transport, TransportError, TransportType};

/// Client side of an in-process connection.
pub struct LoopbackTransport {
    /// Sender for outgoing events (delivers to the server handle).
    tx: mpsc::Sender<ClientEvent>,
    /// Receiver for events pushed by the server handle.
    rx: Mutex<mpsc::Receiver<ServerEvent>>,
    /// Cleared when either side severs the connection.
    connected: Arc<AtomicBool>,
}

/// Server side of an in-process connection.
pub struct LoopbackServer {
    /// Pushes events to the client.
    tx: SyncMutex<Option<mpsc::Sender<ServerEvent>>>,
    /// Events sent by the client.
    rx: Mutex<mpsc::Receiver<ClientEvent>>,
    /// Shared liveness flag.
    connected: Arc<AtomicBool>,
}

impl LoopbackTransport {
    /// Create a connected client/server pair.
    ///
    /// The `buffer` parameter controls the channel capacity for each
    /// direction.
    #[must_use]
    pub fn create_pair(buffer: usize) -> (Self, LoopbackServer) {
        let (client_tx, server_rx) = mpsc::channel(buffer);
        let (server_tx, client_rx) = mpsc::channel(buffer);
        let connected = Arc::new(AtomicBool::new(true));

        let client = Self {
            tx: client_tx,
            rx: Mutex::new(client_rx),
            connected: Arc::clone(&connected),
        };
        let server = LoopbackServer {
            tx: SyncMutex::new(Some(server_tx)),
            rx: Mutex::new(server_rx),
            connected,
        };
        (client, server)
    }
}

impl Transport for LoopbackTransport {
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<ServerEvent, TransportError> {
        let mut rx = self.rx.lock().await;
        let event = rx.recv().await;
        match event {
            Some(event) if self.connected.load(Ordering::SeqCst) => Ok(event),
            _ => {
                self.connected.store(false, Ordering::SeqCst);
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}

impl LoopbackServer {
    /// Push an event to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the connection was
    /// severed or the client dropped its end.
    pub async fn push(&self, event: ServerEvent) -> Result<(), TransportError> {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx
                .send(event)
                .await
                .map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Receive the next event the client sent.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the client end is
    /// dropped and every buffered event has been drained.
    pub async fn next_client_event(&self) -> Result<ClientEvent, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    /// Drain every event the client has sent so far without waiting.
    pub async fn drain_client_events(&self) -> Vec<ClientEvent> {
        let mut rx = self.rx.lock().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Sever the connection, as if the network dropped.
    ///
    /// The client's pending `recv` resolves with `ConnectionClosed` and
    /// further sends fail.
    pub fn sever(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.tx.lock().take();
    }

    /// Whether the connection is still alive.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Connector producing loopback pairs.
///
/// Each successful `connect` publishes the server half so a test can
/// pick it up with [`take_server`](Self::take_server). Failures can be
/// scripted per channel with [`fail_next`](Self::fail_next).
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    inner: Arc<ConnectorState>,
}

#[derive(Default)]
struct ConnectorState {
    servers: SyncMutex<HashMap<ChannelKey, VecDeque<LoopbackServer>>>,
    failures: SyncMutex<HashMap<ChannelKey, usize>>,
    dials: SyncMutex<HashMap<ChannelKey, usize>>,
    server_ready: tokio::sync::Notify,
}

/// Capacity of each direction of a loopback pair.
const LOOPBACK_BUFFER: usize = 64;

impl LoopbackConnector {
    /// Create a connector with no scripted failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` dials for `channel` fail with `Unreachable`.
    pub fn fail_next(&self, channel: ChannelKey, count: usize) {
        *self.inner.failures.lock().entry(channel).or_default() += count;
    }

    /// Number of dial attempts made for `channel`, successful or not.
    #[must_use]
    pub fn dial_count(&self, channel: ChannelKey) -> usize {
        self.inner.dials.lock().get(&channel).copied().unwrap_or(0)
    }

    /// Take the oldest server half produced for `channel`, if any.
    #[must_use]
    pub fn take_server(&self, channel: ChannelKey) -> Option<LoopbackServer> {
        self.inner
            .servers
            .lock()
            .get_mut(&channel)
            .and_then(VecDeque::pop_front)
    }

    /// Wait until a server half for `channel` is available and take it.
    pub async fn wait_server(&self, channel: ChannelKey) -> LoopbackServer {
        loop {
            let notified = self.inner.server_ready.notified();
            if let Some(server) = self.take_server(channel) {
                return server;
            }
            notified.await;
        }
    }
}

impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self, channel: ChannelKey) -> Result<LoopbackTransport, TransportError> {
        *self.inner.dials.lock().entry(channel).or_default() += 1;

        {
            let mut failures = self.inner.failures.lock();
            if let Some(remaining) = failures.get_mut(&channel)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(TransportError::Unreachable(channel));
            }
        }

        let (client, server) = LoopbackTransport::create_pair(LOOPBACK_BUFFER);
        self.inner
            .servers
            .lock()
            .entry(channel)
            .or_default()
            .push_back(server);
        self.inner.server_ready.notify_waiters();
        Ok(client)
    }
}
