//! WebSocket transport.
//!
//! Implements the [`Transport`] trait over one WebSocket connection per
//! channel. Frames are JSON text encoded with [`chatsync_proto::codec`].
//! A background reader task decodes incoming frames; malformed frames are
//! logged and skipped without tearing the connection down.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use chatsync_proto::codec;
use chatsync_proto::conversation::ChannelKey;
use chatsync_proto::event::{ClientEvent, ServerEvent};

use super::{Connector, Transport, TransportError, TransportType};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Capacity of the decoded-event channel fed by the reader task.
const INCOMING_BUFFER: usize = 256;

/// WebSocket transport for a single channel.
pub struct WsTransport {
    /// The channel this connection serves.
    channel: ChannelKey,
    /// Write half of the WebSocket connection.
    ws_sender: Arc<Mutex<WsSender>>,
    /// Events decoded by the background reader task.
    incoming: Mutex<mpsc::Receiver<ServerEvent>>,
    /// Whether the WebSocket connection is active.
    connected: Arc<AtomicBool>,
    /// Background reader task, aborted when the transport is dropped.
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WsTransport {
    /// Connect to `url` for `channel`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the handshake does not finish within `timeout`.
    /// - [`TransportError::Io`] if the connection or handshake fails.
    pub async fn connect(
        url: &str,
        channel: ChannelKey,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let (ws_stream, _response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, channel = %channel, "WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, channel = %channel, err = %e, "WebSocket connect failed");
                TransportError::Io(std::io::Error::other(e))
            })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(INCOMING_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            tx,
            Arc::clone(&connected),
            channel,
        ));

        tracing::info!(url, channel = %channel, "WebSocket connected");

        Ok(Self {
            channel,
            ws_sender: Arc::new(Mutex::new(ws_sender)),
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }

    /// The channel this transport serves.
    #[must_use]
    pub const fn channel(&self) -> ChannelKey {
        self.channel
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

impl Transport for WsTransport {
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }

        let text = codec::encode_client(event)?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(channel = %self.channel, err = %e, "WebSocket send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    async fn recv(&self) -> Result<ServerEvent, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }
}

/// Background task that reads frames and forwards decoded events.
///
/// Sets `connected` to `false` when the WebSocket closes or errors out.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<ServerEvent>,
    connected: Arc<AtomicBool>,
    channel: ChannelKey,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match codec::decode_server(&text) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, err = %e, "malformed frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!(channel = %channel, "WebSocket closed by server");
                break;
            }
            Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(channel = %channel, err = %e, "WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!(channel = %channel, "WebSocket reader task exiting");
}

/// Dials [`WsTransport`]s from a per-channel URL map.
#[derive(Debug, Clone)]
pub struct WsConnector {
    urls: HashMap<ChannelKey, String>,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Create a connector for the given channel URLs.
    #[must_use]
    pub const fn new(urls: HashMap<ChannelKey, String>, connect_timeout: Duration) -> Self {
        Self {
            urls,
            connect_timeout,
        }
    }

    /// The URL configured for `channel`, if any.
    #[must_use]
    pub fn url(&self, channel: ChannelKey) -> Option<&str> {
        self.urls.get(&channel).map(String::as_str)
    }
}

impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, channel: ChannelKey) -> Result<WsTransport, TransportError> {
        let Some(url) = self.url(channel) else {
            return Err(TransportError::Unreachable(channel));
        };
        WsTransport::connect(url, channel, self.connect_timeout).await
    }
}
