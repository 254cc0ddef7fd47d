//! Transport layer abstraction.
//!
//! Defines the [`Transport`] trait carrying typed socket events for one
//! channel, and the [`Connector`] trait that dials a transport for a
//! channel. Concrete implementations:
//! - [`loopback::LoopbackTransport`]: in-process channel pair for testing
//! - [`ws::WsTransport`]: JSON frames over a WebSocket
//!
//! [`registry::ConnectionRegistry`] owns one connection per channel and
//! [`router`] maps conversations onto channels.

pub mod loopback;
pub mod registry;
pub mod router;
pub mod ws;

use std::fmt;

use chatsync_proto::codec::CodecError;
use chatsync_proto::conversation::ChannelKey;
use chatsync_proto::event::{ClientEvent, ServerEvent};

/// Describes which kind of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// WebSocket connection to the chat server.
    WebSocket,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "WebSocket"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// No endpoint is configured or reachable for the channel.
    #[error("channel {0} is unreachable")]
    Unreachable(ChannelKey),

    /// A frame could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Async transport carrying socket events for a single channel.
///
/// One transport is shared by every conversation of its channel; rooms
/// are multiplexed over it with join/leave events.
pub trait Transport: Send + Sync {
    /// Send an event to the server.
    ///
    /// Returns `Ok(())` once the frame has been handed to the connection.
    /// This does NOT guarantee the server processed it.
    fn send(
        &self,
        event: &ClientEvent,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next event pushed by the server.
    ///
    /// Resolves with [`TransportError::ConnectionClosed`] once the
    /// connection is gone; callers treat that as a disconnect.
    fn recv(&self) -> impl std::future::Future<Output = Result<ServerEvent, TransportError>> + Send;

    /// Whether the underlying connection is still alive.
    fn is_connected(&self) -> bool;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}

/// Dials transports, one per channel.
///
/// The connection registry calls this for the initial connect and for
/// every reconnect attempt, so implementations must be reusable.
pub trait Connector: Send + Sync + 'static {
    /// The transport produced by this connector.
    type Transport: Transport + 'static;

    /// Open a new connection for `channel`.
    fn connect(
        &self,
        channel: ChannelKey,
    ) -> impl std::future::Future<Output = Result<Self::Transport, TransportError>> + Send;
}
