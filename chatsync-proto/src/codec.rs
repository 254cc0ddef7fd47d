//! JSON encoding of socket frames.

use crate::event::{ClientEvent, ServerEvent};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The frame is not a known event or its payload is malformed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// Encodes an outgoing client event as a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_client(event: &ClientEvent) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a client event (used by server-side test harnesses).
///
/// # Errors
///
/// Returns `CodecError::MalformedFrame` if the text is not a client event.
pub fn decode_client(text: &str) -> Result<ClientEvent, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::MalformedFrame(e.to_string()))
}

/// Encodes a server event (used by server-side test harnesses).
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_server(event: &ServerEvent) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes an incoming server frame.
///
/// # Errors
///
/// Returns `CodecError::MalformedFrame` if the text is not a known server
/// event or its payload does not match the event's shape.
pub fn decode_server(text: &str) -> Result<ServerEvent, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::MalformedFrame(e.to_string()))
}
