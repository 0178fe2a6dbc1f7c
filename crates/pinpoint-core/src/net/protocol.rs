use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::GameError;

use super::messages::{ClientMessage, GuessMsg, ServerMessage, client_types};

/// Maximum accepted inbound frame size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024; // 16 KiB

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    EmptyMessage,

    #[error("payload too large: {0} bytes (max {MAX_MESSAGE_SIZE})")]
    PayloadTooLarge(usize),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },

    #[error("serialize error: {0}")]
    SerializeError(String),
}

impl From<ProtocolError> for GameError {
    fn from(e: ProtocolError) -> Self {
        GameError::MalformedInput(e.to_string())
    }
}

/// Generic inbound envelope. The payload is left opaque until `type` has
/// been matched against the known set.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Encode a `ServerMessage` as a JSON text frame.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

/// Encode a `ClientMessage` as a JSON text frame.
pub fn encode_client_message(msg: &ClientMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

/// Decode an inbound frame into a `ClientMessage`.
pub fn decode_client_message(data: &str) -> Result<ClientMessage, ProtocolError> {
    if data.trim().is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(data.len()));
    }
    let frame: InboundFrame =
        serde_json::from_str(data).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    match frame.kind.as_str() {
        client_types::GUESS => {
            let guess: GuessMsg =
                serde_json::from_value(frame.payload).map_err(|e| ProtocolError::InvalidPayload {
                    kind: client_types::GUESS,
                    reason: e.to_string(),
                })?;
            Ok(ClientMessage::Guess(guess))
        },
        client_types::START => Ok(ClientMessage::Start),
        client_types::ABORT => Ok(ClientMessage::Abort),
        client_types::HEARTBEAT => Ok(ClientMessage::Heartbeat),
        client_types::LEAVE => Ok(ClientMessage::Leave),
        _ => Err(ProtocolError::UnknownMessageType(frame.kind)),
    }
}

/// Decode an outbound frame. Used by clients and tests.
pub fn decode_server_message(data: &str) -> Result<ServerMessage, ProtocolError> {
    if data.trim().is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    serde_json::from_str(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
}
