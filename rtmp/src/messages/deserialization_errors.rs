use rml_amf0::Amf0DeserializationError;
use std::io;
use thiserror::Error;

/// Failures turning a `MessagePayload` back into an `RtmpMessage`
#[derive(Debug, Error)]
pub enum MessageDeserializationError {
    /// Too short, or the amf0 values had the wrong shape
    #[error("Message body did not match its type")]
    InvalidMessageFormat,

    /// The message type id is not one the protocol defines
    #[error("Message type id {type_id} is not a known RTMP message type")]
    UnknownMessageType { type_id: u8 },

    #[error("Invalid amf0 encoding: {0}")]
    Amf0DeserializationError(#[from] Amf0DeserializationError),

    #[error("Message body ended early: {0}")]
    Io(#[from] io::Error),
}
