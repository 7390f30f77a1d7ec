use crate::chunk_io::{ChunkDeserializationError, ChunkSerializationError};
use crate::messages::{MessageDeserializationError, MessageSerializationError};
use thiserror::Error;

/// Errors that end the connection a server session belongs to
#[derive(Debug, Error)]
pub enum ServerSessionError {
    #[error("Inbound chunk stream is corrupt: {0}")]
    ChunkDeserializationError(#[from] ChunkDeserializationError),

    #[error("Outbound chunking failed: {0}")]
    ChunkSerializationError(#[from] ChunkSerializationError),

    #[error("Could not encode a message: {0}")]
    MessageSerializationError(#[from] MessageSerializationError),

    #[error("Could not decode a message: {0}")]
    MessageDeserializationError(#[from] MessageDeserializationError),

    #[error("connect command carried no app name")]
    NoAppNameForConnectionRequest,

    /// Unknown id, or an id answered with the wrong kind of accept
    #[error("No outstanding request matches this id")]
    InvalidRequestId,

    #[error("Cannot {action} on stream {stream_id}, it is not in a state that allows it")]
    ActionAttemptedOnInactiveStream { action: String, stream_id: u32 },
}
