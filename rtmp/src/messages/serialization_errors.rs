use rml_amf0::Amf0SerializationError;
use std::io;
use thiserror::Error;

/// Enumeration that represents the various errors that may occur while trying to
/// serialize a RTMP message into a raw RTMP payload.
#[derive(Debug, Error)]
pub enum MessageSerializationError {
    #[error("Cannot serialize a SetChunkSize message with a size of 2147483648 or greater")]
    InvalidChunkSize,

    /// A user control event was missing a value its wire form requires
    #[error("User control event {event} requires a {field} value")]
    MissingUserControlValue {
        event: &'static str,
        field: &'static str,
    },

    /// Media data inside an aggregate message cannot exceed the 24 bit tag size field
    #[error("A message of {size} bytes cannot be placed inside an aggregate message")]
    AggregateEntryTooLarge { size: usize },

    #[error("The values provided could not be serialized into valid AMF0 encoded data: {0}")]
    Amf0SerializationError(#[from] Amf0SerializationError),

    #[error("An IO error occurred while writing the output: {0}")]
    Io(#[from] io::Error),
}
