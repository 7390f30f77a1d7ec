use std::io;
use thiserror::Error;

use crate::messages::MessageSerializationError;

/// Failures reading media out of a source.  These end the playback they occur in but
/// leave the connection usable.
#[derive(Debug, Error)]
pub enum MediaSourceError {
    #[error("The data does not start with a valid FLV header")]
    InvalidFlvHeader,

    /// The tag at the given file offset cannot be read as an FLV tag
    #[error("Corrupt FLV tag at offset {offset}")]
    CorruptTag { offset: u64 },

    /// `next_message` was called after `has_next` returned false
    #[error("The media source has no more messages")]
    Exhausted,

    #[error("The media source has been closed")]
    Closed,

    #[error("Failed to bundle messages into an aggregate: {0}")]
    Aggregate(#[from] MessageSerializationError),

    #[error("An IO error occurred while reading media: {0}")]
    Io(#[from] io::Error),
}
