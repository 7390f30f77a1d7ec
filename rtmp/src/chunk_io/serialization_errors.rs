use std::io;
use thiserror::Error;

use crate::messages::MessageSerializationError;

/// Errors that can occur while framing RTMP messages into chunks
#[derive(Debug, Error)]
pub enum ChunkSerializationError {
    /// A message cannot be larger than 16777215 bytes, even when split across multiple chunks
    #[error("The current message has a length of {size} bytes, which is over the allowed size of 16777215 bytes")]
    MessageTooLong { size: u32 },

    #[error("An invalid chunk size was specified.  Chunk size must be greater than 0 and less than 2147483647")]
    InvalidMaxChunkSize { attempted_chunk_size: u32 },

    /// Chunk stream ids 0 and 1 collide with the basic header escape values and ids above
    /// 65599 do not fit in the three byte form
    #[error("Chunk stream id {chunk_stream_id} cannot be represented in a chunk basic header")]
    InvalidChunkStreamId { chunk_stream_id: u32 },

    #[error("Failed to create SetChunkSize message: {0}")]
    SetChunkSizeMessageCreationFailure(#[from] MessageSerializationError),

    #[error("{0}")]
    Io(#[from] io::Error),
}
