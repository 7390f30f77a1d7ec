use std::io;
use thiserror::Error;

/// Errors that can occur while reassembling RTMP chunks into messages.  Every variant is
/// a violation of the chunk protocol and the connection the bytes came from should be closed.
#[derive(Debug, Error)]
pub enum ChunkDeserializationError {
    /// A chunk without a full header arrived on a chunk stream that has no previous header
    /// to inherit the missing fields from
    #[error("Received chunk with non-zero chunk type on csid {csid} prior to receiving a type 0 chunk")]
    NoPreviousChunkOnStream { csid: u32 },

    /// The peer asked for a chunk size outside of what the protocol allows
    #[error("Requested an invalid max chunk size of {chunk_size}.  The largest chunk size possible is 2147483647")]
    InvalidMaxChunkSize { chunk_size: usize },

    /// A SetChunkSize or Abort message arrived with a payload that could not be read
    #[error("Protocol control message of type {type_id} had a malformed payload")]
    MalformedControlMessage { type_id: u8 },

    #[error("{0}")]
    Io(#[from] io::Error),
}
