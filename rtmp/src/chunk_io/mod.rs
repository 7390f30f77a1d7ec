//! Framing of RTMP messages into chunks and reassembly of chunks back into messages.
//!
//! Each direction of a connection keeps its own per chunk stream header state, which is
//! what allows headers to be compressed against the previous message on the same stream.

mod chunk_header;
mod deserialization_errors;
mod deserializer;
mod serialization_errors;
mod serializer;

pub use self::chunk_header::{
    read_chunk_header, write_basic_header, write_chunk_header, ChannelHeaderTable, ChunkHeader,
    ChunkHeaderFormat, EXTENDED_TIMESTAMP_MARKER, MAX_CHUNK_STREAM_ID, MAX_MESSAGE_LENGTH,
    MIN_CHUNK_STREAM_ID,
};
pub use self::deserialization_errors::ChunkDeserializationError;
pub use self::deserializer::ChunkDeserializer;
pub use self::serialization_errors::ChunkSerializationError;
pub use self::serializer::{ChunkSerializer, Packet, INITIAL_MAX_CHUNK_SIZE, MAX_CHUNK_SIZE};
