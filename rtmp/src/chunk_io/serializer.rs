use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

use super::chunk_header::{
    write_basic_header, write_chunk_header, ChannelHeaderTable, ChunkHeaderFormat, MAX_MESSAGE_LENGTH,
};
use super::ChunkSerializationError;
use crate::messages::{is_stream_begin, MessagePayload, RtmpMessage};

pub const INITIAL_MAX_CHUNK_SIZE: u32 = 128;
pub const MAX_CHUNK_SIZE: u32 = 0x7FFF_FFFF;

/// An outbound data packet containing all the RTMP chunks of a single RTMP message.
/// Packets must reach the peer in the order they were serialized, otherwise the peer
/// will resolve compressed headers against the wrong previous header.
#[derive(Debug, PartialEq, Clone)]
pub struct Packet {
    pub bytes: Bytes,
}

/// Allows serializing RTMP messages into RTMP chunks.
///
/// Due to the nature of the RTMP chunking protocol, the same serializer should be used
/// for all messages that need to be sent to the same peer.
pub struct ChunkSerializer {
    previous_headers: ChannelHeaderTable,
    max_chunk_size: u32,
}

impl ChunkSerializer {
    /// Creates a new `ChunkSerializer` that splits messages into chunks of 128 bytes
    /// until told otherwise.
    pub fn new() -> ChunkSerializer {
        ChunkSerializer {
            previous_headers: ChannelHeaderTable::new(),
            max_chunk_size: INITIAL_MAX_CHUNK_SIZE,
        }
    }

    pub fn get_max_chunk_size(&self) -> u32 {
        self.max_chunk_size
    }

    /// Changes the maximum amount of bytes from RTMP messages that can be in a single RTMP chunk.
    ///
    /// The peer has to be told about the change before any chunk framed with the new size
    /// arrives, so the returned `SetChunkSize` packet *must* be sent before anything else
    /// this serializer produces afterwards.
    pub fn set_max_chunk_size(&mut self, new_size: u32, timestamp: u32) -> Result<Packet, ChunkSerializationError> {
        validate_chunk_size(new_size)?;

        let message = RtmpMessage::SetChunkSize { size: new_size };
        let payload = message.into_message_payload(timestamp, 0)?;
        self.serialize(&payload, false)
    }

    /// Turns an RTMP message payload into binary data (representing RTMP chunks) that can be
    /// sent over the network.
    ///
    /// The header of the first chunk is compressed against the previous message sent on the
    /// same chunk stream.  Every later chunk of the message only carries a one to three byte
    /// repeat header.  Compression can be bypassed with `force_uncompressed`, which some
    /// players require for the first messages after the handshake.
    ///
    /// Serializing a `SetChunkSize` message switches this serializer to the new chunk size
    /// for every message after it, and a `StreamBegin` user control message resets all
    /// header compression state.
    pub fn serialize(
        &mut self,
        message: &MessagePayload,
        force_uncompressed: bool,
    ) -> Result<Packet, ChunkSerializationError> {
        let length = message.data.len();
        if length > MAX_MESSAGE_LENGTH as usize {
            return Err(ChunkSerializationError::MessageTooLong { size: length as u32 });
        }

        let new_chunk_size = match message.type_id {
            1 => Some(read_chunk_size(&message.data)?),
            _ => None,
        };

        if is_stream_begin(message) {
            self.previous_headers.clear();
        }

        let csid = get_csid_for_message_type(message.type_id);
        if force_uncompressed {
            self.previous_headers.forget(csid);
        }

        let header = self.previous_headers.compress(
            csid,
            message.timestamp,
            length as u32,
            message.type_id,
            message.message_stream_id,
        );

        let chunk_size = self.max_chunk_size as usize;
        let chunk_count = (length + chunk_size - 1) / chunk_size;
        let mut writer = BytesMut::with_capacity(length + 16 + chunk_count * 3).writer();
        write_chunk_header(&mut writer, &header)?;

        for (index, slice) in message.data.chunks(chunk_size).enumerate() {
            if index > 0 {
                write_basic_header(&mut writer, ChunkHeaderFormat::Repeat, csid)?;
            }

            writer.get_mut().put_slice(slice);
        }

        if let Some(size) = new_chunk_size {
            self.max_chunk_size = size;
        }

        Ok(Packet {
            bytes: writer.into_inner().freeze(),
        })
    }
}

impl Default for ChunkSerializer {
    fn default() -> Self {
        ChunkSerializer::new()
    }
}

fn validate_chunk_size(size: u32) -> Result<(), ChunkSerializationError> {
    if size == 0 || size > MAX_CHUNK_SIZE {
        return Err(ChunkSerializationError::InvalidMaxChunkSize {
            attempted_chunk_size: size,
        });
    }

    Ok(())
}

fn read_chunk_size(data: &[u8]) -> Result<u32, ChunkSerializationError> {
    let mut cursor = Cursor::new(data);
    let size = cursor.read_u32::<BigEndian>()?;
    validate_chunk_size(size)?;
    Ok(size)
}

/// Each category of message travels on its own chunk stream so that header compression
/// stays effective when they are interleaved
fn get_csid_for_message_type(message_type_id: u8) -> u32 {
    match message_type_id {
        1..=6 => 2,
        17 | 20 => 3,
        8 => 4,
        9 => 5,
        15 | 18 => 6,
        22 => 7,
        _ => 8,
    }
}
