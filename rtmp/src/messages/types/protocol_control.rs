use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::Cursor;

use crate::messages::{MessageDeserializationError, MessageSerializationError};
use crate::messages::{PeerBandwidthLimitType, RtmpMessage};

const MAX_CHUNK_SIZE: u32 = 0x8000_0000 - 1;

/// Abort, Acknowledgement and WindowAcknowledgement all carry a single 32 bit value
pub fn serialize_u32(value: u32) -> Result<Bytes, MessageSerializationError> {
    let mut cursor = Cursor::new(Vec::with_capacity(4));
    cursor.write_u32::<BigEndian>(value)?;
    Ok(Bytes::from(cursor.into_inner()))
}

pub fn deserialize_u32(data: &[u8]) -> Result<u32, MessageDeserializationError> {
    let mut cursor = Cursor::new(data);
    Ok(cursor.read_u32::<BigEndian>()?)
}

pub fn serialize_set_chunk_size(size: u32) -> Result<Bytes, MessageSerializationError> {
    if size > MAX_CHUNK_SIZE {
        return Err(MessageSerializationError::InvalidChunkSize);
    }

    serialize_u32(size)
}

pub fn deserialize_set_chunk_size(data: &[u8]) -> Result<RtmpMessage, MessageDeserializationError> {
    let size = deserialize_u32(data)?;
    if size > MAX_CHUNK_SIZE {
        return Err(MessageDeserializationError::InvalidMessageFormat);
    }

    Ok(RtmpMessage::SetChunkSize { size })
}

pub fn serialize_set_peer_bandwidth(
    size: u32,
    limit_type: &PeerBandwidthLimitType,
) -> Result<Bytes, MessageSerializationError> {
    let limit = match limit_type {
        PeerBandwidthLimitType::Hard => 0,
        PeerBandwidthLimitType::Soft => 1,
        PeerBandwidthLimitType::Dynamic => 2,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(5));
    cursor.write_u32::<BigEndian>(size)?;
    cursor.write_u8(limit)?;
    Ok(Bytes::from(cursor.into_inner()))
}

pub fn deserialize_set_peer_bandwidth(data: &[u8]) -> Result<RtmpMessage, MessageDeserializationError> {
    let mut cursor = Cursor::new(data);
    let size = cursor.read_u32::<BigEndian>()?;
    let limit_type = match cursor.read_u8()? {
        0 => PeerBandwidthLimitType::Hard,
        1 => PeerBandwidthLimitType::Soft,
        2 => PeerBandwidthLimitType::Dynamic,
        _ => return Err(MessageDeserializationError::InvalidMessageFormat),
    };

    Ok(RtmpMessage::SetPeerBandwidth { size, limit_type })
}
