use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

use super::{MessageDeserializationError, MessagePayload, MessageSerializationError, AGGREGATE_TYPE_ID};

const TAG_HEADER_LENGTH: usize = 11;
const BACK_POINTER_LENGTH: usize = 4;
const MAX_TAG_DATA_LENGTH: usize = 0xFF_FFFF;

/// Bytes an entry adds to an aggregate message on top of its own payload
pub const AGGREGATE_TAG_OVERHEAD: usize = TAG_HEADER_LENGTH + BACK_POINTER_LENGTH;

/// Bundles consecutive media messages into a single aggregate message.  Each entry is laid
/// out as an FLV tag (11 byte header, body, 4 byte back pointer) and the aggregate takes the
/// timestamp of its first entry.
pub struct AggregateBuilder {
    byte_limit: usize,
    data: BytesMut,
    first: Option<MessagePayload>,
    last_timestamp: u32,
    count: usize,
}

impl AggregateBuilder {
    pub fn new(byte_limit: usize) -> AggregateBuilder {
        AggregateBuilder {
            byte_limit,
            data: BytesMut::new(),
            first: None,
            last_timestamp: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn byte_length(&self) -> usize {
        self.data.len()
    }

    /// Time covered from the first entry to the last one
    pub fn duration(&self) -> u32 {
        match &self.first {
            Some(first) => self.last_timestamp.saturating_sub(first.timestamp),
            None => 0,
        }
    }

    /// True when a message with `data_length` bytes could be added without pushing the
    /// aggregate past its byte limit.  An empty builder accepts any message so oversized
    /// messages still go out.
    pub fn has_room_for(&self, data_length: usize) -> bool {
        self.is_empty() || self.data.len() + data_length + AGGREGATE_TAG_OVERHEAD <= self.byte_limit
    }

    /// Appends the message when it fits, returning false when it does not
    pub fn try_add(&mut self, message: &MessagePayload) -> Result<bool, MessageSerializationError> {
        if !self.has_room_for(message.data.len()) {
            return Ok(false);
        }

        let length = message.data.len();
        if length > MAX_TAG_DATA_LENGTH {
            return Err(MessageSerializationError::AggregateEntryTooLarge { size: length });
        }

        let mut header = Vec::with_capacity(TAG_HEADER_LENGTH);
        header.write_u8(message.type_id)?;
        header.write_u24::<BigEndian>(length as u32)?;
        header.write_u24::<BigEndian>(message.timestamp & 0xFF_FFFF)?;
        header.write_u8((message.timestamp >> 24) as u8)?;
        header.write_u24::<BigEndian>(0)?;

        self.data.reserve(length + AGGREGATE_TAG_OVERHEAD);
        self.data.put_slice(&header);
        self.data.put_slice(&message.data);
        self.data.put_u32((TAG_HEADER_LENGTH + length) as u32);

        if self.first.is_none() {
            self.first = Some(message.clone());
        }

        self.last_timestamp = message.timestamp;
        self.count += 1;
        Ok(true)
    }

    /// Produces the message to send.  A builder holding a single entry hands that entry back
    /// unchanged instead of wrapping it.
    pub fn finish(self) -> Option<MessagePayload> {
        let first = self.first?;
        if self.count == 1 {
            return Some(first);
        }

        Some(MessagePayload {
            timestamp: first.timestamp,
            type_id: AGGREGATE_TYPE_ID,
            message_stream_id: first.message_stream_id,
            data: self.data.freeze(),
        })
    }
}

/// Breaks an aggregate message back into its entries.  Entry timestamps are rebased so the
/// first entry lands on the aggregate's own timestamp.
pub fn split_aggregate(payload: &MessagePayload) -> Result<Vec<MessagePayload>, MessageDeserializationError> {
    let data = &payload.data;
    let mut cursor = Cursor::new(&data[..]);
    let mut messages = Vec::new();
    let mut first_timestamp = None;

    while (cursor.position() as usize) + TAG_HEADER_LENGTH <= data.len() {
        let type_id = cursor.read_u8()?;
        let length = cursor.read_u24::<BigEndian>()? as usize;
        let lower_timestamp = cursor.read_u24::<BigEndian>()?;
        let upper_timestamp = u32::from(cursor.read_u8()?);
        let _stream_id = cursor.read_u24::<BigEndian>()?;

        let start = cursor.position() as usize;
        let end = start + length;
        if end > data.len() {
            return Err(MessageDeserializationError::InvalidMessageFormat);
        }

        let timestamp = (upper_timestamp << 24) | lower_timestamp;
        let base = *first_timestamp.get_or_insert(timestamp);

        messages.push(MessagePayload {
            timestamp: payload.timestamp.wrapping_add(timestamp.wrapping_sub(base)),
            type_id,
            message_stream_id: payload.message_stream_id,
            data: data.slice(start..end),
        });

        cursor.set_position((end + BACK_POINTER_LENGTH).min(data.len()) as u64);
    }

    Ok(messages)
}
