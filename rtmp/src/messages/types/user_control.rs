use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Write};

use crate::messages::{MessageDeserializationError, MessageSerializationError};
use crate::messages::{RtmpMessage, UserControlEventType};

pub fn serialize(
    event_type: &UserControlEventType,
    stream_id: Option<u32>,
    buffer_length: Option<u32>,
    timestamp: Option<u32>,
) -> Result<Bytes, MessageSerializationError> {
    let mut cursor = Cursor::new(Vec::with_capacity(10));
    cursor.write_u16::<BigEndian>(event_id(event_type))?;

    match event_type {
        UserControlEventType::PingRequest | UserControlEventType::PingResponse => {
            write_required(&mut cursor, event_type, "timestamp", timestamp)?;
        }

        UserControlEventType::SetBufferLength => {
            write_required(&mut cursor, event_type, "stream id", stream_id)?;
            write_required(&mut cursor, event_type, "buffer length", buffer_length)?;
        }

        _ => write_required(&mut cursor, event_type, "stream id", stream_id)?,
    }

    Ok(Bytes::from(cursor.into_inner()))
}

pub fn deserialize(data: &[u8]) -> Result<RtmpMessage, MessageDeserializationError> {
    let mut cursor = Cursor::new(data);
    let event_type = match cursor.read_u16::<BigEndian>()? {
        0 => UserControlEventType::StreamBegin,
        1 => UserControlEventType::StreamEof,
        2 => UserControlEventType::StreamDry,
        3 => UserControlEventType::SetBufferLength,
        4 => UserControlEventType::StreamIsRecorded,
        6 => UserControlEventType::PingRequest,
        7 => UserControlEventType::PingResponse,
        31 => UserControlEventType::BufferEmpty,
        32 => UserControlEventType::BufferReady,
        _ => return Err(MessageDeserializationError::InvalidMessageFormat),
    };

    let mut stream_id = None;
    let mut buffer_length = None;
    let mut timestamp = None;

    match event_type {
        UserControlEventType::PingRequest | UserControlEventType::PingResponse => {
            timestamp = Some(cursor.read_u32::<BigEndian>()?);
        }

        UserControlEventType::SetBufferLength => {
            stream_id = Some(cursor.read_u32::<BigEndian>()?);
            buffer_length = Some(cursor.read_u32::<BigEndian>()?);
        }

        _ => stream_id = Some(cursor.read_u32::<BigEndian>()?),
    }

    Ok(RtmpMessage::UserControl {
        event_type,
        stream_id,
        buffer_length,
        timestamp,
    })
}

fn event_id(event_type: &UserControlEventType) -> u16 {
    match event_type {
        UserControlEventType::StreamBegin => 0,
        UserControlEventType::StreamEof => 1,
        UserControlEventType::StreamDry => 2,
        UserControlEventType::SetBufferLength => 3,
        UserControlEventType::StreamIsRecorded => 4,
        UserControlEventType::PingRequest => 6,
        UserControlEventType::PingResponse => 7,
        UserControlEventType::BufferEmpty => 31,
        UserControlEventType::BufferReady => 32,
    }
}

fn write_required<W: Write>(
    writer: &mut W,
    event_type: &UserControlEventType,
    field: &'static str,
    value: Option<u32>,
) -> Result<(), MessageSerializationError> {
    match value {
        Some(value) => writer.write_u32::<BigEndian>(value)?,
        None => {
            return Err(MessageSerializationError::MissingUserControlValue {
                event: event_name(event_type),
                field,
            })
        }
    }

    Ok(())
}

fn event_name(event_type: &UserControlEventType) -> &'static str {
    match event_type {
        UserControlEventType::StreamBegin => "StreamBegin",
        UserControlEventType::StreamEof => "StreamEof",
        UserControlEventType::StreamDry => "StreamDry",
        UserControlEventType::SetBufferLength => "SetBufferLength",
        UserControlEventType::StreamIsRecorded => "StreamIsRecorded",
        UserControlEventType::PingRequest => "PingRequest",
        UserControlEventType::PingResponse => "PingResponse",
        UserControlEventType::BufferEmpty => "BufferEmpty",
        UserControlEventType::BufferReady => "BufferReady",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_serialize_stream_begin_message() {
        let bytes = serialize(&UserControlEventType::StreamBegin, Some(555), None, None).unwrap();

        let mut expected = Vec::new();
        expected.write_u16::<BigEndian>(0).unwrap();
        expected.write_u32::<BigEndian>(555).unwrap();
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn can_serialize_set_buffer_length_message() {
        let bytes = serialize(&UserControlEventType::SetBufferLength, Some(1), Some(3000), None).unwrap();

        let mut expected = Vec::new();
        expected.write_u16::<BigEndian>(3).unwrap();
        expected.write_u32::<BigEndian>(1).unwrap();
        expected.write_u32::<BigEndian>(3000).unwrap();
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn can_deserialize_set_buffer_length_message() {
        let mut data = Vec::new();
        data.write_u16::<BigEndian>(3).unwrap();
        data.write_u32::<BigEndian>(1).unwrap();
        data.write_u32::<BigEndian>(3000).unwrap();

        let expected = RtmpMessage::UserControl {
            event_type: UserControlEventType::SetBufferLength,
            stream_id: Some(1),
            buffer_length: Some(3000),
            timestamp: None,
        };

        assert_eq!(deserialize(&data).unwrap(), expected);
    }

    #[test]
    fn can_deserialize_ping_request_message() {
        let mut data = Vec::new();
        data.write_u16::<BigEndian>(6).unwrap();
        data.write_u32::<BigEndian>(555).unwrap();

        let expected = RtmpMessage::UserControl {
            event_type: UserControlEventType::PingRequest,
            stream_id: None,
            buffer_length: None,
            timestamp: Some(555),
        };

        assert_eq!(deserialize(&data).unwrap(), expected);
    }

    #[test]
    fn can_deserialize_buffer_empty_message() {
        let mut data = Vec::new();
        data.write_u16::<BigEndian>(31).unwrap();
        data.write_u32::<BigEndian>(1).unwrap();

        match deserialize(&data).unwrap() {
            RtmpMessage::UserControl {
                event_type: UserControlEventType::BufferEmpty,
                stream_id: Some(1),
                ..
            } => (),
            x => panic!("Unexpected message {:?}", x),
        }
    }

    #[test]
    fn ping_without_timestamp_cannot_be_serialized() {
        match serialize(&UserControlEventType::PingResponse, None, None, None) {
            Err(MessageSerializationError::MissingUserControlValue { field: "timestamp", .. }) => (),
            x => panic!("Expected missing value error, got {:?}", x),
        }
    }

    #[test]
    fn unknown_event_is_invalid() {
        let mut data = Vec::new();
        data.write_u16::<BigEndian>(5).unwrap();
        data.write_u32::<BigEndian>(1).unwrap();

        match deserialize(&data) {
            Err(MessageDeserializationError::InvalidMessageFormat) => (),
            x => panic!("Expected invalid message format, got {:?}", x),
        }
    }
}
