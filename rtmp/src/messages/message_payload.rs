use bytes::Bytes;

use super::types::{amf0, protocol_control, user_control};
use super::{MessageDeserializationError, MessageSerializationError, RtmpMessage};

/// Represents a raw RTMP message
#[derive(PartialEq, Debug, Clone)]
pub struct MessagePayload {
    pub timestamp: u32,
    pub type_id: u8,
    pub message_stream_id: u32,
    pub data: Bytes,
}

impl MessagePayload {
    pub fn new() -> MessagePayload {
        MessagePayload {
            timestamp: 0,
            type_id: 0,
            message_stream_id: 0,
            data: Bytes::new(),
        }
    }

    /// Protocol control and user control messages (type ids 1 through 6) always travel on
    /// message stream 0 and are never restamped onto a media stream
    pub fn is_protocol_control(&self) -> bool {
        (1..=6).contains(&self.type_id)
    }

    pub fn to_rtmp_message(&self) -> Result<RtmpMessage, MessageDeserializationError> {
        let data = &self.data[..];
        match self.type_id {
            1 => protocol_control::deserialize_set_chunk_size(data),
            2 => Ok(RtmpMessage::Abort {
                stream_id: protocol_control::deserialize_u32(data)?,
            }),
            3 => Ok(RtmpMessage::Acknowledgement {
                sequence_number: protocol_control::deserialize_u32(data)?,
            }),
            4 => user_control::deserialize(data),
            5 => Ok(RtmpMessage::WindowAcknowledgement {
                size: protocol_control::deserialize_u32(data)?,
            }),
            6 => protocol_control::deserialize_set_peer_bandwidth(data),
            8 => Ok(RtmpMessage::AudioData { data: self.data.clone() }),
            9 => Ok(RtmpMessage::VideoData { data: self.data.clone() }),
            18 => amf0::deserialize_data(data),
            20 => amf0::deserialize_command(data),
            22 => Ok(RtmpMessage::Aggregate { data: self.data.clone() }),
            15 | 16 | 17 | 19 => Ok(RtmpMessage::Unsupported {
                type_id: self.type_id,
                data: self.data.clone(),
            }),
            type_id => Err(MessageDeserializationError::UnknownMessageType { type_id }),
        }
    }

    pub fn from_rtmp_message(
        message: RtmpMessage,
        timestamp: u32,
        message_stream_id: u32,
    ) -> Result<MessagePayload, MessageSerializationError> {
        let type_id = message.get_message_type_id();

        let data = match message {
            RtmpMessage::SetChunkSize { size } => protocol_control::serialize_set_chunk_size(size)?,

            RtmpMessage::Abort { stream_id } => protocol_control::serialize_u32(stream_id)?,

            RtmpMessage::Acknowledgement { sequence_number } => {
                protocol_control::serialize_u32(sequence_number)?
            }

            RtmpMessage::UserControl {
                event_type,
                stream_id,
                buffer_length,
                timestamp,
            } => user_control::serialize(&event_type, stream_id, buffer_length, timestamp)?,

            RtmpMessage::WindowAcknowledgement { size } => protocol_control::serialize_u32(size)?,

            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                protocol_control::serialize_set_peer_bandwidth(size, &limit_type)?
            }

            RtmpMessage::AudioData { data } => data,
            RtmpMessage::VideoData { data } => data,
            RtmpMessage::Aggregate { data } => data,
            RtmpMessage::Unsupported { data, .. } => data,

            RtmpMessage::Amf0Data { values } => amf0::serialize_data(&values)?,

            RtmpMessage::Amf0Command {
                command_name,
                transaction_id,
                command_object,
                additional_arguments,
            } => amf0::serialize_command(command_name, transaction_id, command_object, additional_arguments)?,
        };

        Ok(MessagePayload {
            timestamp,
            type_id,
            message_stream_id,
            data,
        })
    }
}

impl Default for MessagePayload {
    fn default() -> Self {
        MessagePayload::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{PeerBandwidthLimitType, UserControlEventType};
    use rml_amf0::Amf0Value;

    #[test]
    fn payload_carries_timestamp_stream_and_type() {
        let message = RtmpMessage::WindowAcknowledgement { size: 23 };
        let payload = MessagePayload::from_rtmp_message(message, 55, 52).unwrap();

        assert_eq!(payload.data.len(), 4, "Unexpected payload length");
        assert_eq!(payload.type_id, 5, "Incorrect type id");
        assert_eq!(payload.message_stream_id, 52, "Incorrect message stream id");
        assert_eq!(payload.timestamp, 55, "Incorrect timestamp");
    }

    #[test]
    fn can_get_rtmp_message_for_amf0_command_payload() {
        let message = RtmpMessage::Amf0Command {
            command_name: "test".to_string(),
            transaction_id: 15.0,
            command_object: Amf0Value::Number(23.0),
            additional_arguments: vec![Amf0Value::Null],
        };

        let payload = message.clone().into_message_payload(0, 15).unwrap();
        assert_eq!(payload.type_id, 20);
        assert_eq!(payload.to_rtmp_message().unwrap(), message);
    }

    #[test]
    fn can_get_rtmp_message_for_set_peer_bandwidth_payload() {
        let message = RtmpMessage::SetPeerBandwidth {
            size: 15,
            limit_type: PeerBandwidthLimitType::Hard,
        };

        let payload = message.clone().into_message_payload(0, 0).unwrap();
        assert_eq!(payload.to_rtmp_message().unwrap(), message);
    }

    #[test]
    fn can_get_rtmp_message_for_user_control_payload() {
        let message = RtmpMessage::UserControl {
            event_type: UserControlEventType::StreamIsRecorded,
            stream_id: Some(1),
            buffer_length: None,
            timestamp: None,
        };

        let payload = message.clone().into_message_payload(0, 0).unwrap();
        assert!(payload.is_protocol_control());
        assert_eq!(payload.to_rtmp_message().unwrap(), message);
    }

    #[test]
    fn media_payload_keeps_bytes_untouched() {
        let data = Bytes::from(vec![0x17_u8, 0, 1, 2]);
        let payload = RtmpMessage::VideoData { data: data.clone() }
            .into_message_payload(40, 1)
            .unwrap();

        assert!(!payload.is_protocol_control());
        assert_eq!(payload.data, data);
        assert_eq!(payload.to_rtmp_message().unwrap(), RtmpMessage::VideoData { data });
    }

    #[test]
    fn amf3_messages_are_unsupported_but_kept() {
        let payload = MessagePayload {
            timestamp: 0,
            type_id: 17,
            message_stream_id: 0,
            data: Bytes::from(vec![0_u8, 2, 3]),
        };

        match payload.to_rtmp_message().unwrap() {
            RtmpMessage::Unsupported { type_id: 17, data } => assert_eq!(&data[..], &[0, 2, 3]),
            x => panic!("Unexpected message {:?}", x),
        }
    }

    #[test]
    fn unknown_type_id_is_an_error() {
        let payload = MessagePayload {
            type_id: 33,
            ..MessagePayload::new()
        };

        match payload.to_rtmp_message() {
            Err(MessageDeserializationError::UnknownMessageType { type_id: 33 }) => (),
            x => panic!("Expected unknown message type error, got {:?}", x),
        }
    }
}
