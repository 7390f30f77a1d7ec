/*!
RTMP messages in two shapes.  A `MessagePayload` is the raw body plus its header fields
(timestamp, type id, message stream id) and is what the chunk layer moves around.
`RtmpMessage` is the typed view of a payload, decoded once by type id.
*/

mod aggregate;
mod deserialization_errors;
mod message_payload;
mod serialization_errors;
mod types;

pub use self::aggregate::{split_aggregate, AggregateBuilder, AGGREGATE_TAG_OVERHEAD};
pub use self::deserialization_errors::MessageDeserializationError;
pub use self::message_payload::MessagePayload;
pub use self::serialization_errors::MessageSerializationError;
pub use self::types::media::{is_audio_sequence_header, is_video_keyframe, is_video_sequence_header};

use bytes::Bytes;
use rml_amf0::Amf0Value;

pub const AUDIO_TYPE_ID: u8 = 8;
pub const VIDEO_TYPE_ID: u8 = 9;
pub const AMF0_DATA_TYPE_ID: u8 = 18;
pub const AMF0_COMMAND_TYPE_ID: u8 = 20;
pub const AGGREGATE_TYPE_ID: u8 = 22;

/// How a `SetPeerBandwidth` window is meant to be applied
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum PeerBandwidthLimitType {
    /// Use exactly this window
    Hard,

    /// Use the smaller of this window and the current one
    Soft,

    /// Hard if the previous limit was hard, otherwise ignored
    Dynamic,
}

/// Event codes carried in the first two bytes of a user control message
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum UserControlEventType {
    /// A stream is ready for use.  Chunk header compression restarts on both sides.
    StreamBegin,

    /// No more data will follow on the stream
    StreamEof,

    /// The stream has run out of data for now
    StreamDry,

    /// Client buffer length in milliseconds
    SetBufferLength,

    /// The stream plays a recording rather than a live feed
    StreamIsRecorded,

    /// Liveness check carrying a timestamp
    PingRequest,

    /// Reply to `PingRequest` with the same timestamp
    PingResponse,

    /// The client played through everything it had buffered
    BufferEmpty,

    /// The client has data buffered again after a `BufferEmpty`
    BufferReady,
}

/// The decoded form of a `MessagePayload`, one variant per message type id
#[derive(PartialEq, Debug, Clone)]
pub enum RtmpMessage {
    /// Chunks from the sender are split at `size` bytes from now on
    SetChunkSize { size: u32 },

    /// Drop the partial message on chunk stream `stream_id`
    Abort { stream_id: u32 },

    /// Sent once the peer's acknowledgement window has been received, carrying the total
    /// number of bytes received so far.
    Acknowledgement { sequence_number: u32 },

    /// Only the fields the event type uses are set
    UserControl {
        event_type: UserControlEventType,
        stream_id: Option<u32>,
        buffer_length: Option<u32>,
        timestamp: Option<u32>,
    },

    /// Bytes read between each `Acknowledgement`
    WindowAcknowledgement { size: u32 },

    /// Limits how fast the peer sends
    SetPeerBandwidth {
        size: u32,
        limit_type: PeerBandwidthLimitType,
    },

    AudioData { data: Bytes },

    VideoData { data: Bytes },

    /// Metadata and other data messages, such as `onMetaData`
    Amf0Data { values: Vec<Amf0Value> },

    /// `connect`, `play`, `_result` and the rest of the NetConnection/NetStream commands
    Amf0Command {
        command_name: String,
        transaction_id: f64,
        command_object: Amf0Value,
        additional_arguments: Vec<Amf0Value>,
    },

    /// Several audio, video or data messages bundled back to back in FLV tag layout
    Aggregate { data: Bytes },

    /// A message type the protocol defines (AMF3 and shared object messages) but that is
    /// passed along without being decoded
    Unsupported { type_id: u8, data: Bytes },
}

impl RtmpMessage {
    pub fn into_message_payload(
        self,
        timestamp: u32,
        message_stream_id: u32,
    ) -> Result<MessagePayload, MessageSerializationError> {
        MessagePayload::from_rtmp_message(self, timestamp, message_stream_id)
    }

    pub fn get_message_type_id(&self) -> u8 {
        match self {
            RtmpMessage::SetChunkSize { .. } => 1,
            RtmpMessage::Abort { .. } => 2,
            RtmpMessage::Acknowledgement { .. } => 3,
            RtmpMessage::UserControl { .. } => 4,
            RtmpMessage::WindowAcknowledgement { .. } => 5,
            RtmpMessage::SetPeerBandwidth { .. } => 6,
            RtmpMessage::AudioData { .. } => AUDIO_TYPE_ID,
            RtmpMessage::VideoData { .. } => VIDEO_TYPE_ID,
            RtmpMessage::Amf0Data { .. } => AMF0_DATA_TYPE_ID,
            RtmpMessage::Amf0Command { .. } => AMF0_COMMAND_TYPE_ID,
            RtmpMessage::Aggregate { .. } => AGGREGATE_TYPE_ID,
            RtmpMessage::Unsupported { type_id, .. } => *type_id,
        }
    }
}

/// True for a `StreamBegin` user control payload, which resets chunk header compression
pub fn is_stream_begin(payload: &MessagePayload) -> bool {
    payload.type_id == 4 && payload.data.len() >= 2 && payload.data[0] == 0 && payload.data[1] == 0
}
