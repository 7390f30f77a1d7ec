use super::PublishMode;
use crate::messages::MessagePayload;
use rml_amf0::Amf0Value;

/// Where a `play` command asked playback to begin
#[derive(PartialEq, Debug, Clone)]
pub enum PlayStartValue {
    /// Start value -2 or absent.  Prefer a live stream and fall back to a recording
    LiveOrRecorded,

    /// Start value -1.  Never fall back to a recording
    LiveOnly,

    /// Seek into the recording before the first delivery
    StartTimeInMilliseconds(u32),
}

/// Something the application has to know about or decide on
#[derive(Debug, PartialEq, Clone)]
pub enum ServerSessionEvent {
    /// Inbound chunks will be split at this size from now on
    ClientChunkSizeChanged { new_chunk_size: u32 },

    /// Answer with `accept_request` or `reject_request`
    ConnectionRequested { request_id: u32, app_name: String },

    /// Answer with `accept_request` or `reject_request`
    PublishStreamRequested {
        request_id: u32,
        app_name: String,
        stream_key: String,
        mode: PublishMode,
    },

    /// The publishing stream was closed or deleted
    PublishStreamFinished { app_name: String, stream_key: String },

    /// The publisher sent new `onMetaData` for its stream.  `@setDataFrame` wrappers have
    /// already been removed from the payload.
    StreamMetadataChanged {
        app_name: String,
        stream_key: String,
        payload: MessagePayload,
    },

    AudioDataReceived {
        app_name: String,
        stream_key: String,
        payload: MessagePayload,
    },

    VideoDataReceived {
        app_name: String,
        stream_key: String,
        payload: MessagePayload,
    },

    AggregateDataReceived {
        app_name: String,
        stream_key: String,
        payload: MessagePayload,
    },

    /// A command without built in handling, such as `FCPublish`
    UnhandleableAmf0Command {
        command_name: String,
        transaction_id: f64,
        command_object: Amf0Value,
        additional_values: Vec<Amf0Value>,
    },

    /// Answer with `accept_play_request` or `reject_request`
    PlayStreamRequested {
        request_id: u32,
        app_name: String,
        stream_key: String,
        start_at: PlayStartValue,
        duration: Option<u32>,
        reset: bool,
        stream_id: u32,
    },

    /// Playback on `stream_id` ended, because the media ran out, it failed, or the client
    /// closed the stream
    PlayStreamFinished {
        app_name: String,
        stream_key: String,
        stream_id: u32,
    },

    /// The peer's running count of bytes it has read
    AcknowledgementReceived { bytes_received: u32 },

    /// Echo of a ping timestamp
    PingResponseReceived { timestamp: u32 },
}
