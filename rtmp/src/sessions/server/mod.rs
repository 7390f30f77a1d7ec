mod active_stream;
mod config;
mod errors;
mod events;
mod outstanding_requests;
mod publish_mode;
mod result;


use rml_amf0::Amf0Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use self::active_stream::{ActiveStream, StreamState};
use self::outstanding_requests::OutstandingRequest;
use crate::chunk_io::{ChunkDeserializer, ChunkSerializer, Packet};
use crate::media::MediaSource;
use crate::messages::{
    MessagePayload, PeerBandwidthLimitType, RtmpMessage, UserControlEventType, AGGREGATE_TYPE_ID, AUDIO_TYPE_ID,
    VIDEO_TYPE_ID,
};
use crate::playback::{Clock, DeliveryTicket, PlaybackAction, PlaybackError, PlaybackEvent, PlaybackPublisher, SystemClock};

pub use self::config::ServerSessionConfig;
pub use self::errors::ServerSessionError;
pub use self::events::{PlayStartValue, ServerSessionEvent};
pub use self::publish_mode::PublishMode;
pub use self::result::ServerSessionResult;

/// Where the media for an accepted play request comes from
pub enum PlaySource {
    /// A seekable recording, paced out by the session
    Recorded(Box<dyn MediaSource + Send>),

    /// A live stream.  The application forwards its messages with
    /// `ServerSession::send_live_message`, and the config messages are sent right after
    /// the start messages so a late joining player can decode.
    Live { config_messages: Vec<MessagePayload> },
}

#[derive(PartialEq, Debug)]
enum SessionState {
    Started,
    Connected,
}

struct RecordedPlayback {
    stream_key: String,
    publisher: PlaybackPublisher<Box<dyn MediaSource + Send>>,
}

/// A session that represents the server side of a single RTMP connection.
///
/// The `ServerSession` encapsulates the process of parsing RTMP chunks coming in from a client
/// into RTMP messages and performs common server side workflows to handle those messages.  It can
/// either provide pre-serialized messages to be sent back to the client or events that
/// parent applications can perform custom logic against (like verifying if a connection request
/// should be accepted or not).
///
/// Recorded playback is paced by the session itself.  Media packets come back as
/// `OutboundMedia` results whose tickets must be returned once written, and pauses in the
/// pacing come back as `ScheduleDelivery` results that must be answered by calling
/// `deliver_timer_event` after the delay.  Completions and timers left over from before a
/// seek, pause or stop are ignored, so the application never has to cancel them.
///
/// Due to the header compression properties of the RTMP chunking protocol it is required that
/// all bytes **after** the handshake has been completed are passed into the `ServerSession`, that
/// all responses returned by the `ServerSession` are sent to the client **in order**, and that
/// no additional bytes are sent to the client.
pub struct ServerSession {
    config: ServerSessionConfig,
    clock: Arc<dyn Clock>,
    start_time_ms: u64,
    serializer: ChunkSerializer,
    deserializer: ChunkDeserializer,
    connected_app_name: Option<String>,
    current_state: SessionState,
    outstanding_requests: HashMap<u32, OutstandingRequest>,
    next_request_number: u32,
    object_encoding: f64,
    active_streams: HashMap<u32, ActiveStream>,
    next_stream_id: u32,
    playback: Option<RecordedPlayback>,
    client_buffer_duration_ms: Option<u32>,
    peer_window_ack_size: Option<u32>,
    bytes_received: u64,
    bytes_received_at_last_ack: u64,
    bytes_sent: u64,
}

impl ServerSession {
    /// Creates a new server session.
    ///
    /// As part of the initial creation it automatically creates the initial outbound RTMP messages
    /// that the RTMP message protocol requires to confirm to the client that it can stream on
    /// stream id 0 (as well as other important initial information)
    pub fn new(config: ServerSessionConfig) -> Result<(ServerSession, Vec<ServerSessionResult>), ServerSessionError> {
        ServerSession::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Creates a new server session that paces playback against the given clock
    pub fn with_clock(
        config: ServerSessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<(ServerSession, Vec<ServerSessionResult>), ServerSessionError> {
        let start_time_ms = clock.now_ms();
        let mut session = ServerSession {
            config,
            clock,
            start_time_ms,
            serializer: ChunkSerializer::new(),
            deserializer: ChunkDeserializer::new(),
            connected_app_name: None,
            current_state: SessionState::Started,
            outstanding_requests: HashMap::new(),
            next_request_number: 0,
            object_encoding: 0.0,
            active_streams: HashMap::new(),
            next_stream_id: 1,
            playback: None,
            client_buffer_duration_ms: None,
            peer_window_ack_size: None,
            bytes_received: 0,
            bytes_received_at_last_ack: 0,
            bytes_sent: 0,
        };

        let mut results = Vec::with_capacity(4);

        let chunk_size_packet = session.serializer.set_max_chunk_size(session.config.chunk_size, 0)?;
        session.bytes_sent += chunk_size_packet.bytes.len() as u64;
        results.push(ServerSessionResult::OutboundResponse(chunk_size_packet));

        let window_ack_message = RtmpMessage::WindowAcknowledgement {
            size: session.config.window_ack_size,
        };

        let window_ack_packet = session.serialize_message(window_ack_message, 0, true)?;
        results.push(ServerSessionResult::OutboundResponse(window_ack_packet));

        let begin_message = RtmpMessage::UserControl {
            event_type: UserControlEventType::StreamBegin,
            stream_id: Some(0),
            buffer_length: None,
            timestamp: None,
        };

        let begin_packet = session.serialize_message(begin_message, 0, true)?;
        results.push(ServerSessionResult::OutboundResponse(begin_packet));

        let peer_message = RtmpMessage::SetPeerBandwidth {
            size: session.config.peer_bandwidth,
            limit_type: PeerBandwidthLimitType::Dynamic,
        };

        let peer_packet = session.serialize_message(peer_message, 0, true)?;
        results.push(ServerSessionResult::OutboundResponse(peer_packet));

        Ok((session, results))
    }

    /// Takes in bytes that are encoding RTMP chunks and returns any responses or events that can
    /// be reacted to.
    pub fn handle_input(&mut self, bytes: &[u8]) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        self.bytes_received += bytes.len() as u64;

        let mut results = Vec::new();
        let mut bytes_to_process = bytes;
        while let Some(payload) = self.deserializer.get_next_message(bytes_to_process)? {
            bytes_to_process = &[];
            let mut message_results = self.handle_payload(payload)?;
            results.append(&mut message_results);
        }

        if let Some(packet) = self.acknowledge_received_bytes()? {
            results.push(ServerSessionResult::OutboundResponse(packet));
        }

        Ok(results)
    }

    /// Tells the server session that it should accept an outstanding connection or publish
    /// request.  Accepting a play request this way starts live playback without any config
    /// messages; use `accept_play_request` to pick the source.
    pub fn accept_request(&mut self, request_id: u32) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let request = match self.outstanding_requests.remove(&request_id) {
            Some(x) => x,
            None => return Err(ServerSessionError::InvalidRequestId),
        };

        match request {
            OutstandingRequest::ConnectionRequest { app_name, transaction_id } => {
                self.accept_connection_request(app_name, transaction_id)
            }

            OutstandingRequest::PublishRequested {
                stream_key,
                mode,
                stream_id,
            } => self.accept_publish_request(stream_id, stream_key, mode),

            OutstandingRequest::PlayRequested {
                stream_key,
                stream_id,
                start_at,
                duration,
                reset,
            } => self.start_playback(
                stream_id,
                stream_key,
                start_at,
                duration,
                reset,
                PlaySource::Live {
                    config_messages: Vec::new(),
                },
            ),
        }
    }

    /// Accepts an outstanding play request, playing the media from the given source
    pub fn accept_play_request(
        &mut self,
        request_id: u32,
        source: PlaySource,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        match self.outstanding_requests.remove(&request_id) {
            Some(OutstandingRequest::PlayRequested {
                stream_key,
                stream_id,
                start_at,
                duration,
                reset,
            }) => self.start_playback(stream_id, stream_key, start_at, duration, reset, source),

            Some(other) => {
                self.outstanding_requests.insert(request_id, other);
                Err(ServerSessionError::InvalidRequestId)
            }

            None => Err(ServerSessionError::InvalidRequestId),
        }
    }

    /// Tells the server session that it should reject an outstanding request
    pub fn reject_request(&mut self, request_id: u32) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let request = match self.outstanding_requests.remove(&request_id) {
            Some(x) => x,
            None => return Err(ServerSessionError::InvalidRequestId),
        };

        let packet = match request {
            OutstandingRequest::ConnectionRequest { app_name, transaction_id } => {
                let description = format!("Connection to app '{}' was rejected", app_name);
                let status = create_status_object("error", "NetConnection.Connect.Rejected", &description);
                self.create_error_response(transaction_id, Amf0Value::Null, vec![Amf0Value::Object(status)], 0)?
            }

            OutstandingRequest::PublishRequested { stream_key, stream_id, .. } => {
                let description = format!("Publishing on stream key {} was rejected", stream_key);
                self.create_status_packet(stream_id, "error", "NetStream.Publish.BadName", &description, 0)?
            }

            OutstandingRequest::PlayRequested { stream_key, stream_id, .. } => {
                let description = format!("Stream not found: {}", stream_key);
                self.create_status_packet(stream_id, "error", "NetStream.Play.Failed", &description, 0)?
            }
        };

        Ok(vec![ServerSessionResult::OutboundResponse(packet)])
    }

    /// Reports that the packet handed out with `ticket` has been written to the client
    pub fn delivery_completed(&mut self, ticket: DeliveryTicket) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let outcome = match self.playback.as_mut() {
            Some(playback) => playback.publisher.drive(PlaybackEvent::WriteCompleted(ticket)),
            None => return Ok(Vec::new()),
        };

        self.process_playback_outcome(outcome)
    }

    /// Reports that the delay from a `ScheduleDelivery` result has passed
    pub fn deliver_timer_event(&mut self, conversation_id: u32) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let outcome = match self.playback.as_mut() {
            Some(playback) => playback.publisher.deliver_timer_event(conversation_id),
            None => return Ok(Vec::new()),
        };

        self.process_playback_outcome(outcome)
    }

    /// Prepares a message from a live stream for a client playing it on `stream_id`
    pub fn send_live_message(&mut self, stream_id: u32, payload: &MessagePayload) -> Result<Packet, ServerSessionError> {
        match self.active_streams.get(&stream_id) {
            Some(ActiveStream {
                current_state: StreamState::Playing { is_live: true, .. },
            }) => (),

            _ => {
                return Err(ServerSessionError::ActionAttemptedOnInactiveStream {
                    action: "live playback".to_string(),
                    stream_id,
                })
            }
        }

        let mut payload = payload.clone();
        payload.message_stream_id = stream_id;
        self.serialize_payload(&payload, false)
    }

    /// Tells a client playing a live stream that the publisher went away
    pub fn end_live_playback(&mut self, stream_id: u32) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let stream_key = match self.active_streams.get_mut(&stream_id) {
            Some(stream) => match &stream.current_state {
                StreamState::Playing { stream_key, is_live: true } => {
                    let stream_key = stream_key.clone();
                    stream.current_state = StreamState::Created;
                    stream_key
                }

                _ => return Ok(Vec::new()),
            },

            None => return Ok(Vec::new()),
        };

        let description = format!("{} is now unpublished", stream_key);
        let status_packet = self.create_status_packet(stream_id, "status", "NetStream.Play.UnpublishNotify", &description, 0)?;
        let eof_packet = self.create_user_control_packet(UserControlEventType::StreamEof, stream_id)?;

        Ok(vec![
            ServerSessionResult::OutboundResponse(status_packet),
            ServerSessionResult::OutboundResponse(eof_packet),
            ServerSessionResult::RaisedEvent(ServerSessionEvent::PlayStreamFinished {
                app_name: self.app_name(),
                stream_key,
                stream_id,
            }),
        ])
    }

    /// Pauses recorded playback.  Writes still in flight are finished but playback will not
    /// continue until it is resumed.
    pub fn pause_playback(&mut self) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let (stream_id, stream_key) = match self.playback.as_mut() {
            Some(playback) if playback.publisher.is_started() && !playback.publisher.is_paused() => {
                playback.publisher.pause();
                (playback.publisher.stream_id(), playback.stream_key.clone())
            }

            _ => return Ok(Vec::new()),
        };

        let description = format!("Pausing {}", stream_key);
        let packet = self.create_status_packet(stream_id, "status", "NetStream.Pause.Notify", &description, 0)?;
        Ok(vec![ServerSessionResult::OutboundResponse(packet)])
    }

    /// Stops recorded playback, sending the client the end of stream messages
    pub fn stop_playback(&mut self) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let actions = match self.playback.as_mut() {
            Some(playback) => playback.publisher.stop(),
            None => return Ok(Vec::new()),
        };

        self.process_playback_outcome(Ok(actions))
    }

    pub fn is_paused(&self) -> bool {
        match &self.playback {
            Some(playback) => playback.publisher.is_paused(),
            None => false,
        }
    }

    pub fn is_started(&self) -> bool {
        match &self.playback {
            Some(playback) => playback.publisher.is_started(),
            None => false,
        }
    }

    /// Ends any recorded playback without sending anything, for when the connection is gone
    pub fn close(&mut self) {
        if let Some(mut playback) = self.playback.take() {
            playback.publisher.close();
        }
    }

    fn handle_payload(&mut self, payload: MessagePayload) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let message = payload.to_rtmp_message()?;
        let results = match message {
            RtmpMessage::SetChunkSize { size } => {
                // The deserializer has already switched to the new size
                vec![ServerSessionResult::RaisedEvent(ServerSessionEvent::ClientChunkSizeChanged {
                    new_chunk_size: size,
                })]
            }

            RtmpMessage::Abort { .. } => Vec::new(),

            RtmpMessage::Acknowledgement { sequence_number } => {
                vec![ServerSessionResult::RaisedEvent(ServerSessionEvent::AcknowledgementReceived {
                    bytes_received: sequence_number,
                })]
            }

            RtmpMessage::UserControl {
                event_type,
                buffer_length,
                timestamp,
                ..
            } => self.handle_user_control(event_type, buffer_length, timestamp)?,

            RtmpMessage::WindowAcknowledgement { size } => {
                debug!(size, "Client set its acknowledgement window");
                self.peer_window_ack_size = Some(size);
                Vec::new()
            }

            RtmpMessage::SetPeerBandwidth { size, .. } => self.handle_set_peer_bandwidth(size)?,

            RtmpMessage::AudioData { .. } | RtmpMessage::VideoData { .. } | RtmpMessage::Aggregate { .. } => {
                self.handle_published_media(payload)
            }

            RtmpMessage::Amf0Data { values } => self.handle_amf0_data(values, payload)?,

            RtmpMessage::Amf0Command {
                command_name,
                transaction_id,
                command_object,
                additional_arguments,
            } => self.handle_amf0_command(
                payload.message_stream_id,
                command_name,
                transaction_id,
                command_object,
                additional_arguments,
            )?,

            RtmpMessage::Unsupported { .. } => vec![ServerSessionResult::UnhandleableMessageReceived(payload)],
        };

        Ok(results)
    }

    fn handle_user_control(
        &mut self,
        event_type: UserControlEventType,
        buffer_length: Option<u32>,
        timestamp: Option<u32>,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        match (event_type, buffer_length, timestamp) {
            (UserControlEventType::SetBufferLength, Some(buffer_length), _) => {
                debug!(buffer_length, "Client set its buffer length");
                self.client_buffer_duration_ms = Some(buffer_length);
                if let Some(playback) = self.playback.as_mut() {
                    playback.publisher.set_buffer_duration(buffer_length);
                }

                Ok(Vec::new())
            }

            (UserControlEventType::PingRequest, _, Some(timestamp)) => {
                let message = RtmpMessage::UserControl {
                    event_type: UserControlEventType::PingResponse,
                    stream_id: None,
                    buffer_length: None,
                    timestamp: Some(timestamp),
                };

                let packet = self.serialize_message(message, 0, false)?;
                Ok(vec![ServerSessionResult::OutboundResponse(packet)])
            }

            (UserControlEventType::PingResponse, _, Some(timestamp)) => Ok(vec![ServerSessionResult::RaisedEvent(
                ServerSessionEvent::PingResponseReceived { timestamp },
            )]),

            (event_type, _, _) => {
                debug!(?event_type, "Ignoring user control event");
                Ok(Vec::new())
            }
        }
    }

    fn handle_set_peer_bandwidth(&mut self, size: u32) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        if size == self.config.window_ack_size {
            return Ok(Vec::new());
        }

        let message = RtmpMessage::WindowAcknowledgement {
            size: self.config.window_ack_size,
        };

        let packet = self.serialize_message(message, 0, false)?;
        Ok(vec![ServerSessionResult::OutboundResponse(packet)])
    }

    fn handle_published_media(&self, payload: MessagePayload) -> Vec<ServerSessionResult> {
        let stream_key = match self.publishing_stream_key(payload.message_stream_id) {
            Some(x) => x,
            None => return Vec::new(), // Media sent over a stream that isn't publishing, ignore it
        };

        let app_name = self.app_name();
        let event = match payload.type_id {
            AUDIO_TYPE_ID => ServerSessionEvent::AudioDataReceived {
                app_name,
                stream_key,
                payload,
            },

            VIDEO_TYPE_ID => ServerSessionEvent::VideoDataReceived {
                app_name,
                stream_key,
                payload,
            },

            AGGREGATE_TYPE_ID => ServerSessionEvent::AggregateDataReceived {
                app_name,
                stream_key,
                payload,
            },

            _ => return vec![ServerSessionResult::UnhandleableMessageReceived(payload)],
        };

        vec![ServerSessionResult::RaisedEvent(event)]
    }

    fn handle_amf0_data(
        &mut self,
        mut values: Vec<Amf0Value>,
        payload: MessagePayload,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let stream_key = match self.publishing_stream_key(payload.message_stream_id) {
            Some(x) => x,
            None => return Ok(Vec::new()),
        };

        let payload = match values.first() {
            Some(Amf0Value::Utf8String(name)) if name == "@setDataFrame" => {
                values.remove(0);
                RtmpMessage::Amf0Data { values: values.clone() }
                    .into_message_payload(payload.timestamp, payload.message_stream_id)?
            }

            _ => payload,
        };

        match values.first() {
            Some(Amf0Value::Utf8String(name)) if name == "onMetaData" => (),
            _ => return Ok(Vec::new()),
        }

        let event = ServerSessionEvent::StreamMetadataChanged {
            app_name: self.app_name(),
            stream_key,
            payload,
        };

        Ok(vec![ServerSessionResult::RaisedEvent(event)])
    }

    fn handle_amf0_command(
        &mut self,
        stream_id: u32,
        name: String,
        transaction_id: f64,
        command_object: Amf0Value,
        additional_args: Vec<Amf0Value>,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let results = match name.as_str() {
            "connect" => self.handle_command_connect(transaction_id, command_object)?,
            "closeStream" => self.handle_command_close_stream(stream_id, additional_args)?,
            "createStream" => self.handle_command_create_stream(transaction_id)?,
            "deleteStream" => self.handle_command_delete_stream(additional_args)?,
            "play" => self.handle_command_play(stream_id, transaction_id, additional_args)?,
            "publish" => self.handle_command_publish(stream_id, transaction_id, additional_args)?,
            "pause" => self.handle_command_pause(additional_args)?,
            "seek" => self.handle_command_seek(additional_args)?,

            _ => vec![ServerSessionResult::RaisedEvent(ServerSessionEvent::UnhandleableAmf0Command {
                command_name: name,
                additional_values: additional_args,
                transaction_id,
                command_object,
            })],
        };

        Ok(results)
    }

    fn handle_command_connect(
        &mut self,
        transaction_id: f64,
        command_object: Amf0Value,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let mut properties = match command_object {
            Amf0Value::Object(properties) => properties,
            _ => return Err(ServerSessionError::NoAppNameForConnectionRequest),
        };

        let app_name = match properties.remove("app") {
            Some(Amf0Value::Utf8String(mut app)) => {
                if app.ends_with('/') {
                    app.pop();
                }

                app
            }

            _ => return Err(ServerSessionError::NoAppNameForConnectionRequest),
        };

        self.object_encoding = match properties.remove("objectEncoding") {
            Some(Amf0Value::Number(number)) => number,
            _ => 0.0,
        };

        let request = OutstandingRequest::ConnectionRequest {
            app_name: app_name.clone(),
            transaction_id,
        };

        let request_id = self.add_outstanding_request(request);
        let event = ServerSessionEvent::ConnectionRequested { app_name, request_id };

        Ok(vec![ServerSessionResult::RaisedEvent(event)])
    }

    fn handle_command_close_stream(
        &mut self,
        message_stream_id: u32,
        arguments: Vec<Amf0Value>,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        if self.current_state != SessionState::Connected {
            return Ok(Vec::new());
        }

        // Some clients name the stream in the first argument, others only send the command
        // on the stream being closed
        let stream_id = match arguments.first() {
            Some(Amf0Value::Number(x)) => *x as u32,
            _ => message_stream_id,
        };

        let results = self.end_stream_activity(stream_id);
        if let Some(stream) = self.active_streams.get_mut(&stream_id) {
            // As far as we are concerned, a created and closed stream are equivalent.  Both
            // allow reusing the stream
            stream.current_state = StreamState::Created;
        }

        Ok(results)
    }

    fn handle_command_create_stream(&mut self, transaction_id: f64) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let new_stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        self.active_streams.insert(new_stream_id, ActiveStream::new());

        let packet = self.create_success_response(
            transaction_id,
            Amf0Value::Null,
            vec![Amf0Value::Number(f64::from(new_stream_id))],
            0,
        )?;

        Ok(vec![ServerSessionResult::OutboundResponse(packet)])
    }

    fn handle_command_delete_stream(&mut self, arguments: Vec<Amf0Value>) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        if self.current_state != SessionState::Connected {
            return Ok(Vec::new());
        }

        // First argument is expected to be the stream id
        let stream_id = match arguments.first() {
            Some(Amf0Value::Number(x)) => *x as u32,
            _ => return Ok(Vec::new()),
        };

        let results = self.end_stream_activity(stream_id);
        self.active_streams.remove(&stream_id);
        Ok(results)
    }

    fn handle_command_publish(
        &mut self,
        stream_id: u32,
        transaction_id: f64,
        mut arguments: Vec<Amf0Value>,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        if arguments.len() < 2 {
            let packet = self.create_error_packet("NetStream.Publish.Start", "Invalid publish arguments", transaction_id, stream_id)?;
            return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
        }

        if self.current_state != SessionState::Connected {
            let packet = self.create_error_packet("NetStream.Publish.Start", "Can't publish before connecting", transaction_id, stream_id)?;
            return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
        }

        let stream_key = match arguments.remove(0) {
            Amf0Value::Utf8String(stream_key) => stream_key,
            _ => {
                let packet = self.create_error_packet("NetStream.Publish.Start", "Invalid publish arguments", transaction_id, stream_id)?;
                return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
            }
        };

        let mode = match arguments.remove(0) {
            Amf0Value::Utf8String(ref raw_mode) if raw_mode == "live" => PublishMode::Live,
            Amf0Value::Utf8String(ref raw_mode) if raw_mode == "append" => PublishMode::Append,
            Amf0Value::Utf8String(ref raw_mode) if raw_mode == "record" => PublishMode::Record,
            _ => {
                let packet = self.create_error_packet("NetStream.Publish.Start", "Invalid publish mode given", transaction_id, stream_id)?;
                return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
            }
        };

        let request = OutstandingRequest::PublishRequested {
            stream_key: stream_key.clone(),
            mode: mode.clone(),
            stream_id,
        };

        let request_id = self.add_outstanding_request(request);
        let event = ServerSessionEvent::PublishStreamRequested {
            request_id,
            app_name: self.app_name(),
            stream_key,
            mode,
        };

        Ok(vec![ServerSessionResult::RaisedEvent(event)])
    }

    fn handle_command_play(
        &mut self,
        stream_id: u32,
        transaction_id: f64,
        mut arguments: Vec<Amf0Value>,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        if arguments.is_empty() {
            let packet = self.create_error_packet("NetStream.Play.Start", "Invalid play arguments", transaction_id, stream_id)?;
            return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
        }

        if self.current_state != SessionState::Connected {
            let packet = self.create_error_packet("NetStream.Play.Start", "Can't play before connecting", transaction_id, stream_id)?;
            return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
        }

        let stream_key = match arguments.remove(0) {
            Amf0Value::Utf8String(stream_key) => stream_key,
            _ => {
                let packet = self.create_error_packet("NetStream.Play.Start", "Invalid play arguments", transaction_id, stream_id)?;
                return Ok(vec![ServerSessionResult::OutboundResponse(packet)]);
            }
        };

        let mut arguments = arguments.into_iter();
        let start_at = match arguments.next() {
            Some(Amf0Value::Number(x)) if x == -1.0 => PlayStartValue::LiveOnly,
            Some(Amf0Value::Number(x)) if x >= 0.0 => PlayStartValue::StartTimeInMilliseconds(x as u32),
            _ => PlayStartValue::LiveOrRecorded,
        };

        let duration = match arguments.next() {
            Some(Amf0Value::Number(x)) if x >= 0.0 => Some(x as u32),
            _ => None,
        };

        let reset = match arguments.next() {
            Some(Amf0Value::Boolean(x)) => x,
            _ => true,
        };

        debug!(stream_key = %stream_key, ?start_at, ?duration, reset, "Play requested");

        let request = OutstandingRequest::PlayRequested {
            stream_key: stream_key.clone(),
            stream_id,
            start_at: start_at.clone(),
            duration,
            reset,
        };

        let request_id = self.add_outstanding_request(request);
        let event = ServerSessionEvent::PlayStreamRequested {
            request_id,
            app_name: self.app_name(),
            stream_key,
            start_at,
            duration,
            reset,
            stream_id,
        };

        Ok(vec![ServerSessionResult::RaisedEvent(event)])
    }

    fn handle_command_pause(&mut self, arguments: Vec<Amf0Value>) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let (pause, position_ms) = match (arguments.get(0), arguments.get(1)) {
            (Some(Amf0Value::Boolean(pause)), Some(Amf0Value::Number(position))) => (*pause, position.max(0.0) as u32),
            (Some(Amf0Value::Boolean(pause)), _) => (*pause, 0),
            _ => return Ok(Vec::new()),
        };

        if pause {
            return self.pause_playback();
        }

        let (stream_id, stream_key) = match &self.playback {
            Some(playback) => (playback.publisher.stream_id(), playback.stream_key.clone()),
            None => {
                debug!("Ignoring unpause without recorded playback");
                return Ok(Vec::new());
            }
        };

        let description = format!("Unpausing {}", stream_key);
        let notify = self.create_status_payload(stream_id, "NetStream.Unpause.Notify", &description)?;
        let extras = self.create_play_start_messages(stream_id, &stream_key, Some(notify), true)?;
        let outcome = match self.playback.as_mut() {
            Some(playback) => playback.publisher.resume(Some(position_ms), extras),
            None => return Ok(Vec::new()),
        };

        self.process_playback_outcome(outcome)
    }

    fn handle_command_seek(&mut self, arguments: Vec<Amf0Value>) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let position_ms = match arguments.get(0) {
            Some(Amf0Value::Number(position)) => position.max(0.0) as u32,
            _ => return Ok(Vec::new()),
        };

        let (stream_id, stream_key) = match &self.playback {
            Some(playback) if !playback.publisher.is_paused() => (playback.publisher.stream_id(), playback.stream_key.clone()),
            _ => {
                debug!(position_ms, "Ignoring seek while not playing a recording");
                return Ok(Vec::new());
            }
        };

        let description = format!("Seeking {} (stream ID: {}).", position_ms, stream_id);
        let notify = self.create_status_payload(stream_id, "NetStream.Seek.Notify", &description)?;
        let extras = self.create_play_start_messages(stream_id, &stream_key, Some(notify), true)?;
        let outcome = match self.playback.as_mut() {
            Some(playback) => playback.publisher.seek(position_ms, extras),
            None => return Ok(Vec::new()),
        };

        self.process_playback_outcome(outcome)
    }

    fn accept_connection_request(&mut self, app_name: String, transaction_id: f64) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        info!(app_name = %app_name, "Connection accepted");
        self.connected_app_name = Some(app_name.clone());
        self.current_state = SessionState::Connected;

        let mut command_object_properties = HashMap::new();
        command_object_properties.insert("fmsVer".to_string(), Amf0Value::Utf8String(self.config.fms_version.clone()));
        command_object_properties.insert("capabilities".to_string(), Amf0Value::Number(31.0));

        let description = format!("Successfully connected on app: {}", app_name);
        let mut additional_properties = create_status_object("status", "NetConnection.Connect.Success", &description);
        additional_properties.insert("objectEncoding".to_string(), Amf0Value::Number(self.object_encoding));

        let result_packet = self.create_success_response(
            transaction_id,
            Amf0Value::Object(command_object_properties),
            vec![Amf0Value::Object(additional_properties)],
            0,
        )?;

        let bw_done_message = RtmpMessage::Amf0Command {
            command_name: "onBWDone".to_string(),
            transaction_id: 0.0,
            command_object: Amf0Value::Null,
            additional_arguments: vec![Amf0Value::Number(8192_f64)],
        };

        let bw_done_packet = self.serialize_message(bw_done_message, 0, false)?;

        Ok(vec![
            ServerSessionResult::OutboundResponse(result_packet),
            ServerSessionResult::OutboundResponse(bw_done_packet),
        ])
    }

    fn accept_publish_request(
        &mut self,
        stream_id: u32,
        stream_key: String,
        mode: PublishMode,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        match self.active_streams.get_mut(&stream_id) {
            Some(active_stream) => {
                active_stream.current_state = StreamState::Publishing {
                    stream_key: stream_key.clone(),
                    mode,
                };
            }

            None => {
                return Err(ServerSessionError::ActionAttemptedOnInactiveStream {
                    action: "publish".to_string(),
                    stream_id,
                })
            }
        };

        let stream_begin_packet = self.create_user_control_packet(UserControlEventType::StreamBegin, stream_id)?;
        let description = format!("Successfully started publishing on stream key {}", stream_key);
        let publish_packet = self.create_status_packet(stream_id, "status", "NetStream.Publish.Start", &description, 0)?;

        Ok(vec![
            ServerSessionResult::OutboundResponse(stream_begin_packet),
            ServerSessionResult::OutboundResponse(publish_packet),
        ])
    }

    fn start_playback(
        &mut self,
        stream_id: u32,
        stream_key: String,
        start_at: PlayStartValue,
        duration: Option<u32>,
        reset: bool,
        source: PlaySource,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let is_live = match source {
            PlaySource::Live { .. } => true,
            PlaySource::Recorded(_) => false,
        };

        match self.active_streams.get_mut(&stream_id) {
            Some(active_stream) => {
                active_stream.current_state = StreamState::Playing {
                    stream_key: stream_key.clone(),
                    is_live,
                };
            }

            None => {
                return Err(ServerSessionError::ActionAttemptedOnInactiveStream {
                    action: "play".to_string(),
                    stream_id,
                })
            }
        }

        let variation = if reset {
            let description = format!("Playing and resetting {}.", stream_key);
            Some(self.create_status_payload(stream_id, "NetStream.Play.Reset", &description)?)
        } else {
            None
        };

        let extras = self.create_play_start_messages(stream_id, &stream_key, variation, !is_live)?;
        match source {
            PlaySource::Live { config_messages } => {
                info!(stream_key = %stream_key, stream_id, "Live playback started");

                let mut results = Vec::with_capacity(extras.len() + config_messages.len());
                for mut payload in extras.into_iter().chain(config_messages) {
                    if !payload.is_protocol_control() {
                        payload.message_stream_id = stream_id;
                    }

                    let packet = self.serialize_payload(&payload, false)?;
                    results.push(ServerSessionResult::OutboundResponse(packet));
                }

                Ok(results)
            }

            PlaySource::Recorded(source) => {
                if let Some(mut previous) = self.playback.take() {
                    debug!(stream_key = %previous.stream_key, "Replacing recorded playback");
                    previous.publisher.close();
                }

                let mut playback_config = self.config.playback.clone();
                if let Some(buffer_length) = self.client_buffer_duration_ms.filter(|x| *x > 0) {
                    playback_config.buffer_duration_ms = buffer_length;
                }

                let seek_request = match start_at {
                    PlayStartValue::StartTimeInMilliseconds(position) => Some(position),
                    _ => None,
                };

                info!(stream_key = %stream_key, stream_id, ?seek_request, ?duration, "Recorded playback started");

                let mut publisher = PlaybackPublisher::new(source, stream_id, playback_config, Arc::clone(&self.clock));
                let outcome = publisher.start(seek_request, duration, extras);
                self.playback = Some(RecordedPlayback { stream_key, publisher });
                self.process_playback_outcome(outcome)
            }
        }
    }

    fn process_playback_outcome(
        &mut self,
        outcome: Result<Vec<PlaybackAction>, PlaybackError>,
    ) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let actions = match outcome {
            Ok(actions) => actions,
            Err(error) => return self.fail_playback(error),
        };

        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                PlaybackAction::Send(payload) => {
                    let packet = self.serialize_payload(&payload, false)?;
                    results.push(ServerSessionResult::OutboundResponse(packet));
                }

                PlaybackAction::Deliver { message, ticket } => {
                    let packet = self.serialize_payload(&message, false)?;
                    results.push(ServerSessionResult::OutboundMedia { packet, ticket });
                }

                PlaybackAction::ScheduleTimer {
                    conversation_id,
                    delay_ms,
                } => results.push(ServerSessionResult::ScheduleDelivery {
                    conversation_id,
                    delay_ms,
                }),

                PlaybackAction::Finished { position_ms } => {
                    let mut finish_results = self.finish_playback(position_ms)?;
                    results.append(&mut finish_results);
                }
            }
        }

        Ok(results)
    }

    fn finish_playback(&mut self, position_ms: u32) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let mut playback = match self.playback.take() {
            Some(x) => x,
            None => return Ok(Vec::new()),
        };

        playback.publisher.close();
        let stream_id = playback.publisher.stream_id();
        self.reset_playing_stream(stream_id);

        let mut status_properties = HashMap::new();
        status_properties.insert("level".to_string(), Amf0Value::Utf8String("status".to_string()));
        status_properties.insert("code".to_string(), Amf0Value::Utf8String("NetStream.Play.Complete".to_string()));
        status_properties.insert("duration".to_string(), Amf0Value::Number(f64::from(position_ms / 1000)));
        status_properties.insert("bytes".to_string(), Amf0Value::Number(self.bytes_sent as f64));

        let play_status_message = RtmpMessage::Amf0Data {
            values: vec![
                Amf0Value::Utf8String("onPlayStatus".to_string()),
                Amf0Value::Object(status_properties),
            ],
        };

        let play_status_packet = self.serialize_message_at(play_status_message, position_ms, stream_id)?;

        let description = format!("Stopped playing {}.", playback.stream_key);
        let stop_packet = self.create_status_packet(stream_id, "status", "NetStream.Play.Stop", &description, position_ms)?;
        let eof_packet = self.create_user_control_packet(UserControlEventType::StreamEof, stream_id)?;

        Ok(vec![
            ServerSessionResult::OutboundResponse(play_status_packet),
            ServerSessionResult::OutboundResponse(stop_packet),
            ServerSessionResult::OutboundResponse(eof_packet),
            ServerSessionResult::RaisedEvent(ServerSessionEvent::PlayStreamFinished {
                app_name: self.app_name(),
                stream_key: playback.stream_key,
                stream_id,
            }),
        ])
    }

    fn fail_playback(&mut self, error: PlaybackError) -> Result<Vec<ServerSessionResult>, ServerSessionError> {
        let mut playback = match self.playback.take() {
            Some(x) => x,
            None => return Ok(Vec::new()),
        };

        warn!(stream_key = %playback.stream_key, error = %error, "Recorded playback failed");
        playback.publisher.close();
        let stream_id = playback.publisher.stream_id();
        self.reset_playing_stream(stream_id);

        let description = format!("Playback of {} failed: {}", playback.stream_key, error);
        let packet = self.create_status_packet(stream_id, "error", "NetStream.Play.Failed", &description, 0)?;

        Ok(vec![
            ServerSessionResult::OutboundResponse(packet),
            ServerSessionResult::RaisedEvent(ServerSessionEvent::PlayStreamFinished {
                app_name: self.app_name(),
                stream_key: playback.stream_key,
                stream_id,
            }),
        ])
    }

    /// Drops whatever the stream was doing, without sending anything to the client
    fn end_stream_activity(&mut self, stream_id: u32) -> Vec<ServerSessionResult> {
        let app_name = self.app_name();
        let event = match self.active_streams.get(&stream_id).map(|stream| &stream.current_state) {
            Some(StreamState::Publishing { stream_key, .. }) => ServerSessionEvent::PublishStreamFinished {
                app_name,
                stream_key: stream_key.clone(),
            },

            Some(StreamState::Playing { stream_key, .. }) => ServerSessionEvent::PlayStreamFinished {
                app_name,
                stream_key: stream_key.clone(),
                stream_id,
            },

            _ => return Vec::new(),
        };

        let is_playback_stream = match &self.playback {
            Some(playback) => playback.publisher.stream_id() == stream_id,
            None => false,
        };

        if is_playback_stream {
            self.close();
        }

        vec![ServerSessionResult::RaisedEvent(event)]
    }

    fn reset_playing_stream(&mut self, stream_id: u32) {
        if let Some(stream) = self.active_streams.get_mut(&stream_id) {
            if let StreamState::Playing { .. } = stream.current_state {
                stream.current_state = StreamState::Created;
            }
        }
    }

    fn acknowledge_received_bytes(&mut self) -> Result<Option<Packet>, ServerSessionError> {
        let window = match self.peer_window_ack_size {
            Some(window) if window > 0 => u64::from(window),
            _ => return Ok(None),
        };

        if self.bytes_received - self.bytes_received_at_last_ack < window {
            return Ok(None);
        }

        debug!(bytes_received = self.bytes_received, "Acknowledging received bytes");
        self.bytes_received_at_last_ack = self.bytes_received;
        let message = RtmpMessage::Acknowledgement {
            sequence_number: self.bytes_received as u32,
        };

        Ok(Some(self.serialize_message(message, 0, false)?))
    }

    fn create_play_start_messages(
        &self,
        stream_id: u32,
        stream_key: &str,
        variation: Option<MessagePayload>,
        is_recorded: bool,
    ) -> Result<Vec<MessagePayload>, ServerSessionError> {
        let mut messages = Vec::with_capacity(8);
        messages.push(RtmpMessage::SetChunkSize { size: self.config.chunk_size }.into_message_payload(0, 0)?);

        if is_recorded {
            messages.push(user_control_payload(UserControlEventType::StreamIsRecorded, stream_id)?);
        }

        messages.push(user_control_payload(UserControlEventType::StreamBegin, stream_id)?);

        if let Some(variation) = variation {
            messages.push(variation);
        }

        let description = format!("Started playing {}.", stream_key);
        messages.push(self.create_status_payload(stream_id, "NetStream.Play.Start", &description)?);

        let sample_access = RtmpMessage::Amf0Data {
            values: vec![
                Amf0Value::Utf8String("|RtmpSampleAccess".to_string()),
                Amf0Value::Boolean(false),
                Amf0Value::Boolean(false),
            ],
        };

        messages.push(sample_access.into_message_payload(0, stream_id)?);
        messages.push(
            RtmpMessage::AudioData {
                data: bytes::Bytes::new(),
            }
            .into_message_payload(0, stream_id)?,
        );

        let mut data_start_properties = HashMap::new();
        data_start_properties.insert("code".to_string(), Amf0Value::Utf8String("NetStream.Data.Start".to_string()));
        let data_start = RtmpMessage::Amf0Data {
            values: vec![
                Amf0Value::Utf8String("onStatus".to_string()),
                Amf0Value::Object(data_start_properties),
            ],
        };

        messages.push(data_start.into_message_payload(0, stream_id)?);
        Ok(messages)
    }

    fn create_status_payload(&self, stream_id: u32, code: &str, description: &str) -> Result<MessagePayload, ServerSessionError> {
        let status_object = create_status_object("status", code, description);
        let message = RtmpMessage::Amf0Command {
            command_name: "onStatus".to_string(),
            transaction_id: 0.0,
            command_object: Amf0Value::Null,
            additional_arguments: vec![Amf0Value::Object(status_object)],
        };

        Ok(message.into_message_payload(0, stream_id)?)
    }

    fn create_status_packet(
        &mut self,
        stream_id: u32,
        level: &str,
        code: &str,
        description: &str,
        timestamp: u32,
    ) -> Result<Packet, ServerSessionError> {
        let status_object = create_status_object(level, code, description);
        let message = RtmpMessage::Amf0Command {
            command_name: "onStatus".to_string(),
            transaction_id: 0.0,
            command_object: Amf0Value::Null,
            additional_arguments: vec![Amf0Value::Object(status_object)],
        };

        self.serialize_message_at(message, timestamp, stream_id)
    }

    fn create_user_control_packet(&mut self, event_type: UserControlEventType, stream_id: u32) -> Result<Packet, ServerSessionError> {
        let payload = user_control_payload(event_type, stream_id)?;
        self.serialize_payload(&payload, false)
    }

    fn create_success_response(
        &mut self,
        transaction_id: f64,
        command_object: Amf0Value,
        additional_arguments: Vec<Amf0Value>,
        stream_id: u32,
    ) -> Result<Packet, ServerSessionError> {
        let message = RtmpMessage::Amf0Command {
            command_name: "_result".to_string(),
            transaction_id,
            command_object,
            additional_arguments,
        };

        self.serialize_message(message, stream_id, false)
    }

    fn create_error_response(
        &mut self,
        transaction_id: f64,
        command_object: Amf0Value,
        additional_arguments: Vec<Amf0Value>,
        stream_id: u32,
    ) -> Result<Packet, ServerSessionError> {
        let message = RtmpMessage::Amf0Command {
            command_name: "_error".to_string(),
            transaction_id,
            command_object,
            additional_arguments,
        };

        self.serialize_message(message, stream_id, false)
    }

    fn create_error_packet(&mut self, code: &str, description: &str, transaction_id: f64, stream_id: u32) -> Result<Packet, ServerSessionError> {
        let status_object = create_status_object("error", code, description);
        self.create_error_response(transaction_id, Amf0Value::Null, vec![Amf0Value::Object(status_object)], stream_id)
    }

    fn serialize_message(&mut self, message: RtmpMessage, stream_id: u32, force_uncompressed: bool) -> Result<Packet, ServerSessionError> {
        let payload = message.into_message_payload(self.get_epoch(), stream_id)?;
        self.serialize_payload(&payload, force_uncompressed)
    }

    fn serialize_message_at(&mut self, message: RtmpMessage, timestamp: u32, stream_id: u32) -> Result<Packet, ServerSessionError> {
        let payload = message.into_message_payload(timestamp, stream_id)?;
        self.serialize_payload(&payload, false)
    }

    fn serialize_payload(&mut self, payload: &MessagePayload, force_uncompressed: bool) -> Result<Packet, ServerSessionError> {
        let packet = self.serializer.serialize(payload, force_uncompressed)?;
        self.bytes_sent += packet.bytes.len() as u64;
        Ok(packet)
    }

    fn add_outstanding_request(&mut self, request: OutstandingRequest) -> u32 {
        let request_id = self.next_request_number;
        self.next_request_number = self.next_request_number.wrapping_add(1);
        self.outstanding_requests.insert(request_id, request);
        request_id
    }

    fn publishing_stream_key(&self, stream_id: u32) -> Option<String> {
        if self.current_state != SessionState::Connected {
            return None;
        }

        match self.active_streams.get(&stream_id).map(|stream| &stream.current_state) {
            Some(StreamState::Publishing { stream_key, .. }) => Some(stream_key.clone()),
            _ => None,
        }
    }

    fn app_name(&self) -> String {
        self.connected_app_name.clone().unwrap_or_default()
    }

    fn get_epoch(&self) -> u32 {
        // Wraps after roughly 49 days, as RTMP timestamps do
        self.clock.now_ms().saturating_sub(self.start_time_ms) as u32
    }
}

fn user_control_payload(event_type: UserControlEventType, stream_id: u32) -> Result<MessagePayload, ServerSessionError> {
    let message = RtmpMessage::UserControl {
        event_type,
        stream_id: Some(stream_id),
        buffer_length: None,
        timestamp: None,
    };

    Ok(message.into_message_payload(0, 0)?)
}

fn create_status_object(level: &str, code: &str, description: &str) -> HashMap<String, Amf0Value> {
    let mut properties = HashMap::new();
    properties.insert("level".to_string(), Amf0Value::Utf8String(level.to_string()));
    properties.insert("code".to_string(), Amf0Value::Utf8String(code.to_string()));
    properties.insert("description".to_string(), Amf0Value::Utf8String(description.to_string()));
    properties
}
