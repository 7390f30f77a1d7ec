use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, info_span, warn, Instrument};

use rml_rtmp_pacer::media::FlvReader;
use rml_rtmp_pacer::messages::MessagePayload;
use rml_rtmp_pacer::sessions::{
    LiveStream, PlaySource, PlayStartValue, ServerSession, ServerSessionConfig, ServerSessionEvent,
    ServerSessionResult, StreamRegistry, Subscriber,
};

use crate::handshake::perform_handshake;
use crate::{send, spawn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub struct ConnectionSettings {
    pub session_config: ServerSessionConfig,
    pub media_dir: PathBuf,
    pub aggregate_byte_limit: usize,
}

/// Everything that can wake a connection up
#[derive(Debug)]
enum ConnectionEvent {
    Input(Bytes),
    InputClosed,
    DeliveryTimer { conversation_id: u32 },
    LiveMessage(MessagePayload),
    LiveEnded,
}

#[derive(PartialEq, Debug)]
enum ConnectionAction {
    None,
    Disconnect,
}

/// Forwards a live stream's messages into a player's connection task
struct ChannelSubscriber {
    sender: UnboundedSender<ConnectionEvent>,
}

impl Subscriber for ChannelSubscriber {
    fn deliver(&self, message: &MessagePayload) -> bool {
        send(&self.sender, ConnectionEvent::LiveMessage(message.clone()))
    }

    fn stream_ended(&self) {
        send(&self.sender, ConnectionEvent::LiveEnded);
    }
}

pub struct Connection {
    id: u64,
    settings: Arc<ConnectionSettings>,
    registry: Arc<StreamRegistry>,
    publishing: Option<Arc<LiveStream>>,
    watching: Option<(Arc<LiveStream>, u32)>,
}

impl Connection {
    pub fn new(id: u64, settings: Arc<ConnectionSettings>, registry: Arc<StreamRegistry>) -> Self {
        Connection {
            id,
            settings,
            registry,
            publishing: None,
            watching: None,
        }
    }

    pub async fn start(self, mut stream: TcpStream) -> Result<(), BoxError> {
        let span = info_span!("connection", id = self.id);
        async move {
            perform_handshake(&mut stream).await?;
            debug!("Handshake completed");
            self.run(stream).await
        }
        .instrument(span)
        .await
    }

    async fn run(mut self, stream: TcpStream) -> Result<(), BoxError> {
        let (reader, mut writer) = tokio::io::split(stream);
        let (event_sender, mut event_receiver) = mpsc::unbounded_channel();

        spawn(connection_reader(reader, event_sender.clone()).in_current_span());

        let (mut session, initial_results) = ServerSession::new(self.settings.session_config.clone())?;
        let result = self
            .event_loop(&mut session, initial_results, &mut writer, &mut event_receiver, &event_sender)
            .await;

        self.clean_up(&mut session);
        info!("Client disconnected");
        result
    }

    async fn event_loop(
        &mut self,
        session: &mut ServerSession,
        initial_results: Vec<ServerSessionResult>,
        writer: &mut WriteHalf<TcpStream>,
        event_receiver: &mut UnboundedReceiver<ConnectionEvent>,
        event_sender: &UnboundedSender<ConnectionEvent>,
    ) -> Result<(), BoxError> {
        let mut results = initial_results;
        loop {
            let action = self.process_results(session, results, writer, event_sender).await?;
            if action == ConnectionAction::Disconnect {
                return Ok(());
            }

            let event = match event_receiver.recv().await {
                Some(event) => event,
                None => return Ok(()),
            };

            results = match event {
                ConnectionEvent::Input(bytes) => session.handle_input(&bytes)?,
                ConnectionEvent::InputClosed => return Ok(()),
                ConnectionEvent::DeliveryTimer { conversation_id } => session.deliver_timer_event(conversation_id)?,
                ConnectionEvent::LiveMessage(payload) => match &self.watching {
                    Some((_, stream_id)) => match session.send_live_message(*stream_id, &payload) {
                        Ok(packet) => vec![ServerSessionResult::OutboundResponse(packet)],
                        Err(error) => {
                            debug!(error = %error, "Dropping live message");
                            Vec::new()
                        }
                    },

                    None => Vec::new(),
                },

                ConnectionEvent::LiveEnded => match self.watching.take() {
                    Some((_, stream_id)) => session.end_live_playback(stream_id)?,
                    None => Vec::new(),
                },
            };
        }
    }

    /// Carries out session results in the order they were produced.  Media is written before
    /// its completion is reported, which may produce more results.
    async fn process_results(
        &mut self,
        session: &mut ServerSession,
        results: Vec<ServerSessionResult>,
        writer: &mut WriteHalf<TcpStream>,
        event_sender: &UnboundedSender<ConnectionEvent>,
    ) -> Result<ConnectionAction, BoxError> {
        let mut pending: VecDeque<ServerSessionResult> = results.into();
        while let Some(result) = pending.pop_front() {
            match result {
                ServerSessionResult::OutboundResponse(packet) => writer.write_all(&packet.bytes).await?,

                ServerSessionResult::OutboundMedia { packet, ticket } => {
                    writer.write_all(&packet.bytes).await?;
                    pending.extend(session.delivery_completed(ticket)?);
                }

                ServerSessionResult::ScheduleDelivery {
                    conversation_id,
                    delay_ms,
                } => schedule_delivery(event_sender.clone(), conversation_id, delay_ms),

                ServerSessionResult::RaisedEvent(event) => {
                    let (results, action) = self.handle_raised_event(session, event, event_sender)?;
                    if action == ConnectionAction::Disconnect {
                        return Ok(ConnectionAction::Disconnect);
                    }

                    pending.extend(results);
                }

                ServerSessionResult::UnhandleableMessageReceived(payload) => {
                    debug!(type_id = payload.type_id, "Unhandleable message received");
                }
            }
        }

        Ok(ConnectionAction::None)
    }

    fn handle_raised_event(
        &mut self,
        session: &mut ServerSession,
        event: ServerSessionEvent,
        event_sender: &UnboundedSender<ConnectionEvent>,
    ) -> Result<(Vec<ServerSessionResult>, ConnectionAction), BoxError> {
        let results = match event {
            ServerSessionEvent::ConnectionRequested { request_id, app_name } => {
                info!(app_name = %app_name, "Client requested connection");
                session.accept_request(request_id)?
            }

            ServerSessionEvent::PublishStreamRequested {
                request_id,
                stream_key,
                mode,
                ..
            } => {
                info!(stream_key = %stream_key, ?mode, "Client requested publishing");
                match self.registry.start_publishing(&stream_key, self.id) {
                    Ok(stream) => {
                        self.publishing = Some(stream);
                        session.accept_request(request_id)?
                    }

                    Err(error) => {
                        warn!(error = %error, "Refusing publish request");
                        session.reject_request(request_id)?
                    }
                }
            }

            ServerSessionEvent::StreamMetadataChanged { payload, .. }
            | ServerSessionEvent::AudioDataReceived { payload, .. }
            | ServerSessionEvent::VideoDataReceived { payload, .. }
            | ServerSessionEvent::AggregateDataReceived { payload, .. } => {
                match &self.publishing {
                    Some(stream) => {
                        stream.broadcast(&payload);
                    }

                    None => {
                        warn!("Received media without publishing");
                        return Ok((Vec::new(), ConnectionAction::Disconnect));
                    }
                }

                Vec::new()
            }

            ServerSessionEvent::PublishStreamFinished { stream_key, .. } => {
                info!(stream_key = %stream_key, "Publishing finished");
                self.stop_publishing();
                Vec::new()
            }

            ServerSessionEvent::PlayStreamRequested {
                request_id,
                stream_key,
                start_at,
                stream_id,
                ..
            } => self.handle_play_request(session, request_id, stream_key, start_at, stream_id, event_sender)?,

            ServerSessionEvent::PlayStreamFinished { stream_key, stream_id, .. } => {
                info!(stream_key = %stream_key, stream_id, "Playback finished");
                if self.is_watching(stream_id) {
                    self.stop_watching();
                }

                Vec::new()
            }

            ServerSessionEvent::ClientChunkSizeChanged { new_chunk_size } => {
                debug!(new_chunk_size, "Client changed its chunk size");
                Vec::new()
            }

            x => {
                debug!(event = ?x, "Unhandled event raised");
                Vec::new()
            }
        };

        Ok((results, ConnectionAction::None))
    }

    fn handle_play_request(
        &mut self,
        session: &mut ServerSession,
        request_id: u32,
        stream_key: String,
        start_at: PlayStartValue,
        stream_id: u32,
        event_sender: &UnboundedSender<ConnectionEvent>,
    ) -> Result<Vec<ServerSessionResult>, BoxError> {
        info!(stream_key = %stream_key, ?start_at, stream_id, "Client requested playback");

        let wants_recording = matches!(start_at, PlayStartValue::StartTimeInMilliseconds(_));

        if !wants_recording {
            if let Some(stream) = self.registry.get(&stream_key) {
                self.stop_watching();
                let subscriber = Arc::new(ChannelSubscriber {
                    sender: event_sender.clone(),
                });

                stream.add_subscriber(self.id, subscriber);
                let config_messages = stream.config_messages();
                self.watching = Some((stream, stream_id));

                return Ok(session.accept_play_request(request_id, PlaySource::Live { config_messages })?);
            }

            if start_at == PlayStartValue::LiveOnly {
                info!(stream_key = %stream_key, "No live stream to play");
                return Ok(session.reject_request(request_id)?);
            }
        }

        let path = match self.media_path(&stream_key) {
            Some(path) => path,
            None => {
                warn!(stream_key = %stream_key, "Refusing stream key that is not a plain file name");
                return Ok(session.reject_request(request_id)?);
            }
        };

        match FlvReader::open(&path) {
            Ok(reader) => {
                let reader = reader.with_aggregate_byte_limit(self.settings.aggregate_byte_limit);
                Ok(session.accept_play_request(request_id, PlaySource::Recorded(Box::new(reader)))?)
            }

            Err(error) => {
                warn!(path = %path.display(), error = %error, "Unable to open recording");
                Ok(session.reject_request(request_id)?)
            }
        }
    }

    fn media_path(&self, stream_key: &str) -> Option<PathBuf> {
        let is_plain_name = !stream_key.is_empty()
            && !stream_key.contains(|c: char| c == '/' || c == '\\')
            && stream_key != "."
            && stream_key != "..";

        if !is_plain_name {
            return None;
        }

        Some(self.settings.media_dir.join(format!("{}.flv", stream_key)))
    }

    fn stop_publishing(&mut self) {
        if let Some(stream) = self.publishing.take() {
            self.registry.stop_publishing(stream.name(), self.id);
        }
    }

    fn is_watching(&self, stream_id: u32) -> bool {
        matches!(&self.watching, Some((_, watched_id)) if *watched_id == stream_id)
    }

    fn stop_watching(&mut self) {
        if let Some((stream, _)) = self.watching.take() {
            stream.remove_subscriber(self.id);
        }
    }

    fn clean_up(&mut self, session: &mut ServerSession) {
        session.close();
        self.stop_publishing();
        self.stop_watching();
    }
}

fn schedule_delivery(sender: UnboundedSender<ConnectionEvent>, conversation_id: u32, delay_ms: u32) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(u64::from(delay_ms))).await;
        send(&sender, ConnectionEvent::DeliveryTimer { conversation_id });
    });
}

async fn connection_reader(
    mut stream: ReadHalf<TcpStream>,
    events: UnboundedSender<ConnectionEvent>,
) -> Result<(), BoxError> {
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        let bytes_read = stream.read_buf(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }

        if !send(&events, ConnectionEvent::Input(buffer.split().freeze())) {
            return Ok(());
        }

        buffer.reserve(4096);
    }

    send(&events, ConnectionEvent::InputClosed);
    debug!("Reader disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watching_connection(registry: &Arc<StreamRegistry>, stream_id: u32) -> (Connection, Arc<LiveStream>, UnboundedSender<ConnectionEvent>) {
        let settings = Arc::new(ConnectionSettings {
            session_config: ServerSessionConfig::new(),
            media_dir: PathBuf::from("."),
            aggregate_byte_limit: 65536,
        });

        let (sender, _receiver) = mpsc::unbounded_channel();
        let stream = registry.start_publishing("live", 99).unwrap();
        stream.add_subscriber(1, Arc::new(ChannelSubscriber { sender: sender.clone() }));

        let mut connection = Connection::new(1, settings, Arc::clone(registry));
        connection.watching = Some((Arc::clone(&stream), stream_id));
        (connection, stream, sender)
    }

    fn play_finished(stream_key: &str, stream_id: u32) -> ServerSessionEvent {
        ServerSessionEvent::PlayStreamFinished {
            app_name: "app".to_string(),
            stream_key: stream_key.to_string(),
            stream_id,
        }
    }

    #[test]
    fn recorded_playback_finishing_keeps_live_subscription() {
        let registry = Arc::new(StreamRegistry::new());
        let (mut connection, stream, sender) = watching_connection(&registry, 5);
        let (mut session, _) = ServerSession::new(ServerSessionConfig::new()).unwrap();

        let (_, action) = connection
            .handle_raised_event(&mut session, play_finished("clip", 7), &sender)
            .unwrap();

        assert_eq!(action, ConnectionAction::None);
        assert_eq!(stream.subscriber_count(), 1, "Live subscription should survive");
        assert!(connection.watching.is_some());
    }

    #[test]
    fn watched_stream_finishing_drops_live_subscription() {
        let registry = Arc::new(StreamRegistry::new());
        let (mut connection, stream, sender) = watching_connection(&registry, 5);
        let (mut session, _) = ServerSession::new(ServerSessionConfig::new()).unwrap();

        connection
            .handle_raised_event(&mut session, play_finished("live", 5), &sender)
            .unwrap();

        assert_eq!(stream.subscriber_count(), 0, "Live subscription should be removed");
        assert!(connection.watching.is_none());
    }
}
