use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Clock, PlaybackConfig, PlaybackError};
use crate::media::MediaSource;
use crate::messages::MessagePayload;

/// Handed out with every paced message.  The owner passes it back through
/// `PlaybackEvent::WriteCompleted` once the message has been written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryTicket {
    conversation_id: u32,
    delay_ms: i64,
    issued_at_ms: u64,
}

impl DeliveryTicket {
    pub fn conversation_id(&self) -> u32 {
        self.conversation_id
    }
}

/// Work the owner of a publisher must carry out, in order
#[derive(Debug, PartialEq)]
pub enum PlaybackAction {
    /// Write the message, nothing is waiting on it
    Send(MessagePayload),

    /// Write the message then report completion with the ticket
    Deliver {
        message: MessagePayload,
        ticket: DeliveryTicket,
    },

    /// Arm a timer and call `deliver_timer_event` with the conversation id when it fires
    ScheduleTimer { conversation_id: u32, delay_ms: u32 },

    /// Playback ended, either because the media ran out or because it was stopped
    Finished { position_ms: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackEvent {
    WriteCompleted(DeliveryTicket),
    TimerFired { conversation_id: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PublisherState {
    Idle,
    Started,
    Paused,
    Stopped,
}

/// Streams messages from a media source to one player, keeping the player's buffer near
/// the configured duration ahead of real time.
///
/// While the player is far ahead, messages are aggregated and the gaps between them are
/// waited out in proportion to how full the buffer is.  When the player falls behind the
/// delays shrink towards zero so it can catch up.
pub struct PlaybackPublisher<S: MediaSource> {
    source: S,
    clock: Arc<dyn Clock>,
    config: PlaybackConfig,
    stream_id: u32,
    conversation_id: u32,
    start_wall_clock_ms: u64,
    seek_time_ms: u32,
    current_position_ms: u32,
    play_length_ms: Option<u32>,
    state: PublisherState,
}

impl<S: MediaSource> PlaybackPublisher<S> {
    pub fn new(source: S, stream_id: u32, config: PlaybackConfig, clock: Arc<dyn Clock>) -> PlaybackPublisher<S> {
        debug!(stream_id, "Playback publisher created");

        PlaybackPublisher {
            source,
            clock,
            config,
            stream_id,
            conversation_id: 0,
            start_wall_clock_ms: 0,
            seek_time_ms: 0,
            current_position_ms: 0,
            play_length_ms: None,
            state: PublisherState::Idle,
        }
    }

    /// Begins playback, optionally seeking first and stopping once `play_length_ms` of
    /// media past the seek point has gone out.  The `extras` are written ahead of the
    /// source's own start messages.
    pub fn start(
        &mut self,
        seek_request_ms: Option<u32>,
        play_length_ms: Option<u32>,
        extras: Vec<MessagePayload>,
    ) -> Result<Vec<PlaybackAction>, PlaybackError> {
        if self.state == PublisherState::Stopped {
            return Err(PlaybackError::AlreadyStopped);
        }

        self.play_length_ms = play_length_ms;
        self.begin(seek_request_ms, extras)
    }

    /// Starts again from a new position, keeping the play length of the original start
    pub fn resume(&mut self, seek_ms: Option<u32>, extras: Vec<MessagePayload>) -> Result<Vec<PlaybackAction>, PlaybackError> {
        if self.state == PublisherState::Stopped {
            return Err(PlaybackError::AlreadyStopped);
        }

        self.begin(seek_ms, extras)
    }

    /// Repositions a running playback.  Seeks requested while paused or before playback
    /// started are ignored.
    pub fn seek(&mut self, seek_ms: u32, extras: Vec<MessagePayload>) -> Result<Vec<PlaybackAction>, PlaybackError> {
        if self.state != PublisherState::Started {
            debug!(seek_ms, state = ?self.state, "Ignoring seek while not playing");
            return Ok(Vec::new());
        }

        self.begin(Some(seek_ms), extras)
    }

    pub fn pause(&mut self) {
        if self.state != PublisherState::Started {
            return;
        }

        self.conversation_id = self.conversation_id.wrapping_add(1);
        self.state = PublisherState::Paused;
        debug!(
            position_ms = self.current_position_ms,
            conversation_id = self.conversation_id,
            "Playback paused"
        );
    }

    pub fn stop(&mut self) -> Vec<PlaybackAction> {
        let mut actions = Vec::new();
        if self.state != PublisherState::Stopped {
            self.finish(&mut actions);
        }

        actions
    }

    /// Continues the delivery loop after a write completed or a timer fired.  Events from
    /// an earlier conversation produce no actions.
    pub fn drive(&mut self, event: PlaybackEvent) -> Result<Vec<PlaybackAction>, PlaybackError> {
        let conversation_id = match event {
            PlaybackEvent::WriteCompleted(ticket) => ticket.conversation_id,
            PlaybackEvent::TimerFired { conversation_id } => conversation_id,
        };

        if conversation_id != self.conversation_id || self.state != PublisherState::Started {
            debug!(
                conversation_id,
                current = self.conversation_id,
                "Dropping event for obsolete conversation"
            );

            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        match event {
            PlaybackEvent::WriteCompleted(ticket) => {
                let completed_in = self.clock.now_ms().saturating_sub(ticket.issued_at_ms);
                if completed_in > u64::from(self.config.write_latency_warning_ms) {
                    warn!(completed_in_ms = completed_in, "Channel busy? Writing the last message took too long");
                }

                let remaining = ticket.delay_ms - completed_in as i64;
                if remaining > i64::from(self.config.timer_tick_ms) {
                    actions.push(PlaybackAction::ScheduleTimer {
                        conversation_id: self.conversation_id,
                        delay_ms: remaining.min(i64::from(u32::MAX)) as u32,
                    });
                } else {
                    self.deliver_next(&mut actions)?;
                }
            }

            PlaybackEvent::TimerFired { .. } => self.deliver_next(&mut actions)?,
        }

        Ok(actions)
    }

    pub fn deliver_timer_event(&mut self, conversation_id: u32) -> Result<Vec<PlaybackAction>, PlaybackError> {
        self.drive(PlaybackEvent::TimerFired { conversation_id })
    }

    pub fn is_paused(&self) -> bool {
        self.state == PublisherState::Paused
    }

    /// True from the first start until playback is stopped, including while paused
    pub fn is_started(&self) -> bool {
        self.state == PublisherState::Started || self.state == PublisherState::Paused
    }

    pub fn is_stopped(&self) -> bool {
        self.state == PublisherState::Stopped
    }

    pub fn conversation_id(&self) -> u32 {
        self.conversation_id
    }

    pub fn current_position_ms(&self) -> u32 {
        self.current_position_ms
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn buffer_duration_ms(&self) -> u32 {
        self.config.buffer_duration_ms
    }

    /// Zero is ignored
    pub fn set_buffer_duration(&mut self, duration_ms: u32) {
        if duration_ms > 0 {
            self.config.buffer_duration_ms = duration_ms;
        }
    }

    pub fn close(&mut self) {
        self.source.close();
    }

    fn begin(&mut self, seek_request_ms: Option<u32>, extras: Vec<MessagePayload>) -> Result<Vec<PlaybackAction>, PlaybackError> {
        self.state = PublisherState::Started;
        self.conversation_id = self.conversation_id.wrapping_add(1);
        self.start_wall_clock_ms = self.clock.now_ms();
        self.seek_time_ms = match seek_request_ms {
            Some(requested) => self.source.seek(requested)?,
            None => 0,
        };

        self.current_position_ms = self.seek_time_ms;

        debug!(
            seek_requested_ms = ?seek_request_ms,
            seek_ms = self.seek_time_ms,
            play_length_ms = ?self.play_length_ms,
            conversation_id = self.conversation_id,
            "Playback starting"
        );

        let mut actions = Vec::new();
        for message in extras.into_iter().chain(self.source.start_messages()) {
            actions.push(PlaybackAction::Send(self.stamp(message)));
        }

        self.deliver_next(&mut actions)?;
        Ok(actions)
    }

    fn stamp(&self, mut message: MessagePayload) -> MessagePayload {
        if !message.is_protocol_control() {
            message.message_stream_id = self.stream_id;
            message.timestamp = self.current_position_ms;
        }

        message
    }

    fn deliver_next(&mut self, actions: &mut Vec<PlaybackAction>) -> Result<(), PlaybackError> {
        let past_length = match self.play_length_ms {
            Some(length) => u64::from(self.current_position_ms) > u64::from(self.seek_time_ms) + u64::from(length),
            None => false,
        };

        if past_length || !self.source.has_next() {
            self.finish(actions);
            return Ok(());
        }

        let now = self.clock.now_ms();
        let elapsed = now.saturating_sub(self.start_wall_clock_ms) as i64;
        let client_buffer = i64::from(self.current_position_ms) - (elapsed + i64::from(self.seek_time_ms));
        if client_buffer > i64::from(self.config.timer_tick_ms) {
            self.source.set_aggregate_target(client_buffer.min(i64::from(u32::MAX)) as u32);
        } else {
            self.source.set_aggregate_target(0);
        }

        let mut message = self.source.next_message()?;
        let compensation_factor = client_buffer as f64 / f64::from(self.config.buffer_duration_ms);
        let gap = i64::from(message.timestamp) - i64::from(self.current_position_ms);
        let delay_ms = (gap as f64 * compensation_factor) as i64;

        self.current_position_ms = self.current_position_ms.max(message.timestamp);
        message.message_stream_id = self.stream_id;

        actions.push(PlaybackAction::Deliver {
            message,
            ticket: DeliveryTicket {
                conversation_id: self.conversation_id,
                delay_ms,
                issued_at_ms: now,
            },
        });

        Ok(())
    }

    fn finish(&mut self, actions: &mut Vec<PlaybackAction>) {
        self.conversation_id = self.conversation_id.wrapping_add(1);
        self.state = PublisherState::Stopped;

        let elapsed_ms = self.clock.now_ms().saturating_sub(self.start_wall_clock_ms);
        info!(
            start_s = self.seek_time_ms / 1000,
            elapsed_s = elapsed_ms / 1000,
            streamed_s = self.current_position_ms.saturating_sub(self.seek_time_ms) / 1000,
            "Playback finished"
        );

        actions.push(PlaybackAction::Finished {
            position_ms: self.current_position_ms,
        });
    }
}
