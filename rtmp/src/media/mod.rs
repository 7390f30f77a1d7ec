//! Seekable sources of timestamped media messages that recorded playback pulls from.

mod errors;
mod flv;
mod limited;
mod memory;

pub use self::errors::MediaSourceError;
pub use self::flv::FlvReader;
pub use self::limited::LimitedSource;
pub use self::memory::MemorySource;

use crate::messages::{is_video_keyframe, AggregateBuilder, MessagePayload, VIDEO_TYPE_ID};

/// Largest aggregate message a source produces unless configured otherwise
pub const DEFAULT_AGGREGATE_BYTE_LIMIT: usize = 65536;

/// A positioned stream of media messages in timestamp order.
///
/// `seek` moves the cursor to the last point at or before the requested time where decoding
/// can start and returns that time.  When an aggregate target is set, `next_message` may
/// bundle consecutive messages spanning up to roughly that duration into one aggregate
/// message.
pub trait MediaSource {
    fn seek(&mut self, target_ms: u32) -> Result<u32, MediaSourceError>;

    fn has_next(&self) -> bool;

    fn next_message(&mut self) -> Result<MessagePayload, MediaSourceError>;

    /// Messages a player needs before any media, such as metadata and codec sequence headers
    fn start_messages(&self) -> Vec<MessagePayload>;

    /// Zero turns aggregation off
    fn set_aggregate_target(&mut self, duration_ms: u32);

    fn close(&mut self);
}

impl<S: MediaSource + ?Sized> MediaSource for Box<S> {
    fn seek(&mut self, target_ms: u32) -> Result<u32, MediaSourceError> {
        (**self).seek(target_ms)
    }

    fn has_next(&self) -> bool {
        (**self).has_next()
    }

    fn next_message(&mut self) -> Result<MessagePayload, MediaSourceError> {
        (**self).next_message()
    }

    fn start_messages(&self) -> Vec<MessagePayload> {
        (**self).start_messages()
    }

    fn set_aggregate_target(&mut self, duration_ms: u32) {
        (**self).set_aggregate_target(duration_ms)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// What an indexed source knows about a message without loading its data
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MediaEntry {
    pub timestamp: u32,
    pub type_id: u8,
    pub data_length: usize,
    pub is_keyframe: bool,
}

impl MediaEntry {
    pub fn new(timestamp: u32, type_id: u8, data: &[u8], data_length: usize) -> MediaEntry {
        MediaEntry {
            timestamp,
            type_id,
            data_length,
            is_keyframe: type_id == VIDEO_TYPE_ID && is_video_keyframe(data),
        }
    }
}

/// Read position and aggregation settings over a list of indexed entries
#[derive(Debug)]
pub(crate) struct MediaCursor {
    position: usize,
    aggregate_target_ms: u32,
    aggregate_byte_limit: usize,
}

impl MediaCursor {
    pub fn new(aggregate_byte_limit: usize) -> MediaCursor {
        MediaCursor {
            position: 0,
            aggregate_target_ms: 0,
            aggregate_byte_limit,
        }
    }

    pub fn has_next(&self, entries: &[MediaEntry]) -> bool {
        self.position < entries.len()
    }

    pub fn set_aggregate_target(&mut self, duration_ms: u32) {
        self.aggregate_target_ms = duration_ms;
    }

    pub fn set_aggregate_byte_limit(&mut self, limit: usize) {
        self.aggregate_byte_limit = limit;
    }

    /// Snaps to the last video keyframe at or before the target.  Sources without video
    /// snap to the last message at or before the target instead.
    pub fn seek(&mut self, entries: &[MediaEntry], target_ms: u32) -> u32 {
        let has_video = entries.iter().any(|entry| entry.type_id == VIDEO_TYPE_ID);
        let found = entries
            .iter()
            .rposition(|entry| entry.timestamp <= target_ms && (entry.is_keyframe || !has_video));

        self.position = found.unwrap_or(0);
        match entries.get(self.position) {
            Some(entry) => entry.timestamp.min(target_ms),
            None => 0,
        }
    }

    pub fn next<F>(&mut self, entries: &[MediaEntry], mut load: F) -> Result<MessagePayload, MediaSourceError>
    where
        F: FnMut(usize) -> Result<MessagePayload, MediaSourceError>,
    {
        if self.position >= entries.len() {
            return Err(MediaSourceError::Exhausted);
        }

        if self.aggregate_target_ms == 0 {
            let message = load(self.position)?;
            self.position += 1;
            return Ok(message);
        }

        let mut builder = AggregateBuilder::new(self.aggregate_byte_limit);
        while let Some(entry) = entries.get(self.position) {
            if !builder.has_room_for(entry.data_length) {
                break;
            }

            // The index length can disagree with the loaded body, so the builder decides
            let message = load(self.position)?;
            if !builder.try_add(&message)? {
                break;
            }

            self.position += 1;

            if builder.duration() > self.aggregate_target_ms {
                break;
            }
        }

        builder.finish().ok_or(MediaSourceError::Exhausted)
    }
}
