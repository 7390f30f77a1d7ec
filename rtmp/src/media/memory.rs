use super::{MediaCursor, MediaEntry, MediaSource, MediaSourceError, DEFAULT_AGGREGATE_BYTE_LIMIT};
use crate::messages::MessagePayload;

/// A media source over messages already held in memory, such as a short clip or a
/// scripted test sequence.  Messages must be in timestamp order.
pub struct MemorySource {
    start_messages: Vec<MessagePayload>,
    messages: Vec<MessagePayload>,
    entries: Vec<MediaEntry>,
    cursor: MediaCursor,
    closed: bool,
}

impl MemorySource {
    pub fn new(start_messages: Vec<MessagePayload>, messages: Vec<MessagePayload>) -> MemorySource {
        let entries = messages
            .iter()
            .map(|message| MediaEntry::new(message.timestamp, message.type_id, &message.data, message.data.len()))
            .collect();

        MemorySource {
            start_messages,
            messages,
            entries,
            cursor: MediaCursor::new(DEFAULT_AGGREGATE_BYTE_LIMIT),
            closed: false,
        }
    }

    pub fn with_aggregate_byte_limit(mut self, limit: usize) -> MemorySource {
        self.cursor.set_aggregate_byte_limit(limit);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl MediaSource for MemorySource {
    fn seek(&mut self, target_ms: u32) -> Result<u32, MediaSourceError> {
        if self.closed {
            return Err(MediaSourceError::Closed);
        }

        Ok(self.cursor.seek(&self.entries, target_ms))
    }

    fn has_next(&self) -> bool {
        !self.closed && self.cursor.has_next(&self.entries)
    }

    fn next_message(&mut self) -> Result<MessagePayload, MediaSourceError> {
        if self.closed {
            return Err(MediaSourceError::Closed);
        }

        let messages = &self.messages;
        self.cursor.next(&self.entries, |index| {
            messages.get(index).cloned().ok_or(MediaSourceError::Exhausted)
        })
    }

    fn start_messages(&self) -> Vec<MessagePayload> {
        self.start_messages.clone()
    }

    fn set_aggregate_target(&mut self, duration_ms: u32) {
        self.cursor.set_aggregate_target(duration_ms);
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{split_aggregate, AGGREGATE_TAG_OVERHEAD, AGGREGATE_TYPE_ID};
    use bytes::Bytes;

    fn message(type_id: u8, timestamp: u32, first_byte: u8) -> MessagePayload {
        MessagePayload {
            timestamp,
            type_id,
            message_stream_id: 0,
            data: Bytes::from(vec![first_byte, 1, 2, 3]),
        }
    }

    fn clip() -> Vec<MessagePayload> {
        vec![
            message(9, 0, 0x17),
            message(8, 10, 0xAF),
            message(9, 40, 0x27),
            message(8, 50, 0xAF),
            message(9, 80, 0x17),
            message(9, 120, 0x27),
        ]
    }

    #[test]
    fn messages_are_returned_in_order() {
        let mut source = MemorySource::new(vec![], clip());
        let mut timestamps = Vec::new();
        while source.has_next() {
            timestamps.push(source.next_message().unwrap().timestamp);
        }

        assert_eq!(timestamps, vec![0, 10, 40, 50, 80, 120]);
    }

    #[test]
    fn next_after_end_is_exhausted() {
        let mut source = MemorySource::new(vec![], vec![message(9, 0, 0x17)]);
        source.next_message().unwrap();

        match source.next_message() {
            Err(MediaSourceError::Exhausted) => (),
            x => panic!("Expected exhausted error, got {:?}", x),
        }
    }

    #[test]
    fn seek_moves_cursor_to_keyframe() {
        let mut source = MemorySource::new(vec![], clip());
        assert_eq!(source.seek(110).unwrap(), 80);
        assert_eq!(source.next_message().unwrap().timestamp, 80);

        assert_eq!(source.seek(10).unwrap(), 0);
        assert_eq!(source.next_message().unwrap().timestamp, 0);
    }

    #[test]
    fn aggregation_stops_once_target_duration_is_passed() {
        let mut source = MemorySource::new(vec![], clip());
        source.set_aggregate_target(45);

        let first = source.next_message().unwrap();
        assert_eq!(first.type_id, AGGREGATE_TYPE_ID);
        assert_eq!(first.timestamp, 0);

        let entries = split_aggregate(&first).unwrap();
        let timestamps: Vec<u32> = entries.iter().map(|x| x.timestamp).collect();
        assert_eq!(timestamps, vec![0, 10, 40, 50]);

        let second = source.next_message().unwrap();
        assert_eq!(second.timestamp, 80);
    }

    #[test]
    fn aggregation_respects_byte_limit() {
        let limit = (4 + AGGREGATE_TAG_OVERHEAD) * 2;
        let mut source = MemorySource::new(vec![], clip()).with_aggregate_byte_limit(limit);
        source.set_aggregate_target(1000);

        let first = source.next_message().unwrap();
        assert_eq!(first.data.len(), limit);
        assert_eq!(split_aggregate(&first).unwrap().len(), 2);

        let second = source.next_message().unwrap();
        assert_eq!(second.timestamp, 40);
    }

    #[test]
    fn closed_source_has_nothing_next() {
        let mut source = MemorySource::new(vec![], clip());
        source.close();

        assert!(!source.has_next());
        assert!(source.is_closed());
        match source.next_message() {
            Err(MediaSourceError::Closed) => (),
            x => panic!("Expected closed error, got {:?}", x),
        }
    }
}
