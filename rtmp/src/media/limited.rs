use super::{MediaSource, MediaSourceError};
use crate::messages::MessagePayload;
use tracing::debug;

/// Exposes a time window of another source as if it were a source of its own.  Timestamps
/// are shifted so the window starts at zero.
pub struct LimitedSource<S> {
    inner: S,
    start_ms: u32,
    length_ms: u32,
    position_ms: u32,
}

impl<S: MediaSource> LimitedSource<S> {
    /// The window begins at the seek point of `start_ms` in the inner source, which may be
    /// slightly before it.
    pub fn new(mut inner: S, start_ms: u32, length_ms: u32) -> Result<Self, MediaSourceError> {
        let start_ms = inner.seek(start_ms)?;
        Ok(LimitedSource {
            inner,
            start_ms,
            length_ms,
            position_ms: 0,
        })
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn rewind(&mut self) -> Result<u32, MediaSourceError> {
        self.inner.seek(self.start_ms)?;
        self.position_ms = 0;
        Ok(0)
    }
}

impl<S: MediaSource> MediaSource for LimitedSource<S> {
    /// Never lands before the window.  A snap that would is replaced by the window start.
    fn seek(&mut self, target_ms: u32) -> Result<u32, MediaSourceError> {
        if target_ms == 0 {
            return self.rewind();
        }

        let target_ms = target_ms.min(self.length_ms);
        let actual = self.inner.seek(self.start_ms.saturating_add(target_ms))?;
        if actual < self.start_ms {
            debug!(actual, window_start = self.start_ms, "Seek snapped before the window, rewinding");
            return self.rewind();
        }

        self.position_ms = actual - self.start_ms;
        Ok(self.position_ms)
    }

    fn has_next(&self) -> bool {
        self.position_ms < self.length_ms && self.inner.has_next()
    }

    fn next_message(&mut self) -> Result<MessagePayload, MediaSourceError> {
        if self.position_ms >= self.length_ms {
            return Err(MediaSourceError::Exhausted);
        }

        let mut message = self.inner.next_message()?;
        message.timestamp = message.timestamp.saturating_sub(self.start_ms);
        self.position_ms = self.position_ms.max(message.timestamp);
        Ok(message)
    }

    fn start_messages(&self) -> Vec<MessagePayload> {
        self.inner.start_messages()
    }

    fn set_aggregate_target(&mut self, duration_ms: u32) {
        self.inner.set_aggregate_target(duration_ms);
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MemorySource;
    use bytes::Bytes;

    fn clip() -> MemorySource {
        let messages = (0..10)
            .map(|index| MessagePayload {
                timestamp: index * 100,
                type_id: 9,
                message_stream_id: 0,
                data: Bytes::from(vec![if index % 3 == 0 { 0x17 } else { 0x27 }, 1]),
            })
            .collect();

        MemorySource::new(vec![], messages)
    }

    #[test]
    fn window_starts_at_preceding_keyframe_rebased_to_zero() {
        let mut source = LimitedSource::new(clip(), 350, 400).unwrap();

        let first = source.next_message().unwrap();
        assert_eq!(first.timestamp, 0, "Window should start at the keyframe at 300");
    }

    #[test]
    fn window_ends_after_length() {
        let mut source = LimitedSource::new(clip(), 300, 250).unwrap();
        let mut timestamps = Vec::new();
        while source.has_next() {
            timestamps.push(source.next_message().unwrap().timestamp);
        }

        assert_eq!(timestamps, vec![0, 100, 200, 300]);
    }

    #[test]
    fn seek_is_relative_to_window() {
        let mut source = LimitedSource::new(clip(), 300, 500).unwrap();
        assert_eq!(source.seek(350).unwrap(), 300);
        assert_eq!(source.next_message().unwrap().timestamp, 300);
    }

    /// Answers seeks from a fixed list, as a source with irregular keyframes might
    struct ScriptedSeeks {
        inner: MemorySource,
        answers: Vec<u32>,
        requests: Vec<u32>,
    }

    impl MediaSource for ScriptedSeeks {
        fn seek(&mut self, target_ms: u32) -> Result<u32, MediaSourceError> {
            self.requests.push(target_ms);
            let answer = if self.answers.is_empty() { target_ms } else { self.answers.remove(0) };
            self.inner.seek(answer)
        }

        fn has_next(&self) -> bool {
            self.inner.has_next()
        }

        fn next_message(&mut self) -> Result<MessagePayload, MediaSourceError> {
            self.inner.next_message()
        }

        fn start_messages(&self) -> Vec<MessagePayload> {
            self.inner.start_messages()
        }

        fn set_aggregate_target(&mut self, duration_ms: u32) {
            self.inner.set_aggregate_target(duration_ms);
        }

        fn close(&mut self) {
            self.inner.close();
        }
    }

    #[test]
    fn seek_snapping_before_window_rewinds_to_window_start() {
        let inner = ScriptedSeeks {
            inner: clip(),
            answers: vec![300, 0],
            requests: Vec::new(),
        };

        let mut source = LimitedSource::new(inner, 300, 500).unwrap();
        assert_eq!(source.seek(250).unwrap(), 0);

        let first = source.next_message().unwrap();
        assert_eq!(first.timestamp, 0, "Playback should resume at the window start");
        assert_eq!(source.next_message().unwrap().timestamp, 100);

        let inner = source.into_inner();
        assert_eq!(inner.requests, vec![300, 550, 300]);
    }

    #[test]
    fn seek_to_zero_rewinds_to_window_start() {
        let mut source = LimitedSource::new(clip(), 350, 500).unwrap();
        source.next_message().unwrap();
        source.next_message().unwrap();

        assert_eq!(source.seek(0).unwrap(), 0);
        assert_eq!(source.next_message().unwrap().timestamp, 0);
    }
}
