//! Fan-out of live published streams to any number of subscribing connections.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rml_amf0::Amf0Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::messages::{
    is_audio_sequence_header, is_video_sequence_header, MessagePayload, RtmpMessage, AMF0_DATA_TYPE_ID,
    AUDIO_TYPE_ID, VIDEO_TYPE_ID,
};

#[derive(Debug, Error, PartialEq)]
pub enum LiveStreamError {
    #[error("Stream '{name}' already has a publisher")]
    AlreadyPublishing { name: String },
}

/// Receiver of a live stream's messages, usually a handle to a player's connection
pub trait Subscriber: Send + Sync {
    /// Returns false once the subscriber can no longer accept messages, which removes it
    /// from the stream.
    fn deliver(&self, message: &MessagePayload) -> bool;

    /// Called once when the publisher stops
    fn stream_ended(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConfigSlot {
    Metadata,
    VideoSequenceHeader,
    AudioSequenceHeader,
}

const CONFIG_ORDER: [ConfigSlot; 3] = [
    ConfigSlot::Metadata,
    ConfigSlot::VideoSequenceHeader,
    ConfigSlot::AudioSequenceHeader,
];

/// A stream being published right now.  Subscribers may join and leave from any thread,
/// including while a broadcast is running.
pub struct LiveStream {
    name: String,
    publisher_id: u64,
    config: DashMap<ConfigSlot, MessagePayload>,
    subscribers: DashMap<u64, Arc<dyn Subscriber>>,
}

impl LiveStream {
    fn new(name: String, publisher_id: u64) -> LiveStream {
        LiveStream {
            name,
            publisher_id,
            config: DashMap::new(),
            subscribers: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publisher_id(&self) -> u64 {
        self.publisher_id
    }

    /// Metadata and the latest codec sequence headers, which a player joining part way
    /// through needs before it can decode anything
    pub fn config_messages(&self) -> Vec<MessagePayload> {
        CONFIG_ORDER
            .iter()
            .filter_map(|slot| self.config.get(slot).map(|entry| entry.value().clone()))
            .collect()
    }

    pub fn add_subscriber(&self, subscriber_id: u64, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.insert(subscriber_id, subscriber);
        debug!(stream = %self.name, subscriber_id, subscribers = self.subscribers.len(), "Subscriber joined");
    }

    pub fn remove_subscriber(&self, subscriber_id: u64) -> bool {
        let removed = self.subscribers.remove(&subscriber_id).is_some();
        if removed {
            debug!(stream = %self.name, subscriber_id, "Subscriber left");
        }

        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Sends the message to every subscriber registered when the call started and returns
    /// how many accepted it.  Subscribers that refuse it are dropped.
    pub fn broadcast(&self, message: &MessagePayload) -> usize {
        self.remember_config(message);

        let snapshot: Vec<(u64, Arc<dyn Subscriber>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut delivered = 0;
        for (subscriber_id, subscriber) in snapshot {
            if subscriber.deliver(message) {
                delivered += 1;
            } else {
                self.subscribers.remove(&subscriber_id);
                debug!(stream = %self.name, subscriber_id, "Pruned subscriber that stopped accepting messages");
            }
        }

        delivered
    }

    fn remember_config(&self, message: &MessagePayload) {
        let slot = match message.type_id {
            VIDEO_TYPE_ID if is_video_sequence_header(&message.data) => ConfigSlot::VideoSequenceHeader,
            AUDIO_TYPE_ID if is_audio_sequence_header(&message.data) => ConfigSlot::AudioSequenceHeader,
            AMF0_DATA_TYPE_ID if is_metadata(message) => ConfigSlot::Metadata,
            _ => return,
        };

        debug!(stream = %self.name, ?slot, "Caching stream config message");
        self.config.insert(slot, message.clone());
    }

    fn end(&self) {
        let snapshot: Vec<Arc<dyn Subscriber>> = self.subscribers.iter().map(|entry| Arc::clone(entry.value())).collect();
        self.subscribers.clear();

        for subscriber in snapshot {
            subscriber.stream_ended();
        }
    }
}

fn is_metadata(message: &MessagePayload) -> bool {
    match message.to_rtmp_message() {
        Ok(RtmpMessage::Amf0Data { values }) => match values.first() {
            Some(Amf0Value::Utf8String(name)) => name == "onMetaData",
            _ => false,
        },

        _ => false,
    }
}

/// Every live stream currently being published, by name
#[derive(Default)]
pub struct StreamRegistry {
    streams: DashMap<String, Arc<LiveStream>>,
}

impl StreamRegistry {
    pub fn new() -> StreamRegistry {
        StreamRegistry { streams: DashMap::new() }
    }

    pub fn start_publishing(&self, name: &str, publisher_id: u64) -> Result<Arc<LiveStream>, LiveStreamError> {
        match self.streams.entry(name.to_string()) {
            Entry::Occupied(_) => Err(LiveStreamError::AlreadyPublishing { name: name.to_string() }),
            Entry::Vacant(entry) => {
                let stream = Arc::new(LiveStream::new(name.to_string(), publisher_id));
                entry.insert(Arc::clone(&stream));
                info!(stream = name, publisher_id, "Live stream published");
                Ok(stream)
            }
        }
    }

    /// Removes the stream if `publisher_id` is the one publishing it, telling every
    /// subscriber the stream has ended.
    pub fn stop_publishing(&self, name: &str, publisher_id: u64) -> bool {
        match self.streams.remove_if(name, |_, stream| stream.publisher_id == publisher_id) {
            Some((_, stream)) => {
                info!(stream = name, publisher_id, subscribers = stream.subscriber_count(), "Live stream unpublished");
                stream.end();
                true
            }

            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<LiveStream>> {
        self.streams.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct CountingSubscriber {
        received: AtomicUsize,
        refuse: AtomicBool,
        ended: AtomicBool,
    }

    impl Subscriber for CountingSubscriber {
        fn deliver(&self, _message: &MessagePayload) -> bool {
            if self.refuse.load(Ordering::SeqCst) {
                return false;
            }

            self.received.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn stream_ended(&self) {
            self.ended.store(true, Ordering::SeqCst);
        }
    }

    fn video(timestamp: u32, first_bytes: &[u8]) -> MessagePayload {
        MessagePayload {
            timestamp,
            type_id: VIDEO_TYPE_ID,
            message_stream_id: 1,
            data: Bytes::from(first_bytes.to_vec()),
        }
    }

    fn metadata() -> MessagePayload {
        RtmpMessage::Amf0Data {
            values: vec![
                Amf0Value::Utf8String("onMetaData".to_string()),
                Amf0Value::Number(1.0),
            ],
        }
        .into_message_payload(0, 1)
        .unwrap()
    }

    #[test]
    fn second_publisher_is_refused() {
        let registry = StreamRegistry::new();
        registry.start_publishing("abc", 1).unwrap();

        match registry.start_publishing("abc", 2) {
            Err(LiveStreamError::AlreadyPublishing { name }) => assert_eq!(name, "abc"),
            Ok(_) => panic!("Expected already publishing error"),
        }
    }

    #[test]
    fn only_the_publisher_can_stop_a_stream() {
        let registry = StreamRegistry::new();
        let stream = registry.start_publishing("abc", 1).unwrap();
        let subscriber = Arc::new(CountingSubscriber::default());
        stream.add_subscriber(10, subscriber.clone());

        assert!(!registry.stop_publishing("abc", 2));
        assert!(registry.get("abc").is_some());

        assert!(registry.stop_publishing("abc", 1));
        assert!(registry.get("abc").is_none());
        assert!(registry.is_empty());
        assert!(subscriber.ended.load(Ordering::SeqCst));
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[test]
    fn broadcast_reaches_every_subscriber_and_prunes_refusals() {
        let registry = StreamRegistry::new();
        let stream = registry.start_publishing("abc", 1).unwrap();
        let first = Arc::new(CountingSubscriber::default());
        let second = Arc::new(CountingSubscriber::default());
        stream.add_subscriber(1, first.clone());
        stream.add_subscriber(2, second.clone());

        assert_eq!(stream.broadcast(&video(0, &[0x27, 1])), 2);

        second.refuse.store(true, Ordering::SeqCst);
        assert_eq!(stream.broadcast(&video(40, &[0x27, 1])), 1);
        assert_eq!(stream.subscriber_count(), 1);
        assert_eq!(first.received.load(Ordering::SeqCst), 2);
        assert_eq!(second.received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn config_messages_are_cached_in_order() {
        let registry = StreamRegistry::new();
        let stream = registry.start_publishing("abc", 1).unwrap();
        let audio_header = MessagePayload {
            timestamp: 0,
            type_id: AUDIO_TYPE_ID,
            message_stream_id: 1,
            data: Bytes::from(vec![0xAF, 0, 0x12, 0x10]),
        };

        stream.broadcast(&audio_header);
        stream.broadcast(&video(0, &[0x17, 0, 0, 0, 0, 1]));
        stream.broadcast(&video(0, &[0x17, 1, 0, 0, 0]));
        stream.broadcast(&metadata());
        stream.broadcast(&video(33, &[0x17, 0, 0, 0, 0, 2]));

        let config = stream.config_messages();
        assert_eq!(config.len(), 3);
        assert_eq!(config[0].type_id, AMF0_DATA_TYPE_ID);
        assert_eq!(&config[1].data[..], &[0x17, 0, 0, 0, 0, 2], "Latest video sequence header should be kept");
        assert_eq!(config[2], audio_header);
    }

    #[test]
    fn subscribers_can_join_and_leave_during_broadcasts() {
        let registry = Arc::new(StreamRegistry::new());
        let stream = registry.start_publishing("abc", 1).unwrap();
        let steady = Arc::new(CountingSubscriber::default());
        stream.add_subscriber(0, steady.clone());

        let churn = {
            let stream = Arc::clone(&stream);
            thread::spawn(move || {
                for id in 1..500u64 {
                    stream.add_subscriber(id, Arc::new(CountingSubscriber::default()));
                    if id % 2 == 0 {
                        stream.remove_subscriber(id - 1);
                    }
                }
            })
        };

        let broadcaster = {
            let stream = Arc::clone(&stream);
            thread::spawn(move || {
                for timestamp in 0..500u32 {
                    stream.broadcast(&video(timestamp, &[0x27, 1]));
                }
            })
        };

        churn.join().unwrap();
        broadcaster.join().unwrap();

        assert_eq!(steady.received.load(Ordering::SeqCst), 500);
        assert!(stream.subscriber_count() >= 250);
    }
}
