use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BytesMut};
use std::cmp::min;
use std::collections::HashMap;
use std::io::Cursor;
use tracing::{debug, warn};

use super::chunk_header::{read_chunk_header, ChannelHeaderTable, ChunkHeader, ChunkHeaderFormat};
use super::serializer::{INITIAL_MAX_CHUNK_SIZE, MAX_CHUNK_SIZE};
use super::ChunkDeserializationError;
use crate::messages::MessagePayload;

/// Allows deserializing bytes representing RTMP chunks into RTMP message payloads.
///
/// Due to the nature of the RTMP chunk protocol it is required that every byte going through the
/// wire is sent to the same `ChunkDeserializer` instance, as future chunks can rely on previous
/// chunks, so any chunks missing from the stream may cause deserialization errors.
pub struct ChunkDeserializer {
    max_chunk_size: usize,
    buffer: BytesMut,
    previous_headers: ChannelHeaderTable,
    partial_messages: HashMap<u32, PartialMessage>,
}

struct PartialMessage {
    header: ChunkHeader,
    data: BytesMut,
}

impl ChunkDeserializer {
    /// Create a new `ChunkDeserializer` expecting RTMP chunks with a max size of 128 bytes.
    pub fn new() -> ChunkDeserializer {
        ChunkDeserializer {
            max_chunk_size: INITIAL_MAX_CHUNK_SIZE as usize,
            buffer: BytesMut::with_capacity(4096),
            previous_headers: ChannelHeaderTable::new(),
            partial_messages: HashMap::new(),
        }
    }

    /// Attempts to read a complete RTMP message from the passed in bytes.
    ///
    /// It is normal that one set of bytes will not form a complete RTMP message (or even a
    /// complete RTMP chunk).  The deserializer stores every byte passed into it, so the same
    /// bytes should never be passed in twice.  `Ok(None)` means more bytes are needed.
    ///
    /// Only one message is returned per call.  When the passed in bytes may contain more than
    /// one message the caller should keep calling this with an empty slice until `Ok(None)`
    /// is returned.
    ///
    /// Chunks of messages on different chunk streams may be interleaved; each chunk stream
    /// is accumulated separately.  `SetChunkSize` and `Abort` messages take effect before the
    /// next chunk is read, and are still returned to the caller.
    pub fn get_next_message(&mut self, bytes: &[u8]) -> Result<Option<MessagePayload>, ChunkDeserializationError> {
        self.buffer.extend_from_slice(bytes);

        loop {
            let (parsed, header_length) = match read_chunk_header(&self.buffer[..])? {
                Some(result) => result,
                None => return Ok(None),
            };

            let csid = parsed.chunk_stream_id;
            let continues_message = match self.partial_messages.get(&csid) {
                Some(_) if parsed.format == ChunkHeaderFormat::Repeat => true,
                Some(partial) => {
                    warn!(
                        csid,
                        received = partial.data.len(),
                        expected = partial.header.message_length,
                        "New message started before the previous one on the chunk stream completed"
                    );

                    false
                }

                None => false,
            };

            let header = self.previous_headers.resolve(parsed, continues_message)?;
            let received = match self.partial_messages.get(&csid) {
                Some(partial) if continues_message => partial.data.len(),
                _ => 0,
            };

            let remaining = (header.message_length as usize).saturating_sub(received);
            let chunk_length = min(remaining, self.max_chunk_size);
            if self.buffer.len() < header_length + chunk_length {
                return Ok(None);
            }

            self.buffer.advance(header_length);
            let chunk_data = self.buffer.split_to(chunk_length);
            self.previous_headers.record(header.clone());

            if !continues_message {
                // Grows as chunks arrive, a declared length alone reserves at most one chunk
                let data = BytesMut::with_capacity(min(header.message_length as usize, self.max_chunk_size));
                self.partial_messages.insert(csid, PartialMessage { header, data });
            }

            let is_complete = match self.partial_messages.get_mut(&csid) {
                Some(partial) => {
                    partial.data.extend_from_slice(&chunk_data);
                    partial.data.len() >= partial.header.message_length as usize
                }

                None => false,
            };

            if !is_complete {
                continue;
            }

            if let Some(partial) = self.partial_messages.remove(&csid) {
                let payload = MessagePayload {
                    timestamp: partial.header.timestamp,
                    type_id: partial.header.message_type_id,
                    message_stream_id: partial.header.message_stream_id,
                    data: partial.data.freeze(),
                };

                self.apply_protocol_control(&payload)?;
                return Ok(Some(payload));
            }
        }
    }

    /// Changes the chunk size the deserializer expects.  Normally this happens automatically
    /// when the peer sends a `SetChunkSize` message.
    pub fn set_max_chunk_size(&mut self, new_size: usize) -> Result<(), ChunkDeserializationError> {
        if new_size == 0 || new_size > MAX_CHUNK_SIZE as usize {
            return Err(ChunkDeserializationError::InvalidMaxChunkSize { chunk_size: new_size });
        }

        self.max_chunk_size = new_size;
        Ok(())
    }

    pub fn get_max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    fn apply_protocol_control(&mut self, payload: &MessagePayload) -> Result<(), ChunkDeserializationError> {
        match payload.type_id {
            1 => {
                let size = read_control_value(payload)?;
                self.set_max_chunk_size(size as usize)?;
                debug!(size, "Peer changed its chunk size");
            }

            2 => {
                let csid = read_control_value(payload)?;
                if self.partial_messages.remove(&csid).is_some() {
                    debug!(csid, "Peer aborted a partially received message");
                }
            }

            _ => (),
        }

        Ok(())
    }
}

impl Default for ChunkDeserializer {
    fn default() -> Self {
        ChunkDeserializer::new()
    }
}

fn read_control_value(payload: &MessagePayload) -> Result<u32, ChunkDeserializationError> {
    let mut cursor = Cursor::new(&payload.data[..]);
    cursor
        .read_u32::<BigEndian>()
        .map_err(|_| ChunkDeserializationError::MalformedControlMessage { type_id: payload.type_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_io::chunk_header::{write_basic_header, write_chunk_header};
    use crate::chunk_io::ChunkSerializer;
    use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
    use bytes::Bytes;

    fn form_type_0_chunk(csid: u32, timestamp: u32, type_id: u8, stream_id: u32, message_length: u32, data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        let header = ChunkHeader {
            format: ChunkHeaderFormat::Full,
            chunk_stream_id: csid,
            timestamp,
            delta_time: 0,
            message_length,
            message_type_id: type_id,
            message_stream_id: stream_id,
        };

        write_chunk_header(&mut bytes, &header).unwrap();
        bytes.extend_from_slice(data);
        bytes
    }

    fn form_repeat_chunk(csid: u32, data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_basic_header(&mut bytes, ChunkHeaderFormat::Repeat, csid).unwrap();
        bytes.extend_from_slice(data);
        bytes
    }

    #[test]
    fn can_read_message_in_single_type_0_chunk() {
        let bytes = form_type_0_chunk(4, 25, 9, 1, 3, &[1, 2, 3]);
        let mut deserializer = ChunkDeserializer::new();
        let payload = deserializer.get_next_message(&bytes).unwrap().unwrap();

        assert_eq!(payload.timestamp, 25, "Unexpected timestamp");
        assert_eq!(payload.type_id, 9, "Unexpected type id");
        assert_eq!(payload.message_stream_id, 1, "Unexpected stream id");
        assert_eq!(&payload.data[..], &[1, 2, 3], "Unexpected data");
    }

    #[test]
    fn stream_id_is_read_little_endian() {
        let mut bytes = vec![4_u8];
        bytes.write_u24::<BigEndian>(0).unwrap();
        bytes.write_u24::<BigEndian>(1).unwrap();
        bytes.write_u8(9).unwrap();
        bytes.write_u32::<LittleEndian>(0x0102_0304).unwrap();
        bytes.push(5);

        let mut deserializer = ChunkDeserializer::new();
        let payload = deserializer.get_next_message(&bytes).unwrap().unwrap();
        assert_eq!(payload.message_stream_id, 0x0102_0304);
    }

    #[test]
    fn returns_none_until_whole_chunk_arrives() {
        let bytes = form_type_0_chunk(4, 25, 9, 1, 3, &[1, 2, 3]);
        let mut deserializer = ChunkDeserializer::new();

        for byte in &bytes[..bytes.len() - 1] {
            let result = deserializer.get_next_message(&[*byte]).unwrap();
            assert!(result.is_none(), "Expected no message yet");
        }

        let payload = deserializer.get_next_message(&bytes[bytes.len() - 1..]).unwrap().unwrap();
        assert_eq!(&payload.data[..], &[1, 2, 3]);
    }

    #[test]
    fn multiple_messages_are_returned_one_per_call() {
        let mut bytes = form_type_0_chunk(4, 25, 9, 1, 1, &[1]);
        bytes.extend(form_type_0_chunk(5, 30, 8, 1, 1, &[2]));

        let mut deserializer = ChunkDeserializer::new();
        let first = deserializer.get_next_message(&bytes).unwrap().unwrap();
        let second = deserializer.get_next_message(&[]).unwrap().unwrap();
        let third = deserializer.get_next_message(&[]).unwrap();

        assert_eq!(first.data[0], 1);
        assert_eq!(second.data[0], 2);
        assert!(third.is_none());
    }

    #[test]
    fn interleaved_chunk_streams_are_reassembled_separately() {
        let video: Vec<u8> = (0..200).map(|x| x as u8).collect();
        let audio = [9_u8; 50];

        let mut bytes = form_type_0_chunk(5, 100, 9, 1, 200, &video[..128]);
        bytes.extend(form_type_0_chunk(4, 110, 8, 1, 50, &audio));
        bytes.extend(form_repeat_chunk(5, &video[128..]));

        let mut deserializer = ChunkDeserializer::new();
        let first = deserializer.get_next_message(&bytes).unwrap().unwrap();
        let second = deserializer.get_next_message(&[]).unwrap().unwrap();

        assert_eq!(first.type_id, 8, "Audio message should complete first");
        assert_eq!(&first.data[..], &audio[..]);
        assert_eq!(second.type_id, 9);
        assert_eq!(second.timestamp, 100);
        assert_eq!(&second.data[..], &video[..]);
    }

    #[test]
    fn non_type_0_chunk_without_previous_chunk_is_an_error() {
        let bytes = form_repeat_chunk(4, &[1, 2, 3]);
        let mut deserializer = ChunkDeserializer::new();

        match deserializer.get_next_message(&bytes) {
            Err(ChunkDeserializationError::NoPreviousChunkOnStream { csid: 4 }) => (),
            x => panic!("Expected no previous chunk error, got {:?}", x),
        }
    }

    #[test]
    fn compressed_messages_from_serializer_resolve_timestamps() {
        let mut serializer = ChunkSerializer::new();
        let mut deserializer = ChunkDeserializer::new();
        let timestamps = [0_u32, 40, 80, 80, 0xFF_FFFF, 0x0100_0010];

        for timestamp in timestamps.iter() {
            let message = MessagePayload {
                timestamp: *timestamp,
                type_id: 9,
                message_stream_id: 1,
                data: Bytes::from(vec![1_u8; 300]),
            };

            let packet = serializer.serialize(&message, false).unwrap();
            let payload = deserializer.get_next_message(&packet.bytes).unwrap().unwrap();
            assert_eq!(payload, message, "Unexpected payload at timestamp {}", timestamp);
        }
    }

    #[test]
    fn set_chunk_size_message_is_applied_automatically() {
        let mut serializer = ChunkSerializer::new();
        let mut deserializer = ChunkDeserializer::new();

        let mut bytes = serializer.set_max_chunk_size(4096, 0).unwrap().bytes.to_vec();
        let message = MessagePayload {
            timestamp: 10,
            type_id: 9,
            message_stream_id: 1,
            data: Bytes::from(vec![3_u8; 3000]),
        };

        bytes.extend_from_slice(&serializer.serialize(&message, false).unwrap().bytes);

        let control = deserializer.get_next_message(&bytes).unwrap().unwrap();
        assert_eq!(control.type_id, 1);
        assert_eq!(deserializer.get_max_chunk_size(), 4096);

        let payload = deserializer.get_next_message(&[]).unwrap().unwrap();
        assert_eq!(payload, message);
    }

    #[test]
    fn abort_message_drops_partial_message() {
        let mut bytes = form_type_0_chunk(5, 100, 9, 1, 200, &[1_u8; 128]);

        let mut abort = Vec::new();
        abort.write_u32::<BigEndian>(5).unwrap();
        bytes.extend(form_type_0_chunk(2, 0, 2, 0, 4, &abort));
        bytes.extend(form_type_0_chunk(5, 200, 9, 1, 2, &[7, 8]));

        let mut deserializer = ChunkDeserializer::new();
        let control = deserializer.get_next_message(&bytes).unwrap().unwrap();
        let payload = deserializer.get_next_message(&[]).unwrap().unwrap();

        assert_eq!(control.type_id, 2);
        assert_eq!(payload.timestamp, 200);
        assert_eq!(&payload.data[..], &[7, 8]);
    }

    #[test]
    fn zero_chunk_size_from_peer_is_an_error() {
        let mut data = Vec::new();
        data.write_u32::<BigEndian>(0).unwrap();
        let bytes = form_type_0_chunk(2, 0, 1, 0, 4, &data);

        let mut deserializer = ChunkDeserializer::new();
        match deserializer.get_next_message(&bytes) {
            Err(ChunkDeserializationError::InvalidMaxChunkSize { chunk_size: 0 }) => (),
            x => panic!("Expected invalid chunk size error, got {:?}", x),
        }
    }

    #[test]
    fn empty_message_is_returned() {
        let bytes = form_type_0_chunk(3, 5, 20, 0, 0, &[]);
        let mut deserializer = ChunkDeserializer::new();
        let payload = deserializer.get_next_message(&bytes).unwrap().unwrap();

        assert_eq!(payload.data.len(), 0);
    }

    #[test]
    fn declared_lengths_do_not_reserve_whole_messages() {
        let mut deserializer = ChunkDeserializer::new();
        let first_chunk = vec![0_u8; INITIAL_MAX_CHUNK_SIZE as usize];
        for csid in 3..400 {
            let bytes = form_type_0_chunk(csid, 0, 9, 1, 0xFF_FFFF, &first_chunk);
            assert!(deserializer.get_next_message(&bytes).unwrap().is_none());
        }

        assert_eq!(deserializer.partial_messages.len(), 397);
        for partial in deserializer.partial_messages.values() {
            assert_eq!(partial.data.len(), INITIAL_MAX_CHUNK_SIZE as usize);
            assert!(
                partial.data.capacity() <= 2 * INITIAL_MAX_CHUNK_SIZE as usize,
                "Partial message reserved {} bytes",
                partial.data.capacity()
            );
        }
    }

    #[test]
    fn message_larger_than_first_chunk_still_reassembles() {
        let data: Vec<u8> = (0..1000_u32).map(|x| x as u8).collect();
        let payload = MessagePayload {
            timestamp: 10,
            type_id: 9,
            message_stream_id: 1,
            data: Bytes::from(data.clone()),
        };

        let mut serializer = ChunkSerializer::new();
        let packet = serializer.serialize(&payload, false).unwrap();

        let mut deserializer = ChunkDeserializer::new();
        let result = deserializer.get_next_message(&packet.bytes[..]).unwrap().unwrap();
        assert_eq!(&result.data[..], &data[..]);
    }
}
