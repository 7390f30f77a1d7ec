use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info, warn};

use super::{MediaCursor, MediaEntry, MediaSource, MediaSourceError, DEFAULT_AGGREGATE_BYTE_LIMIT};
use crate::messages::{
    is_audio_sequence_header, is_video_sequence_header, MessagePayload, AMF0_DATA_TYPE_ID, AUDIO_TYPE_ID,
    VIDEO_TYPE_ID,
};

const FLV_HEADER_LENGTH: u32 = 9;
const TAG_HEADER_LENGTH: u64 = 11;
const BACK_POINTER_LENGTH: u64 = 4;

/// Reads an FLV file as a media source.
///
/// All tags are indexed when the reader is opened; tag bodies are only read when they are
/// played.  The first script data tag (`onMetaData`) and the first AVC and AAC sequence
/// headers become start messages so they are sent on every play and seek, and are left
/// out of the playable messages.
pub struct FlvReader<R> {
    reader: R,
    tags: Vec<MediaEntry>,
    data_offsets: Vec<u64>,
    start_messages: Vec<MessagePayload>,
    cursor: MediaCursor,
    closed: bool,
}

impl FlvReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MediaSourceError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader = FlvReader::new(BufReader::new(file))?;
        info!(path = %path.display(), tags = reader.tags.len(), "Opened flv file for reading");
        Ok(reader)
    }
}

impl<R: Read + Seek> FlvReader<R> {
    pub fn new(mut reader: R) -> Result<Self, MediaSourceError> {
        let file_length = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut signature = [0_u8; 3];
        read_header_bytes(&mut reader, &mut signature)?;
        if &signature != b"FLV" {
            return Err(MediaSourceError::InvalidFlvHeader);
        }

        let _version = reader.read_u8().map_err(header_error)?;
        let _flags = reader.read_u8().map_err(header_error)?;
        let data_offset = reader.read_u32::<BigEndian>().map_err(header_error)?;
        if data_offset < FLV_HEADER_LENGTH {
            return Err(MediaSourceError::InvalidFlvHeader);
        }

        // Skip to the first tag, past the zero back pointer
        let mut position = u64::from(data_offset) + BACK_POINTER_LENGTH;

        let mut flv = FlvReader {
            reader,
            tags: Vec::new(),
            data_offsets: Vec::new(),
            start_messages: Vec::new(),
            cursor: MediaCursor::new(DEFAULT_AGGREGATE_BYTE_LIMIT),
            closed: false,
        };

        let mut metadata = None;
        let mut video_header = None;
        let mut audio_header = None;

        while position + TAG_HEADER_LENGTH <= file_length {
            flv.reader.seek(SeekFrom::Start(position))?;
            let tag_type = flv.reader.read_u8()? & 0x1F;
            let data_length = u64::from(flv.reader.read_u24::<BigEndian>()?);
            let lower_timestamp = flv.reader.read_u24::<BigEndian>()?;
            let upper_timestamp = u32::from(flv.reader.read_u8()?);
            let _stream_id = flv.reader.read_u24::<BigEndian>()?;

            let timestamp = (upper_timestamp << 24) | lower_timestamp;
            let data_offset = position + TAG_HEADER_LENGTH;
            if data_offset + data_length > file_length {
                warn!(offset = position, "Flv file ends in the middle of a tag, ignoring the rest");
                break;
            }

            match tag_type {
                AUDIO_TYPE_ID | VIDEO_TYPE_ID | AMF0_DATA_TYPE_ID => (),
                _ => return Err(MediaSourceError::CorruptTag { offset: position }),
            }

            let mut prefix = [0_u8; 2];
            let prefix_length = data_length.min(2) as usize;
            flv.reader.read_exact(&mut prefix[..prefix_length])?;
            let prefix = &prefix[..prefix_length];

            let is_start_message = match tag_type {
                AMF0_DATA_TYPE_ID => metadata.is_none() && flv.tags.is_empty(),
                VIDEO_TYPE_ID => video_header.is_none() && is_video_sequence_header(prefix),
                _ => audio_header.is_none() && is_audio_sequence_header(prefix),
            };

            if is_start_message {
                let message = flv.read_message(data_offset, data_length as usize, tag_type, timestamp)?;
                match tag_type {
                    AMF0_DATA_TYPE_ID => metadata = Some(message),
                    VIDEO_TYPE_ID => video_header = Some(message),
                    _ => audio_header = Some(message),
                }
            } else {
                flv.tags.push(MediaEntry::new(timestamp, tag_type, prefix, data_length as usize));
                flv.data_offsets.push(data_offset);
            }

            position = data_offset + data_length + BACK_POINTER_LENGTH;
        }

        flv.start_messages = metadata.into_iter().chain(video_header).chain(audio_header).collect();
        flv.reader.seek(SeekFrom::Start(0))?;

        debug!(
            tags = flv.tags.len(),
            start_messages = flv.start_messages.len(),
            "Indexed flv tags"
        );

        Ok(flv)
    }

    pub fn with_aggregate_byte_limit(mut self, limit: usize) -> Self {
        self.cursor.set_aggregate_byte_limit(limit);
        self
    }

    /// Timestamp of the last playable tag
    pub fn duration_ms(&self) -> u32 {
        self.tags.last().map(|tag| tag.timestamp).unwrap_or(0)
    }

    fn read_message(
        &mut self,
        data_offset: u64,
        data_length: usize,
        type_id: u8,
        timestamp: u32,
    ) -> Result<MessagePayload, MediaSourceError> {
        self.reader.seek(SeekFrom::Start(data_offset))?;
        let mut data = vec![0_u8; data_length];
        self.reader.read_exact(&mut data).map_err(|error| match error.kind() {
            io::ErrorKind::UnexpectedEof => MediaSourceError::CorruptTag {
                offset: data_offset - TAG_HEADER_LENGTH,
            },
            _ => MediaSourceError::Io(error),
        })?;

        Ok(MessagePayload {
            timestamp,
            type_id,
            message_stream_id: 0,
            data: Bytes::from(data),
        })
    }
}

impl<R: Read + Seek> MediaSource for FlvReader<R> {
    fn seek(&mut self, target_ms: u32) -> Result<u32, MediaSourceError> {
        if self.closed {
            return Err(MediaSourceError::Closed);
        }

        let actual = self.cursor.seek(&self.tags, target_ms);
        debug!(target_ms, actual, "Seeked flv file");
        Ok(actual)
    }

    fn has_next(&self) -> bool {
        !self.closed && self.cursor.has_next(&self.tags)
    }

    fn next_message(&mut self) -> Result<MessagePayload, MediaSourceError> {
        if self.closed {
            return Err(MediaSourceError::Closed);
        }

        let tags = &self.tags;
        let data_offsets = &self.data_offsets;
        let reader = &mut self.reader;

        self.cursor.next(tags, |index| {
            let tag = &tags[index];
            let data_offset = data_offsets[index];
            reader.seek(SeekFrom::Start(data_offset))?;

            let mut data = vec![0_u8; tag.data_length];
            reader.read_exact(&mut data)?;

            Ok(MessagePayload {
                timestamp: tag.timestamp,
                type_id: tag.type_id,
                message_stream_id: 0,
                data: Bytes::from(data),
            })
        })
    }

    fn start_messages(&self) -> Vec<MessagePayload> {
        self.start_messages.clone()
    }

    fn set_aggregate_target(&mut self, duration_ms: u32) {
        self.cursor.set_aggregate_target(duration_ms);
    }

    fn close(&mut self) {
        if !self.closed {
            debug!("Closing flv reader");
        }

        self.closed = true;
    }
}

fn read_header_bytes<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<(), MediaSourceError> {
    reader.read_exact(buffer).map_err(header_error)
}

fn header_error(error: io::Error) -> MediaSourceError {
    match error.kind() {
        io::ErrorKind::UnexpectedEof => MediaSourceError::InvalidFlvHeader,
        _ => MediaSourceError::Io(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use rml_amf0::Amf0Value;
    use std::collections::HashMap;
    use std::io::Cursor;

    fn write_tag(output: &mut Vec<u8>, tag_type: u8, timestamp: u32, data: &[u8]) {
        output.write_u8(tag_type).unwrap();
        output.write_u24::<BigEndian>(data.len() as u32).unwrap();
        output.write_u24::<BigEndian>(timestamp & 0xFF_FFFF).unwrap();
        output.write_u8((timestamp >> 24) as u8).unwrap();
        output.write_u24::<BigEndian>(0).unwrap();
        output.extend_from_slice(data);
        output.write_u32::<BigEndian>(11 + data.len() as u32).unwrap();
    }

    fn flv_file() -> Vec<u8> {
        let mut properties = HashMap::new();
        properties.insert("duration".to_string(), Amf0Value::Number(0.2));
        let metadata = rml_amf0::serialize(&vec![
            Amf0Value::Utf8String("onMetaData".to_string()),
            Amf0Value::Object(properties),
        ])
        .unwrap();

        let mut output = b"FLV".to_vec();
        output.write_u8(1).unwrap();
        output.write_u8(0b0000_0101).unwrap();
        output.write_u32::<BigEndian>(9).unwrap();
        output.write_u32::<BigEndian>(0).unwrap();

        write_tag(&mut output, 18, 0, &metadata);
        write_tag(&mut output, 9, 0, &[0x17, 0x00, 0x01, 0x02]);
        write_tag(&mut output, 8, 0, &[0xAF, 0x00, 0x12]);
        write_tag(&mut output, 9, 0, &[0x17, 0x01, 0xA0]);
        write_tag(&mut output, 8, 20, &[0xAF, 0x01, 0xB0]);
        write_tag(&mut output, 9, 40, &[0x27, 0x01, 0xA1]);
        write_tag(&mut output, 9, 80, &[0x17, 0x01, 0xA2]);
        write_tag(&mut output, 8, 90, &[0xAF, 0x01, 0xB1]);
        write_tag(&mut output, 9, 120, &[0x27, 0x01, 0xA3]);
        output
    }

    #[test]
    fn metadata_and_sequence_headers_become_start_messages() {
        let reader = FlvReader::new(Cursor::new(flv_file())).unwrap();
        let start = reader.start_messages();

        assert_eq!(start.len(), 3);
        assert_eq!(start[0].type_id, 18);
        assert_eq!(start[1].type_id, 9);
        assert_eq!(&start[1].data[..], &[0x17, 0x00, 0x01, 0x02]);
        assert_eq!(start[2].type_id, 8);
        assert_eq!(&start[2].data[..], &[0xAF, 0x00, 0x12]);
    }

    #[test]
    fn playable_tags_are_read_in_order() {
        let mut reader = FlvReader::new(Cursor::new(flv_file())).unwrap();
        let mut read = Vec::new();
        while reader.has_next() {
            let message = reader.next_message().unwrap();
            read.push((message.type_id, message.timestamp, message.data[2]));
        }

        assert_eq!(
            read,
            vec![(9, 0, 0xA0), (8, 20, 0xB0), (9, 40, 0xA1), (9, 80, 0xA2), (8, 90, 0xB1), (9, 120, 0xA3)]
        );
        assert_eq!(reader.duration_ms(), 120);
    }

    #[test]
    fn seek_returns_preceding_keyframe_time() {
        let mut reader = FlvReader::new(Cursor::new(flv_file())).unwrap();

        assert_eq!(reader.seek(100).unwrap(), 80);
        let message = reader.next_message().unwrap();
        assert_eq!(message.timestamp, 80);
        assert_eq!(message.data[2], 0xA2);

        assert_eq!(reader.seek(79).unwrap(), 0);
        assert_eq!(reader.next_message().unwrap().data[2], 0xA0);
    }

    #[test]
    fn aggregated_read_bundles_tags() {
        let mut reader = FlvReader::new(Cursor::new(flv_file())).unwrap();
        reader.set_aggregate_target(1000);

        let message = reader.next_message().unwrap();
        assert_eq!(message.type_id, 22);
        assert!(!reader.has_next());
    }

    #[test]
    fn invalid_signature_is_rejected() {
        let mut data = flv_file();
        data[0] = b'X';

        match FlvReader::new(Cursor::new(data)) {
            Err(MediaSourceError::InvalidFlvHeader) => (),
            Err(x) => panic!("Expected invalid header error, got {:?}", x),
            Ok(_) => panic!("Expected invalid header error"),
        }
    }

    #[test]
    fn short_file_is_rejected() {
        match FlvReader::new(Cursor::new(b"FLV\x01".to_vec())) {
            Err(MediaSourceError::InvalidFlvHeader) => (),
            Err(x) => panic!("Expected invalid header error, got {:?}", x),
            Ok(_) => panic!("Expected invalid header error"),
        }
    }

    #[test]
    fn unknown_tag_type_is_corrupt() {
        let mut data = flv_file();
        write_tag(&mut data, 3, 150, &[1, 2, 3]);
        let offset = (flv_file().len()) as u64;

        match FlvReader::new(Cursor::new(data)) {
            Err(MediaSourceError::CorruptTag { offset: x }) => assert_eq!(x, offset),
            Err(x) => panic!("Expected corrupt tag error, got {:?}", x),
            Ok(_) => panic!("Expected corrupt tag error"),
        }
    }

    #[test]
    fn truncated_last_tag_is_ignored() {
        let mut data = flv_file();
        write_tag(&mut data, 9, 160, &[0x27, 0x01, 0xA4, 0xA5]);
        let truncated_length = data.len() - 6;
        data.truncate(truncated_length);

        let mut reader = FlvReader::new(Cursor::new(data)).unwrap();
        let mut count = 0;
        while reader.has_next() {
            reader.next_message().unwrap();
            count += 1;
        }

        assert_eq!(count, 6);
    }
}
