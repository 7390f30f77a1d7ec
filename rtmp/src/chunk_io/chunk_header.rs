use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Cursor, Write};
use tracing::{debug, warn};

use super::{ChunkDeserializationError, ChunkSerializationError};

/// Value of the 3 byte timestamp field signalling that the real value follows as 4 bytes
pub const EXTENDED_TIMESTAMP_MARKER: u32 = 0xFF_FFFF;

pub const MIN_CHUNK_STREAM_ID: u32 = 2;
pub const MAX_CHUNK_STREAM_ID: u32 = 65599;

/// Largest message length that fits in the 3 byte length field
pub const MAX_MESSAGE_LENGTH: u32 = 0xFF_FFFF;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ChunkHeaderFormat {
    Full,            // Format 0
    DeltaWithLength, // Format 1
    TimeDeltaOnly,   // Format 2
    Repeat,          // Format 3
}

impl ChunkHeaderFormat {
    pub fn from_bits(bits: u8) -> ChunkHeaderFormat {
        match bits & 0b11 {
            0 => ChunkHeaderFormat::Full,
            1 => ChunkHeaderFormat::DeltaWithLength,
            2 => ChunkHeaderFormat::TimeDeltaOnly,
            _ => ChunkHeaderFormat::Repeat,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            ChunkHeaderFormat::Full => 0,
            ChunkHeaderFormat::DeltaWithLength => 1,
            ChunkHeaderFormat::TimeDeltaOnly => 2,
            ChunkHeaderFormat::Repeat => 3,
        }
    }
}

/// A chunk header with every field resolved.  `timestamp` is always the absolute timestamp
/// of the message, even when the wire form only carried a delta.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct ChunkHeader {
    pub format: ChunkHeaderFormat,
    pub chunk_stream_id: u32,
    pub timestamp: u32,
    pub delta_time: u32,
    pub message_length: u32,
    pub message_type_id: u8,
    pub message_stream_id: u32,
}

impl ChunkHeader {
    pub fn new(format: ChunkHeaderFormat, chunk_stream_id: u32) -> ChunkHeader {
        ChunkHeader {
            format,
            chunk_stream_id,
            timestamp: 0,
            delta_time: 0,
            message_length: 0,
            message_type_id: 0,
            message_stream_id: 0,
        }
    }

    /// The value that belongs in the 3 byte time slot of this header's format
    fn time_field(&self) -> u32 {
        match self.format {
            ChunkHeaderFormat::Full => self.timestamp,
            _ => self.delta_time,
        }
    }
}

/// The last fully resolved header seen on each chunk stream.  Serializers and deserializers
/// each own one; a table is never shared between the two directions of a connection.
#[derive(Debug, Default)]
pub struct ChannelHeaderTable {
    headers: HashMap<u32, ChunkHeader>,
}

impl ChannelHeaderTable {
    pub fn new() -> ChannelHeaderTable {
        ChannelHeaderTable {
            headers: HashMap::new(),
        }
    }

    pub fn get(&self, chunk_stream_id: u32) -> Option<&ChunkHeader> {
        self.headers.get(&chunk_stream_id)
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Drops the state of a single chunk stream so its next header goes out in full
    pub fn forget(&mut self, chunk_stream_id: u32) {
        self.headers.remove(&chunk_stream_id);
    }

    pub fn clear(&mut self) {
        if !self.headers.is_empty() {
            debug!(channels = self.headers.len(), "Resetting chunk header compression state");
        }

        self.headers.clear();
    }

    /// Picks the most compact header format for a new message on the chunk stream and
    /// records the header as the receiving side will resolve it.
    pub fn compress(
        &mut self,
        chunk_stream_id: u32,
        timestamp: u32,
        message_length: u32,
        message_type_id: u8,
        message_stream_id: u32,
    ) -> ChunkHeader {
        let mut header = ChunkHeader {
            format: ChunkHeaderFormat::Full,
            chunk_stream_id,
            timestamp,
            delta_time: 0,
            message_length,
            message_type_id,
            message_stream_id,
        };

        if let Some(previous) = self.headers.get(&chunk_stream_id) {
            let can_compress = message_stream_id != 0
                && timestamp != 0
                && previous.message_stream_id == message_stream_id;

            if can_compress {
                let delta = i64::from(timestamp) - i64::from(previous.timestamp);
                if delta < 0 {
                    warn!(
                        csid = chunk_stream_id,
                        previous = previous.timestamp,
                        current = timestamp,
                        "Negative timestamp delta on chunk stream, sending a zero delta instead"
                    );
                }

                header.delta_time = delta.max(0) as u32;
                header.timestamp = previous.timestamp.wrapping_add(header.delta_time);
                header.format = if previous.message_length == message_length
                    && previous.message_type_id == message_type_id
                {
                    ChunkHeaderFormat::TimeDeltaOnly
                } else {
                    ChunkHeaderFormat::DeltaWithLength
                };
            }
        }

        self.headers.insert(chunk_stream_id, header.clone());
        header
    }

    /// Fills in the fields a parsed header inherits from the previous header on its chunk
    /// stream.  `continues_message` is true when the chunk carries more bytes of a message
    /// that is still being accumulated, in which case a repeat header changes nothing.
    ///
    /// The table is left untouched so a chunk whose payload has not fully arrived yet can be
    /// resolved again later.  Call `record` once the chunk is consumed.
    pub fn resolve(
        &self,
        parsed: ChunkHeader,
        continues_message: bool,
    ) -> Result<ChunkHeader, ChunkDeserializationError> {
        let csid = parsed.chunk_stream_id;
        let resolved = match parsed.format {
            ChunkHeaderFormat::Full => parsed,

            format => {
                let previous = match self.headers.get(&csid) {
                    Some(previous) => previous,
                    None => return Err(ChunkDeserializationError::NoPreviousChunkOnStream { csid }),
                };

                match format {
                    ChunkHeaderFormat::DeltaWithLength => ChunkHeader {
                        timestamp: previous.timestamp.wrapping_add(parsed.delta_time),
                        message_stream_id: previous.message_stream_id,
                        ..parsed
                    },

                    ChunkHeaderFormat::TimeDeltaOnly => ChunkHeader {
                        timestamp: previous.timestamp.wrapping_add(parsed.delta_time),
                        message_length: previous.message_length,
                        message_type_id: previous.message_type_id,
                        message_stream_id: previous.message_stream_id,
                        ..parsed
                    },

                    _ if continues_message => previous.clone(),

                    _ => ChunkHeader {
                        timestamp: previous.timestamp.wrapping_add(previous.delta_time),
                        ..previous.clone()
                    },
                }
            }
        };

        Ok(resolved)
    }

    pub fn record(&mut self, header: ChunkHeader) {
        self.headers.insert(header.chunk_stream_id, header);
    }
}

/// Writes the 1 to 3 byte basic header carrying the format and chunk stream id
pub fn write_basic_header<W: Write>(
    writer: &mut W,
    format: ChunkHeaderFormat,
    chunk_stream_id: u32,
) -> Result<(), ChunkSerializationError> {
    let format_bits = format.to_bits() << 6;
    match chunk_stream_id {
        MIN_CHUNK_STREAM_ID..=63 => writer.write_u8(format_bits | chunk_stream_id as u8)?,

        64..=319 => {
            writer.write_u8(format_bits)?;
            writer.write_u8((chunk_stream_id - 64) as u8)?;
        }

        320..=MAX_CHUNK_STREAM_ID => {
            let value = chunk_stream_id - 64;
            writer.write_u8(format_bits | 1)?;
            writer.write_u8((value & 0xFF) as u8)?;
            writer.write_u8((value >> 8) as u8)?;
        }

        _ => return Err(ChunkSerializationError::InvalidChunkStreamId { chunk_stream_id }),
    }

    Ok(())
}

/// Writes the basic header plus every message header field the header's format carries
pub fn write_chunk_header<W: Write>(
    writer: &mut W,
    header: &ChunkHeader,
) -> Result<(), ChunkSerializationError> {
    write_basic_header(writer, header.format, header.chunk_stream_id)?;
    if header.format == ChunkHeaderFormat::Repeat {
        return Ok(());
    }

    let time_field = header.time_field();
    let is_extended = time_field >= EXTENDED_TIMESTAMP_MARKER;
    if is_extended {
        writer.write_u24::<BigEndian>(EXTENDED_TIMESTAMP_MARKER)?;
    } else {
        writer.write_u24::<BigEndian>(time_field)?;
    }

    if header.format == ChunkHeaderFormat::Full || header.format == ChunkHeaderFormat::DeltaWithLength {
        writer.write_u24::<BigEndian>(header.message_length)?;
        writer.write_u8(header.message_type_id)?;
    }

    if header.format == ChunkHeaderFormat::Full {
        writer.write_u32::<LittleEndian>(header.message_stream_id)?;
    }

    if is_extended {
        writer.write_u32::<BigEndian>(time_field)?;
    }

    Ok(())
}

/// Attempts to read a chunk header from the start of `bytes`.  Returns `None` when the
/// header is not complete yet.  On success the number of bytes the header occupied is
/// returned alongside it.  Only the fields present on the wire are filled in; the rest
/// come from `ChannelHeaderTable::resolve`.
pub fn read_chunk_header(bytes: &[u8]) -> Result<Option<(ChunkHeader, usize)>, ChunkDeserializationError> {
    let mut cursor = Cursor::new(bytes);
    match read_header_fields(&mut cursor) {
        Ok(header) => Ok(Some((header, cursor.position() as usize))),
        Err(ref error) if error.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(error) => Err(error.into()),
    }
}

fn read_header_fields(cursor: &mut Cursor<&[u8]>) -> io::Result<ChunkHeader> {
    let first_byte = cursor.read_u8()?;
    let format = ChunkHeaderFormat::from_bits(first_byte >> 6);
    let chunk_stream_id = match first_byte & 0b0011_1111 {
        0 => 64 + u32::from(cursor.read_u8()?),
        1 => {
            let low = u32::from(cursor.read_u8()?);
            let high = u32::from(cursor.read_u8()?);
            64 + low + high * 256
        }

        csid => u32::from(csid),
    };

    let mut header = ChunkHeader::new(format, chunk_stream_id);
    if format == ChunkHeaderFormat::Repeat {
        return Ok(header);
    }

    let mut time_field = cursor.read_u24::<BigEndian>()?;
    if format == ChunkHeaderFormat::Full || format == ChunkHeaderFormat::DeltaWithLength {
        header.message_length = cursor.read_u24::<BigEndian>()?;
        header.message_type_id = cursor.read_u8()?;
    }

    if format == ChunkHeaderFormat::Full {
        header.message_stream_id = cursor.read_u32::<LittleEndian>()?;
    }

    if time_field == EXTENDED_TIMESTAMP_MARKER {
        time_field = cursor.read_u32::<BigEndian>()?;
    }

    match format {
        ChunkHeaderFormat::Full => header.timestamp = time_field,
        _ => header.delta_time = time_field,
    }

    Ok(header)
}
