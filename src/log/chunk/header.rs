use byteorder::{ByteOrder, LittleEndian};

use crate::error::CorruptionKind;

pub const HEADER_SIZE: usize = 128;
pub const FILE_TYPE_CHUNK: u8 = 1;
pub const CHUNK_FORMAT_VERSION: u8 = 1;

/// Fixed-size header at the start of every chunk file.
///
/// A scavenged chunk produced by merging may cover a range of chunk
/// numbers; an ordinary chunk has `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u8,
    pub chunk_size: i32,
    pub chunk_start_number: i32,
    pub chunk_end_number: i32,
    pub is_scavenged: bool,
}

impl ChunkHeader {
    pub fn new(chunk_size: i32, chunk_start_number: i32, chunk_end_number: i32, is_scavenged: bool) -> Self {
        Self {
            version: CHUNK_FORMAT_VERSION,
            chunk_size,
            chunk_start_number,
            chunk_end_number,
            is_scavenged,
        }
    }

    /// First logical log position covered by the chunk.
    pub fn chunk_start_position(&self) -> i64 {
        self.chunk_start_number as i64 * self.chunk_size as i64
    }

    /// Logical log position just past the chunk.
    pub fn chunk_end_position(&self) -> i64 {
        (self.chunk_end_number as i64 + 1) * self.chunk_size as i64
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = FILE_TYPE_CHUNK;
        buf[1] = self.version;
        LittleEndian::write_i32(&mut buf[2..6], self.chunk_size);
        LittleEndian::write_i32(&mut buf[6..10], self.chunk_start_number);
        LittleEndian::write_i32(&mut buf[10..14], self.chunk_end_number);
        buf[14] = self.is_scavenged as u8;
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self, CorruptionKind> {
        if buf[0] != FILE_TYPE_CHUNK {
            return Err(CorruptionKind::BadHeader(format!(
                "unexpected file type {}",
                buf[0]
            )));
        }
        let header = Self {
            version: buf[1],
            chunk_size: LittleEndian::read_i32(&buf[2..6]),
            chunk_start_number: LittleEndian::read_i32(&buf[6..10]),
            chunk_end_number: LittleEndian::read_i32(&buf[10..14]),
            is_scavenged: buf[14] != 0,
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), CorruptionKind> {
        if self.version != CHUNK_FORMAT_VERSION {
            return Err(CorruptionKind::BadHeader(format!(
                "unsupported chunk version {}",
                self.version
            )));
        }
        if self.chunk_size <= 0 {
            return Err(CorruptionKind::BadHeader(format!(
                "invalid chunk size {}",
                self.chunk_size
            )));
        }
        if self.chunk_start_number < 0 || self.chunk_end_number < self.chunk_start_number {
            return Err(CorruptionKind::BadHeader(format!(
                "invalid chunk range {}-{}",
                self.chunk_start_number, self.chunk_end_number
            )));
        }
        Ok(())
    }
}
