//! Framing of individual log records.
//!
//! ```text
//! +------------+------------------+-------------+---------+------------+
//! | len (i32)  | log_position i64 | crc32 (u32) | payload | len (i32)  |
//! +------------+------------------+-------------+---------+------------+
//!              \_______________ body (len bytes) _________/
//! ```
//!
//! The trailing length lets a reader step backwards from the end of a
//! record without any external index.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::hasher::record_checksum;

/// Length prefix plus length suffix.
pub const FRAME_OVERHEAD: usize = 8;

/// Position and checksum stored ahead of the payload.
pub const BODY_HEADER_SIZE: usize = 12;

/// Largest body a frame can describe.
pub const MAX_BODY_SIZE: usize = i32::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Logical position the record was appended at. Survives scavenging.
    pub log_position: i64,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn new(log_position: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            log_position,
            payload: payload.into(),
        }
    }

    pub fn body_len(&self) -> usize {
        BODY_HEADER_SIZE + self.payload.len()
    }

    /// Bytes the record occupies in a chunk, framing included.
    pub fn size_on_disk(&self) -> usize {
        self.body_len() + FRAME_OVERHEAD
    }

    pub fn encode(&self) -> Vec<u8> {
        let body_len = self.body_len() as i32;
        let mut buf = Vec::with_capacity(self.size_on_disk());
        // Writes into a Vec cannot fail.
        let _ = buf.write_i32::<LittleEndian>(body_len);
        let _ = buf.write_i64::<LittleEndian>(self.log_position);
        let _ = buf.write_u32::<LittleEndian>(record_checksum(&self.payload));
        buf.extend_from_slice(&self.payload);
        let _ = buf.write_i32::<LittleEndian>(body_len);
        buf
    }

    /// Decodes a body (the bytes between the two length fields).
    ///
    /// Returns a description of the problem when the body is not a valid
    /// record; callers attach the file they were reading.
    pub fn decode_body(body: &[u8]) -> std::result::Result<Self, String> {
        if body.len() < BODY_HEADER_SIZE {
            return Err(format!("body of {} bytes is shorter than its header", body.len()));
        }
        let mut cursor = Cursor::new(body);
        let log_position = cursor
            .read_i64::<LittleEndian>()
            .map_err(|e| e.to_string())?;
        let checksum = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| e.to_string())?;
        let payload = body[BODY_HEADER_SIZE..].to_vec();

        if record_checksum(&payload) != checksum {
            return Err(format!(
                "payload checksum mismatch for record at {}",
                log_position
            ));
        }
        Ok(Self {
            log_position,
            payload,
        })
    }
}

/// A record returned by a chunk or log read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRead {
    pub record: LogRecord,
    /// Bytes the record occupies, framing included.
    pub length: usize,
    /// Position to continue from: the next record when reading forward,
    /// this record's own position when reading backward.
    pub next_position: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let record = LogRecord::new(4096, b"event-data".to_vec());
        let bytes = record.encode();

        assert_eq!(bytes.len(), record.size_on_disk());
        let prefix = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let suffix = i32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        assert_eq!(prefix, suffix);
        assert_eq!(prefix as usize, record.body_len());

        let decoded = LogRecord::decode_body(&bytes[4..bytes.len() - 4]).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_checksum_detects_flipped_payload() {
        let record = LogRecord::new(0, vec![1, 2, 3, 4]);
        let mut bytes = record.encode();
        bytes[4 + BODY_HEADER_SIZE] ^= 0xff;

        let result = LogRecord::decode_body(&bytes[4..bytes.len() - 4]);
        assert!(result.is_err());
    }

    #[test]
    fn test_short_body_rejected() {
        assert!(LogRecord::decode_body(&[0u8; 5]).is_err());
    }
}
