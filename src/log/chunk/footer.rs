use byteorder::{ByteOrder, LittleEndian};

use crate::error::CorruptionKind;

pub const FOOTER_SIZE: usize = 128;

/// Bytes covered by the checksum; the checksum itself sits after them.
pub const FOOTER_CHECKSUM_OFFSET: usize = FOOTER_SIZE - 8;

const FLAG_COMPLETED: u8 = 0b01;
const FLAG_HAS_MAP: u8 = 0b10;

/// Trailer written when a chunk is completed.
///
/// An active chunk has an all-zero footer area, which decodes as not
/// completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    pub is_completed: bool,
    pub has_map: bool,
    /// Bytes of record data stored in the file.
    pub physical_data_size: i32,
    /// Logical bytes the chunk covers. Equals the physical size unless
    /// the chunk was scavenged.
    pub logical_data_size: i64,
    /// Bytes of position map following the data.
    pub map_size: i32,
    pub checksum: u64,
}

impl ChunkFooter {
    pub fn new(physical_data_size: i32, logical_data_size: i64, map_size: i32) -> Self {
        Self {
            is_completed: true,
            has_map: map_size > 0,
            physical_data_size,
            logical_data_size,
            map_size,
            checksum: 0,
        }
    }

    /// Encodes everything except the checksum field.
    pub fn encode_prefix(&self) -> [u8; FOOTER_CHECKSUM_OFFSET] {
        let mut buf = [0u8; FOOTER_CHECKSUM_OFFSET];
        let mut flags = 0;
        if self.is_completed {
            flags |= FLAG_COMPLETED;
        }
        if self.has_map {
            flags |= FLAG_HAS_MAP;
        }
        buf[0] = flags;
        LittleEndian::write_i32(&mut buf[1..5], self.physical_data_size);
        LittleEndian::write_i64(&mut buf[5..13], self.logical_data_size);
        LittleEndian::write_i32(&mut buf[13..17], self.map_size);
        buf
    }

    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[..FOOTER_CHECKSUM_OFFSET].copy_from_slice(&self.encode_prefix());
        LittleEndian::write_u64(&mut buf[FOOTER_CHECKSUM_OFFSET..], self.checksum);
        buf
    }

    pub fn decode(buf: &[u8; FOOTER_SIZE]) -> Result<Self, CorruptionKind> {
        let flags = buf[0];
        let footer = Self {
            is_completed: flags & FLAG_COMPLETED != 0,
            has_map: flags & FLAG_HAS_MAP != 0,
            physical_data_size: LittleEndian::read_i32(&buf[1..5]),
            logical_data_size: LittleEndian::read_i64(&buf[5..13]),
            map_size: LittleEndian::read_i32(&buf[13..17]),
            checksum: LittleEndian::read_u64(&buf[FOOTER_CHECKSUM_OFFSET..]),
        };

        if footer.is_completed
            && (footer.physical_data_size < 0
                || footer.map_size < 0
                || footer.logical_data_size < footer.physical_data_size as i64)
        {
            return Err(CorruptionKind::BadFooter(format!(
                "inconsistent sizes: physical {}, logical {}, map {}",
                footer.physical_data_size, footer.logical_data_size, footer.map_size
            )));
        }
        Ok(footer)
    }
}
