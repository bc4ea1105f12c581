use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// On-disk entry format of a PTable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PTableVersion {
    /// 32-bit stream hash, 32-bit event version.
    V1 = 1,
    /// 64-bit stream hash, 32-bit event version.
    V2 = 2,
    /// 64-bit stream hash, 64-bit event version.
    V3 = 3,
    /// V3 entries plus persisted midpoints.
    V4 = 4,
}

impl PTableVersion {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PTableVersion::V1),
            2 => Some(PTableVersion::V2),
            3 => Some(PTableVersion::V3),
            4 => Some(PTableVersion::V4),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn entry_size(&self) -> usize {
        match self {
            PTableVersion::V1 => 16,
            PTableVersion::V2 => 20,
            PTableVersion::V3 | PTableVersion::V4 => 24,
        }
    }

    pub fn has_midpoints(&self) -> bool {
        matches!(self, PTableVersion::V4)
    }

    /// Maps a 64-bit stream hash onto the key width stored in this format.
    pub fn table_hash(&self, hash: u64) -> u64 {
        match self {
            PTableVersion::V1 => hash >> 32,
            _ => hash,
        }
    }

    /// Re-keys an entry read from a `from` table for storage in this format.
    pub fn convert_from(&self, from: PTableVersion, entry: IndexEntry) -> IndexEntry {
        if *self == PTableVersion::V1 && from != PTableVersion::V1 {
            IndexEntry {
                stream: self.table_hash(entry.stream),
                ..entry
            }
        } else {
            entry
        }
    }

    pub fn encode_entry(&self, entry: &IndexEntry, buf: &mut [u8]) -> Result<()> {
        match self {
            PTableVersion::V1 | PTableVersion::V2 => {
                let version = i32::try_from(entry.version).map_err(|_| {
                    Error::InvalidInput(format!(
                        "event version {} does not fit a {:?} table",
                        entry.version, self
                    ))
                })?;
                LittleEndian::write_i32(&mut buf[0..4], version);
                if *self == PTableVersion::V1 {
                    let stream = u32::try_from(entry.stream).map_err(|_| {
                        Error::InvalidInput(format!(
                            "stream hash {:#x} does not fit a V1 table",
                            entry.stream
                        ))
                    })?;
                    LittleEndian::write_u32(&mut buf[4..8], stream);
                    LittleEndian::write_i64(&mut buf[8..16], entry.position);
                } else {
                    LittleEndian::write_u64(&mut buf[4..12], entry.stream);
                    LittleEndian::write_i64(&mut buf[12..20], entry.position);
                }
            }
            PTableVersion::V3 | PTableVersion::V4 => {
                LittleEndian::write_i64(&mut buf[0..8], entry.version);
                LittleEndian::write_u64(&mut buf[8..16], entry.stream);
                LittleEndian::write_i64(&mut buf[16..24], entry.position);
            }
        }
        Ok(())
    }

    pub fn decode_entry(&self, buf: &[u8]) -> IndexEntry {
        match self {
            PTableVersion::V1 => IndexEntry {
                version: LittleEndian::read_i32(&buf[0..4]) as i64,
                stream: LittleEndian::read_u32(&buf[4..8]) as u64,
                position: LittleEndian::read_i64(&buf[8..16]),
            },
            PTableVersion::V2 => IndexEntry {
                version: LittleEndian::read_i32(&buf[0..4]) as i64,
                stream: LittleEndian::read_u64(&buf[4..12]),
                position: LittleEndian::read_i64(&buf[12..20]),
            },
            PTableVersion::V3 | PTableVersion::V4 => IndexEntry {
                version: LittleEndian::read_i64(&buf[0..8]),
                stream: LittleEndian::read_u64(&buf[8..16]),
                position: LittleEndian::read_i64(&buf[16..24]),
            },
        }
    }
}

/// One `(stream hash, event version) -> log position` mapping.
///
/// `Ord` follows table order: stream descending, then version descending,
/// then position descending. The newest event of a stream sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexEntry {
    pub stream: u64,
    pub version: i64,
    pub position: i64,
}

impl IndexEntry {
    pub fn new(stream: u64, version: i64, position: i64) -> Self {
        Self {
            stream,
            version,
            position,
        }
    }

    /// Where this entry sits relative to the key `(stream, version)` in table order.
    pub fn cmp_key(&self, stream: u64, version: i64) -> Ordering {
        (stream, version).cmp(&(self.stream, self.version))
    }
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.stream, other.version, other.position).cmp(&(self.stream, self.version, self.position))
    }
}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
