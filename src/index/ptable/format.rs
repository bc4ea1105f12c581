//! ## PTable File Layout
//!
//! ```text
//! +------------------------------+ 0
//! | Header (128 bytes)           |  file type, format version
//! +------------------------------+ 128
//! | Entries                      |  count * entry_size, table order
//! +------------------------------+
//! | Midpoints (V4)               |  24 bytes each
//! +------------------------------+
//! | Footer (V4, 128 bytes)       |  file type, format version, midpoint count
//! +------------------------------+
//! | Checksum (8 bytes)           |  CRC-64 of everything above
//! +------------------------------+
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::index::entry::{IndexEntry, PTableVersion};

pub const FILE_TYPE_PTABLE: u8 = 0x02;
pub const HEADER_SIZE: usize = 128;
pub const FOOTER_SIZE: usize = 128;
pub const CHECKSUM_SIZE: usize = 8;
pub const MIDPOINT_SIZE: usize = 24;

/// Largest supported midpoint cache depth.
pub const MAX_CACHE_DEPTH: u32 = 30;

pub fn encode_header(version: PTableVersion) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0] = FILE_TYPE_PTABLE;
    buf[1] = version.as_u8();
    buf
}

pub fn decode_header(buf: &[u8; HEADER_SIZE]) -> Result<PTableVersion, String> {
    if buf[0] != FILE_TYPE_PTABLE {
        return Err(format!("unexpected file type {:#04x}", buf[0]));
    }
    PTableVersion::from_u8(buf[1]).ok_or_else(|| format!("unknown table version {}", buf[1]))
}

pub fn encode_footer(version: PTableVersion, midpoint_count: u32) -> [u8; FOOTER_SIZE] {
    let mut buf = [0u8; FOOTER_SIZE];
    buf[0] = FILE_TYPE_PTABLE;
    buf[1] = version.as_u8();
    LittleEndian::write_u32(&mut buf[2..6], midpoint_count);
    buf
}

/// Returns the persisted midpoint count.
pub fn decode_footer(buf: &[u8; FOOTER_SIZE], version: PTableVersion) -> Result<u32, String> {
    if buf[0] != FILE_TYPE_PTABLE {
        return Err(format!("unexpected footer file type {:#04x}", buf[0]));
    }
    if buf[1] != version.as_u8() {
        return Err(format!(
            "footer version {} does not match header version {}",
            buf[1],
            version.as_u8()
        ));
    }
    Ok(LittleEndian::read_u32(&buf[2..6]))
}

/// Sampled key with the index of the entry it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Midpoint {
    pub stream: u64,
    pub version: i64,
    pub item_index: u64,
}

impl Midpoint {
    pub fn new(entry: &IndexEntry, item_index: u64) -> Self {
        Self {
            stream: entry.stream,
            version: entry.version,
            item_index,
        }
    }

    pub fn encode(&self) -> [u8; MIDPOINT_SIZE] {
        let mut buf = [0u8; MIDPOINT_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.stream);
        LittleEndian::write_i64(&mut buf[8..16], self.version);
        LittleEndian::write_u64(&mut buf[16..24], self.item_index);
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            stream: LittleEndian::read_u64(&buf[0..8]),
            version: LittleEndian::read_i64(&buf[8..16]),
            item_index: LittleEndian::read_u64(&buf[16..24]),
        }
    }

    /// True when this midpoint's key sorts strictly before `(stream, version)`.
    pub fn is_before(&self, stream: u64, version: i64) -> bool {
        (self.stream, self.version) > (stream, version)
    }

    /// True when this midpoint's key sorts strictly after `(stream, version)`.
    pub fn is_after(&self, stream: u64, version: i64) -> bool {
        (self.stream, self.version) < (stream, version)
    }
}

/// Number of midpoints kept for a table of `count` entries.
pub fn midpoint_count(count: u64, depth: u32) -> u64 {
    if count == 0 {
        return 0;
    }
    let depth = depth.min(MAX_CACHE_DEPTH);
    (1u64 << depth).min(count).max(2)
}

/// Entry index sampled by midpoint `k` of `n`.
pub fn midpoint_index(k: u64, count: u64, n: u64) -> u64 {
    if n <= 1 {
        return 0;
    }
    ((k as u128 * (count - 1) as u128) / (n - 1) as u128) as u64
}

/// Checks that keys never increase and item indices never decrease.
pub fn validate_midpoints(midpoints: &[Midpoint], count: u64) -> Result<(), String> {
    for (k, pair) in midpoints.windows(2).enumerate() {
        let (prev, next) = (pair[0], pair[1]);
        if next.is_before(prev.stream, prev.version) {
            return Err(format!(
                "midpoint {} key ({:#x}, {}) sorts before midpoint {} key ({:#x}, {})",
                k + 1,
                next.stream,
                next.version,
                k,
                prev.stream,
                prev.version
            ));
        }
        if prev.item_index > next.item_index {
            return Err(format!(
                "midpoint {} item index {} exceeds midpoint {} item index {}",
                k, prev.item_index, k + 1, next.item_index
            ));
        }
    }
    if let Some(last) = midpoints.last() {
        if last.item_index >= count {
            return Err(format!(
                "midpoint item index {} beyond {} entries",
                last.item_index, count
            ));
        }
    }
    Ok(())
}
