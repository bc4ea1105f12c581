//! Position map of a scavenged chunk.
//!
//! Index entries keep pointing at the logical positions records had before
//! scavenging. The map translates each surviving record's chunk-local
//! logical position to the physical offset it was rewritten to.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::CorruptionKind;

pub const POS_MAP_ENTRY_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosMapEntry {
    /// Chunk-local logical position the record was written at.
    pub log_pos: i64,
    /// Offset of the record in the scavenged chunk's data area.
    pub actual_pos: i32,
}

/// Entries sorted by `log_pos`, strictly increasing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PosMap {
    entries: Vec<PosMapEntry>,
}

impl PosMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry; entries must arrive in increasing `log_pos` order.
    pub fn push(&mut self, log_pos: i64, actual_pos: i32) {
        debug_assert!(self.entries.last().map_or(true, |last| last.log_pos < log_pos));
        self.entries.push(PosMapEntry {
            log_pos,
            actual_pos,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<PosMapEntry> {
        self.entries.get(index).copied()
    }

    pub fn first(&self) -> Option<PosMapEntry> {
        self.entries.first().copied()
    }

    pub fn last(&self) -> Option<PosMapEntry> {
        self.entries.last().copied()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.entries.len() * POS_MAP_ENTRY_SIZE
    }

    /// Entry for a record that started exactly at `log_pos`.
    pub fn exact(&self, log_pos: i64) -> Option<(usize, PosMapEntry)> {
        self.entries
            .binary_search_by_key(&log_pos, |e| e.log_pos)
            .ok()
            .map(|idx| (idx, self.entries[idx]))
    }

    /// First entry at or after `log_pos`.
    pub fn closest_forward(&self, log_pos: i64) -> Option<(usize, PosMapEntry)> {
        let idx = self.entries.partition_point(|e| e.log_pos < log_pos);
        self.entries.get(idx).map(|e| (idx, *e))
    }

    /// Last entry strictly before `log_pos`.
    pub fn closest_backward(&self, log_pos: i64) -> Option<(usize, PosMapEntry)> {
        let idx = self.entries.partition_point(|e| e.log_pos < log_pos);
        if idx == 0 {
            return None;
        }
        Some((idx - 1, self.entries[idx - 1]))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size_in_bytes()];
        for (chunk, entry) in buf.chunks_exact_mut(POS_MAP_ENTRY_SIZE).zip(&self.entries) {
            LittleEndian::write_i64(&mut chunk[0..8], entry.log_pos);
            LittleEndian::write_i32(&mut chunk[8..12], entry.actual_pos);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CorruptionKind> {
        if buf.len() % POS_MAP_ENTRY_SIZE != 0 {
            return Err(CorruptionKind::BadFooter(format!(
                "position map size {} is not a multiple of {}",
                buf.len(),
                POS_MAP_ENTRY_SIZE
            )));
        }

        let mut entries: Vec<PosMapEntry> = Vec::with_capacity(buf.len() / POS_MAP_ENTRY_SIZE);
        for chunk in buf.chunks_exact(POS_MAP_ENTRY_SIZE) {
            let entry = PosMapEntry {
                log_pos: LittleEndian::read_i64(&chunk[0..8]),
                actual_pos: LittleEndian::read_i32(&chunk[8..12]),
            };
            if let Some(prev) = entries.last() {
                if prev.log_pos >= entry.log_pos || prev.actual_pos >= entry.actual_pos {
                    return Err(CorruptionKind::BadFooter(format!(
                        "position map out of order at log position {}",
                        entry.log_pos
                    )));
                }
            }
            entries.push(entry);
        }
        Ok(Self { entries })
    }
}
