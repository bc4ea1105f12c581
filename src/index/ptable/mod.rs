//! Persistent, immutable, sorted index tables.
//!
//! A PTable holds index entries in table order (stream hash descending,
//! then version descending, then position descending). Lookups narrow
//! the search with an in-memory midpoint cache before binary searching
//! the file itself.

mod build;
pub mod format;
pub mod pool;

pub use format::Midpoint;
pub use pool::{PooledReader, ReaderPool};

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use format::{CHECKSUM_SIZE, FOOTER_SIZE, HEADER_SIZE, MIDPOINT_SIZE};

use super::entry::{IndexEntry, PTableVersion};
use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::hasher::Hasher;

const VERIFY_BLOCK_SIZE: usize = 64 * 1024;
const ITER_BATCH_ENTRIES: u64 = 1024;

/// Settings applied when opening or writing a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableOptions {
    pub cache_depth: u32,
    pub skip_verify: bool,
    pub initial_readers: usize,
    pub max_readers: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self::from(&IndexConfig::default())
    }
}

impl From<&IndexConfig> for TableOptions {
    fn from(config: &IndexConfig) -> Self {
        Self {
            cache_depth: config.index_cache_depth,
            skip_verify: config.skip_verify,
            initial_readers: config.initial_reader_count,
            max_readers: config.max_reader_count,
        }
    }
}

pub(crate) fn corrupt(path: &Path, msg: impl fmt::Display) -> Error {
    Error::CorruptIndex(format!("{}: {}", path.display(), msg))
}

pub struct PTable {
    path: PathBuf,
    version: PTableVersion,
    count: u64,
    file_size: u64,
    midpoints: Vec<Midpoint>,
    readers: ReaderPool,
    delete_on_drop: AtomicBool,
}

impl fmt::Debug for PTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PTable")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("count", &self.count)
            .field("midpoints", &self.midpoints.len())
            .finish()
    }
}

impl PTable {
    /// Opens and validates a table file.
    pub fn open(path: impl AsRef<Path>, options: TableOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(corrupt(&path, "table file not found"));
        }
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < (HEADER_SIZE + CHECKSUM_SIZE) as u64 {
            return Err(corrupt(&path, format!("file of {} bytes is too short", file_size)));
        }

        let mut header = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut header, 0)?;
        let version = format::decode_header(&header).map_err(|msg| corrupt(&path, msg))?;

        let (entries_len, persisted) = if version.has_midpoints() {
            let trailer = (HEADER_SIZE + FOOTER_SIZE + CHECKSUM_SIZE) as u64;
            if file_size < trailer {
                return Err(corrupt(&path, format!("file of {} bytes has no footer", file_size)));
            }
            let mut footer = [0u8; FOOTER_SIZE];
            file.read_exact_at(&mut footer, file_size - (FOOTER_SIZE + CHECKSUM_SIZE) as u64)?;
            let stored = format::decode_footer(&footer, version).map_err(|msg| corrupt(&path, msg))?;
            let entries_len = file_size
                .checked_sub(trailer + stored as u64 * MIDPOINT_SIZE as u64)
                .ok_or_else(|| corrupt(&path, format!("{} midpoints do not fit the file", stored)))?;
            (entries_len, Some(stored as u64))
        } else {
            (file_size - (HEADER_SIZE + CHECKSUM_SIZE) as u64, None)
        };

        let entry_size = version.entry_size() as u64;
        if entries_len % entry_size != 0 {
            return Err(corrupt(
                &path,
                format!("entry area of {} bytes is not a multiple of {}", entries_len, entry_size),
            ));
        }
        let count = entries_len / entry_size;

        if options.skip_verify {
            tracing::debug!(path = %path.display(), "Skipping table checksum verification");
        } else {
            Self::verify_checksum(&file, file_size, &path)?;
        }

        let required = format::midpoint_count(count, options.cache_depth);
        let midpoints = match persisted {
            Some(stored) if stored == required && required > 0 => {
                Self::read_persisted_midpoints(&file, HEADER_SIZE as u64 + entries_len, stored)?
            }
            _ => Self::sample_midpoints(&file, version, count, required)?,
        };
        format::validate_midpoints(&midpoints, count).map_err(|msg| corrupt(&path, msg))?;

        let readers = ReaderPool::new(&path, options.initial_readers, options.max_readers)?;

        tracing::debug!(
            path = %path.display(),
            version = ?version,
            entries = count,
            midpoints = midpoints.len(),
            "Opened table"
        );

        Ok(Self {
            path,
            version,
            count,
            file_size,
            midpoints,
            readers,
            delete_on_drop: AtomicBool::new(false),
        })
    }

    fn verify_checksum(file: &File, file_size: u64, path: &Path) -> Result<()> {
        let data_len = file_size - CHECKSUM_SIZE as u64;
        let mut hasher = Hasher::new();
        let mut buf = vec![0u8; VERIFY_BLOCK_SIZE];
        let mut offset = 0u64;
        while offset < data_len {
            let n = (data_len - offset).min(VERIFY_BLOCK_SIZE as u64) as usize;
            file.read_exact_at(&mut buf[..n], offset)?;
            hasher.write(&buf[..n]);
            offset += n as u64;
        }

        let mut stored = [0u8; CHECKSUM_SIZE];
        file.read_exact_at(&mut stored, data_len)?;
        if u64::from_le_bytes(stored) != hasher.checksum() {
            return Err(corrupt(path, "checksum mismatch"));
        }
        Ok(())
    }

    fn read_persisted_midpoints(file: &File, offset: u64, count: u64) -> Result<Vec<Midpoint>> {
        let mut buf = vec![0u8; count as usize * MIDPOINT_SIZE];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf.chunks_exact(MIDPOINT_SIZE).map(Midpoint::decode).collect())
    }

    pub(crate) fn sample_midpoints(
        file: &File,
        version: PTableVersion,
        count: u64,
        n: u64,
    ) -> Result<Vec<Midpoint>> {
        let mut midpoints: Vec<Midpoint> = Vec::with_capacity(n as usize);
        let mut buf = vec![0u8; version.entry_size()];
        for k in 0..n {
            let index = format::midpoint_index(k, count, n);
            match midpoints.last().copied() {
                Some(prev) if prev.item_index == index => midpoints.push(prev),
                _ => {
                    Self::read_entry_into(file, version, index, &mut buf)?;
                    midpoints.push(Midpoint::new(&version.decode_entry(&buf), index));
                }
            }
        }
        Ok(midpoints)
    }

    fn read_entry_into(file: &File, version: PTableVersion, index: u64, buf: &mut [u8]) -> Result<()> {
        let offset = HEADER_SIZE as u64 + index * version.entry_size() as u64;
        file.read_exact_at(buf, offset)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> PTableVersion {
        self.version
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn midpoints(&self) -> &[Midpoint] {
        &self.midpoints
    }

    pub fn readers(&self) -> &ReaderPool {
        &self.readers
    }

    fn read_entry(&self, reader: &File, index: u64) -> Result<IndexEntry> {
        let mut buf = [0u8; 24];
        let buf = &mut buf[..self.version.entry_size()];
        Self::read_entry_into(reader, self.version, index, buf)?;
        Ok(self.version.decode_entry(buf))
    }

    /// Entry index range `[lo, hi)` that must contain the first entry not before the key.
    fn search_window(&self, stream: u64, version: i64) -> (u64, u64) {
        if self.midpoints.is_empty() {
            return (0, self.count);
        }
        let before = self.midpoints.partition_point(|m| m.is_before(stream, version));
        let lo = match before {
            0 => 0,
            n => self.midpoints[n - 1].item_index + 1,
        };
        let not_after = self.midpoints.partition_point(|m| !m.is_after(stream, version));
        let hi = match self.midpoints.get(not_after) {
            Some(m) => m.item_index,
            None => self.count,
        };
        (lo, hi.max(lo))
    }

    /// Index of the first entry whose key does not sort before `(stream, version)`.
    fn lower_bound(&self, reader: &File, stream: u64, version: i64) -> Result<u64> {
        let (mut lo, mut hi) = self.search_window(stream, version);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.read_entry(reader, mid)?.cmp_key(stream, version) == std::cmp::Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    pub fn try_get_one_value(&self, hash: u64, version: i64) -> Result<Option<i64>> {
        Ok(self
            .get_range(hash, version, version, Some(1))?
            .first()
            .map(|e| e.position))
    }

    pub fn try_get_latest_entry(&self, hash: u64) -> Result<Option<IndexEntry>> {
        Ok(self.get_range(hash, i64::MIN, i64::MAX, Some(1))?.into_iter().next())
    }

    pub fn try_get_oldest_entry(&self, hash: u64) -> Result<Option<IndexEntry>> {
        if self.count == 0 {
            return Ok(None);
        }
        let stream = self.version.table_hash(hash);
        let reader = self.readers.acquire()?;
        let end = match stream.checked_sub(1) {
            Some(below) => self.lower_bound(&reader, below, i64::MAX)?,
            None => self.count,
        };
        if end == 0 {
            return Ok(None);
        }
        let entry = self.read_entry(&reader, end - 1)?;
        Ok((entry.stream == stream).then_some(entry))
    }

    /// Entries of the stream with versions in `from..=to`, newest first.
    pub fn get_range(
        &self,
        hash: u64,
        from: i64,
        to: i64,
        limit: Option<usize>,
    ) -> Result<Vec<IndexEntry>> {
        let mut result = Vec::new();
        if from > to || self.count == 0 {
            return Ok(result);
        }
        let limit = limit.unwrap_or(usize::MAX);
        let stream = self.version.table_hash(hash);
        let reader = self.readers.acquire()?;

        let mut index = self.lower_bound(&reader, stream, to)?;
        while index < self.count && result.len() < limit {
            let entry = self.read_entry(&reader, index)?;
            if entry.stream != stream || entry.version < from {
                break;
            }
            result.push(entry);
            index += 1;
        }
        Ok(result)
    }

    /// Every entry in table order.
    pub fn iter(&self) -> PTableIter<'_> {
        PTableIter {
            table: self,
            next: 0,
            batch: VecDeque::new(),
            failed: false,
        }
    }

    fn read_batch(&self, start: u64, n: u64) -> Result<Vec<IndexEntry>> {
        let entry_size = self.version.entry_size();
        let mut buf = vec![0u8; n as usize * entry_size];
        let reader = self.readers.acquire()?;
        reader.read_exact_at(&mut buf, HEADER_SIZE as u64 + start * entry_size as u64)?;
        Ok(buf
            .chunks_exact(entry_size)
            .map(|chunk| self.version.decode_entry(chunk))
            .collect())
    }

    /// Deletes the file once the last lease on this table is dropped.
    pub fn mark_for_destruction(&self) {
        self.delete_on_drop.store(true, Ordering::SeqCst);
        tracing::debug!(path = %self.path.display(), "Table marked for destruction");
    }

    pub fn is_marked_for_destruction(&self) -> bool {
        self.delete_on_drop.load(Ordering::SeqCst)
    }
}

impl Drop for PTable {
    fn drop(&mut self) {
        if !self.delete_on_drop.load(Ordering::SeqCst) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::info!(path = %self.path.display(), "Deleted table file"),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to delete table file")
            }
        }
    }
}

pub struct PTableIter<'a> {
    table: &'a PTable,
    next: u64,
    batch: VecDeque<IndexEntry>,
    failed: bool,
}

impl Iterator for PTableIter<'_> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.batch.pop_front() {
            return Some(Ok(entry));
        }
        if self.failed || self.next >= self.table.count {
            return None;
        }
        let n = (self.table.count - self.next).min(ITER_BATCH_ENTRIES);
        match self.table.read_batch(self.next, n) {
            Ok(entries) => {
                self.next += n;
                self.batch.extend(entries);
                self.batch.pop_front().map(Ok)
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
