//! Chunk files: fixed-capacity segments of the transaction log.
//!
//! ## Chunk File Layout
//!
//! ```text
//! +---------------------------+ 0
//! | Header (128 bytes)        |
//! +---------------------------+ 128
//! | Data (framed records)     |  unscavenged: chunk_size bytes reserved up front
//! +---------------------------+
//! | Position map (scavenged)  |  12 bytes per surviving record
//! +---------------------------+
//! | Footer (128 bytes)        |  zeroed until the chunk is completed
//! +---------------------------+
//! ```
//!
//! A chunk moves through three states:
//! 1. **Active**: the single writable chunk. Appends land at the write
//!    position and become visible to readers once fully written.
//! 2. **Completed**: footer and checksum written, file immutable.
//! 3. **Scavenged**: a rewritten copy holding only live records plus a
//!    position map from old logical offsets to new physical offsets.
//!
//! Positions passed to the read methods are chunk-local *logical*
//! positions, i.e. `log_position - chunk_start_position`.
//!
//! Deletion is deferred: `mark_for_deletion` only flags the chunk; the file
//! is removed when the last `Arc<Chunk>` lease is dropped.

pub mod footer;
pub mod header;
pub mod posmap;

pub use footer::{ChunkFooter, FOOTER_SIZE};
pub use header::{ChunkHeader, HEADER_SIZE};
pub use posmap::{PosMap, PosMapEntry};

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use byteorder::{ByteOrder, LittleEndian};

use super::record::{LogRecord, RecordRead, BODY_HEADER_SIZE, FRAME_OVERHEAD};
use crate::error::{CorruptionKind, Error, Result};
use crate::hasher::Hasher;

const CHECKSUM_BLOCK_SIZE: usize = 64 * 1024;

/// Outcome of `Chunk::try_append`. Positions are chunk-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub success: bool,
    pub old_position: i64,
    pub new_position: i64,
}

#[derive(Debug)]
struct Completion {
    footer: ChunkFooter,
    pos_map: PosMap,
}

pub struct Chunk {
    path: PathBuf,
    header: ChunkHeader,
    file: File,
    /// Serializes appends and completion.
    write_pos: Mutex<i64>,
    /// Bytes of data readers may see while the chunk is active.
    data_size: AtomicI64,
    completion: OnceLock<Completion>,
    cache: RwLock<Option<Arc<[u8]>>>,
    delete_on_drop: AtomicBool,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("completed", &self.is_completed())
            .field("data_size", &self.data_size.load(Ordering::Acquire))
            .finish()
    }
}

impl Chunk {
    /// Creates a new chunk file.
    ///
    /// Ordinary chunks reserve their full capacity immediately so the file
    /// length never changes afterwards. Scavenged chunks grow as records are
    /// copied in and are truncated to their exact size on completion.
    pub fn create_new(path: impl AsRef<Path>, header: ChunkHeader) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        file.write_all_at(&header.encode(), 0)?;
        if !header.is_scavenged {
            file.set_len(Self::full_file_len(&header))?;
        }
        file.sync_all()?;

        tracing::debug!(
            path = %path.display(),
            chunk_start = header.chunk_start_number,
            chunk_end = header.chunk_end_number,
            scavenged = header.is_scavenged,
            "Created chunk"
        );

        Ok(Self::build(path, header, file, 0, None))
    }

    /// Opens a completed chunk, validating its layout and optionally its checksum.
    pub fn open_completed(path: impl AsRef<Path>, verify_checksum: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (file, header, footer) = Self::open_parts(&path, false)?;
        if !footer.is_completed {
            return Err(Error::corrupt_db(CorruptionKind::NotCompleted, &path));
        }

        let actual_len = file.metadata()?.len();
        let expected_len = if header.is_scavenged {
            (HEADER_SIZE + FOOTER_SIZE) as u64 + footer.physical_data_size as u64 + footer.map_size as u64
        } else {
            Self::full_file_len(&header)
        };
        if actual_len != expected_len {
            return Err(Error::corrupt_db(
                CorruptionKind::BadLength {
                    expected: expected_len,
                    actual: actual_len,
                },
                &path,
            ));
        }
        if !header.is_scavenged && footer.physical_data_size as i64 > Self::capacity_of(&header) {
            return Err(Error::corrupt_db(
                CorruptionKind::BadFooter("data size exceeds chunk capacity".into()),
                &path,
            ));
        }

        let mut map_bytes = vec![0u8; footer.map_size as usize];
        if !map_bytes.is_empty() {
            file.read_exact_at(
                &mut map_bytes,
                (HEADER_SIZE as i32 + footer.physical_data_size) as u64,
            )?;
        }
        let pos_map = PosMap::decode(&map_bytes).map_err(|kind| Error::corrupt_db(kind, &path))?;

        let chunk = Self::build(
            path,
            header,
            file,
            footer.physical_data_size as i64,
            Some(Completion { footer, pos_map }),
        );

        if verify_checksum {
            let actual =
                chunk.compute_checksum(footer.physical_data_size as usize, &map_bytes, &footer)?;
            if actual != footer.checksum {
                return Err(Error::corrupt_db(CorruptionKind::ChecksumMismatch, &chunk.path));
            }
        }
        Ok(chunk)
    }

    /// Reopens the active chunk with `write_position` bytes of data already written.
    pub fn open_for_write(path: impl AsRef<Path>, write_position: i64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (file, header, footer) = Self::open_parts(&path, true)?;
        if footer.is_completed {
            return Err(Error::InvalidOperation(format!(
                "chunk {} is already completed",
                path.display()
            )));
        }
        if header.is_scavenged {
            return Err(Error::corrupt_db(
                CorruptionKind::BadHeader("scavenged chunk was never completed".into()),
                &path,
            ));
        }

        let actual_len = file.metadata()?.len();
        let expected_len = Self::full_file_len(&header);
        if actual_len != expected_len {
            return Err(Error::corrupt_db(
                CorruptionKind::BadLength {
                    expected: expected_len,
                    actual: actual_len,
                },
                &path,
            ));
        }
        if write_position < 0 || write_position > Self::capacity_of(&header) {
            return Err(Error::corrupt_db(
                CorruptionKind::BadLength {
                    expected: Self::capacity_of(&header) as u64,
                    actual: write_position.max(0) as u64,
                },
                &path,
            ));
        }

        Ok(Self::build(path, header, file, write_position, None))
    }

    /// Reads header and footer without validating anything else.
    pub fn inspect(path: impl AsRef<Path>) -> Result<(ChunkHeader, ChunkFooter)> {
        let (_, header, footer) = Self::open_parts(path.as_ref(), false)?;
        Ok((header, footer))
    }

    fn open_parts(path: &Path, writable: bool) -> Result<(File, ChunkHeader, ChunkFooter)> {
        if !path.exists() {
            return Err(Error::corrupt_db(CorruptionKind::ChunkNotFound, path));
        }
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len();
        let min_len = (HEADER_SIZE + FOOTER_SIZE) as u64;
        if len < min_len {
            return Err(Error::corrupt_db(
                CorruptionKind::BadLength {
                    expected: min_len,
                    actual: len,
                },
                path,
            ));
        }

        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut header_buf, 0)?;
        let header = ChunkHeader::decode(&header_buf).map_err(|kind| Error::corrupt_db(kind, path))?;

        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer_buf, len - FOOTER_SIZE as u64)?;
        let footer = ChunkFooter::decode(&footer_buf).map_err(|kind| Error::corrupt_db(kind, path))?;

        Ok((file, header, footer))
    }

    fn build(
        path: PathBuf,
        header: ChunkHeader,
        file: File,
        data_size: i64,
        completion: Option<Completion>,
    ) -> Self {
        let cell = OnceLock::new();
        if let Some(completion) = completion {
            let _ = cell.set(completion);
        }
        Self {
            path,
            header,
            file,
            write_pos: Mutex::new(data_size),
            data_size: AtomicI64::new(data_size),
            completion: cell,
            cache: RwLock::new(None),
            delete_on_drop: AtomicBool::new(false),
        }
    }

    fn capacity_of(header: &ChunkHeader) -> i64 {
        header.chunk_end_position() - header.chunk_start_position()
    }

    fn full_file_len(header: &ChunkHeader) -> u64 {
        (HEADER_SIZE + FOOTER_SIZE) as u64 + Self::capacity_of(header) as u64
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn footer(&self) -> Option<ChunkFooter> {
        self.completion.get().map(|c| c.footer)
    }

    pub fn is_completed(&self) -> bool {
        self.completion.get().is_some()
    }

    pub fn is_scavenged(&self) -> bool {
        self.header.is_scavenged
    }

    pub fn is_cached(&self) -> bool {
        self.cache.read().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Data bytes the chunk can hold.
    pub fn capacity(&self) -> i64 {
        Self::capacity_of(&self.header)
    }

    /// Logical bytes covered by records; grows while the chunk is active.
    pub fn logical_data_size(&self) -> i64 {
        match self.completion.get() {
            Some(c) => c.footer.logical_data_size,
            None => self.data_size.load(Ordering::Acquire),
        }
    }

    /// Record bytes physically present in the file.
    pub fn physical_data_size(&self) -> i64 {
        match self.completion.get() {
            Some(c) => c.footer.physical_data_size as i64,
            None => self.data_size.load(Ordering::Acquire),
        }
    }

    pub fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Appends a record if it fits in the remaining capacity.
    ///
    /// Ordinary chunks require the record to carry the log position it is
    /// written at. Scavenged chunks accept records carrying their original
    /// positions.
    pub fn try_append(&self, record: &LogRecord) -> Result<AppendResult> {
        let mut write_pos = self.write_pos.lock()?;
        if self.is_completed() {
            return Err(Error::ReadOnly(format!(
                "cannot append to completed chunk {}",
                self.path.display()
            )));
        }

        let old_position = *write_pos;
        if !self.header.is_scavenged
            && record.log_position != self.header.chunk_start_position() + old_position
        {
            return Err(Error::InvalidInput(format!(
                "record position {} does not match write position {}",
                record.log_position,
                self.header.chunk_start_position() + old_position
            )));
        }

        let bytes = record.encode();
        let new_position = old_position + bytes.len() as i64;
        if new_position > self.capacity() {
            return Ok(AppendResult {
                success: false,
                old_position,
                new_position: old_position,
            });
        }

        self.file
            .write_all_at(&bytes, HEADER_SIZE as u64 + old_position as u64)?;
        *write_pos = new_position;
        self.data_size.store(new_position, Ordering::Release);

        Ok(AppendResult {
            success: true,
            old_position,
            new_position,
        })
    }

    /// Makes appended data durable.
    pub fn flush(&self) -> Result<()> {
        if self.is_completed() {
            return Err(Error::ReadOnly(format!(
                "cannot flush completed chunk {}",
                self.path.display()
            )));
        }
        self.file.sync_data()?;
        Ok(())
    }

    /// Writes the footer and seals the chunk.
    pub fn complete(&self) -> Result<()> {
        if self.header.is_scavenged {
            return Err(Error::InvalidOperation(
                "scavenged chunks are sealed with complete_scavenged".to_string(),
            ));
        }
        let write_pos = self.write_pos.lock()?;
        if self.is_completed() {
            return Err(Error::ReadOnly(format!(
                "chunk {} is already completed",
                self.path.display()
            )));
        }

        let data_size = *write_pos;
        let mut footer = ChunkFooter::new(data_size as i32, data_size, 0);
        footer.checksum = self.compute_checksum(data_size as usize, &[], &footer)?;

        let footer_offset = Self::full_file_len(&self.header) - FOOTER_SIZE as u64;
        self.file.write_all_at(&footer.encode(), footer_offset)?;
        self.file.sync_all()?;

        let _ = self.completion.set(Completion {
            footer,
            pos_map: PosMap::new(),
        });

        tracing::info!(
            chunk = self.header.chunk_start_number,
            data_size = data_size,
            "Completed chunk"
        );
        Ok(())
    }

    /// Seals a scavenged chunk with its position map.
    ///
    /// `logical_data_size` is the logical size of the chunk(s) it replaces.
    pub fn complete_scavenged(&self, pos_map: PosMap, logical_data_size: i64) -> Result<()> {
        if !self.header.is_scavenged {
            return Err(Error::InvalidOperation(
                "only scavenged chunks carry a position map".to_string(),
            ));
        }
        let write_pos = self.write_pos.lock()?;
        if self.is_completed() {
            return Err(Error::ReadOnly(format!(
                "chunk {} is already completed",
                self.path.display()
            )));
        }

        let physical = *write_pos;
        let map_bytes = pos_map.encode();
        let mut footer = ChunkFooter::new(physical as i32, logical_data_size, map_bytes.len() as i32);
        footer.checksum = self.compute_checksum(physical as usize, &map_bytes, &footer)?;

        let map_offset = HEADER_SIZE as u64 + physical as u64;
        let footer_offset = map_offset + map_bytes.len() as u64;
        self.file.write_all_at(&map_bytes, map_offset)?;
        self.file.write_all_at(&footer.encode(), footer_offset)?;
        self.file.set_len(footer_offset + FOOTER_SIZE as u64)?;
        self.file.sync_all()?;

        let _ = self.completion.set(Completion { footer, pos_map });

        tracing::info!(
            chunk = self.header.chunk_start_number,
            physical_size = physical,
            logical_size = logical_data_size,
            records = map_bytes.len() / posmap::POS_MAP_ENTRY_SIZE,
            "Completed scavenged chunk"
        );
        Ok(())
    }

    fn compute_checksum(&self, data_len: usize, map_bytes: &[u8], footer: &ChunkFooter) -> Result<u64> {
        let mut hasher = Hasher::new();
        let mut buf = vec![0u8; CHECKSUM_BLOCK_SIZE];

        let mut header_buf = [0u8; HEADER_SIZE];
        self.file.read_exact_at(&mut header_buf, 0)?;
        hasher.write(&header_buf);

        let mut offset = 0usize;
        while offset < data_len {
            let n = (data_len - offset).min(CHECKSUM_BLOCK_SIZE);
            self.file
                .read_exact_at(&mut buf[..n], (HEADER_SIZE + offset) as u64)?;
            hasher.write(&buf[..n]);
            offset += n;
        }

        hasher.write(map_bytes);
        hasher.write(&footer.encode_prefix());
        Ok(hasher.checksum())
    }

    /// Loads the whole completed file into memory.
    ///
    /// Returns false if the chunk is still active or already cached.
    pub fn cache_in_memory(&self) -> Result<bool> {
        if !self.is_completed() {
            return Ok(false);
        }
        let mut cache = self.cache.write()?;
        if cache.is_some() {
            return Ok(false);
        }
        let len = self.file.metadata()?.len() as usize;
        let mut bytes = vec![0u8; len];
        self.file.read_exact_at(&mut bytes, 0)?;
        *cache = Some(Arc::from(bytes.into_boxed_slice()));

        tracing::debug!(chunk = self.header.chunk_start_number, bytes = len, "Cached chunk");
        Ok(true)
    }

    pub fn uncache_from_memory(&self) -> Result<bool> {
        let released = self.cache.write()?.take().is_some();
        if released {
            tracing::debug!(chunk = self.header.chunk_start_number, "Uncached chunk");
        }
        Ok(released)
    }

    /// Flags the file for removal once the last lease is dropped.
    pub fn mark_for_deletion(&self) {
        self.delete_on_drop.store(true, Ordering::SeqCst);
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.delete_on_drop.load(Ordering::SeqCst)
    }

    fn read_data(&self, offset: i64, buf: &mut [u8]) -> Result<()> {
        let file_offset = HEADER_SIZE + offset as usize;
        if let Some(cache) = self.cache.read()?.as_ref() {
            let end = file_offset + buf.len();
            if end > cache.len() {
                return Err(self.bad_record(format!("read past end of chunk at {}", offset)));
            }
            buf.copy_from_slice(&cache[file_offset..end]);
            return Ok(());
        }
        self.file.read_exact_at(buf, file_offset as u64)?;
        Ok(())
    }

    fn bad_record(&self, msg: String) -> Error {
        Error::corrupt_db(CorruptionKind::BadRecord(msg), &self.path)
    }

    /// Reads the record starting at physical offset `actual`.
    fn read_record(&self, actual: i64, limit: i64) -> Result<Option<(LogRecord, usize)>> {
        if actual < 0 || actual >= limit {
            return Ok(None);
        }
        if actual + FRAME_OVERHEAD as i64 > limit {
            return Err(self.bad_record(format!("truncated record frame at {}", actual)));
        }

        let mut len_buf = [0u8; 4];
        self.read_data(actual, &mut len_buf)?;
        let len = LittleEndian::read_i32(&len_buf);
        if len < BODY_HEADER_SIZE as i32 || actual + FRAME_OVERHEAD as i64 + len as i64 > limit {
            return Err(self.bad_record(format!("invalid record length {} at {}", len, actual)));
        }

        let mut body = vec![0u8; len as usize + 4];
        self.read_data(actual + 4, &mut body)?;
        let suffix = LittleEndian::read_i32(&body[len as usize..]);
        if suffix != len {
            return Err(self.bad_record(format!(
                "length prefix {} and suffix {} differ at {}",
                len, suffix, actual
            )));
        }
        body.truncate(len as usize);
        let record = LogRecord::decode_body(&body).map_err(|msg| self.bad_record(msg))?;
        Ok(Some((record, len as usize + FRAME_OVERHEAD)))
    }

    /// Reads the record ending at physical offset `actual_end`.
    fn read_record_before(&self, actual_end: i64, limit: i64) -> Result<Option<(LogRecord, usize, i64)>> {
        let actual_end = actual_end.min(limit);
        if actual_end <= 0 {
            return Ok(None);
        }
        if actual_end < FRAME_OVERHEAD as i64 {
            return Err(self.bad_record(format!("truncated record frame before {}", actual_end)));
        }

        let mut len_buf = [0u8; 4];
        self.read_data(actual_end - 4, &mut len_buf)?;
        let len = LittleEndian::read_i32(&len_buf);
        let start = actual_end - FRAME_OVERHEAD as i64 - len as i64;
        if len < BODY_HEADER_SIZE as i32 || start < 0 {
            return Err(self.bad_record(format!(
                "invalid record length suffix {} before {}",
                len, actual_end
            )));
        }
        match self.read_record(start, limit)? {
            Some((record, length)) => Ok(Some((record, length, start))),
            None => Ok(None),
        }
    }

    fn check_position(&self, record: &LogRecord, local: i64) -> Result<()> {
        let expected = self.header.chunk_start_position() + local;
        if record.log_position != expected {
            return Err(self.bad_record(format!(
                "record claims position {} but was found at {}",
                record.log_position, expected
            )));
        }
        Ok(())
    }

    fn pos_map(&self) -> Option<&PosMap> {
        match self.completion.get() {
            Some(c) if self.header.is_scavenged => Some(&c.pos_map),
            _ => None,
        }
    }

    /// Reads the record that starts exactly at `position`.
    pub fn try_read_at(&self, position: i64) -> Result<Option<RecordRead>> {
        if self.header.is_scavenged {
            let Some(map) = self.pos_map() else {
                return Ok(None);
            };
            return match map.exact(position) {
                Some((_, entry)) => self.read_mapped(entry),
                None => Ok(None),
            };
        }

        if position < 0 || position >= self.logical_data_size() {
            return Ok(None);
        }
        match self.read_record(position, self.physical_data_size())? {
            Some((record, length)) => {
                self.check_position(&record, position)?;
                Ok(Some(RecordRead {
                    record,
                    length,
                    next_position: position + length as i64,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn try_read_first(&self) -> Result<Option<RecordRead>> {
        self.try_read_closest_forward(0)
    }

    pub fn try_read_last(&self) -> Result<Option<RecordRead>> {
        self.try_read_closest_backward(self.logical_data_size())
    }

    /// Reads the first record at or after `position`.
    pub fn try_read_closest_forward(&self, position: i64) -> Result<Option<RecordRead>> {
        if self.header.is_scavenged {
            let Some(map) = self.pos_map() else {
                return Ok(None);
            };
            return match map.closest_forward(position) {
                Some((_, entry)) => self.read_mapped(entry),
                None => Ok(None),
            };
        }
        self.try_read_at(position.max(0))
    }

    /// Reads the last record that starts before `position`.
    ///
    /// `next_position` of the result is the record's own position, which is
    /// where a backward scan continues from.
    pub fn try_read_closest_backward(&self, position: i64) -> Result<Option<RecordRead>> {
        if self.header.is_scavenged {
            let Some(map) = self.pos_map() else {
                return Ok(None);
            };
            return match map.closest_backward(position) {
                Some((_, entry)) => Ok(self.read_mapped(entry)?.map(|mut read| {
                    read.next_position = entry.log_pos;
                    read
                })),
                None => Ok(None),
            };
        }

        let limit = self.physical_data_size();
        match self.read_record_before(position.min(self.logical_data_size()), limit)? {
            Some((record, length, start)) => {
                self.check_position(&record, start)?;
                Ok(Some(RecordRead {
                    record,
                    length,
                    next_position: start,
                }))
            }
            None => Ok(None),
        }
    }

    fn read_mapped(&self, entry: PosMapEntry) -> Result<Option<RecordRead>> {
        let limit = self.physical_data_size();
        match self.read_record(entry.actual_pos as i64, limit)? {
            Some((record, length)) => {
                self.check_position(&record, entry.log_pos)?;
                Ok(Some(RecordRead {
                    record,
                    length,
                    next_position: entry.log_pos + length as i64,
                }))
            }
            None => Err(self.bad_record(format!(
                "position map points past data at {}",
                entry.actual_pos
            ))),
        }
    }

    /// Iterates all records in logical order.
    pub fn records(&self) -> ChunkRecords<'_> {
        ChunkRecords {
            chunk: self,
            position: 0,
            done: false,
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if !self.delete_on_drop.load(Ordering::SeqCst) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::info!(path = %self.path.display(), "Deleted chunk file"),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to delete chunk file")
            }
        }
    }
}

/// Forward iterator over the records of one chunk.
pub struct ChunkRecords<'a> {
    chunk: &'a Chunk,
    position: i64,
    done: bool,
}

impl Iterator for ChunkRecords<'_> {
    type Item = Result<RecordRead>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.chunk.try_read_closest_forward(self.position) {
            Ok(Some(read)) => {
                self.position = read.next_position;
                Some(Ok(read))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
