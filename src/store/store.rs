use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use super::event::{decode_event, encode_event, Event};
use super::metrics::{self, StoreMetrics};
use crate::checkpoint::{self, Checkpoint, CheckpointKind, FileCheckpoint};
use crate::config::StoreConfig;
use crate::error::{CorruptionKind, Error, Result};
use crate::flock::FileLock;
use crate::index::{IndexEntry, TableIndex};
use crate::log::{ChunkDb, LogReader, LogWriter, MergeChunksResult, ScavengeResult, Scavenger};

const LOCK_FILE: &str = "chunkdb.lock";

/// An event log with a stream index over it.
///
/// Events are appended to the chunked log first and indexed second. On
/// open, everything the log holds past the index's watermark is indexed
/// again, so an index flush may lag the log without losing events.
pub struct Store {
    pub(crate) config: StoreConfig,
    _lock: FileLock,
    checkpoints: HashMap<CheckpointKind, Arc<dyn Checkpoint>>,
    db: Arc<ChunkDb>,
    writer: Mutex<LogWriter>,
    index: TableIndex,
}

impl Store {
    pub fn open(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE)).map_err(Error::LockError)?;

        let mut checkpoints: HashMap<CheckpointKind, Arc<dyn Checkpoint>> = HashMap::new();
        for kind in CheckpointKind::ALL {
            let checkpoint = FileCheckpoint::open(
                config.dir.join(kind.file_name()),
                kind.name(),
                kind.initial_value(),
            )?;
            checkpoints.insert(kind, Arc::new(checkpoint));
        }
        let writer_checkpoint = checkpoints
            .get(&CheckpointKind::Writer)
            .cloned()
            .ok_or_else(|| Error::InvalidOperation("writer checkpoint missing".into()))?;

        let db = Arc::new(ChunkDb::open(&config.dir, &config.log, writer_checkpoint)?);
        let writer = LogWriter::new(db.clone())?;
        let index = TableIndex::open(config.index_dir(), &config.index)?;

        let reindexed = Self::reindex(&db, &index)?;
        tracing::info!(
            dir = %config.dir.display(),
            writer = db.writer_checkpoint().read(),
            reindexed,
            "Opened store"
        );

        Ok(Self {
            config,
            _lock: lock,
            checkpoints,
            db,
            writer: Mutex::new(writer),
            index,
        })
    }

    /// Indexes every event after the index's prepare watermark.
    fn reindex(db: &Arc<ChunkDb>, index: &TableIndex) -> Result<usize> {
        let indexed = index.prepare_checkpoint()?;
        let writer = db.writer_checkpoint().read();
        let mut reader = LogReader::new(db.clone(), 0);

        if indexed >= 0 {
            if indexed >= writer {
                tracing::warn!(indexed, writer, "Index is ahead of the log, nothing to reindex");
                return Ok(0);
            }
            match reader.try_read_at(indexed)? {
                Some(read) => reader.reposition(read.next_position),
                // Scavenged away; a scavenged chunk resolves any position forward.
                None => reader.reposition(indexed + 1),
            }
        }

        let mut count = 0;
        while let Some(read) = reader.try_read_next()? {
            match decode_event(read.record_position, &read.record.payload) {
                Some(event) => {
                    index.add(read.record_position, event.stream_hash, event.version, read.record_position)?;
                    count += 1;
                }
                None => tracing::warn!(position = read.record_position, "Skipping record that is not an event"),
            }
        }
        if count > 0 {
            tracing::info!(from = indexed, events = count, "Reindexed log tail");
        }
        Ok(count)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<ChunkDb> {
        &self.db
    }

    pub fn index(&self) -> &TableIndex {
        &self.index
    }

    fn checkpoint(&self, kind: CheckpointKind) -> Result<&Arc<dyn Checkpoint>> {
        self.checkpoints
            .get(&kind)
            .ok_or_else(|| Error::InvalidInput(format!("unknown checkpoint {}", kind)))
    }

    /// Appends an event and indexes it. Returns its log position.
    ///
    /// The event becomes readable once the writer is flushed.
    pub fn append_event(&self, stream_hash: u64, version: i64, data: &[u8]) -> Result<i64> {
        let payload = encode_event(stream_hash, version, data);
        let mut writer = self.writer.lock()?;
        let position = writer.append(&payload)?;
        self.index.add(position, stream_hash, version, position)?;
        Ok(position)
    }

    fn read_event_at(&self, reader: &LogReader, position: i64) -> Result<Option<Event>> {
        let Some(read) = reader.try_read_at(position)? else {
            return Ok(None);
        };
        decode_event(read.record_position, &read.record.payload)
            .map(Some)
            .ok_or_else(|| {
                Error::corrupt_db(
                    CorruptionKind::BadRecord(format!("record at {} is not an event", position)),
                    self.db.dir(),
                )
            })
    }

    /// True if the entry points at an event of exactly this stream hash.
    fn entry_matches(&self, reader: &LogReader, entry: &IndexEntry, stream_hash: u64) -> Result<bool> {
        Ok(self
            .read_event_at(reader, entry.position)?
            .map_or(false, |event| event.stream_hash == stream_hash && event.version == entry.version))
    }

    pub fn read_event(&self, stream_hash: u64, version: i64) -> Result<Option<Event>> {
        let reader = LogReader::new(self.db.clone(), 0);
        let position = self.index.try_get_one_value_where(stream_hash, version, |entry| {
            self.entry_matches(&reader, entry, stream_hash)
        })?;
        match position {
            Some(position) => self.read_event_at(&reader, position),
            None => Ok(None),
        }
    }

    /// Events of the stream from version `from` down to version `to`, newest first.
    pub fn read_stream_backward(&self, stream_hash: u64, from: i64, to: i64) -> Result<Vec<Event>> {
        let reader = LogReader::new(self.db.clone(), 0);
        let entries = self.index.get_range_where(stream_hash, to, from, None, |entry| {
            self.entry_matches(&reader, entry, stream_hash)
        })?;

        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(event) = self.read_event_at(&reader, entry.position)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    pub fn read_checkpoint(&self, kind: CheckpointKind) -> Result<i64> {
        Ok(self.checkpoint(kind)?.read())
    }

    /// Waits until the flushed value of `kind` reaches `at_least`.
    pub async fn await_checkpoint(&self, kind: CheckpointKind, at_least: i64) -> Result<i64> {
        checkpoint::wait_for(self.checkpoint(kind)?.as_ref(), at_least).await
    }

    /// Makes every appended event durable and readable.
    pub fn flush(&self) -> Result<()> {
        self.writer.lock()?.flush()
    }

    /// Rewrites a completed chunk without the events `is_live` rejects.
    ///
    /// Records that do not hold an event are kept.
    pub fn scavenge_chunk<F>(&self, number: i32, mut is_live: F) -> Result<ScavengeResult>
    where
        F: FnMut(&Event) -> bool,
    {
        Scavenger::new(self.db.clone()).scavenge_chunk(number, |record| {
            decode_event(record.log_position, &record.payload).map_or(true, |event| is_live(&event))
        })
    }

    /// Folds the chunks covering `from..=to` into one file once scavenging
    /// has shrunk them enough to fit.
    pub fn merge_chunks(&self, from: i32, to: i32) -> Result<Option<MergeChunksResult>> {
        Scavenger::new(self.db.clone()).merge_chunks(from, to)
    }

    /// Rewrites every index table without the entries `should_keep` rejects.
    pub fn scavenge_index<F>(&self, should_keep: F) -> Result<i64>
    where
        F: FnMut(&IndexEntry) -> bool,
    {
        self.index.scavenge(should_keep)
    }

    /// Writes every indexed entry to index tables.
    pub fn flush_index(&self) -> Result<usize> {
        self.index.flush_all()
    }

    /// Writes only memtables that have already filled up.
    pub fn flush_pending_index(&self) -> Result<usize> {
        self.index.flush_pending()
    }

    pub fn merge_index(&self) -> Result<bool> {
        self.index.merge_indexes()
    }

    pub fn collect_metrics(&self) -> Result<StoreMetrics> {
        let metrics = StoreMetrics {
            chunks: self.db.manager().all_chunks()?.len(),
            cached_chunks: self.db.manager().cached_chunks()?,
            writer_position: self.db.writer_checkpoint().read_non_flushed(),
            flushed_position: self.db.writer_checkpoint().read(),
            index: self.index.stats()?,
        };
        metrics::log_metrics(&metrics);
        Ok(metrics)
    }

    /// Flushes the log, the index and every checkpoint.
    pub fn close(&self) -> Result<()> {
        self.writer.lock()?.close()?;
        self.index.close(false)?;
        for checkpoint in self.checkpoints.values() {
            checkpoint.flush()?;
            checkpoint.close()?;
        }
        self.db.close()?;
        tracing::info!(dir = %self.config.dir.display(), "Closed store");
        Ok(())
    }
}
