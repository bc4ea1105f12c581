//! Sequential reads over the whole log.
//!
//! Readers only see records below the *flushed* writer checkpoint, so a
//! record becomes visible once the writer has made it durable. Forward
//! reads skip the unused tail of completed chunks and the gaps scavenging
//! leaves behind.

use std::sync::Arc;

use super::chunk::Chunk;
use super::db::ChunkDb;
use super::record::{LogRecord, RecordRead};
use crate::checkpoint::{self, Checkpoint};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqReadResult {
    pub record: LogRecord,
    pub record_position: i64,
    /// Where the reader continues: past the record going forward, the
    /// record itself going backward.
    pub next_position: i64,
    /// Set on the last record before the writer position going forward,
    /// and on the record at position 0 going backward.
    pub eof: bool,
}

pub struct LogReader {
    db: Arc<ChunkDb>,
    position: i64,
}

impl LogReader {
    pub fn new(db: Arc<ChunkDb>, initial_position: i64) -> Self {
        Self {
            db,
            position: initial_position.max(0),
        }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn reposition(&mut self, position: i64) {
        self.position = position.max(0);
    }

    fn writer_position(&self) -> i64 {
        self.db.writer_checkpoint().read()
    }

    /// True when nothing readable follows a record ending at `next`.
    fn is_last_before(chunk: &Chunk, local_next: i64, writer: i64) -> bool {
        let end = if chunk.is_completed() && local_next >= chunk.logical_data_size() {
            chunk.header().chunk_end_position()
        } else {
            chunk.header().chunk_start_position() + local_next
        };
        end >= writer
    }

    fn forward_result(chunk: &Chunk, read: RecordRead, writer: i64) -> Option<SeqReadResult> {
        let start = chunk.header().chunk_start_position();
        let next_position = start + read.next_position;
        if next_position > writer {
            return None;
        }
        Some(SeqReadResult {
            eof: Self::is_last_before(chunk, read.next_position, writer),
            record_position: read.record.log_position,
            record: read.record,
            next_position,
        })
    }

    pub fn try_read_next(&mut self) -> Result<Option<SeqReadResult>> {
        let writer = self.writer_position();
        let manager = self.db.manager();
        let mut position = self.position;

        loop {
            if position >= writer {
                return Ok(None);
            }
            let Some(chunk) = manager.get_chunk_for(position)? else {
                return Ok(None);
            };
            let local = position - chunk.header().chunk_start_position();
            match chunk.try_read_closest_forward(local)? {
                Some(read) => {
                    let result = Self::forward_result(&chunk, read, writer);
                    if let Some(result) = &result {
                        self.position = result.next_position;
                    }
                    return Ok(result);
                }
                None => position = chunk.header().chunk_end_position(),
            }
        }
    }

    pub fn try_read_prev(&mut self) -> Result<Option<SeqReadResult>> {
        let manager = self.db.manager();
        let mut position = self.position.min(self.writer_position());

        loop {
            if position <= 0 {
                return Ok(None);
            }
            let Some(chunk) = manager.get_chunk_for(position - 1)? else {
                return Ok(None);
            };
            let start = chunk.header().chunk_start_position();
            match chunk.try_read_closest_backward(position - start)? {
                Some(read) => {
                    let record_position = start + read.next_position;
                    self.position = record_position;
                    return Ok(Some(SeqReadResult {
                        record: read.record,
                        record_position,
                        next_position: record_position,
                        eof: record_position == 0,
                    }));
                }
                None => position = start,
            }
        }
    }

    /// Reads the record at exactly `position` without moving the reader.
    pub fn try_read_at(&self, position: i64) -> Result<Option<SeqReadResult>> {
        let writer = self.writer_position();
        if position < 0 || position >= writer {
            return Ok(None);
        }
        let Some(chunk) = self.db.manager().get_chunk_for(position)? else {
            return Ok(None);
        };
        let local = position - chunk.header().chunk_start_position();
        Ok(chunk
            .try_read_at(local)?
            .and_then(|read| Self::forward_result(&chunk, read, writer)))
    }
}

/// Forward reader that records its progress in a chaser checkpoint.
pub struct LogChaser {
    reader: LogReader,
    checkpoint: Arc<dyn Checkpoint>,
}

impl LogChaser {
    /// Starts at the flushed value of `checkpoint`.
    pub fn new(db: Arc<ChunkDb>, checkpoint: Arc<dyn Checkpoint>) -> Self {
        let reader = LogReader::new(db, checkpoint.read());
        Self { reader, checkpoint }
    }

    pub fn position(&self) -> i64 {
        self.reader.position()
    }

    pub fn try_read_next(&mut self) -> Result<Option<SeqReadResult>> {
        let result = self.reader.try_read_next()?;
        if let Some(read) = &result {
            self.checkpoint.write(read.next_position);
        }
        Ok(result)
    }

    /// Waits until the writer flushes past the chaser and returns the next record.
    pub async fn read_next(&mut self) -> Result<SeqReadResult> {
        loop {
            let writer = self.reader.writer_position();
            if let Some(read) = self.try_read_next()? {
                return Ok(read);
            }
            checkpoint::wait_for(self.reader.db.writer_checkpoint().as_ref(), writer + 1).await?;
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.checkpoint.flush()
    }
}
