use std::sync::Arc;

use super::chunk::Chunk;
use super::db::ChunkDb;
use super::record::{LogRecord, BODY_HEADER_SIZE, FRAME_OVERHEAD};
use crate::checkpoint::Checkpoint;
use crate::error::{Error, Result};

/// Single appender of the log.
///
/// Appends advance the writer checkpoint without flushing it; `flush`
/// makes both the chunk data and the checkpoint durable. When the active
/// chunk is full it is completed, the checkpoint jumps to the chunk
/// boundary and a fresh chunk takes over.
pub struct LogWriter {
    db: Arc<ChunkDb>,
    checkpoint: Arc<dyn Checkpoint>,
    active: Arc<Chunk>,
}

impl LogWriter {
    pub fn new(db: Arc<ChunkDb>) -> Result<Self> {
        let active = db
            .manager()
            .last_chunk()?
            .filter(|chunk| !chunk.is_completed())
            .ok_or_else(|| Error::InvalidOperation("log has no active chunk".to_string()))?;
        let checkpoint = db.writer_checkpoint().clone();
        Ok(Self {
            db,
            checkpoint,
            active,
        })
    }

    /// Position the next record will be written at.
    pub fn position(&self) -> i64 {
        self.checkpoint.read_non_flushed()
    }

    /// Appends a framed record carrying its own log position.
    ///
    /// Returns `(true, new_position)` on success. When the record does not
    /// fit, the active chunk is completed, a new chunk is started and
    /// `(false, position)` is returned so the caller can reframe and retry.
    pub fn write(&mut self, record: &LogRecord) -> Result<(bool, i64)> {
        let result = self.active.try_append(record)?;
        if result.success {
            let new_position = self.active.header().chunk_start_position() + result.new_position;
            self.checkpoint.write(new_position);
            return Ok((true, new_position));
        }

        self.complete_chunk()?;
        Ok((false, self.position()))
    }

    /// Frames `payload` at the current position and appends it.
    ///
    /// Returns the log position of the record.
    pub fn append(&mut self, payload: &[u8]) -> Result<i64> {
        let size = FRAME_OVERHEAD + BODY_HEADER_SIZE + payload.len();
        let capacity = self.db.manager().chunk_size() as usize;
        if size > capacity {
            return Err(Error::RecordTooLarge { size, capacity });
        }

        for _ in 0..2 {
            let position = self.position();
            let (written, _) = self.write(&LogRecord::new(position, payload))?;
            if written {
                return Ok(position);
            }
        }
        Err(Error::RecordTooLarge { size, capacity })
    }

    /// Makes appended records durable, then publishes the writer position.
    pub fn flush(&self) -> Result<()> {
        self.active.flush()?;
        self.checkpoint.flush()
    }

    /// Completes the active chunk and switches to a new one.
    pub fn complete_chunk(&mut self) -> Result<()> {
        self.active.flush()?;
        self.active.complete()?;

        let boundary = self.active.header().chunk_end_position();
        self.checkpoint.write(boundary);
        self.checkpoint.flush()?;

        let manager = self.db.manager();
        self.active = manager.add_new_chunk()?;
        manager.try_cache_chunks()?;

        tracing::debug!(
            chunk = self.active.header().chunk_start_number,
            position = boundary,
            "Switched to new chunk"
        );
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{FileCheckpoint, InMemoryCheckpoint};
    use crate::config::LogConfig;
    use crate::tmpfs::TempDir;

    const CHUNK_SIZE: usize = 4096;

    fn open_db(dir: &TempDir, checkpoint: Arc<dyn Checkpoint>) -> Result<Arc<ChunkDb>> {
        let config = LogConfig::default().chunk_size(CHUNK_SIZE);
        Ok(Arc::new(ChunkDb::open(dir.path(), &config, checkpoint)?))
    }

    #[test]
    fn test_append_advances_unflushed_position() -> Result<()> {
        let dir = TempDir::new()?;
        let checkpoint: Arc<dyn Checkpoint> = Arc::new(InMemoryCheckpoint::new("writer", 0));
        let mut writer = LogWriter::new(open_db(&dir, checkpoint.clone())?)?;

        let first = writer.append(b"one")?;
        let second = writer.append(b"two")?;
        assert_eq!(first, 0);
        assert!(second > first);
        assert_eq!(checkpoint.read(), 0, "nothing flushed yet");

        writer.flush()?;
        assert_eq!(checkpoint.read(), writer.position());
        Ok(())
    }

    #[test]
    fn test_full_chunk_rolls_over() -> Result<()> {
        let dir = TempDir::new()?;
        let checkpoint: Arc<dyn Checkpoint> = Arc::new(InMemoryCheckpoint::new("writer", 0));
        let db = open_db(&dir, checkpoint.clone())?;
        let mut writer = LogWriter::new(db.clone())?;

        let payload = vec![1u8; 1000];
        let mut positions = Vec::new();
        for _ in 0..5 {
            positions.push(writer.append(&payload)?);
        }

        assert_eq!(db.manager().chunks_count()?, 2);
        assert_eq!(positions[4], CHUNK_SIZE as i64, "fifth record starts the next chunk");
        assert!(db.manager().get_chunk(0)?.expect("chunk 0").is_completed());
        assert!(checkpoint.read() >= CHUNK_SIZE as i64, "boundary is flushed on completion");
        Ok(())
    }

    #[test]
    fn test_record_larger_than_chunk_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let checkpoint: Arc<dyn Checkpoint> = Arc::new(InMemoryCheckpoint::new("writer", 0));
        let mut writer = LogWriter::new(open_db(&dir, checkpoint)?)?;

        let result = writer.append(&vec![0u8; CHUNK_SIZE]);
        assert!(matches!(result, Err(Error::RecordTooLarge { .. })));
        assert_eq!(writer.position(), 0);
        Ok(())
    }

    #[test]
    fn test_appends_survive_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        let checkpoint_path = dir.join("writer.chk");

        let mut positions = Vec::new();
        {
            let checkpoint: Arc<dyn Checkpoint> =
                Arc::new(FileCheckpoint::open(&checkpoint_path, "writer", 0)?);
            let db = open_db(&dir, checkpoint)?;
            let mut writer = LogWriter::new(db.clone())?;
            for i in 0..10u8 {
                positions.push(writer.append(&[i; 600])?);
            }
            writer.flush()?;
            db.close()?;
        }

        let checkpoint: Arc<dyn Checkpoint> =
            Arc::new(FileCheckpoint::open(&checkpoint_path, "writer", 0)?);
        let db = open_db(&dir, checkpoint)?;
        for (i, position) in positions.iter().enumerate() {
            let chunk = db.manager().get_chunk_for(*position)?.expect("chunk");
            let local = position - chunk.header().chunk_start_position();
            let read = chunk.try_read_at(local)?.expect("record");
            assert_eq!(read.record.payload, vec![i as u8; 600]);
        }

        let mut writer = LogWriter::new(db)?;
        let next = writer.append(b"after reopen")?;
        assert!(next > *positions.last().expect("positions"));
        Ok(())
    }
}
