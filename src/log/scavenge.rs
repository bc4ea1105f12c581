use std::sync::Arc;

use super::chunk::{Chunk, ChunkHeader, PosMap};
use super::db::ChunkDb;
use super::record::LogRecord;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScavengeResult {
    pub chunk_number: i32,
    pub old_size: u64,
    pub new_size: u64,
    pub kept: usize,
    pub dropped: usize,
}

/// Outcome of folding a range of chunks into one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeChunksResult {
    pub chunk_start: i32,
    pub chunk_end: i32,
    pub old_size: u64,
    pub new_size: u64,
    pub records: usize,
}

/// Rewrites completed chunks keeping only live records.
pub struct Scavenger {
    db: Arc<ChunkDb>,
}

impl Scavenger {
    pub fn new(db: Arc<ChunkDb>) -> Self {
        Self { db }
    }

    /// Copies the records of chunk `number` accepted by `is_live` into a
    /// new version of the chunk and switches it in.
    ///
    /// Readers holding the old chunk keep reading it until they drop it.
    pub fn scavenge_chunk<F>(&self, number: i32, mut is_live: F) -> Result<ScavengeResult>
    where
        F: FnMut(&LogRecord) -> bool,
    {
        let manager = self.db.manager();
        let chunk = manager
            .get_chunk(number)?
            .ok_or_else(|| Error::InvalidInput(format!("chunk {} does not exist", number)))?;
        if !chunk.is_completed() {
            return Err(Error::InvalidOperation(format!(
                "chunk {} is still being written",
                number
            )));
        }

        let header = *chunk.header();
        let temp = Chunk::create_new(
            manager.naming().temp_filename(),
            ChunkHeader::new(
                header.chunk_size,
                header.chunk_start_number,
                header.chunk_end_number,
                true,
            ),
        )?;

        let mut pos_map = PosMap::new();
        let (kept, dropped) = match Self::copy_live(&chunk, &temp, &mut pos_map, &mut is_live) {
            Ok(copied) => copied,
            Err(e) => {
                temp.mark_for_deletion();
                return Err(e);
            }
        };

        let old_size = chunk.file_size()?;
        let switched = self.seal_and_switch(temp, pos_map, chunk.logical_data_size())?;
        let new_size = switched.file_size()?;

        tracing::info!(
            chunk = number,
            old_size = old_size,
            new_size = new_size,
            kept = kept,
            dropped = dropped,
            "Scavenged chunk"
        );

        Ok(ScavengeResult {
            chunk_number: header.chunk_start_number,
            old_size,
            new_size,
            kept,
            dropped,
        })
    }

    /// Folds the completed chunks covering chunk numbers `from..=to` into a
    /// single scavenged chunk that takes over every slot of the range.
    ///
    /// Records keep their log positions. Returns `None` and leaves the
    /// chunks alone when their combined data does not fit in one chunk.
    pub fn merge_chunks(&self, from: i32, to: i32) -> Result<Option<MergeChunksResult>> {
        if from >= to {
            return Err(Error::InvalidInput(format!(
                "chunk range {}-{} has nothing to merge",
                from, to
            )));
        }
        let manager = self.db.manager();
        let missing = |n: i32| Error::InvalidInput(format!("chunk {} does not exist", n));
        let first = manager.get_chunk(from)?.ok_or_else(|| missing(from))?;
        let last = manager.get_chunk(to)?.ok_or_else(|| missing(to))?;
        if first.header().chunk_start_number != from || last.header().chunk_end_number != to {
            return Err(Error::InvalidInput(format!(
                "chunk range {}-{} splits an existing chunk",
                from, to
            )));
        }

        let sources: Vec<Arc<Chunk>> = manager
            .all_chunks()?
            .into_iter()
            .filter(|c| c.header().chunk_start_number >= from && c.header().chunk_end_number <= to)
            .collect();
        if let Some(active) = sources.iter().find(|c| !c.is_completed()) {
            return Err(Error::InvalidOperation(format!(
                "chunk {} is still being written",
                active.header().chunk_start_number
            )));
        }

        let physical: i64 = sources.iter().map(|c| c.physical_data_size()).sum();
        if physical > manager.chunk_size() as i64 {
            tracing::info!(from, to, physical, "Chunks too large to merge");
            return Ok(None);
        }

        let header = *first.header();
        let temp = Chunk::create_new(
            manager.naming().temp_filename(),
            ChunkHeader::new(header.chunk_size, from, to, true),
        )?;

        let mut pos_map = PosMap::new();
        let mut records = 0;
        let mut old_size = 0;
        for source in &sources {
            match Self::copy_live(source, &temp, &mut pos_map, &mut |_: &LogRecord| true) {
                Ok((kept, _)) => records += kept,
                Err(e) => {
                    temp.mark_for_deletion();
                    return Err(e);
                }
            }
            old_size += source.file_size()?;
        }

        let logical_data_size =
            last.header().chunk_start_position() + last.logical_data_size() - header.chunk_start_position();
        let switched = self.seal_and_switch(temp, pos_map, logical_data_size)?;
        let new_size = switched.file_size()?;

        tracing::info!(
            chunk_start = from,
            chunk_end = to,
            old_size = old_size,
            new_size = new_size,
            records = records,
            "Merged chunks"
        );

        Ok(Some(MergeChunksResult {
            chunk_start: from,
            chunk_end: to,
            old_size,
            new_size,
            records,
        }))
    }

    fn seal_and_switch(&self, temp: Chunk, pos_map: PosMap, logical_data_size: i64) -> Result<Arc<Chunk>> {
        if let Err(e) = temp.complete_scavenged(pos_map, logical_data_size) {
            temp.mark_for_deletion();
            return Err(e);
        }
        let manager = self.db.manager();
        let switched = manager.switch_chunk(Arc::new(temp))?;
        manager.try_cache_chunks()?;
        Ok(switched)
    }

    /// Appends the records of `source` accepted by `is_live` to `target`,
    /// mapping each one relative to the start of `target`.
    fn copy_live<F>(
        source: &Chunk,
        target: &Chunk,
        pos_map: &mut PosMap,
        is_live: &mut F,
    ) -> Result<(usize, usize)>
    where
        F: FnMut(&LogRecord) -> bool,
    {
        let start = target.header().chunk_start_position();
        let (mut kept, mut dropped) = (0, 0);

        for read in source.records() {
            let record = read?.record;
            if !is_live(&record) {
                dropped += 1;
                continue;
            }
            let appended = target.try_append(&record)?;
            if !appended.success {
                return Err(Error::InvalidOperation(format!(
                    "scavenged copy of chunk {} overflowed",
                    source.header().chunk_start_number
                )));
            }
            pos_map.push(record.log_position - start, appended.old_position as i32);
            kept += 1;
        }
        Ok((kept, dropped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, InMemoryCheckpoint};
    use crate::config::LogConfig;
    use crate::log::db::CHUNK_FILE_PREFIX;
    use crate::log::naming::{FileNamingStrategy, VersionedPatternNaming};
    use crate::log::reader::LogReader;
    use crate::log::writer::LogWriter;
    use crate::tmpfs::TempDir;

    fn open(dir: &TempDir) -> Result<(Arc<ChunkDb>, LogWriter)> {
        let checkpoint: Arc<dyn Checkpoint> = Arc::new(InMemoryCheckpoint::new("writer", 0));
        let config = LogConfig::default().chunk_size(4096);
        let db = Arc::new(ChunkDb::open(dir.path(), &config, checkpoint)?);
        let writer = LogWriter::new(db.clone())?;
        Ok((db, writer))
    }

    fn read_all(db: &Arc<ChunkDb>) -> Result<Vec<u8>> {
        let mut reader = LogReader::new(db.clone(), 0);
        let mut tags = Vec::new();
        while let Some(read) = reader.try_read_next()? {
            tags.push(read.record.payload[0]);
        }
        Ok(tags)
    }

    #[test]
    fn test_scavenge_keeps_live_records_at_original_positions() -> Result<()> {
        let dir = TempDir::new()?;
        let (db, mut writer) = open(&dir)?;
        let mut positions = Vec::new();
        for i in 0..6u8 {
            positions.push(writer.append(&[i; 500])?);
        }
        writer.complete_chunk()?;
        writer.append(&[9; 10])?;
        writer.flush()?;

        let old_path = db.manager().get_chunk(0)?.expect("chunk 0").path().to_path_buf();
        let result = Scavenger::new(db.clone()).scavenge_chunk(0, |r| r.payload[0] % 2 == 0)?;
        assert_eq!(result.kept, 3);
        assert_eq!(result.dropped, 3);
        assert!(result.new_size < result.old_size);
        assert!(!old_path.exists());

        assert_eq!(read_all(&db)?, vec![0, 2, 4, 9]);

        let reader = LogReader::new(db.clone(), 0);
        let kept = reader.try_read_at(positions[2])?.expect("kept record");
        assert_eq!(kept.record.payload[0], 2);
        assert!(reader.try_read_at(positions[3])?.is_none());
        Ok(())
    }

    #[test]
    fn test_scavenge_everything_leaves_an_empty_chunk() -> Result<()> {
        let dir = TempDir::new()?;
        let (db, mut writer) = open(&dir)?;
        for i in 0..3u8 {
            writer.append(&[i; 100])?;
        }
        writer.complete_chunk()?;
        writer.append(&[7; 10])?;
        writer.flush()?;

        let result = Scavenger::new(db.clone()).scavenge_chunk(0, |_| false)?;
        assert_eq!(result.kept, 0);
        assert_eq!(read_all(&db)?, vec![7]);

        let mut reader = LogReader::new(db.clone(), db.writer_checkpoint().read());
        let read = reader.try_read_prev()?.expect("record in chunk 1");
        assert_eq!(read.record.payload[0], 7);
        assert!(reader.try_read_prev()?.is_none());
        Ok(())
    }

    #[test]
    fn test_scavenge_active_chunk_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let (db, mut writer) = open(&dir)?;
        writer.append(b"active")?;

        let result = Scavenger::new(db).scavenge_chunk(0, |_| true);
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
        Ok(())
    }

    #[test]
    fn test_scavenged_chunk_survives_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        let writer_position = {
            let (db, mut writer) = open(&dir)?;
            for i in 0..4u8 {
                writer.append(&[i; 200])?;
            }
            writer.complete_chunk()?;
            Scavenger::new(db.clone()).scavenge_chunk(0, |r| r.payload[0] != 1)?;
            db.writer_checkpoint().read()
        };

        let checkpoint: Arc<dyn Checkpoint> =
            Arc::new(InMemoryCheckpoint::new("writer", writer_position));
        let config = LogConfig::default().chunk_size(4096);
        let db = Arc::new(ChunkDb::open(dir.path(), &config, checkpoint)?);
        assert!(db.manager().get_chunk(0)?.expect("chunk 0").is_scavenged());
        assert_eq!(read_all(&db)?, vec![0, 2, 3]);
        Ok(())
    }

    fn fill_chunk(writer: &mut LogWriter, tags: std::ops::Range<u8>) -> Result<Vec<i64>> {
        let mut positions = Vec::new();
        for tag in tags {
            positions.push(writer.append(&[tag; 500])?);
        }
        writer.complete_chunk()?;
        Ok(positions)
    }

    #[test]
    fn test_merge_scavenged_chunks_into_one_file() -> Result<()> {
        let dir = TempDir::new()?;
        let naming = VersionedPatternNaming::new(dir.path(), CHUNK_FILE_PREFIX);
        let (writer_position, second) = {
            let (db, mut writer) = open(&dir)?;
            fill_chunk(&mut writer, 0..6)?;
            let second = fill_chunk(&mut writer, 10..16)?;
            writer.append(&[99; 10])?;
            writer.flush()?;

            let scavenger = Scavenger::new(db.clone());
            scavenger.scavenge_chunk(0, |r| r.payload[0] % 2 == 0)?;
            scavenger.scavenge_chunk(1, |r| r.payload[0] % 2 == 0)?;

            let result = scavenger.merge_chunks(0, 1)?.expect("chunks fit in one file");
            assert_eq!(result.records, 6);
            assert!(result.new_size < result.old_size);

            let merged = db.manager().get_chunk(0)?.expect("chunk 0");
            assert!(Arc::ptr_eq(&merged, &db.manager().get_chunk(1)?.expect("chunk 1")));
            assert_eq!(merged.header().chunk_end_number, 1);
            assert_eq!(db.manager().all_chunks()?.len(), 2);
            assert!(!naming.filename_for(1, 1).exists());

            assert_eq!(read_all(&db)?, vec![0, 2, 4, 10, 12, 14, 99]);
            let reader = LogReader::new(db.clone(), 0);
            let read = reader.try_read_at(second[2])?.expect("record from chunk 1");
            assert_eq!(read.record.payload[0], 12);
            assert!(reader.try_read_at(second[1])?.is_none());

            let mut reader = LogReader::new(db.clone(), db.writer_checkpoint().read());
            let mut backward = Vec::new();
            while let Some(read) = reader.try_read_prev()? {
                backward.push(read.record.payload[0]);
            }
            assert_eq!(backward, vec![99, 14, 12, 10, 4, 2, 0]);
            (db.writer_checkpoint().read(), second)
        };

        let checkpoint: Arc<dyn Checkpoint> =
            Arc::new(InMemoryCheckpoint::new("writer", writer_position));
        let config = LogConfig::default().chunk_size(4096);
        let db = Arc::new(ChunkDb::open(dir.path(), &config, checkpoint)?);
        assert_eq!(db.manager().chunks_count()?, 3);
        assert_eq!(db.manager().get_chunk(1)?.expect("chunk 1").header().chunk_start_number, 0);
        assert_eq!(read_all(&db)?, vec![0, 2, 4, 10, 12, 14, 99]);
        let reader = LogReader::new(db.clone(), 0);
        assert_eq!(reader.try_read_at(second[4])?.expect("record").record.payload[0], 14);
        Ok(())
    }

    #[test]
    fn test_merge_chunks_rejections() -> Result<()> {
        let dir = TempDir::new()?;
        let (db, mut writer) = open(&dir)?;
        fill_chunk(&mut writer, 0..6)?;
        fill_chunk(&mut writer, 10..16)?;
        writer.append(b"active")?;
        writer.flush()?;

        let scavenger = Scavenger::new(db.clone());
        // Two nearly full chunks do not fit in one.
        assert_eq!(scavenger.merge_chunks(0, 1)?, None);
        assert!(!db.manager().get_chunk(0)?.expect("chunk 0").is_scavenged());
        assert_eq!(read_all(&db)?.len(), 13);

        assert!(matches!(scavenger.merge_chunks(1, 1), Err(Error::InvalidInput(_))));
        assert!(matches!(scavenger.merge_chunks(1, 2), Err(Error::InvalidOperation(_))));
        assert!(matches!(scavenger.merge_chunks(1, 5), Err(Error::InvalidInput(_))));
        Ok(())
    }
}
