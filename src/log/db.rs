use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::chunk::Chunk;
use super::manager::ChunkManager;
use super::naming::{FileNamingStrategy, VersionedPatternNaming};
use crate::checkpoint::Checkpoint;
use crate::config::LogConfig;
use crate::error::{CorruptionKind, Error, Result};

pub const CHUNK_FILE_PREFIX: &str = "chunk-";

/// The chunk set of one database directory, validated against the writer checkpoint.
pub struct ChunkDb {
    dir: PathBuf,
    config: LogConfig,
    manager: ChunkManager,
    writer_checkpoint: Arc<dyn Checkpoint>,
}

impl ChunkDb {
    /// Opens the chunks of `dir` up to the flushed writer checkpoint.
    ///
    /// Every chunk before the one holding the writer position must be
    /// present and completed. The chunk holding the writer position is
    /// reopened for appends, or created when the writer sits on a chunk
    /// boundary. Stale versions and scavenge leftovers are removed.
    pub fn open(
        dir: impl Into<PathBuf>,
        config: &LogConfig,
        writer_checkpoint: Arc<dyn Checkpoint>,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let naming: Arc<dyn FileNamingStrategy> =
            Arc::new(VersionedPatternNaming::new(&dir, CHUNK_FILE_PREFIX));
        let manager = ChunkManager::new(config, naming.clone())?;
        let chunk_size = manager.chunk_size() as i64;

        let writer = writer_checkpoint.read();
        if writer < 0 {
            return Err(Error::corrupt_db(
                CorruptionKind::BadCheckpoint(format!("negative writer position {}", writer)),
                &dir,
            ));
        }
        let last_chunk_number = i32::try_from(writer / chunk_size).map_err(|_| {
            Error::corrupt_db(
                CorruptionKind::BadCheckpoint(format!("writer position {} out of range", writer)),
                &dir,
            )
        })?;

        let mut number = 0;
        while number < last_chunk_number {
            let path = Self::latest_version(naming.as_ref(), number)?;
            let chunk = Chunk::open_completed(&path, config.verify_checksums)?;
            let end_number = chunk.header().chunk_end_number;
            manager.add_chunk(Arc::new(chunk))?;
            number = end_number + 1;
        }
        if number > last_chunk_number {
            return Err(Error::corrupt_db(
                CorruptionKind::BadCheckpoint(format!(
                    "writer position {} falls inside completed chunk range ending at {}",
                    writer,
                    number - 1
                )),
                &dir,
            ));
        }

        match naming.all_versions_for(last_chunk_number)?.first() {
            None if writer == last_chunk_number as i64 * chunk_size => {
                manager.add_new_chunk()?;
            }
            None => {
                return Err(Error::corrupt_db(
                    CorruptionKind::ChunkNotFound,
                    naming.filename_for(last_chunk_number, 0),
                ));
            }
            Some(path) => {
                let (header, footer) = Chunk::inspect(path)?;
                if footer.is_completed {
                    let chunk = Chunk::open_completed(path, config.verify_checksums)?;
                    let data_end = header.chunk_start_position() + chunk.logical_data_size();
                    // A crash between sealing a chunk and flushing the writer
                    // checkpoint leaves the writer behind the sealed data.
                    if writer > data_end || (chunk.is_scavenged() && writer != data_end) {
                        return Err(Error::corrupt_db(
                            CorruptionKind::BadCheckpoint(format!(
                                "writer position {} inside completed chunk ending at {}",
                                writer, data_end
                            )),
                            path,
                        ));
                    }
                    if writer < data_end {
                        tracing::warn!(
                            path = %path.display(),
                            writer,
                            data_end,
                            "Writer checkpoint behind completed chunk, moving it to the chunk end"
                        );
                    }
                    manager.add_chunk(Arc::new(chunk))?;
                    writer_checkpoint.write(header.chunk_end_position());
                    writer_checkpoint.flush()?;
                    manager.add_new_chunk()?;
                } else {
                    let chunk = Chunk::open_for_write(path, writer - header.chunk_start_position())?;
                    manager.add_chunk(Arc::new(chunk))?;
                }
            }
        }

        Self::remove_stale_files(naming.as_ref(), &manager)?;
        manager.try_cache_chunks()?;

        tracing::info!(
            dir = %dir.display(),
            chunks = manager.chunks_count()?,
            writer = writer_checkpoint.read_non_flushed(),
            "Opened chunk database"
        );

        Ok(Self {
            dir,
            config: config.clone(),
            manager,
            writer_checkpoint,
        })
    }

    fn latest_version(naming: &dyn FileNamingStrategy, number: i32) -> Result<PathBuf> {
        naming
            .all_versions_for(number)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::corrupt_db(CorruptionKind::ChunkNotFound, naming.filename_for(number, 0))
            })
    }

    fn remove_stale_files(naming: &dyn FileNamingStrategy, manager: &ChunkManager) -> Result<()> {
        let last_expected = manager.chunks_count()? as i32 - 1;
        let files = naming.all_files()?;
        if let Some(extraneous) = files
            .iter()
            .find(|p| naming.parse_index(p).map_or(false, |index| index > last_expected))
        {
            return Err(Error::corrupt_db(CorruptionKind::ExtraneousFile, extraneous));
        }

        let live: HashSet<PathBuf> = manager
            .all_chunks()?
            .iter()
            .map(|c| c.path().to_path_buf())
            .collect();
        for path in files.iter().filter(|p| !live.contains(*p)) {
            Self::remove_file(path, "Removed old chunk version")?;
        }
        for path in naming.temp_files()? {
            Self::remove_file(&path, "Removed leftover scavenge file")?;
        }
        Ok(())
    }

    fn remove_file(path: &Path, msg: &'static str) -> Result<()> {
        fs::remove_file(path)?;
        tracing::info!(path = %path.display(), "{}", msg);
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn manager(&self) -> &ChunkManager {
        &self.manager
    }

    pub fn writer_checkpoint(&self) -> &Arc<dyn Checkpoint> {
        &self.writer_checkpoint
    }

    /// Flushes the active chunk and the writer checkpoint.
    pub fn close(&self) -> Result<()> {
        if let Some(last) = self.manager.last_chunk()? {
            if !last.is_completed() {
                last.flush()?;
            }
        }
        self.writer_checkpoint.flush()?;
        self.writer_checkpoint.close()?;
        tracing::info!(dir = %self.dir.display(), "Closed chunk database");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{FileCheckpoint, InMemoryCheckpoint};
    use crate::log::chunk::{ChunkHeader, PosMap};
    use crate::log::record::LogRecord;
    use crate::tmpfs::TempDir;

    const CHUNK_SIZE: usize = 4096;

    fn config() -> LogConfig {
        LogConfig::default().chunk_size(CHUNK_SIZE)
    }

    fn checkpoint(value: i64) -> Arc<dyn Checkpoint> {
        Arc::new(InMemoryCheckpoint::new("writer", value))
    }

    fn naming(dir: &TempDir) -> VersionedPatternNaming {
        VersionedPatternNaming::new(dir.path(), CHUNK_FILE_PREFIX)
    }

    fn completed_chunk(dir: &TempDir, number: i32, version: i32) -> Result<()> {
        let path = naming(dir).filename_for(number, version);
        let chunk = Chunk::create_new(path, ChunkHeader::new(CHUNK_SIZE as i32, number, number, false))?;
        chunk.complete()
    }

    #[test]
    fn test_open_empty_directory_creates_first_chunk() -> Result<()> {
        let dir = TempDir::new()?;
        let db = ChunkDb::open(dir.path(), &config(), checkpoint(0))?;
        assert_eq!(db.manager().chunks_count()?, 1);
        assert!(naming(&dir).filename_for(0, 0).exists());
        Ok(())
    }

    #[test]
    fn test_missing_chunk_below_writer_is_corrupt() -> Result<()> {
        let dir = TempDir::new()?;
        completed_chunk(&dir, 0, 0)?;
        let result = ChunkDb::open(dir.path(), &config(), checkpoint(2 * CHUNK_SIZE as i64 + 10));
        assert!(matches!(
            result,
            Err(Error::CorruptDatabase(CorruptionKind::ChunkNotFound, _))
        ));
        Ok(())
    }

    #[test]
    fn test_incomplete_chunk_below_writer_is_corrupt() -> Result<()> {
        let dir = TempDir::new()?;
        Chunk::create_new(
            naming(&dir).filename_for(0, 0),
            ChunkHeader::new(CHUNK_SIZE as i32, 0, 0, false),
        )?;
        let result = ChunkDb::open(dir.path(), &config(), checkpoint(CHUNK_SIZE as i64));
        assert!(matches!(
            result,
            Err(Error::CorruptDatabase(CorruptionKind::NotCompleted, _))
        ));
        Ok(())
    }

    #[test]
    fn test_writer_on_boundary_creates_next_chunk() -> Result<()> {
        let dir = TempDir::new()?;
        completed_chunk(&dir, 0, 0)?;
        let db = ChunkDb::open(dir.path(), &config(), checkpoint(CHUNK_SIZE as i64))?;
        assert_eq!(db.manager().chunks_count()?, 2);
        let last = db.manager().last_chunk()?.expect("active chunk");
        assert!(!last.is_completed());
        assert_eq!(last.header().chunk_start_number, 1);
        Ok(())
    }

    #[test]
    fn test_missing_last_chunk_mid_range_is_corrupt() -> Result<()> {
        let dir = TempDir::new()?;
        completed_chunk(&dir, 0, 0)?;
        let result = ChunkDb::open(dir.path(), &config(), checkpoint(CHUNK_SIZE as i64 + 100));
        assert!(matches!(
            result,
            Err(Error::CorruptDatabase(CorruptionKind::ChunkNotFound, _))
        ));
        Ok(())
    }

    #[test]
    fn test_extraneous_chunk_is_corrupt() -> Result<()> {
        let dir = TempDir::new()?;
        completed_chunk(&dir, 5, 0)?;
        let result = ChunkDb::open(dir.path(), &config(), checkpoint(0));
        assert!(matches!(
            result,
            Err(Error::CorruptDatabase(CorruptionKind::ExtraneousFile, _))
        ));
        Ok(())
    }

    #[test]
    fn test_old_versions_and_temp_files_removed() -> Result<()> {
        let dir = TempDir::new()?;
        let naming = naming(&dir);
        completed_chunk(&dir, 0, 0)?;
        let scavenged = Chunk::create_new(
            naming.filename_for(0, 1),
            ChunkHeader::new(CHUNK_SIZE as i32, 0, 0, true),
        )?;
        scavenged.complete_scavenged(PosMap::new(), 0)?;
        drop(scavenged);
        let temp = naming.temp_filename();
        fs::write(&temp, b"partial")?;

        let db = ChunkDb::open(dir.path(), &config(), checkpoint(CHUNK_SIZE as i64))?;
        assert!(!naming.filename_for(0, 0).exists());
        assert!(naming.filename_for(0, 1).exists());
        assert!(!temp.exists());
        assert!(db.manager().get_chunk(0)?.expect("chunk 0").is_scavenged());
        Ok(())
    }

    #[test]
    fn test_reopen_active_chunk_at_writer() -> Result<()> {
        let dir = TempDir::new()?;
        let writer = checkpoint(0);
        let end = {
            let db = ChunkDb::open(dir.path(), &config(), writer.clone())?;
            let chunk = db.manager().last_chunk()?.expect("active chunk");
            let appended = chunk.try_append(&LogRecord::new(0, b"kept".to_vec()))?;
            chunk.flush()?;
            writer.write(appended.new_position);
            writer.flush()?;
            appended.new_position
        };

        let db = ChunkDb::open(dir.path(), &config(), writer)?;
        let chunk = db.manager().last_chunk()?.expect("active chunk");
        assert_eq!(chunk.logical_data_size(), end);
        assert_eq!(chunk.try_read_at(0)?.expect("record").record.payload, b"kept");
        Ok(())
    }

    #[test]
    fn test_crash_after_sealing_chunk_moves_writer_to_boundary() -> Result<()> {
        let dir = TempDir::new()?;
        let checkpoint_dir = TempDir::new()?;
        let checkpoint_path = checkpoint_dir.path().join("writer.chk");
        let open_checkpoint = || -> Result<Arc<dyn Checkpoint>> {
            Ok(Arc::new(FileCheckpoint::open(&checkpoint_path, "writer", 0)?))
        };

        let unflushed = {
            let writer = open_checkpoint()?;
            let db = ChunkDb::open(dir.path(), &config(), writer.clone())?;
            let chunk = db.manager().last_chunk()?.expect("active chunk");
            let first = chunk.try_append(&LogRecord::new(0, b"flushed".to_vec()))?;
            chunk.flush()?;
            writer.write(first.new_position);
            writer.flush()?;

            let second = chunk.try_append(&LogRecord::new(first.new_position, b"sealed".to_vec()))?;
            // Seal the chunk but die before the checkpoint reaches the boundary.
            chunk.flush()?;
            chunk.complete()?;
            second.old_position
        };

        let writer = open_checkpoint()?;
        assert!(writer.read() < CHUNK_SIZE as i64);
        let db = ChunkDb::open(dir.path(), &config(), writer.clone())?;
        assert_eq!(writer.read(), CHUNK_SIZE as i64);
        assert_eq!(db.manager().chunks_count()?, 2);

        let sealed = db.manager().get_chunk(0)?.expect("chunk 0");
        assert!(sealed.is_completed());
        assert_eq!(sealed.try_read_at(unflushed)?.expect("record").record.payload, b"sealed");
        assert!(!db.manager().last_chunk()?.expect("active chunk").is_completed());
        Ok(())
    }

    #[test]
    fn test_writer_past_completed_chunk_data_is_corrupt() -> Result<()> {
        let dir = TempDir::new()?;
        completed_chunk(&dir, 0, 0)?;
        let result = ChunkDb::open(dir.path(), &config(), checkpoint(100));
        assert!(matches!(
            result,
            Err(Error::CorruptDatabase(CorruptionKind::BadCheckpoint(_), _))
        ));
        Ok(())
    }
}
