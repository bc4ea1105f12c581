use std::fs;
use std::sync::{Arc, RwLock};

use super::chunk::{Chunk, ChunkHeader};
use super::naming::FileNamingStrategy;
use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Owns the ordered chunk sequence and maps log positions onto it.
///
/// Slot `n` holds the chunk covering chunk number `n`. A merged scavenged
/// chunk occupies every slot in its range.
pub struct ChunkManager {
    chunk_size: i32,
    max_cached_chunks: usize,
    verify_checksums: bool,
    naming: Arc<dyn FileNamingStrategy>,
    chunks: RwLock<Vec<Arc<Chunk>>>,
}

impl ChunkManager {
    pub fn new(config: &LogConfig, naming: Arc<dyn FileNamingStrategy>) -> Result<Self> {
        let chunk_size = i32::try_from(config.chunk_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                Error::InvalidInput(format!("chunk size {} out of range", config.chunk_size))
            })?;

        Ok(Self {
            chunk_size,
            max_cached_chunks: config.max_cached_chunks,
            verify_checksums: config.verify_checksums,
            naming,
            chunks: RwLock::new(Vec::new()),
        })
    }

    pub fn chunk_size(&self) -> i32 {
        self.chunk_size
    }

    pub fn naming(&self) -> &Arc<dyn FileNamingStrategy> {
        &self.naming
    }

    pub fn chunks_count(&self) -> Result<usize> {
        Ok(self.chunks.read()?.len())
    }

    /// Creates the next empty chunk and makes it the last one.
    pub fn add_new_chunk(&self) -> Result<Arc<Chunk>> {
        let mut chunks = self.chunks.write()?;
        let number = chunks.len() as i32;
        let header = ChunkHeader::new(self.chunk_size, number, number, false);
        let chunk = Arc::new(Chunk::create_new(self.naming.filename_for(number, 0), header)?);
        chunks.push(chunk.clone());

        tracing::info!(chunk = number, "Added new chunk");
        Ok(chunk)
    }

    /// Appends an opened chunk. Its range must start right after the last chunk.
    pub fn add_chunk(&self, chunk: Arc<Chunk>) -> Result<()> {
        let header = *chunk.header();
        self.check_chunk_size(&header)?;

        let mut chunks = self.chunks.write()?;
        if header.chunk_start_number as usize != chunks.len() {
            return Err(Error::InvalidOperation(format!(
                "chunk {} added out of order, expected {}",
                header.chunk_start_number,
                chunks.len()
            )));
        }
        for _ in header.chunk_start_number..=header.chunk_end_number {
            chunks.push(chunk.clone());
        }
        Ok(())
    }

    fn check_chunk_size(&self, header: &ChunkHeader) -> Result<()> {
        if header.chunk_size != self.chunk_size {
            return Err(Error::InvalidInput(format!(
                "chunk {} has size {}, database uses {}",
                header.chunk_start_number, header.chunk_size, self.chunk_size
            )));
        }
        Ok(())
    }

    pub fn get_chunk(&self, number: i32) -> Result<Option<Arc<Chunk>>> {
        if number < 0 {
            return Ok(None);
        }
        Ok(self.chunks.read()?.get(number as usize).cloned())
    }

    /// Chunk holding `log_position`; `None` past the last chunk.
    pub fn get_chunk_for(&self, log_position: i64) -> Result<Option<Arc<Chunk>>> {
        if log_position < 0 {
            return Ok(None);
        }
        let number = log_position / self.chunk_size as i64;
        match i32::try_from(number) {
            Ok(number) => self.get_chunk(number),
            Err(_) => Ok(None),
        }
    }

    pub fn last_chunk(&self) -> Result<Option<Arc<Chunk>>> {
        Ok(self.chunks.read()?.last().cloned())
    }

    /// Distinct chunks in order.
    pub fn all_chunks(&self) -> Result<Vec<Arc<Chunk>>> {
        let chunks = self.chunks.read()?;
        let mut distinct: Vec<Arc<Chunk>> = Vec::with_capacity(chunks.len());
        for chunk in chunks.iter() {
            if distinct.last().map_or(true, |last| !Arc::ptr_eq(last, chunk)) {
                distinct.push(chunk.clone());
            }
        }
        Ok(distinct)
    }

    /// Swaps a completed replacement chunk into the live set.
    ///
    /// The file is renamed to the next version of its start index and
    /// reopened; the chunks it replaces are marked for deletion and go away
    /// once readers release them. A replacement covering several chunk
    /// numbers takes over every slot in its range.
    pub fn switch_chunk(&self, chunk: Arc<Chunk>) -> Result<Arc<Chunk>> {
        if !chunk.is_completed() {
            return Err(Error::InvalidOperation(format!(
                "cannot switch in incomplete chunk {}",
                chunk.path().display()
            )));
        }
        let header = *chunk.header();
        self.check_chunk_size(&header)?;

        let mut chunks = self.chunks.write()?;
        if header.chunk_end_number as usize >= chunks.len() {
            return Err(Error::InvalidOperation(format!(
                "chunk range {}-{} is beyond the last chunk {}",
                header.chunk_start_number,
                header.chunk_end_number,
                chunks.len() as i64 - 1
            )));
        }

        let old_path = chunk.path().to_path_buf();
        let new_path = self.naming.best_version_filename(header.chunk_start_number)?;
        drop(chunk);
        fs::rename(&old_path, &new_path)?;
        let new_chunk = Arc::new(Chunk::open_completed(&new_path, self.verify_checksums)?);

        let mut replaced: Vec<Arc<Chunk>> = Vec::new();
        for slot in &mut chunks[header.chunk_start_number as usize..=header.chunk_end_number as usize] {
            let old = std::mem::replace(slot, new_chunk.clone());
            if !replaced.iter().any(|r| Arc::ptr_eq(r, &old)) {
                replaced.push(old);
            }
        }
        drop(chunks);

        for old in &replaced {
            old.mark_for_deletion();
        }

        tracing::info!(
            chunk_start = header.chunk_start_number,
            chunk_end = header.chunk_end_number,
            path = %new_path.display(),
            replaced = replaced.len(),
            "Switched chunk"
        );
        Ok(new_chunk)
    }

    /// Keeps the newest completed chunks cached and releases the rest.
    pub fn try_cache_chunks(&self) -> Result<()> {
        let mut cached = 0;
        for chunk in self.all_chunks()?.iter().rev() {
            if !chunk.is_completed() {
                continue;
            }
            if cached < self.max_cached_chunks {
                chunk.cache_in_memory()?;
                cached += 1;
            } else {
                chunk.uncache_from_memory()?;
            }
        }
        Ok(())
    }

    pub fn cached_chunks(&self) -> Result<usize> {
        Ok(self.all_chunks()?.iter().filter(|c| c.is_cached()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::chunk::PosMap;
    use crate::log::naming::VersionedPatternNaming;
    use crate::log::record::LogRecord;
    use crate::tmpfs::TempDir;

    fn manager(dir: &TempDir, max_cached: usize) -> Result<ChunkManager> {
        let config = LogConfig::default().chunk_size(1024).max_cached_chunks(max_cached);
        let naming = Arc::new(VersionedPatternNaming::new(dir.path(), "chunk-"));
        ChunkManager::new(&config, naming)
    }

    #[test]
    fn test_position_to_chunk_mapping() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = manager(&dir, 0)?;
        manager.add_new_chunk()?;
        manager.add_new_chunk()?;

        assert_eq!(manager.chunks_count()?, 2);
        let chunk = manager.get_chunk_for(1023)?.expect("chunk 0");
        assert_eq!(chunk.header().chunk_start_number, 0);
        let chunk = manager.get_chunk_for(1024)?.expect("chunk 1");
        assert_eq!(chunk.header().chunk_start_number, 1);
        assert!(manager.get_chunk_for(2048)?.is_none());
        assert!(manager.get_chunk_for(-1)?.is_none());
        Ok(())
    }

    #[test]
    fn test_add_chunk_out_of_order_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = manager(&dir, 0)?;
        let chunk = Chunk::create_new(dir.join("chunk-000003.000000"), ChunkHeader::new(1024, 3, 3, false))?;
        assert!(matches!(
            manager.add_chunk(Arc::new(chunk)),
            Err(Error::InvalidOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_switch_chunk_renames_and_retires_old() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = manager(&dir, 0)?;
        let original = manager.add_new_chunk()?;
        original.try_append(&LogRecord::new(0, b"dead".to_vec()))?;
        original.complete()?;
        manager.add_new_chunk()?;
        let original_path = original.path().to_path_buf();

        let temp = Chunk::create_new(
            manager.naming().temp_filename(),
            ChunkHeader::new(1024, 0, 0, true),
        )?;
        temp.complete_scavenged(PosMap::new(), original.logical_data_size())?;

        let switched = manager.switch_chunk(Arc::new(temp))?;
        assert_eq!(switched.path(), manager.naming().filename_for(0, 1).as_path());
        assert!(original.is_marked_for_deletion());
        assert!(original_path.exists(), "lease keeps the old file alive");

        drop(original);
        assert!(!original_path.exists());
        let current = manager.get_chunk(0)?.expect("switched chunk");
        assert!(current.is_scavenged());
        assert!(current.try_read_at(0)?.is_none());
        assert_eq!(manager.chunks_count()?, 2);
        Ok(())
    }

    #[test]
    fn test_switch_requires_completed_chunk() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = manager(&dir, 0)?;
        manager.add_new_chunk()?;
        let temp = Chunk::create_new(
            manager.naming().temp_filename(),
            ChunkHeader::new(1024, 0, 0, true),
        )?;
        assert!(matches!(
            manager.switch_chunk(Arc::new(temp)),
            Err(Error::InvalidOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_cache_policy_keeps_newest_completed() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = manager(&dir, 1)?;
        for _ in 0..3 {
            manager.add_new_chunk()?.complete()?;
        }
        manager.add_new_chunk()?;

        manager.try_cache_chunks()?;
        assert_eq!(manager.cached_chunks()?, 1);
        assert!(manager.get_chunk(2)?.expect("chunk 2").is_cached());
        assert!(!manager.get_chunk(0)?.expect("chunk 0").is_cached());
        assert!(!manager.get_chunk(3)?.expect("active chunk").is_cached());
        Ok(())
    }
}
