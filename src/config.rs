use std::path::PathBuf;
use std::time::Duration;

use crate::index::PTableVersion;

/// Configuration for the whole store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Transaction log settings
    pub log: LogConfig,

    /// Stream index settings
    pub index: IndexConfig,

    /// Background task intervals
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Data capacity of a single chunk file, excluding header and footer (default: 256MB)
    pub chunk_size: usize,

    /// Number of most recent completed chunks kept in memory (default: 2)
    pub max_cached_chunks: usize,

    /// Verify footer checksums when opening completed chunks (default: true)
    pub verify_checksums: bool,
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Entries held by a memtable before it is swapped out for flushing (default: 1M)
    pub max_memtable_entries: usize,

    /// Tables a level may hold before it is merged into the next (default: 4)
    pub max_tables_per_level: usize,

    /// Levels at or above this one are only merged manually (default: unbounded)
    pub max_auto_merge_level: usize,

    /// Depth of the midpoint cache, 2^depth samples at most (default: 16)
    pub index_cache_depth: u32,

    /// Format written for new tables (default: V4)
    pub table_version: PTableVersion,

    /// Reader handles opened eagerly per table (default: 5)
    pub initial_reader_count: usize,

    /// Hard cap on reader handles per table (default: 64)
    pub max_reader_count: usize,

    /// Skip checksum verification when opening tables (default: false)
    pub skip_verify: bool,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often pending memtables are flushed to tables (default: 1s)
    pub index_flush_interval: Duration,

    /// How often the writer checkpoint is flushed (default: 100ms)
    pub checkpoint_flush_interval: Duration,

    /// How often metrics are logged (default: 30s)
    pub metrics_interval: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024 * 1024, // 256MB
            max_cached_chunks: 2,
            verify_checksums: true,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_memtable_entries: 1_000_000,
            max_tables_per_level: 4,
            max_auto_merge_level: usize::MAX,
            index_cache_depth: 16,
            table_version: PTableVersion::V4,
            initial_reader_count: 5,
            max_reader_count: 64,
            skip_verify: false,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            index_flush_interval: Duration::from_secs(1),
            checkpoint_flush_interval: Duration::from_millis(100),
            metrics_interval: Duration::from_secs(30),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./chunkdb"),
            log: LogConfig::default(),
            index: IndexConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Directory holding index tables and the index map
    pub fn index_dir(&self) -> PathBuf {
        self.dir.join("index")
    }

    /// Configure log settings
    pub fn log(mut self, config: LogConfig) -> Self {
        self.log = config;
        self
    }

    /// Configure index settings
    pub fn index(mut self, config: IndexConfig) -> Self {
        self.index = config;
        self
    }

    /// Configure background task intervals
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

impl LogConfig {
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn max_cached_chunks(mut self, count: usize) -> Self {
        self.max_cached_chunks = count;
        self
    }

    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }
}

impl IndexConfig {
    pub fn max_memtable_entries(mut self, entries: usize) -> Self {
        self.max_memtable_entries = entries;
        self
    }

    pub fn max_tables_per_level(mut self, max_tables: usize) -> Self {
        self.max_tables_per_level = max_tables;
        self
    }

    pub fn max_auto_merge_level(mut self, level: usize) -> Self {
        self.max_auto_merge_level = level;
        self
    }

    pub fn index_cache_depth(mut self, depth: u32) -> Self {
        self.index_cache_depth = depth;
        self
    }

    pub fn table_version(mut self, version: PTableVersion) -> Self {
        self.table_version = version;
        self
    }

    /// Set initial and maximum reader handles per table
    pub fn reader_count(mut self, initial: usize, max: usize) -> Self {
        self.initial_reader_count = initial;
        self.max_reader_count = max;
        self
    }

    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.skip_verify = skip;
        self
    }
}

impl SchedulerConfig {
    pub fn index_flush_interval(mut self, interval: Duration) -> Self {
        self.index_flush_interval = interval;
        self
    }

    pub fn checkpoint_flush_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_flush_interval = interval;
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.dir, PathBuf::from("./chunkdb"));
        assert_eq!(config.log.chunk_size, 256 * 1024 * 1024);
        assert_eq!(config.log.max_cached_chunks, 2);
        assert!(config.log.verify_checksums);

        assert_eq!(config.index.max_memtable_entries, 1_000_000);
        assert_eq!(config.index.max_tables_per_level, 4);
        assert_eq!(config.index.max_auto_merge_level, usize::MAX);
        assert_eq!(config.index.index_cache_depth, 16);
        assert_eq!(config.index.table_version, PTableVersion::V4);
        assert!(config.index.initial_reader_count <= config.index.max_reader_count);
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new("/tmp/test")
            .log(LogConfig::default().chunk_size(4096).max_cached_chunks(0))
            .index(
                IndexConfig::default()
                    .max_memtable_entries(10)
                    .max_tables_per_level(2)
                    .max_auto_merge_level(3)
                    .index_cache_depth(4)
                    .table_version(PTableVersion::V3)
                    .reader_count(1, 2),
            )
            .scheduler(
                SchedulerConfig::default()
                    .index_flush_interval(Duration::from_millis(50))
                    .metrics_interval(Duration::from_secs(5)),
            );

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.index_dir(), PathBuf::from("/tmp/test/index"));
        assert_eq!(config.log.chunk_size, 4096);
        assert_eq!(config.log.max_cached_chunks, 0);

        assert_eq!(config.index.max_memtable_entries, 10);
        assert_eq!(config.index.max_tables_per_level, 2);
        assert_eq!(config.index.max_auto_merge_level, 3);
        assert_eq!(config.index.index_cache_depth, 4);
        assert_eq!(config.index.table_version, PTableVersion::V3);
        assert_eq!(config.index.initial_reader_count, 1);
        assert_eq!(config.index.max_reader_count, 2);

        assert_eq!(config.scheduler.index_flush_interval, Duration::from_millis(50));
        assert_eq!(config.scheduler.metrics_interval, Duration::from_secs(5));
    }
}
