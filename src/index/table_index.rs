use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::entry::IndexEntry;
use super::index_map::{IndexMap, MergeContext, MergeResult};
use super::memtable::MemTable;
use super::naming::{SequentialTableNaming, TableNaming};
use super::ptable::{format::MAX_CACHE_DEPTH, PTable, TableOptions};
use crate::config::IndexConfig;
use crate::error::{Error, Result};

pub const INDEX_MAP_FILENAME: &str = "indexmap";

/// Point-in-time sizes of the index, for metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub current_memtable_entries: usize,
    pub awaiting_memtables: usize,
    pub tables_per_level: Vec<usize>,
    pub prepare_checkpoint: i64,
    pub commit_checkpoint: i64,
}

/// Stream index: memtables in front of a leveled set of tables.
///
/// Writers insert into the current memtable. A full memtable is queued for
/// flushing and replaced, so writers never wait on disk. Lookups consult
/// the current memtable, the queued ones (newest first), then the tables.
pub struct TableIndex {
    dir: PathBuf,
    map_path: PathBuf,
    config: IndexConfig,
    naming: SequentialTableNaming,

    current: RwLock<Arc<MemTable>>,
    awaiting: RwLock<VecDeque<Arc<MemTable>>>,
    map: RwLock<Arc<IndexMap>>,

    // Serializes map replacement between flushes, merges and scavenges.
    map_update: Mutex<()>,
    flush_running: AtomicBool,
}

/// Clears the flush flag when dropped.
struct FlushGuard<'a> {
    index: &'a TableIndex,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.index.flush_running.store(false, Ordering::SeqCst);
    }
}

impl TableIndex {
    pub fn open(dir: impl Into<PathBuf>, config: &IndexConfig) -> Result<Self> {
        let dir = dir.into();
        if config.max_tables_per_level < 2 {
            return Err(Error::InvalidInput(format!(
                "max_tables_per_level must be at least 2, got {}",
                config.max_tables_per_level
            )));
        }
        if config.index_cache_depth > MAX_CACHE_DEPTH {
            return Err(Error::InvalidInput(format!(
                "index_cache_depth must be at most {}, got {}",
                MAX_CACHE_DEPTH, config.index_cache_depth
            )));
        }
        if config.max_memtable_entries == 0 {
            return Err(Error::InvalidInput("max_memtable_entries must be positive".into()));
        }
        fs::create_dir_all(&dir)?;

        let naming = SequentialTableNaming::open(&dir)?;
        let map_path = dir.join(INDEX_MAP_FILENAME);
        let ctx = MergeContext {
            naming: &naming,
            version: config.table_version,
            options: TableOptions::from(config),
        };
        let loaded = IndexMap::from_file(
            &map_path,
            config.max_tables_per_level,
            config.max_auto_merge_level,
            &ctx,
        )?;
        if loaded.has_merged() {
            loaded.merged_map.save_to_file(&map_path)?;
        }
        let MergeResult {
            merged_map: map,
            to_delete,
        } = loaded;
        for table in to_delete {
            table.mark_for_destruction();
        }

        remove_orphans(&dir, &naming, &map)?;

        let memtable = MemTable::new(config.max_memtable_entries);
        memtable.note_checkpoints(map.prepare_checkpoint(), map.commit_checkpoint());

        tracing::info!(
            dir = %dir.display(),
            tables = map.table_count(),
            prepare = map.prepare_checkpoint(),
            commit = map.commit_checkpoint(),
            "Opened table index"
        );

        Ok(Self {
            dir,
            map_path,
            config: config.clone(),
            naming,
            current: RwLock::new(Arc::new(memtable)),
            awaiting: RwLock::new(VecDeque::new()),
            map: RwLock::new(Arc::new(map)),
            map_update: Mutex::new(()),
            flush_running: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ctx(&self) -> MergeContext<'_> {
        MergeContext {
            naming: &self.naming,
            version: self.config.table_version,
            options: TableOptions::from(&self.config),
        }
    }

    /// Current map snapshot.
    pub fn map(&self) -> Result<Arc<IndexMap>> {
        Ok(self.map.read()?.clone())
    }

    pub fn add(&self, commit_position: i64, stream: u64, version: i64, position: i64) -> Result<()> {
        // The read guard stays held across the insert so a swap cannot queue
        // the memtable for flushing while the entry is still being added.
        let full = {
            let memtable = self.current.read()?;
            memtable.add(stream, version, position);
            memtable.note_checkpoints(position, commit_position);
            memtable.is_full()
        };
        if full {
            self.swap_current(false)?;
        }
        Ok(())
    }

    pub fn add_entries(&self, commit_position: i64, entries: &[IndexEntry]) -> Result<()> {
        let Some(prepare) = entries.iter().map(|e| e.position).max() else {
            return Ok(());
        };
        let full = {
            let memtable = self.current.read()?;
            memtable.add_entries(entries);
            memtable.note_checkpoints(prepare, commit_position);
            memtable.is_full()
        };
        if full {
            self.swap_current(false)?;
        }
        Ok(())
    }

    /// Queues the current memtable for flushing and starts a new one.
    ///
    /// Without `force`, only a full memtable is swapped.
    fn swap_current(&self, force: bool) -> Result<bool> {
        let mut current = self.current.write()?;
        if current.is_empty() || !(force || current.is_full()) {
            return Ok(false);
        }
        let next = MemTable::new(self.config.max_memtable_entries);
        next.note_checkpoints(current.prepare_checkpoint(), current.commit_checkpoint());
        let full = std::mem::replace(&mut *current, Arc::new(next));
        let mut awaiting = self.awaiting.write()?;
        awaiting.push_back(full);
        tracing::debug!(awaiting = awaiting.len(), "Queued memtable for flush");
        Ok(true)
    }

    fn try_start_flush(&self) -> Option<FlushGuard<'_>> {
        if self.flush_running.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(FlushGuard { index: self })
        }
    }

    pub fn awaiting_count(&self) -> Result<usize> {
        Ok(self.awaiting.read()?.len())
    }

    /// Writes every queued memtable to a table, oldest first.
    ///
    /// Returns the number of memtables flushed, or 0 if another flush is
    /// already running.
    pub fn flush_pending(&self) -> Result<usize> {
        let Some(_guard) = self.try_start_flush() else {
            return Ok(0);
        };

        let mut flushed = 0;
        loop {
            let next = self.awaiting.read()?.front().cloned();
            let Some(memtable) = next else {
                break;
            };

            let ctx = self.ctx();
            let table = PTable::from_memtable(
                &memtable,
                self.naming.next_table_path(),
                ctx.version,
                ctx.options,
            )?;

            {
                let _update = self.map_update.lock()?;
                let map = self.map()?;
                let result = map.add_table(
                    Arc::new(table),
                    memtable.prepare_checkpoint().max(map.prepare_checkpoint()),
                    memtable.commit_checkpoint().max(map.commit_checkpoint()),
                    &ctx,
                )?;
                self.install(result)?;
            }

            self.awaiting.write()?.pop_front();
            flushed += 1;
        }

        if flushed > 0 {
            tracing::info!(memtables = flushed, "Flushed memtables to index tables");
        }
        Ok(flushed)
    }

    /// Queues the current memtable even if it is not full, then flushes.
    pub fn flush_all(&self) -> Result<usize> {
        self.swap_current(true)?;
        self.flush_pending()
    }

    /// Persists, swaps in and retires. Caller holds `map_update`.
    fn install(&self, result: MergeResult) -> Result<()> {
        result.merged_map.save_to_file(&self.map_path)?;
        *self.map.write()? = Arc::new(result.merged_map);
        for table in &result.to_delete {
            table.mark_for_destruction();
        }
        Ok(())
    }

    /// Merges every table at or above the auto-merge level into one.
    pub fn merge_indexes(&self) -> Result<bool> {
        let _update = self.map_update.lock()?;
        let result = self.map()?.try_manual_merge(&self.ctx())?;
        if !result.has_merged() {
            return Ok(false);
        }
        self.install(result)?;
        Ok(true)
    }

    /// Rewrites every table without the entries rejected by `should_keep`.
    ///
    /// Returns the bytes saved.
    pub fn scavenge<F>(&self, mut should_keep: F) -> Result<i64>
    where
        F: FnMut(&IndexEntry) -> bool,
    {
        let _update = self.map_update.lock()?;
        let ctx = self.ctx();
        let mut saved = 0;
        for table in self.map()?.in_order() {
            let (result, bytes) = self.map()?.scavenge(table.path(), &mut should_keep, &ctx)?;
            self.install(result)?;
            saved += bytes;
        }
        tracing::info!(saved_bytes = saved, "Scavenged index tables");
        Ok(saved)
    }

    /// Highest log position reflected by any memtable or table.
    pub fn prepare_checkpoint(&self) -> Result<i64> {
        let current = self.current.read()?.prepare_checkpoint();
        Ok(current.max(self.map()?.prepare_checkpoint()))
    }

    pub fn commit_checkpoint(&self) -> Result<i64> {
        let current = self.current.read()?.commit_checkpoint();
        Ok(current.max(self.map()?.commit_checkpoint()))
    }

    /// Current memtable, then queued memtables newest first.
    fn memtables(&self) -> Result<Vec<Arc<MemTable>>> {
        let current = self.current.read()?;
        let awaiting = self.awaiting.read()?;
        let mut memtables = Vec::with_capacity(awaiting.len() + 1);
        memtables.push(current.clone());
        memtables.extend(awaiting.iter().rev().cloned());
        Ok(memtables)
    }

    pub fn try_get_one_value(&self, hash: u64, version: i64) -> Result<Option<i64>> {
        for memtable in self.memtables()? {
            if let Some(position) = memtable.try_get_one_value(hash, version) {
                return Ok(Some(position));
            }
        }
        for table in self.map()?.in_order() {
            if let Some(position) = table.try_get_one_value(hash, version)? {
                return Ok(Some(position));
            }
        }
        Ok(None)
    }

    /// Like `try_get_one_value`, skipping entries `accept` rejects.
    ///
    /// Used to filter out streams whose hash collides with the wanted one.
    pub fn try_get_one_value_where<F>(&self, hash: u64, version: i64, mut accept: F) -> Result<Option<i64>>
    where
        F: FnMut(&IndexEntry) -> Result<bool>,
    {
        for memtable in self.memtables()? {
            for entry in memtable.get_range(hash, version, version, None) {
                if accept(&entry)? {
                    return Ok(Some(entry.position));
                }
            }
        }
        for table in self.map()?.in_order() {
            for entry in table.get_range(hash, version, version, None)? {
                if accept(&entry)? {
                    return Ok(Some(entry.position));
                }
            }
        }
        Ok(None)
    }

    pub fn try_get_latest_entry(&self, hash: u64) -> Result<Option<IndexEntry>> {
        let mut found: Vec<IndexEntry> = Vec::new();
        for memtable in self.memtables()? {
            found.extend(memtable.try_get_latest_entry(hash));
        }
        for table in self.map()?.in_order() {
            found.extend(table.try_get_latest_entry(hash)?);
        }
        Ok(found.into_iter().max_by_key(|e| (e.version, e.position)))
    }

    pub fn try_get_latest_entry_where<F>(&self, hash: u64, accept: F) -> Result<Option<IndexEntry>>
    where
        F: FnMut(&IndexEntry) -> Result<bool>,
    {
        Ok(self
            .get_range_where(hash, i64::MIN, i64::MAX, Some(1), accept)?
            .into_iter()
            .next())
    }

    pub fn try_get_oldest_entry(&self, hash: u64) -> Result<Option<IndexEntry>> {
        let mut found: Vec<IndexEntry> = Vec::new();
        for memtable in self.memtables()? {
            found.extend(memtable.try_get_oldest_entry(hash));
        }
        for table in self.map()?.in_order() {
            found.extend(table.try_get_oldest_entry(hash)?);
        }
        Ok(found.into_iter().min_by_key(|e| (e.version, e.position)))
    }

    pub fn try_get_oldest_entry_where<F>(&self, hash: u64, accept: F) -> Result<Option<IndexEntry>>
    where
        F: FnMut(&IndexEntry) -> Result<bool>,
    {
        Ok(self
            .get_range_where(hash, i64::MIN, i64::MAX, None, accept)?
            .pop())
    }

    /// Entries of the stream with versions in `from..=to`, newest first.
    pub fn get_range(&self, hash: u64, from: i64, to: i64, limit: Option<usize>) -> Result<Vec<IndexEntry>> {
        self.get_range_where(hash, from, to, limit, |_| Ok(true))
    }

    pub fn get_range_where<F>(
        &self,
        hash: u64,
        from: i64,
        to: i64,
        limit: Option<usize>,
        mut accept: F,
    ) -> Result<Vec<IndexEntry>>
    where
        F: FnMut(&IndexEntry) -> Result<bool>,
    {
        let mut entries = Vec::new();
        for memtable in self.memtables()? {
            entries.extend(memtable.get_range(hash, from, to, None));
        }
        for table in self.map()?.in_order() {
            entries.extend(table.get_range(hash, from, to, None)?);
        }

        // Narrow tables report a truncated stream key, so order by version alone.
        entries.sort_by(|a, b| (b.version, b.position).cmp(&(a.version, a.position)));
        entries.dedup_by_key(|e| (e.version, e.position));

        let limit = limit.unwrap_or(usize::MAX);
        let mut result = Vec::new();
        for entry in entries {
            if result.len() >= limit {
                break;
            }
            if accept(&entry)? {
                result.push(entry);
            }
        }
        Ok(result)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let map = self.map()?;
        Ok(IndexStats {
            current_memtable_entries: self.current.read()?.len(),
            awaiting_memtables: self.awaiting_count()?,
            tables_per_level: map.tables_per_level(),
            prepare_checkpoint: self.prepare_checkpoint()?,
            commit_checkpoint: self.commit_checkpoint()?,
        })
    }

    /// Flushes everything to disk, or with `remove_files` deletes the index.
    pub fn close(&self, remove_files: bool) -> Result<()> {
        if !remove_files {
            self.flush_all()?;
            tracing::info!(dir = %self.dir.display(), "Closed table index");
            return Ok(());
        }

        let _update = self.map_update.lock()?;
        for table in self.map()?.in_order() {
            table.mark_for_destruction();
        }
        if self.map_path.exists() {
            fs::remove_file(&self.map_path)?;
        }
        *self.map.write()? = Arc::new(IndexMap::empty(
            self.config.max_tables_per_level,
            self.config.max_auto_merge_level,
        ));
        tracing::info!(dir = %self.dir.display(), "Closed table index and removed its files");
        Ok(())
    }
}

/// Removes table files the map does not reference, left by an interrupted flush or merge.
fn remove_orphans(dir: &Path, naming: &dyn TableNaming, map: &IndexMap) -> Result<()> {
    let live: Vec<PathBuf> = map.in_order().iter().map(|t| t.path().to_path_buf()).collect();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let stale_map = path.extension().map_or(false, |ext| ext == "tmp");
        if !(stale_map || (naming.is_table(&path) && !live.contains(&path))) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => tracing::info!(path = %path.display(), "Removed unreferenced index file"),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove unreferenced index file")
            }
        }
    }
    Ok(())
}
