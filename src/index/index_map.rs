//! Leveled collection of index tables.
//!
//! ```text
//! level 0:  [t7] [t8]          <- flushed memtables, newest last
//! level 1:  [t5] [t6]          <- merges of full level 0
//! level 2:  [t4]
//! ```
//!
//! An `IndexMap` is never mutated in place. Every change returns a new map
//! plus the tables it replaced; the caller persists the new map, swaps it in
//! and only then marks the replaced tables for destruction, so readers
//! holding the old map keep working until they drop it.
//!
//! ## Map file
//!
//! ```text
//! <crc64 hex of the remainder>
//! <map version>
//! <prepare>/<commit>
//! <max auto merge level>
//! <level>,<position>,<filename>   one line per table
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use super::entry::{IndexEntry, PTableVersion};
use super::naming::TableNaming;
use super::ptable::{PTable, TableOptions};
use crate::error::{Error, Result};
use crate::hasher::Hasher;

pub const INDEX_MAP_VERSION: u32 = 1;

/// What a merge needs to write new tables.
#[derive(Clone, Copy)]
pub struct MergeContext<'a> {
    pub naming: &'a dyn TableNaming,
    pub version: PTableVersion,
    pub options: TableOptions,
}

/// A new map plus the tables it no longer references.
#[derive(Debug)]
pub struct MergeResult {
    pub merged_map: IndexMap,
    pub to_delete: Vec<Arc<PTable>>,
}

impl MergeResult {
    fn unchanged(map: &IndexMap) -> Self {
        Self {
            merged_map: map.clone(),
            to_delete: Vec::new(),
        }
    }

    pub fn has_merged(&self) -> bool {
        !self.to_delete.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IndexMap {
    prepare_checkpoint: i64,
    commit_checkpoint: i64,
    max_tables_per_level: usize,
    max_auto_merge_level: usize,
    /// Tables per level, oldest first.
    levels: Vec<Vec<Arc<PTable>>>,
}

fn corrupt_map(path: &Path, msg: impl std::fmt::Display) -> Error {
    Error::CorruptIndex(format!("index map {}: {}", path.display(), msg))
}

impl IndexMap {
    pub fn empty(max_tables_per_level: usize, max_auto_merge_level: usize) -> Self {
        Self {
            prepare_checkpoint: -1,
            commit_checkpoint: -1,
            max_tables_per_level,
            max_auto_merge_level,
            levels: Vec::new(),
        }
    }

    pub fn prepare_checkpoint(&self) -> i64 {
        self.prepare_checkpoint
    }

    pub fn commit_checkpoint(&self) -> i64 {
        self.commit_checkpoint
    }

    pub fn max_auto_merge_level(&self) -> usize {
        self.max_auto_merge_level
    }

    pub fn tables_per_level(&self) -> Vec<usize> {
        self.levels.iter().map(Vec::len).collect()
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Level 0 first; within a level, the newest table first.
    pub fn in_order(&self) -> Vec<Arc<PTable>> {
        self.levels
            .iter()
            .flat_map(|level| level.iter().rev().cloned())
            .collect()
    }

    fn is_full(&self, levels: &[Vec<Arc<PTable>>], level: usize) -> bool {
        level < self.max_auto_merge_level && levels[level].len() >= self.max_tables_per_level
    }

    /// Adds a flushed table at level 0 without triggering any merge.
    pub fn add_table_without_merge(&self, table: Arc<PTable>, prepare: i64, commit: i64) -> IndexMap {
        let mut map = self.clone();
        if map.levels.is_empty() {
            map.levels.push(Vec::new());
        }
        map.levels[0].push(table);
        map.prepare_checkpoint = prepare;
        map.commit_checkpoint = commit;
        map
    }

    /// Adds a flushed table at level 0, then merges every full level.
    ///
    /// A merge can fill the next level, so merges cascade upwards.
    pub fn add_table(
        &self,
        table: Arc<PTable>,
        prepare: i64,
        commit: i64,
        ctx: &MergeContext<'_>,
    ) -> Result<MergeResult> {
        let mut map = self.add_table_without_merge(table, prepare, commit);
        let mut to_delete = Vec::new();
        let mut level = 0;
        while level < map.levels.len() {
            if map.is_full(&map.levels, level) {
                merge_level(&mut map.levels, level, ctx, &mut to_delete)?;
            }
            level += 1;
        }
        Ok(MergeResult {
            merged_map: map,
            to_delete,
        })
    }

    /// Merges the lowest full level, if any.
    pub fn try_merge_one_level(&self, ctx: &MergeContext<'_>) -> Result<MergeResult> {
        let Some(level) = (0..self.levels.len()).find(|&l| self.is_full(&self.levels, l)) else {
            return Ok(MergeResult::unchanged(self));
        };
        let mut map = self.clone();
        let mut to_delete = Vec::new();
        merge_level(&mut map.levels, level, ctx, &mut to_delete)?;
        Ok(MergeResult {
            merged_map: map,
            to_delete,
        })
    }

    /// Merges every table at or above the auto-merge level into a single
    /// table one level above it.
    pub fn try_manual_merge(&self, ctx: &MergeContext<'_>) -> Result<MergeResult> {
        let base = self.max_auto_merge_level;
        if base >= self.levels.len() {
            return Ok(MergeResult::unchanged(self));
        }
        let tables: Vec<Arc<PTable>> = self.levels[base..]
            .iter()
            .flat_map(|level| level.iter().rev().cloned())
            .collect();
        if tables.len() < 2 {
            return Ok(MergeResult::unchanged(self));
        }

        tracing::info!(level = base, tables = tables.len(), "Starting manual index merge");
        let merged = PTable::merge(&tables, ctx.naming.next_table_path(), ctx.version, ctx.options)?;

        let mut map = self.clone();
        map.levels.truncate(base);
        map.levels.resize_with(base + 2, Vec::new);
        map.levels[base + 1].push(Arc::new(merged));
        Ok(MergeResult {
            merged_map: map,
            to_delete: tables,
        })
    }

    /// Replaces the table at `table_path` with a copy holding only the
    /// entries accepted by `should_keep`. Also returns the bytes saved.
    pub fn scavenge<F>(
        &self,
        table_path: &Path,
        should_keep: F,
        ctx: &MergeContext<'_>,
    ) -> Result<(MergeResult, i64)>
    where
        F: FnMut(&IndexEntry) -> bool,
    {
        let (level, index) = self
            .levels
            .iter()
            .enumerate()
            .find_map(|(l, tables)| {
                tables
                    .iter()
                    .position(|t| t.path() == table_path)
                    .map(|i| (l, i))
            })
            .ok_or_else(|| {
                Error::InvalidInput(format!("{} is not in the index map", table_path.display()))
            })?;

        let old = self.levels[level][index].clone();
        let (scavenged, saved) =
            PTable::scavenged(&old, ctx.naming.next_table_path(), should_keep, ctx.options)?;

        let mut map = self.clone();
        map.levels[level][index] = Arc::new(scavenged);
        Ok((
            MergeResult {
                merged_map: map,
                to_delete: vec![old],
            },
            saved,
        ))
    }

    /// Writes the map through a temp file that is fsynced and renamed into place.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let mut body = String::new();
        body.push_str(&format!("{}\n", INDEX_MAP_VERSION));
        body.push_str(&format!("{}/{}\n", self.prepare_checkpoint, self.commit_checkpoint));
        body.push_str(&format!("{}\n", self.max_auto_merge_level));
        for (level, tables) in self.levels.iter().enumerate() {
            for (position, table) in tables.iter().enumerate() {
                let name = table
                    .path()
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| {
                        Error::InvalidInput(format!("bad table path {}", table.path().display()))
                    })?;
                body.push_str(&format!("{},{},{}\n", level, position, name));
            }
        }

        let mut hasher = Hasher::new();
        hasher.write(body.as_bytes());
        let contents = format!("{:016x}\n{}", hasher.checksum(), body);

        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;

        tracing::debug!(
            path = %path.display(),
            tables = self.table_count(),
            prepare = self.prepare_checkpoint,
            commit = self.commit_checkpoint,
            "Saved index map"
        );
        Ok(())
    }

    /// Loads a map file, opening every table it references.
    ///
    /// A missing file yields an empty map. If the file was written with a
    /// different auto-merge level, full levels are merged before returning.
    pub fn from_file(
        path: &Path,
        max_tables_per_level: usize,
        max_auto_merge_level: usize,
        ctx: &MergeContext<'_>,
    ) -> Result<MergeResult> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No index map found, starting empty");
            return Ok(MergeResult::unchanged(&Self::empty(
                max_tables_per_level,
                max_auto_merge_level,
            )));
        }

        let contents = fs::read_to_string(path)?;
        let (checksum_line, body) = contents
            .split_once('\n')
            .ok_or_else(|| corrupt_map(path, "missing checksum"))?;
        let stored = u64::from_str_radix(checksum_line.trim(), 16)
            .map_err(|_| corrupt_map(path, format!("bad checksum line {:?}", checksum_line)))?;
        let mut hasher = Hasher::new();
        hasher.write(body.as_bytes());
        if hasher.checksum() != stored {
            return Err(corrupt_map(path, "checksum mismatch"));
        }

        let mut lines = body.lines();
        let mut next_line = |what: &str| {
            lines
                .next()
                .ok_or_else(|| corrupt_map(path, format!("missing {}", what)))
        };

        let version = next_line("version")?;
        if version.trim().parse::<u32>().ok() != Some(INDEX_MAP_VERSION) {
            return Err(corrupt_map(path, format!("unsupported version {:?}", version)));
        }

        let checkpoints = next_line("checkpoints")?;
        let (prepare, commit) = checkpoints
            .split_once('/')
            .and_then(|(p, c)| Some((p.trim().parse::<i64>().ok()?, c.trim().parse::<i64>().ok()?)))
            .filter(|&(p, c)| p >= -1 && c >= -1)
            .ok_or_else(|| corrupt_map(path, format!("bad checkpoints {:?}", checkpoints)))?;

        let stored_level = next_line("auto merge level")?;
        let stored_level = stored_level
            .trim()
            .parse::<usize>()
            .map_err(|_| corrupt_map(path, format!("bad auto merge level {:?}", stored_level)))?;

        let mut placed: BTreeMap<(usize, usize), Arc<PTable>> = BTreeMap::new();
        for line in lines.filter(|l| !l.trim().is_empty()) {
            let mut fields = line.splitn(3, ',');
            let (level, position, name) = match (fields.next(), fields.next(), fields.next()) {
                (Some(l), Some(p), Some(n)) => (l.parse::<usize>(), p.parse::<usize>(), n),
                _ => return Err(corrupt_map(path, format!("bad table line {:?}", line))),
            };
            let (Ok(level), Ok(position)) = (level, position) else {
                return Err(corrupt_map(path, format!("bad table line {:?}", line)));
            };
            if Path::new(name).file_name().and_then(|n| n.to_str()) != Some(name) {
                return Err(corrupt_map(path, format!("bad table name {:?}", name)));
            }

            let table_path = ctx.naming.dir().join(name);
            let table = PTable::open(&table_path, ctx.options).map_err(|e| {
                if e.is_corruption() {
                    e
                } else {
                    corrupt_map(path, format!("cannot open {}: {}", table_path.display(), e))
                }
            })?;
            if placed.insert((level, position), Arc::new(table)).is_some() {
                return Err(corrupt_map(path, format!("duplicate slot {},{}", level, position)));
            }
        }

        let mut levels: Vec<Vec<Arc<PTable>>> = Vec::new();
        for ((level, position), table) in placed {
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            if levels[level].len() != position {
                return Err(corrupt_map(
                    path,
                    format!("level {} is missing position {}", level, levels[level].len()),
                ));
            }
            levels[level].push(table);
        }

        let map = IndexMap {
            prepare_checkpoint: prepare,
            commit_checkpoint: commit,
            max_tables_per_level,
            max_auto_merge_level,
            levels,
        };
        tracing::info!(
            path = %path.display(),
            tables = map.table_count(),
            prepare,
            commit,
            "Loaded index map"
        );

        if stored_level == max_auto_merge_level {
            return Ok(MergeResult::unchanged(&map));
        }

        tracing::info!(
            stored = stored_level,
            configured = max_auto_merge_level,
            "Auto merge level changed, merging full levels"
        );
        let mut result = MergeResult::unchanged(&map);
        loop {
            let step = result.merged_map.try_merge_one_level(ctx)?;
            if !step.has_merged() {
                break;
            }
            result.to_delete.extend(step.to_delete);
            result.merged_map = step.merged_map;
        }
        Ok(result)
    }
}

/// Merges every table of `level` into one table at `level + 1`.
fn merge_level(
    levels: &mut Vec<Vec<Arc<PTable>>>,
    level: usize,
    ctx: &MergeContext<'_>,
    to_delete: &mut Vec<Arc<PTable>>,
) -> Result<()> {
    let tables: Vec<Arc<PTable>> = levels[level].iter().rev().cloned().collect();
    tracing::info!(level, tables = tables.len(), "Merging index level");

    let merged = PTable::merge(&tables, ctx.naming.next_table_path(), ctx.version, ctx.options)?;
    levels[level].clear();
    if levels.len() <= level + 1 {
        levels.push(Vec::new());
    }
    levels[level + 1].push(Arc::new(merged));
    to_delete.extend(tables);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memtable::MemTable;
    use crate::index::naming::SequentialTableNaming;
    use crate::tmpfs::TempDir;

    struct Fixture {
        naming: SequentialTableNaming,
        _dir: TempDir,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let dir = TempDir::new()?;
            Ok(Self {
                naming: SequentialTableNaming::open(dir.path())?,
                _dir: dir,
            })
        }

        fn ctx(&self) -> MergeContext<'_> {
            MergeContext {
                naming: &self.naming,
                version: PTableVersion::V4,
                options: TableOptions {
                    cache_depth: 4,
                    skip_verify: false,
                    initial_readers: 1,
                    max_readers: 2,
                },
            }
        }

        fn table(&self, entries: &[(u64, i64, i64)]) -> Result<Arc<PTable>> {
            let memtable = MemTable::new(64);
            for &(stream, version, position) in entries {
                memtable.add(stream, version, position);
            }
            let ctx = self.ctx();
            Ok(Arc::new(PTable::from_memtable(
                &memtable,
                self.naming.next_table_path(),
                ctx.version,
                ctx.options,
            )?))
        }

        fn map_path(&self) -> std::path::PathBuf {
            self.naming.dir().join("indexmap")
        }
    }

    fn all_entries(map: &IndexMap) -> Result<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        for table in map.in_order() {
            for entry in table.iter() {
                entries.push(entry?);
            }
        }
        entries.sort();
        Ok(entries)
    }

    #[test]
    fn test_merges_cascade() -> Result<()> {
        let f = Fixture::new()?;
        let ctx = f.ctx();
        let mut map = IndexMap::empty(2, usize::MAX);
        let mut deleted = 0;

        for i in 0..4i64 {
            let table = f.table(&[(1, i, i * 10), (2, 0, 5)])?;
            let result = map.add_table(table, i * 10, i * 10, &ctx)?;
            deleted += result.to_delete.len();
            map = result.merged_map;
        }

        assert_eq!(map.tables_per_level(), vec![0, 0, 1]);
        assert_eq!(deleted, 6);
        assert_eq!(map.prepare_checkpoint(), 30);
        assert_eq!(map.commit_checkpoint(), 30);

        let entries = all_entries(&map)?;
        assert_eq!(entries.len(), 8);
        assert_eq!(entries.iter().filter(|e| **e == IndexEntry::new(2, 0, 5)).count(), 4);
        let merged = &map.in_order()[0];
        assert_eq!(merged.try_get_latest_entry(1)?, Some(IndexEntry::new(1, 3, 30)));
        Ok(())
    }

    #[test]
    fn test_level_bounds_hold() -> Result<()> {
        let f = Fixture::new()?;
        let ctx = f.ctx();
        let mut map = IndexMap::empty(3, usize::MAX);
        for i in 0..20i64 {
            map = map.add_table(f.table(&[(7, i, i)])?, i, i, &ctx)?.merged_map;
            assert!(map.tables_per_level().iter().all(|&n| n < 3));
        }
        assert_eq!(all_entries(&map)?.len(), 20);
        Ok(())
    }

    #[test]
    fn test_in_order_lists_newest_first() -> Result<()> {
        let f = Fixture::new()?;
        let first = f.table(&[(1, 0, 0)])?;
        let second = f.table(&[(1, 1, 1)])?;
        let map = IndexMap::empty(4, usize::MAX)
            .add_table_without_merge(first.clone(), 0, 0)
            .add_table_without_merge(second.clone(), 1, 1);

        let order: Vec<_> = map.in_order().iter().map(|t| t.path().to_path_buf()).collect();
        assert_eq!(order, vec![second.path().to_path_buf(), first.path().to_path_buf()]);
        Ok(())
    }

    #[test]
    fn test_manual_merge_above_auto_level() -> Result<()> {
        let f = Fixture::new()?;
        let ctx = f.ctx();
        let mut map = IndexMap::empty(2, 1);
        for i in 0..6i64 {
            map = map.add_table(f.table(&[(3, i, i)])?, i, i, &ctx)?.merged_map;
        }
        assert_eq!(map.tables_per_level(), vec![0, 3]);
        assert!(!map.try_merge_one_level(&ctx)?.has_merged());

        let result = map.try_manual_merge(&ctx)?;
        assert_eq!(result.to_delete.len(), 3);
        let map = result.merged_map;
        assert_eq!(map.tables_per_level(), vec![0, 0, 1]);
        assert_eq!(all_entries(&map)?.len(), 6);

        assert!(!map.try_manual_merge(&ctx)?.has_merged());
        Ok(())
    }

    #[test]
    fn test_scavenge_replaces_table() -> Result<()> {
        let f = Fixture::new()?;
        let ctx = f.ctx();
        let table = f.table(&[(1, 0, 10), (1, 1, 20), (2, 0, 30)])?;
        let map = IndexMap::empty(4, usize::MAX).add_table_without_merge(table.clone(), 30, 30);

        let (result, saved) = map.scavenge(table.path(), |e| e.stream == 1, &ctx)?;
        assert!(saved > 0);
        assert_eq!(result.to_delete.len(), 1);
        let scavenged = &result.merged_map.in_order()[0];
        assert_eq!(scavenged.count(), 2);
        assert_eq!(scavenged.try_get_latest_entry(2)?, None);

        let missing = map.scavenge(&f.naming.dir().join("table-99999999"), |_| true, &ctx);
        assert!(matches!(missing, Err(Error::InvalidInput(_))));
        Ok(())
    }

    #[test]
    fn test_save_and_reload() -> Result<()> {
        let f = Fixture::new()?;
        let ctx = f.ctx();
        let mut map = IndexMap::empty(2, usize::MAX);
        for i in 0..3i64 {
            map = map.add_table(f.table(&[(5, i, i * 100)])?, i * 100, i * 100 - 1, &ctx)?.merged_map;
        }
        map.save_to_file(&f.map_path())?;

        let loaded = IndexMap::from_file(&f.map_path(), 2, usize::MAX, &ctx)?;
        assert!(!loaded.has_merged());
        let loaded = loaded.merged_map;
        assert_eq!(loaded.tables_per_level(), map.tables_per_level());
        assert_eq!(loaded.prepare_checkpoint(), 200);
        assert_eq!(loaded.commit_checkpoint(), 199);
        assert_eq!(all_entries(&loaded)?, all_entries(&map)?);
        Ok(())
    }

    #[test]
    fn test_missing_map_is_empty() -> Result<()> {
        let f = Fixture::new()?;
        let map = IndexMap::from_file(&f.map_path(), 4, usize::MAX, &f.ctx())?.merged_map;
        assert_eq!(map.table_count(), 0);
        assert_eq!(map.prepare_checkpoint(), -1);
        assert_eq!(map.commit_checkpoint(), -1);
        Ok(())
    }

    #[test]
    fn test_corrupt_map_rejected() -> Result<()> {
        let f = Fixture::new()?;
        let ctx = f.ctx();
        let table = f.table(&[(1, 0, 0)])?;
        IndexMap::empty(4, usize::MAX)
            .add_table_without_merge(table.clone(), 0, 0)
            .save_to_file(&f.map_path())?;

        let original = fs::read_to_string(f.map_path())?;
        fs::write(f.map_path(), original.replace("0/0", "0/9"))?;
        assert!(matches!(
            IndexMap::from_file(&f.map_path(), 4, usize::MAX, &ctx),
            Err(Error::CorruptIndex(_))
        ));

        fs::write(f.map_path(), &original)?;
        table.mark_for_destruction();
        drop(table);
        assert!(matches!(
            IndexMap::from_file(&f.map_path(), 4, usize::MAX, &ctx),
            Err(Error::CorruptIndex(_))
        ));
        Ok(())
    }

    #[test]
    fn test_reload_with_new_auto_level_merges() -> Result<()> {
        let f = Fixture::new()?;
        let ctx = f.ctx();
        IndexMap::empty(2, 0)
            .add_table_without_merge(f.table(&[(1, 0, 0)])?, 0, 0)
            .add_table_without_merge(f.table(&[(1, 1, 1)])?, 1, 1)
            .save_to_file(&f.map_path())?;

        let result = IndexMap::from_file(&f.map_path(), 2, usize::MAX, &ctx)?;
        assert_eq!(result.to_delete.len(), 2);
        assert_eq!(result.merged_map.tables_per_level(), vec![0, 1]);
        assert_eq!(result.merged_map.max_auto_merge_level(), usize::MAX);
        Ok(())
    }
}
