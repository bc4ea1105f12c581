use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use super::format;
use super::{PTable, TableOptions};
use crate::error::{Error, Result};
use crate::hasher::Hasher;
use crate::index::entry::{IndexEntry, PTableVersion};
use crate::index::memtable::MemTable;
use crate::index::merge::{EntryIterator, MergeIterator};

/// Streams entries in table order into a new table file.
///
/// The partially written file is removed on failure.
pub(crate) fn write_table<I>(path: &Path, version: PTableVersion, entries: I, depth: u32) -> Result<u64>
where
    I: IntoIterator<Item = Result<IndexEntry>>,
{
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    match write_contents(file, version, entries, depth) {
        Ok(count) => Ok(count),
        Err(e) => {
            let _ = fs::remove_file(path);
            Err(e)
        }
    }
}

fn write_contents<I>(file: File, version: PTableVersion, entries: I, depth: u32) -> Result<u64>
where
    I: IntoIterator<Item = Result<IndexEntry>>,
{
    let mut hasher = Hasher::new();
    let mut writer = BufWriter::new(file);

    let header = format::encode_header(version);
    writer.write_all(&header)?;
    hasher.write(&header);

    let mut buf = vec![0u8; version.entry_size()];
    let mut count = 0u64;
    let mut prev: Option<IndexEntry> = None;
    for entry in entries {
        let entry = entry?;
        if prev.map_or(false, |prev| entry < prev) {
            return Err(Error::InvalidInput(format!(
                "entry {:?} written out of table order",
                entry
            )));
        }
        version.encode_entry(&entry, &mut buf)?;
        writer.write_all(&buf)?;
        hasher.write(&buf);
        prev = Some(entry);
        count += 1;
    }

    if version.has_midpoints() {
        writer.flush()?;
        let n = format::midpoint_count(count, depth);
        let midpoints = PTable::sample_midpoints(writer.get_ref(), version, count, n)?;
        for midpoint in &midpoints {
            let bytes = midpoint.encode();
            writer.write_all(&bytes)?;
            hasher.write(&bytes);
        }
        let footer = format::encode_footer(version, n as u32);
        writer.write_all(&footer)?;
        hasher.write(&footer);
    }

    writer.write_all(&hasher.checksum().to_le_bytes())?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(count)
}

impl PTable {
    /// Persists a memtable as a new table at `path`.
    pub fn from_memtable(
        memtable: &MemTable,
        path: impl AsRef<Path>,
        version: PTableVersion,
        options: TableOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let start = Instant::now();

        let count = if version == PTableVersion::V1 {
            // Narrowing the hash can reorder entries of colliding streams.
            let mut entries: Vec<IndexEntry> = memtable
                .iter()
                .map(|e| version.convert_from(PTableVersion::V4, e))
                .collect();
            entries.sort();
            write_table(path, version, entries.into_iter().map(Ok), options.cache_depth)?
        } else {
            write_table(path, version, memtable.iter().map(Ok), options.cache_depth)?
        };

        tracing::info!(
            path = %path.display(),
            entries = count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Wrote table from memtable"
        );
        Self::open(path, options)
    }

    /// Merges `tables` (newest first) into one table at `path`.
    ///
    /// The output uses `version` unless one of the inputs is V1, in which
    /// case every entry is narrowed to V1 keys.
    pub fn merge(
        tables: &[Arc<PTable>],
        path: impl AsRef<Path>,
        version: PTableVersion,
        options: TableOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let start = Instant::now();
        let output = if tables.iter().any(|t| t.version() == PTableVersion::V1) {
            PTableVersion::V1
        } else {
            version
        };

        let count = if output == PTableVersion::V1
            && tables.iter().any(|t| t.version() != PTableVersion::V1)
        {
            let mut entries = Vec::new();
            for table in tables {
                for entry in table.iter() {
                    entries.push(output.convert_from(table.version(), entry?));
                }
            }
            entries.sort();
            write_table(path, output, entries.into_iter().map(Ok), options.cache_depth)?
        } else {
            let sources: Vec<EntryIterator<'_>> = tables
                .iter()
                .map(|t| Box::new(t.iter()) as EntryIterator<'_>)
                .collect();
            write_table(path, output, MergeIterator::new(sources), options.cache_depth)?
        };

        tracing::info!(
            path = %path.display(),
            inputs = tables.len(),
            entries = count,
            version = ?output,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Merged tables"
        );
        Self::open(path, options)
    }

    /// Writes the entries of `table` accepted by `should_keep` to a new table.
    ///
    /// Returns the new table and the number of bytes saved.
    pub fn scavenged<F>(
        table: &PTable,
        path: impl AsRef<Path>,
        mut should_keep: F,
        options: TableOptions,
    ) -> Result<(Self, i64)>
    where
        F: FnMut(&IndexEntry) -> bool,
    {
        let path = path.as_ref();
        let kept = table.iter().filter(|entry| match entry {
            Ok(entry) => should_keep(entry),
            Err(_) => true,
        });
        let count = write_table(path, table.version(), kept, options.cache_depth)?;

        let scavenged = Self::open(path, options)?;
        let saved = table.file_size() as i64 - scavenged.file_size() as i64;
        tracing::info!(
            source = %table.path().display(),
            path = %path.display(),
            kept = count,
            dropped = table.count() - count,
            saved_bytes = saved,
            "Scavenged table"
        );
        Ok((scavenged, saved))
    }
}
