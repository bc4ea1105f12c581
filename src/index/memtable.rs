use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_skiplist::SkipSet;

use super::entry::IndexEntry;

/// In-memory index entries, kept in table order.
///
/// Readers and the single writer share the table without locking. An
/// identical `(stream, version, position)` triple is stored once.
#[derive(Debug)]
pub struct MemTable {
    entries: SkipSet<IndexEntry>,
    capacity: usize,
    prepare_checkpoint: AtomicI64,
    commit_checkpoint: AtomicI64,
}

impl MemTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: SkipSet::new(),
            capacity,
            prepare_checkpoint: AtomicI64::new(-1),
            commit_checkpoint: AtomicI64::new(-1),
        }
    }

    pub fn add(&self, stream: u64, version: i64, position: i64) {
        self.entries.insert(IndexEntry::new(stream, version, position));
    }

    pub fn add_entries(&self, entries: &[IndexEntry]) {
        for entry in entries {
            self.entries.insert(*entry);
        }
    }

    /// Records log positions covered by this table; only ever moves forward.
    pub fn note_checkpoints(&self, prepare: i64, commit: i64) {
        self.prepare_checkpoint.fetch_max(prepare, Ordering::AcqRel);
        self.commit_checkpoint.fetch_max(commit, Ordering::AcqRel);
    }

    pub fn prepare_checkpoint(&self) -> i64 {
        self.prepare_checkpoint.load(Ordering::Acquire)
    }

    pub fn commit_checkpoint(&self) -> i64 {
        self.commit_checkpoint.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    fn stream_range(&self, stream: u64, from: i64, to: i64) -> impl Iterator<Item = IndexEntry> + '_ {
        let newest = IndexEntry::new(stream, to, i64::MAX);
        let oldest = IndexEntry::new(stream, from, i64::MIN);
        self.entries.range(newest..=oldest).map(|e| *e.value())
    }

    pub fn try_get_one_value(&self, stream: u64, version: i64) -> Option<i64> {
        self.stream_range(stream, version, version)
            .next()
            .map(|e| e.position)
    }

    pub fn try_get_latest_entry(&self, stream: u64) -> Option<IndexEntry> {
        self.stream_range(stream, i64::MIN, i64::MAX).next()
    }

    pub fn try_get_oldest_entry(&self, stream: u64) -> Option<IndexEntry> {
        self.stream_range(stream, i64::MIN, i64::MAX).last()
    }

    /// Entries of `stream` with versions in `from..=to`, newest first.
    pub fn get_range(&self, stream: u64, from: i64, to: i64, limit: Option<usize>) -> Vec<IndexEntry> {
        if from > to {
            return Vec::new();
        }
        self.stream_range(stream, from, to)
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// Every entry in table order.
    pub fn iter(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        self.entries.iter().map(|e| *e.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_duplicate_triples_collapse() {
        let table = MemTable::new(10);
        table.add(1, 0, 100);
        table.add(1, 0, 100);
        table.add(1, 0, 200);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get_range(1, 0, 0, None).len(), 2);
    }

    #[test]
    fn test_lookups() {
        let table = MemTable::new(100);
        for version in 0..5 {
            table.add(7, version, version * 10);
            table.add(8, version, 1000 + version);
        }

        assert_eq!(table.try_get_one_value(7, 3), Some(30));
        assert_eq!(table.try_get_one_value(7, 9), None);
        assert_eq!(table.try_get_latest_entry(7), Some(IndexEntry::new(7, 4, 40)));
        assert_eq!(table.try_get_oldest_entry(8), Some(IndexEntry::new(8, 0, 1000)));
        assert_eq!(table.try_get_latest_entry(9), None);

        let range = table.get_range(7, 1, 3, None);
        let versions: Vec<i64> = range.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
        assert_eq!(table.get_range(7, 0, 4, Some(2)).len(), 2);
        assert!(table.get_range(7, 3, 1, None).is_empty());
    }

    #[test]
    fn test_iter_in_table_order() {
        let table = MemTable::new(100);
        table.add(1, 5, 0);
        table.add(3, 1, 0);
        table.add(3, 2, 0);
        let keys: Vec<(u64, i64)> = table.iter().map(|e| (e.stream, e.version)).collect();
        assert_eq!(keys, vec![(3, 2), (3, 1), (1, 5)]);
    }

    #[test]
    fn test_full_and_checkpoints() {
        let table = MemTable::new(2);
        table.add(1, 0, 0);
        assert!(!table.is_full());
        table.add(1, 1, 10);
        assert!(table.is_full());

        table.note_checkpoints(10, 20);
        table.note_checkpoints(5, 30);
        assert_eq!(table.prepare_checkpoint(), 10);
        assert_eq!(table.commit_checkpoint(), 30);
    }

    #[test]
    fn test_concurrent_inserts() {
        let table = Arc::new(MemTable::new(usize::MAX));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for v in 0..250 {
                        table.add(t, v, v);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer panicked");
        }
        assert_eq!(table.len(), 1000);
        assert_eq!(table.try_get_latest_entry(2), Some(IndexEntry::new(2, 249, 249)));
    }
}
