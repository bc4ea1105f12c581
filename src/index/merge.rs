use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::entry::IndexEntry;
use crate::error::Result;

/// Boxed entry source for merging.
pub type EntryIterator<'a> = Box<dyn Iterator<Item = Result<IndexEntry>> + Send + 'a>;

pub struct HeapEntry<'a> {
    pub entry: IndexEntry,
    /// Lower sources are newer and win ties.
    pub source: usize,
    pub iterator: EntryIterator<'a>,
}

impl std::fmt::Debug for HeapEntry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapEntry")
            .field("entry", &self.entry)
            .field("source", &self.source)
            .finish()
    }
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.entry == other.entry && self.source == other.source
    }
}

impl Eq for HeapEntry<'_> {}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap pops the greatest element, so both keys are reversed.
impl Ord for HeapEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.entry.cmp(&other.entry) {
            Ordering::Equal => other.source.cmp(&self.source),
            other => other.reverse(),
        }
    }
}

/// K-way merge of sources already in table order.
///
/// Every entry of every source is yielded; nothing is deduplicated.
#[derive(Debug)]
pub struct MergeIterator<'a> {
    heap: BinaryHeap<HeapEntry<'a>>,
    pending_error: Option<crate::error::Error>,
}

impl<'a> MergeIterator<'a> {
    pub fn new(iterators: Vec<EntryIterator<'a>>) -> Self {
        let mut heap = BinaryHeap::new();
        let mut pending_error = None;

        for (source, mut iterator) in iterators.into_iter().enumerate() {
            match iterator.next() {
                Some(Ok(entry)) => heap.push(HeapEntry {
                    entry,
                    source,
                    iterator,
                }),
                Some(Err(e)) => {
                    pending_error.get_or_insert(e);
                }
                None => {}
            }
        }

        Self {
            heap,
            pending_error,
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            self.heap.clear();
            return Some(Err(e));
        }

        let mut top = self.heap.pop()?;
        let entry = top.entry;
        match top.iterator.next() {
            Some(Ok(next)) => {
                top.entry = next;
                self.heap.push(top);
            }
            Some(Err(e)) => self.pending_error = Some(e),
            None => {}
        }
        Some(Ok(entry))
    }
}
