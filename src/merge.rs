use crate::memtable::Entry;
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub type SortedSource = Box<dyn Iterator<Item = (Bytes, Entry)> + Send>;

struct HeapItem {
    key: Bytes,
    entry: Entry,
    source_index: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source_index == other.source_index
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    // BinaryHeap is a max-heap: reverse on key for min-first order, and on
    // equal keys the LOWER source index sorts greater so it pops first.
    // Sources are handed over newest-first, so index 0 wins duplicates.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.source_index.cmp(&self.source_index))
    }
}

/// K-way sorted merge with one emission per unique key.
///
/// Each source must itself be key-ascending. Duplicate keys across sources
/// resolve to the source with the lowest index; losing versions are drained
/// and their sources advanced. Tombstones are emitted as-is; callers that
/// want them gone filter on `Entry::tombstone`.
pub struct MergeIterator {
    sources: Vec<SortedSource>,
    heap: BinaryHeap<HeapItem>,
}

impl MergeIterator {
    /// `sources` ordered newest-first: active memtable, then the immutable
    /// memtable, then SSTables from newest to oldest.
    pub fn new(mut sources: Vec<SortedSource>) -> Self {
        let mut heap = BinaryHeap::new();
        for (source_index, source) in sources.iter_mut().enumerate() {
            if let Some((key, entry)) = source.next() {
                heap.push(HeapItem {
                    key,
                    entry,
                    source_index,
                });
            }
        }
        Self { sources, heap }
    }

    fn advance(&mut self, source_index: usize) {
        if let Some((key, entry)) = self.sources[source_index].next() {
            self.heap.push(HeapItem {
                key,
                entry,
                source_index,
            });
        }
    }
}

impl Iterator for MergeIterator {
    type Item = (Bytes, Entry);

    fn next(&mut self) -> Option<Self::Item> {
        let winner = self.heap.pop()?;

        // Drain stale versions of the same key from older sources.
        while let Some(top) = self.heap.peek() {
            if top.key != winner.key {
                break;
            }
            let stale = self.heap.pop().unwrap();
            self.advance(stale.source_index);
        }
        self.advance(winner.source_index);

        Some((winner.key, winner.entry))
    }
}
