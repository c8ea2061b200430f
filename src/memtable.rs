use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A single versioned value. A delete is an `Entry` with `tombstone` set and
/// an empty value; it shadows older versions at lower layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: Bytes,
    pub timestamp_ms: u64,
    pub tombstone: bool,
}

impl Entry {
    pub fn put(value: Bytes, timestamp_ms: u64) -> Self {
        Self {
            value,
            timestamp_ms,
            tombstone: false,
        }
    }

    pub fn tombstone(timestamp_ms: u64) -> Self {
        Self {
            value: Bytes::new(),
            timestamp_ms,
            tombstone: true,
        }
    }

    /// Approximate encoded footprint, used for memtable size accounting.
    fn footprint(&self, key: &[u8]) -> usize {
        key.len() + self.value.len() + 8 + 1
    }
}

/// Ordered in-memory buffer of recent writes.
///
/// Mutated only while active; after the engine swaps it out it is read-only
/// until the flush that wrote it to an SSTable drops it.
#[derive(Debug)]
pub struct MemTable {
    map: SkipMap<Bytes, Entry>,
    size: AtomicUsize,
    size_limit: usize,
}

impl MemTable {
    pub fn new(size_limit: usize) -> Self {
        Self {
            map: SkipMap::new(),
            size: AtomicUsize::new(0),
            size_limit,
        }
    }

    pub fn put(&self, key: Bytes, value: Bytes, timestamp_ms: u64) {
        self.insert(key, Entry::put(value, timestamp_ms));
    }

    pub fn delete(&self, key: Bytes, timestamp_ms: u64) {
        self.insert(key, Entry::tombstone(timestamp_ms));
    }

    fn insert(&self, key: Bytes, entry: Entry) {
        let added = entry.footprint(&key);
        // Overwrites give back the old footprint before charging the new one.
        if let Some(prev) = self.map.get(&key) {
            let removed = prev.value().footprint(&key);
            self.size.fetch_sub(removed, Ordering::Relaxed);
        }
        self.map.insert(key, entry);
        self.size.fetch_add(added, Ordering::Relaxed);
    }

    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.map.get(key).map(|e| e.value().clone())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&self, key: &[u8]) {
        if let Some(entry) = self.map.remove(key) {
            let removed = entry.value().footprint(entry.key());
            self.size.fetch_sub(removed, Ordering::Relaxed);
        }
    }

    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_full(&self) -> bool {
        self.approximate_size() >= self.size_limit
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        while self.map.pop_front().is_some() {}
        self.size.store(0, Ordering::Relaxed);
    }

    /// All entries in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (Bytes, Entry)> + '_ {
        self.map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
    }

    /// Entries with `start <= key <= end`, ascending.
    pub fn range<'a>(
        &'a self,
        start: &'a [u8],
        end: &'a [u8],
    ) -> impl Iterator<Item = (Bytes, Entry)> + 'a {
        self.map
            .range::<[u8], _>((Bound::Included(start), Bound::Included(end)))
            .map(|e| (e.key().clone(), e.value().clone()))
    }
}
