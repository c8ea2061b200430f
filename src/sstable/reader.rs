use crate::bloom::BloomFilter;
use crate::error::{Result, SiltError};
use crate::memtable::Entry;
use crate::sstable::{decode_entry, decode_index_entry, Footer, TAIL_LEN};
use bytes::{Buf, Bytes};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Read handle over one immutable table file.
///
/// The footer is parsed and the sparse index and filter are loaded up front;
/// point and range reads then decode entries straight out of the mapped
/// data region.
pub struct SstReader {
    pub path: PathBuf,
    mmap: Mmap,
    footer: Footer,
    index: Vec<(Bytes, u64)>,
    filter: Option<BloomFilter>,
}

impl SstReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        if mmap.len() < TAIL_LEN {
            return Err(SiltError::Corruption(format!(
                "sstable {path:?} is too small to hold a footer"
            )));
        }
        let footer_size = Footer::read_tail(&mmap)? as usize;
        let footer_start = mmap
            .len()
            .checked_sub(TAIL_LEN + footer_size)
            .ok_or_else(|| {
                SiltError::Corruption(format!(
                    "sstable {path:?} declares a footer larger than the file"
                ))
            })?;
        let footer = Footer::decode(&mmap[footer_start..mmap.len() - TAIL_LEN])?;

        let index_end = if footer.filter_offset != 0 {
            footer.filter_offset as usize
        } else {
            footer_start
        };
        let index_start = footer.index_offset as usize;
        if index_start > index_end || index_end > mmap.len() {
            return Err(SiltError::Corruption(format!(
                "sstable {path:?} index section out of bounds"
            )));
        }

        let index = Self::load_index(&mmap[index_start..index_end])?;
        let filter = if footer.filter_offset != 0 {
            let filter_start = footer.filter_offset as usize;
            if filter_start > footer_start {
                return Err(SiltError::Corruption(format!(
                    "sstable {path:?} filter section out of bounds"
                )));
            }
            Some(BloomFilter::deserialize(&mmap[filter_start..footer_start])?)
        } else {
            None
        };

        Ok(Self {
            path,
            mmap,
            footer,
            index,
            filter,
        })
    }

    fn load_index(mut region: &[u8]) -> Result<Vec<(Bytes, u64)>> {
        if region.len() < 4 {
            return Err(SiltError::Corruption(
                "sstable index shorter than its count".into(),
            ));
        }
        let count = region.get_u32() as usize;
        let mut index = Vec::with_capacity(count);
        for _ in 0..count {
            let ((key, offset), consumed) = decode_index_entry(region)?;
            index.push((key, offset));
            region.advance(consumed);
        }
        Ok(index)
    }

    pub fn file_number(&self) -> u64 {
        self.footer.file_number as u64
    }

    pub fn entry_count(&self) -> u64 {
        self.footer.entry_count as u64
    }

    pub fn first_key(&self) -> &[u8] {
        &self.footer.first_key
    }

    pub fn last_key(&self) -> &[u8] {
        &self.footer.last_key
    }

    /// Range fence AND filter. Both are needed: the fence alone admits
    /// false positives, the filter alone would give false negatives for
    /// keys outside the file's span.
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        if key < self.first_key() || key > self.last_key() {
            return false;
        }
        match &self.filter {
            Some(filter) => filter.maybe_contains(key),
            None => true,
        }
    }

    /// Point lookup. A returned tombstone entry is a hit: it shadows older
    /// versions and the caller must not keep searching.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        if !self.maybe_contains(key) {
            return Ok(None);
        }

        // Greatest indexed key <= target narrows the scan to one interval.
        let slot = match self.index.binary_search_by(|(k, _)| k.as_ref().cmp(key)) {
            Ok(i) => i,
            Err(0) => return Ok(None),
            Err(i) => i - 1,
        };

        let data_end = self.footer.index_offset as usize;
        let mut pos = self.index[slot].1 as usize;
        while pos < data_end {
            let ((entry_key, entry), consumed) = decode_entry(&self.mmap[pos..data_end])?;
            pos += consumed;
            if entry_key.as_ref() == key {
                return Ok(Some(entry));
            }
            if entry_key.as_ref() > key {
                break;
            }
        }
        Ok(None)
    }

    /// Entries with `start <= key <= end`, ascending.
    pub fn iter_range(self: &Arc<Self>, start: &[u8], end: &[u8]) -> SstRangeIter {
        let pos = match self.index.binary_search_by(|(k, _)| k.as_ref().cmp(start)) {
            Ok(i) => self.index[i].1 as usize,
            Err(0) => 0,
            Err(i) => self.index[i - 1].1 as usize,
        };
        SstRangeIter {
            reader: Arc::clone(self),
            pos,
            start: Bytes::copy_from_slice(start),
            end: Bytes::copy_from_slice(end),
        }
    }

    /// Every entry in the file, ascending. Used by compaction.
    pub fn iter_all(self: &Arc<Self>) -> SstRangeIter {
        SstRangeIter {
            reader: Arc::clone(self),
            pos: 0,
            start: Bytes::new(),
            end: self.footer.last_key.clone(),
        }
    }
}

impl std::fmt::Debug for SstReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SstReader")
            .field("path", &self.path)
            .field("file_number", &self.footer.file_number)
            .field("entry_count", &self.footer.entry_count)
            .finish()
    }
}

pub struct SstRangeIter {
    reader: Arc<SstReader>,
    pos: usize,
    start: Bytes,
    end: Bytes,
}

impl Iterator for SstRangeIter {
    type Item = (Bytes, Entry);

    fn next(&mut self) -> Option<Self::Item> {
        let data_end = self.reader.footer.index_offset as usize;
        while self.pos < data_end {
            let ((key, entry), consumed) =
                match decode_entry(&self.reader.mmap[self.pos..data_end]) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        tracing::warn!(path = ?self.reader.path, error = %e, "sstable scan aborted");
                        self.pos = data_end;
                        return None;
                    }
                };
            self.pos += consumed;
            if key < self.start {
                continue;
            }
            if key > self.end {
                self.pos = data_end;
                return None;
            }
            return Some((key, entry));
        }
        None
    }
}
