use crate::bloom::BloomFilter;
use crate::error::{Result, SiltError};
use crate::memtable::Entry;
use crate::sstable::{
    encode_entry, encode_index_entry, sstable_file_name, Footer, SsTableMeta, FORMAT_VERSION,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Streams strictly key-ascending entries into an immutable table file.
///
/// Entries are written to `<name>.sst.tmp`; `build` writes the index, the
/// optional filter and the footer, fsyncs, and renames into place. Any
/// failure removes the temp file.
pub struct SstBuilder {
    final_path: PathBuf,
    tmp_path: PathBuf,
    writer: BufWriter<fs::File>,
    file_number: u64,
    sparse_index_interval: usize,
    filter: Option<BloomFilter>,
    index: Vec<(Bytes, u64)>,
    first_key: Option<Bytes>,
    last_key: Option<Bytes>,
    entry_count: u64,
    data_bytes: u64,
    scratch: BytesMut,
}

impl SstBuilder {
    pub async fn create(
        dir: impl AsRef<Path>,
        file_number: u64,
        sparse_index_interval: usize,
        filter: Option<BloomFilter>,
    ) -> Result<Self> {
        let final_path = dir.as_ref().join(sstable_file_name(file_number));
        let tmp_path = final_path.with_extension("sst.tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;

        Ok(Self {
            final_path,
            tmp_path,
            writer: BufWriter::new(file),
            file_number,
            sparse_index_interval: sparse_index_interval.max(1),
            filter,
            index: Vec::new(),
            first_key: None,
            last_key: None,
            entry_count: 0,
            data_bytes: 0,
            scratch: BytesMut::new(),
        })
    }

    /// Appends one entry. Keys must arrive in strictly ascending order.
    pub async fn add(&mut self, key: &Bytes, entry: &Entry) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last {
                let shown = String::from_utf8_lossy(key).into_owned();
                self.discard().await;
                return Err(SiltError::KeyOrder(shown));
            }
        }

        // The first entry is always indexed, then one per interval.
        if self.entry_count % self.sparse_index_interval as u64 == 0 {
            self.index.push((key.clone(), self.data_bytes));
        }
        if let Some(filter) = &mut self.filter {
            filter.insert(key);
        }

        self.scratch.clear();
        encode_entry(&mut self.scratch, key, entry);
        let result = self.writer.write_all(&self.scratch).await;
        if let Err(e) = result {
            self.discard().await;
            return Err(e.into());
        }
        self.data_bytes += self.scratch.len() as u64;

        if self.first_key.is_none() {
            self.first_key = Some(key.clone());
        }
        self.last_key = Some(key.clone());
        self.entry_count += 1;
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Finishes the file and returns its metadata.
    pub async fn build(mut self) -> Result<SsTableMeta> {
        match self.finish().await {
            Ok(meta) => Ok(meta),
            Err(e) => {
                let _ = fs::remove_file(&self.tmp_path).await;
                Err(e)
            }
        }
    }

    async fn finish(&mut self) -> Result<SsTableMeta> {
        let (first_key, last_key) = match (self.first_key.take(), self.last_key.take()) {
            (Some(f), Some(l)) => (f, l),
            _ => {
                return Err(SiltError::State(
                    "cannot build an sstable with no entries".into(),
                ))
            }
        };

        let index_offset = self.data_bytes;
        self.scratch.clear();
        self.scratch.put_u32(self.index.len() as u32);
        for (key, offset) in &self.index {
            encode_index_entry(&mut self.scratch, key, *offset);
        }
        self.writer.write_all(&self.scratch).await?;
        let mut position = index_offset + self.scratch.len() as u64;

        let filter_offset = match &self.filter {
            Some(filter) => {
                let offset = position;
                let bytes = filter.serialize();
                self.writer.write_all(&bytes).await?;
                position += bytes.len() as u64;
                offset
            }
            None => 0,
        };

        let created_at = crate::unix_millis();
        let footer = Footer {
            file_number: self.file_number as u32,
            entry_count: self.entry_count as u32,
            data_offset: 0,
            index_offset,
            filter_offset,
            first_key: first_key.clone(),
            last_key: last_key.clone(),
            created_at,
            version: FORMAT_VERSION,
        };
        let footer_bytes = footer.encode();
        self.writer.write_all(&footer_bytes).await?;
        position += footer_bytes.len() as u64;

        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        fs::rename(&self.tmp_path, &self.final_path).await?;

        Ok(SsTableMeta {
            file_number: self.file_number,
            file_path: self.final_path.clone(),
            entry_count: self.entry_count,
            first_key: String::from_utf8_lossy(&first_key).into_owned(),
            last_key: String::from_utf8_lossy(&last_key).into_owned(),
            file_size: position,
            created_at,
            data_offset: 0,
            index_offset,
            filter_offset: (filter_offset != 0).then_some(filter_offset),
        })
    }

    /// Abandons the table, removing the temp file. Used when a compaction
    /// drops every entry.
    pub async fn abort(mut self) {
        self.discard().await;
    }

    async fn discard(&mut self) {
        let _ = self.writer.flush().await;
        let _ = fs::remove_file(&self.tmp_path).await;
    }
}
