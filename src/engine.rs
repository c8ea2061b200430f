use crate::bloom::BloomFilter;
use crate::compaction::{CompactionStats, CompactionWorker};
use crate::config::Config;
use crate::error::{Result, SiltError};
use crate::manifest::{Manifest, ManifestEdit, ManifestState};
use crate::memtable::{Entry, MemTable};
use crate::merge::{MergeIterator, SortedSource};
use crate::sstable::builder::SstBuilder;
use crate::sstable::reader::SstReader;
use crate::sstable::SsTableMeta;
use crate::wal::{LogRecord, Operation, Wal};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

const STATE_READY: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// The LSM orchestrator.
///
/// Writes go WAL-first, then into the active memtable; reads walk the
/// active memtable, the in-flight immutable memtable, then SSTables
/// newest-first. The reader list is kept in lock-step with the manifest.
pub struct StorageEngine {
    pub config: Config,
    sstable_dir: PathBuf,
    wal: Wal,
    active: RwLock<Arc<MemTable>>,
    immutable: RwLock<Option<Arc<MemTable>>>,
    /// Newest first, mirroring the manifest.
    sstables: RwLock<Vec<Arc<SstReader>>>,
    manifest: Mutex<Manifest>,
    state: AtomicU8,
    flush_in_progress: AtomicBool,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    /// WAL segments sealed at a memtable swap, awaiting the checkpoint of
    /// the flush that covers them. Survives failed flush attempts so a
    /// retry still removes the segments its first attempt sealed.
    sealed_segments: Mutex<Vec<PathBuf>>,
    compactor: Mutex<Option<CompactionWorker>>,
    compaction_in_progress: AtomicBool,
    compaction_stats: Arc<CompactionStats>,
}

impl StorageEngine {
    pub async fn open(config: Config) -> Result<Arc<Self>> {
        config.validate()?;

        let wal_dir = config.data_dir.join("wal");
        let sstable_dir = config.data_dir.join("sstables");
        fs::create_dir_all(&wal_dir).await?;
        fs::create_dir_all(&sstable_dir).await?;

        let mut manifest = Manifest::load(&config.data_dir).await?;

        // Open a reader per listed table; entries whose files cannot be
        // opened are retired so manifest and disk converge.
        let mut readers = Vec::new();
        let mut retired = Vec::new();
        for meta in manifest.state().sstables {
            match SstReader::open(&meta.file_path) {
                Ok(reader) => readers.push(Arc::new(reader)),
                Err(e) => {
                    tracing::warn!(
                        file = ?meta.file_path,
                        error = %e,
                        "retiring unopenable sstable from manifest"
                    );
                    retired.push(meta.file_number);
                }
            }
        }
        if !retired.is_empty() {
            manifest
                .apply_edit(ManifestEdit {
                    removed_file_numbers: retired,
                    ..Default::default()
                })
                .await?;
        }

        let wal = Wal::open(wal_dir, config.sync_policy).await?;
        let active = Arc::new(MemTable::new(config.memtable_size_limit));
        let replayed = wal.replay().await?;
        if !replayed.is_empty() {
            tracing::info!(records = replayed.len(), "replaying wal into memtable");
        }
        for record in &replayed {
            Self::apply_to_memtable(&active, &record.op, record.timestamp_ms);
        }

        let engine = Arc::new(Self {
            sstable_dir,
            wal,
            active: RwLock::new(active),
            immutable: RwLock::new(None),
            sstables: RwLock::new(readers),
            manifest: Mutex::new(manifest),
            state: AtomicU8::new(STATE_READY),
            flush_in_progress: AtomicBool::new(false),
            flush_task: Mutex::new(None),
            sealed_segments: Mutex::new(Vec::new()),
            compactor: Mutex::new(None),
            compaction_in_progress: AtomicBool::new(false),
            compaction_stats: Arc::new(CompactionStats::default()),
            config,
        });

        let worker = CompactionWorker::start(&engine);
        *engine.compactor.lock().await = Some(worker);
        Ok(engine)
    }

    fn check_ready(&self) -> Result<()> {
        match self.state.load(Ordering::SeqCst) {
            STATE_READY => Ok(()),
            STATE_CLOSING => Err(SiltError::State("engine is closing".into())),
            _ => Err(SiltError::State("engine is closed".into())),
        }
    }

    pub async fn put(self: &Arc<Self>, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.check_ready()?;
        let key = key.into();
        let value = value.into();
        validate_key(&key)?;
        validate_value(&value)?;

        let record = self
            .wal
            .append(Operation::Put {
                key: key.clone(),
                value: value.clone(),
            })
            .await?;
        self.active.read().await.put(key, value, record.timestamp_ms);
        self.maybe_flush().await
    }

    pub async fn delete(self: &Arc<Self>, key: impl Into<Bytes>) -> Result<()> {
        self.check_ready()?;
        let key = key.into();
        validate_key(&key)?;

        let record = self
            .wal
            .append(Operation::Delete { key: key.clone() })
            .await?;
        self.active.read().await.delete(key, record.timestamp_ms);
        self.maybe_flush().await
    }

    /// Writes all entries under one WAL record, applied in input order.
    /// Returns the number written.
    pub async fn batch_put(self: &Arc<Self>, entries: Vec<(Bytes, Bytes)>) -> Result<usize> {
        self.check_ready()?;
        if entries.is_empty() {
            return Ok(0);
        }
        for (key, value) in &entries {
            validate_key(key)?;
            validate_value(value)?;
        }

        let record = self
            .wal
            .append(Operation::BatchPut {
                entries: entries.clone(),
            })
            .await?;
        {
            let active = self.active.read().await;
            for (key, value) in entries.iter() {
                active.put(key.clone(), value.clone(), record.timestamp_ms);
            }
        }
        self.maybe_flush().await?;
        Ok(entries.len())
    }

    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Bytes>> {
        self.check_ready()?;
        let key = key.as_ref();
        if key.is_empty() {
            return Err(SiltError::InvalidArgument("key must not be empty".into()));
        }

        if let Some(entry) = self.active.read().await.get(key) {
            return Ok(visible(entry));
        }
        if let Some(immutable) = self.immutable.read().await.as_ref() {
            if let Some(entry) = immutable.get(key) {
                return Ok(visible(entry));
            }
        }

        let readers = self.sstables.read().await.clone();
        for reader in readers {
            if !reader.maybe_contains(key) {
                continue;
            }
            if let Some(entry) = reader.get(key)? {
                return Ok(visible(entry));
            }
        }
        Ok(None)
    }

    /// All live pairs with `start <= key <= end`, ascending, newest version
    /// per key, tombstones dropped, at most `limit` results.
    pub async fn read_key_range(
        &self,
        start: impl AsRef<[u8]>,
        end: impl AsRef<[u8]>,
        limit: Option<usize>,
    ) -> Result<Vec<(Bytes, Bytes)>> {
        self.check_ready()?;
        let start = start.as_ref();
        let end = end.as_ref();
        if start > end {
            return Ok(Vec::new());
        }

        // Sources newest-first; the merge resolves duplicates by position.
        let mut sources: Vec<SortedSource> = Vec::new();
        {
            let active = self.active.read().await;
            let rows: Vec<(Bytes, Entry)> = active.range(start, end).collect();
            sources.push(Box::new(rows.into_iter()));
        }
        if let Some(immutable) = self.immutable.read().await.as_ref() {
            let rows: Vec<(Bytes, Entry)> = immutable.range(start, end).collect();
            sources.push(Box::new(rows.into_iter()));
        }
        let readers = self.sstables.read().await.clone();
        for reader in &readers {
            if reader.last_key() < start || reader.first_key() > end {
                continue;
            }
            sources.push(Box::new(reader.iter_range(start, end)));
        }

        let merged = MergeIterator::new(sources);
        Ok(merged
            .filter(|(_, entry)| !entry.tombstone)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(key, entry)| (key, entry.value))
            .collect())
    }

    /// Backup-side apply: the record is re-logged locally (with a locally
    /// assigned sequence) and folded into the active memtable with its
    /// original timestamp.
    pub async fn apply_replicated_record(self: &Arc<Self>, record: LogRecord) -> Result<()> {
        self.check_ready()?;
        let timestamp_ms = record.timestamp_ms;
        self.wal.append(record.op.clone()).await?;
        {
            let active = self.active.read().await;
            Self::apply_to_memtable(&active, &record.op, timestamp_ms);
        }
        self.maybe_flush().await
    }

    /// Commit stream for the replication primary: every durable record, in
    /// sequence order.
    pub fn commit_stream(&self) -> mpsc::UnboundedReceiver<LogRecord> {
        self.wal.subscribe_commits()
    }

    fn apply_to_memtable(memtable: &MemTable, op: &Operation, timestamp_ms: u64) {
        match op {
            Operation::Put { key, value } => {
                memtable.put(key.clone(), value.clone(), timestamp_ms)
            }
            Operation::Delete { key } => memtable.delete(key.clone(), timestamp_ms),
            Operation::BatchPut { entries } => {
                for (key, value) in entries {
                    memtable.put(key.clone(), value.clone(), timestamp_ms);
                }
            }
        }
    }

    /// Non-reentrant flush trigger: swap the full memtable for a fresh one
    /// and schedule a single background flush. Writers never wait on it.
    async fn maybe_flush(self: &Arc<Self>) -> Result<()> {
        if !self.active.read().await.is_full() {
            return Ok(());
        }
        if self.flush_in_progress.swap(true, Ordering::SeqCst) {
            tracing::warn!("memtable full but a flush is already in progress");
            return Ok(());
        }

        let (swapped, watermark) = {
            let mut active = self.active.write().await;
            let mut slot = self.immutable.write().await;
            let watermark = self.wal.last_sequence();
            match slot.as_ref() {
                // A previous flush failed and left its memtable behind;
                // retry it instead of stacking a second one.
                Some(_) => (false, watermark),
                None => {
                    let fresh = Arc::new(MemTable::new(self.config.memtable_size_limit));
                    let old = std::mem::replace(&mut *active, fresh);
                    *slot = Some(old);
                    (true, watermark)
                }
            }
        };

        if swapped {
            match self.wal.rotate().await {
                Ok(sealed) => self.sealed_segments.lock().await.extend(sealed),
                Err(e) => {
                    // Flush without a checkpoint; replay stays idempotent.
                    tracing::error!(error = %e, "wal rotation failed, keeping segments");
                }
            }
        }

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = engine.flush_immutable(watermark).await {
                tracing::error!(error = %e, "memtable flush failed");
            }
            engine.flush_in_progress.store(false, Ordering::SeqCst);
        });
        *self.flush_task.lock().await = Some(handle);
        Ok(())
    }

    async fn flush_immutable(&self, watermark: u64) -> Result<()> {
        let immutable = match self.immutable.read().await.as_ref() {
            Some(memtable) => Arc::clone(memtable),
            None => return Ok(()),
        };
        if immutable.is_empty() {
            *self.immutable.write().await = None;
            self.checkpoint_sealed().await;
            return Ok(());
        }

        let file_number = self.manifest.lock().await.allocate_file_number();
        let filter = BloomFilter::new(immutable.len(), self.config.bloom_fpr);
        let mut builder = SstBuilder::create(
            &self.sstable_dir,
            file_number,
            self.config.sparse_index_interval,
            Some(filter),
        )
        .await?;
        for (key, entry) in immutable.iter() {
            builder.add(&key, &entry).await?;
        }
        let meta = builder.build().await?;
        tracing::info!(
            file = ?meta.file_path,
            entries = meta.entry_count,
            "flushed memtable to sstable"
        );

        let state = {
            let mut manifest = self.manifest.lock().await;
            manifest
                .apply_edit(ManifestEdit {
                    added: vec![meta],
                    last_flushed_sequence: Some(watermark),
                    ..Default::default()
                })
                .await?
        };
        self.sync_readers(&state).await?;

        // The manifest edit is durable; the sealed segments, including any
        // carried over from a failed earlier attempt, are now redundant and
        // the flushed memtable can go.
        self.checkpoint_sealed().await;
        *self.immutable.write().await = None;
        Ok(())
    }

    /// Removes every sealed WAL segment whose checkpoint is now due.
    async fn checkpoint_sealed(&self) {
        let sealed: Vec<PathBuf> = {
            let mut pending = self.sealed_segments.lock().await;
            pending.drain(..).collect()
        };
        self.wal.remove_segments(&sealed).await;
    }

    /// Rebuilds the reader list to mirror a manifest snapshot, reusing
    /// already-open readers.
    async fn sync_readers(&self, state: &ManifestState) -> Result<()> {
        let open: HashMap<u64, Arc<SstReader>> = self
            .sstables
            .read()
            .await
            .iter()
            .map(|reader| (reader.file_number(), Arc::clone(reader)))
            .collect();

        let mut fresh = Vec::with_capacity(state.sstables.len());
        for meta in &state.sstables {
            match open.get(&meta.file_number) {
                Some(reader) => fresh.push(Arc::clone(reader)),
                None => fresh.push(Arc::new(SstReader::open(&meta.file_path)?)),
            }
        }
        *self.sstables.write().await = fresh;
        Ok(())
    }

    /// Size-tiered compaction: merge every live SSTable into one, dropping
    /// tombstones. Returns the new table's metadata, or `None` when the run
    /// was skipped or everything was tombstoned away.
    pub async fn compact(&self) -> Result<Option<SsTableMeta>> {
        self.check_ready()?;
        if self.flush_in_progress.load(Ordering::SeqCst) {
            tracing::debug!("skipping compaction while a flush is in flight");
            return Ok(None);
        }
        if self.compaction_in_progress.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        self.compaction_stats.set_in_progress(true);
        let result = self.run_compaction().await;
        self.compaction_stats.set_in_progress(false);
        self.compaction_in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn run_compaction(&self) -> Result<Option<SsTableMeta>> {
        let snapshot = self.manifest.lock().await.state();
        if snapshot.sstables.len() < 2 {
            return Ok(None);
        }
        let metas = snapshot.sstables;

        let mut readers = Vec::with_capacity(metas.len());
        let mut input_entries = 0u64;
        for meta in &metas {
            let reader = Arc::new(SstReader::open(&meta.file_path)?);
            input_entries += reader.entry_count();
            readers.push(reader);
        }
        let sources: Vec<SortedSource> = readers
            .iter()
            .map(|reader| Box::new(reader.iter_all()) as SortedSource)
            .collect();
        let merged = MergeIterator::new(sources);

        let file_number = self.manifest.lock().await.allocate_file_number();
        let filter = BloomFilter::new(input_entries as usize, self.config.bloom_fpr);
        let mut builder = SstBuilder::create(
            &self.sstable_dir,
            file_number,
            self.config.sparse_index_interval,
            Some(filter),
        )
        .await?;

        let mut kept = 0u64;
        for (key, entry) in merged {
            if entry.tombstone {
                continue;
            }
            builder.add(&key, &entry).await?;
            kept += 1;
        }
        let dropped = input_entries - kept;
        let removed_file_numbers: Vec<u64> = metas.iter().map(|m| m.file_number).collect();

        let (state, new_meta) = if kept == 0 {
            // Every survivor was a tombstone; nothing replaces the inputs.
            builder.abort().await;
            let state = self
                .manifest
                .lock()
                .await
                .apply_edit(ManifestEdit {
                    removed_file_numbers,
                    ..Default::default()
                })
                .await?;
            (state, None)
        } else {
            let meta = builder.build().await?;
            let state = self
                .manifest
                .lock()
                .await
                .apply_edit(ManifestEdit {
                    added: vec![meta.clone()],
                    removed_file_numbers,
                    next_file_number: Some(file_number + 1),
                    ..Default::default()
                })
                .await?;
            (state, Some(meta))
        };

        // Manifest edit is the commit point; only now do the inputs go.
        self.sync_readers(&state).await?;
        drop(readers);
        for meta in &metas {
            if let Err(e) = fs::remove_file(&meta.file_path).await {
                tracing::warn!(file = ?meta.file_path, error = %e, "failed to remove compacted sstable");
            }
        }

        self.compaction_stats.record_run(kept, dropped);
        tracing::info!(
            inputs = metas.len(),
            kept,
            dropped,
            "compaction merged sstables"
        );
        Ok(new_meta)
    }

    pub async fn live_sstable_count(&self) -> usize {
        self.sstables.read().await.len()
    }

    pub fn compaction_stats(&self) -> Arc<CompactionStats> {
        Arc::clone(&self.compaction_stats)
    }

    pub async fn manifest_state(&self) -> ManifestState {
        self.manifest.lock().await.state()
    }

    /// Test hook: wake the compaction worker immediately.
    pub async fn trigger_compaction(&self) {
        if let Some(worker) = self.compactor.lock().await.as_ref() {
            worker.trigger();
        }
    }

    /// Waits for any in-flight background flush to finish.
    pub async fn wait_for_flush(&self) {
        if let Some(handle) = self.flush_task.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.state
            .compare_exchange(
                STATE_READY,
                STATE_CLOSING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| SiltError::State("engine is not ready".into()))?;

        if let Some(worker) = self.compactor.lock().await.take() {
            worker.stop().await;
        }
        if let Some(handle) = self.flush_task.lock().await.take() {
            let _ = handle.await;
        }
        self.wal.shutdown().await?;
        self.sstables.write().await.clear();

        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        tracing::info!("storage engine closed");
        Ok(())
    }
}

fn visible(entry: Entry) -> Option<Bytes> {
    (!entry.tombstone).then_some(entry.value)
}

fn validate_key(key: &Bytes) -> Result<()> {
    if key.is_empty() {
        return Err(SiltError::InvalidArgument("key must not be empty".into()));
    }
    if key.len() > u16::MAX as usize {
        return Err(SiltError::InvalidArgument(format!(
            "key length {} exceeds the {} byte limit",
            key.len(),
            u16::MAX
        )));
    }
    if std::str::from_utf8(key).is_err() {
        return Err(SiltError::InvalidArgument("key must be valid utf-8".into()));
    }
    Ok(())
}

fn validate_value(value: &Bytes) -> Result<()> {
    // Empty values are legal; only the codec's length field bounds them.
    if value.len() > u32::MAX as usize {
        return Err(SiltError::InvalidArgument(
            "value exceeds the 4 GiB encoding limit".into(),
        ));
    }
    Ok(())
}
