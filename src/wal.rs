use crate::config::SyncPolicy;
use crate::error::{Result, SiltError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

pub const OP_PUT: u8 = 1;
pub const OP_DELETE: u8 = 2;
pub const OP_BATCH_PUT: u8 = 3;

/// An implicit group-commit flush fires once this many appends are pending.
const GROUP_FLUSH_THRESHOLD: usize = 100;

/// Smallest possible record body: sequence + timestamp + op byte.
const MIN_BODY_LEN: u32 = 8 + 8 + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Put { key: Bytes, value: Bytes },
    Delete { key: Bytes },
    BatchPut { entries: Vec<(Bytes, Bytes)> },
}

impl Operation {
    pub fn code(&self) -> u8 {
        match self {
            Operation::Put { .. } => OP_PUT,
            Operation::Delete { .. } => OP_DELETE,
            Operation::BatchPut { .. } => OP_BATCH_PUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub sequence_id: u64,
    pub timestamp_ms: u64,
    pub op: Operation,
}

/// `[sequence_id:u64][timestamp:u64][op:u8][payload]` — the CRC-covered body.
pub fn encode_record_body(buf: &mut BytesMut, record: &LogRecord) {
    buf.put_u64(record.sequence_id);
    buf.put_u64(record.timestamp_ms);
    buf.put_u8(record.op.code());
    match &record.op {
        Operation::Put { key, value } => {
            put_kv(buf, key, value);
        }
        Operation::Delete { key } => {
            buf.put_u16(key.len() as u16);
            buf.put_slice(key);
        }
        Operation::BatchPut { entries } => {
            buf.put_u32(entries.len() as u32);
            for (key, value) in entries {
                put_kv(buf, key, value);
            }
        }
    }
}

fn put_kv(buf: &mut BytesMut, key: &Bytes, value: &Bytes) {
    buf.put_u16(key.len() as u16);
    buf.put_slice(key);
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

pub fn decode_record_body(mut body: &[u8]) -> Result<LogRecord> {
    if body.remaining() < MIN_BODY_LEN as usize {
        return Err(SiltError::Corruption("wal record body too short".into()));
    }
    let sequence_id = body.get_u64();
    let timestamp_ms = body.get_u64();
    let op = match body.get_u8() {
        OP_PUT => {
            let (key, value) = get_kv(&mut body)?;
            Operation::Put { key, value }
        }
        OP_DELETE => {
            if body.remaining() < 2 {
                return Err(SiltError::Corruption("wal delete payload too short".into()));
            }
            let key_len = body.get_u16() as usize;
            if body.remaining() < key_len {
                return Err(SiltError::Corruption("wal delete key truncated".into()));
            }
            let key = Bytes::copy_from_slice(&body[..key_len]);
            Operation::Delete { key }
        }
        OP_BATCH_PUT => {
            if body.remaining() < 4 {
                return Err(SiltError::Corruption("wal batch payload too short".into()));
            }
            let count = body.get_u32() as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(get_kv(&mut body)?);
            }
            Operation::BatchPut { entries }
        }
        other => {
            return Err(SiltError::Corruption(format!(
                "unknown wal opcode {other}"
            )))
        }
    };
    Ok(LogRecord {
        sequence_id,
        timestamp_ms,
        op,
    })
}

fn get_kv(body: &mut &[u8]) -> Result<(Bytes, Bytes)> {
    if body.remaining() < 2 {
        return Err(SiltError::Corruption("wal put payload too short".into()));
    }
    let key_len = body.get_u16() as usize;
    if body.remaining() < key_len + 4 {
        return Err(SiltError::Corruption("wal put key truncated".into()));
    }
    let key = Bytes::copy_from_slice(&body[..key_len]);
    body.advance(key_len);
    let value_len = body.get_u32() as usize;
    if body.remaining() < value_len {
        return Err(SiltError::Corruption("wal put value truncated".into()));
    }
    let value = Bytes::copy_from_slice(&body[..value_len]);
    body.advance(value_len);
    Ok((key, value))
}

/// `[frame_len:u32][checksum:u32][body]`. The length counts everything after
/// the length field; the checksum covers the body.
pub fn encode_frame(record: &LogRecord) -> Bytes {
    let mut body = BytesMut::new();
    encode_record_body(&mut body, record);
    let checksum = crc32fast::hash(&body);

    let mut frame = BytesMut::with_capacity(8 + body.len());
    frame.put_u32(4 + body.len() as u32);
    frame.put_u32(checksum);
    frame.put_slice(&body);
    frame.freeze()
}

enum FrameScan {
    Record(LogRecord, usize),
    End,
    Torn(&'static str),
}

fn scan_frame(data: &[u8]) -> FrameScan {
    if data.is_empty() {
        return FrameScan::End;
    }
    if data.len() < 4 {
        return FrameScan::Torn("short length field");
    }
    let frame_len = (&data[..4]).get_u32();
    if frame_len < 4 + MIN_BODY_LEN {
        return FrameScan::Torn("declared length impossibly small");
    }
    if data.len() - 4 < frame_len as usize {
        return FrameScan::Torn("declared length exceeds segment size");
    }
    let checksum = (&data[4..8]).get_u32();
    let body = &data[8..4 + frame_len as usize];
    if crc32fast::hash(body) != checksum {
        return FrameScan::Torn("checksum mismatch");
    }
    match decode_record_body(body) {
        Ok(record) => FrameScan::Record(record, 4 + frame_len as usize),
        Err(_) => FrameScan::Torn("unparseable record body"),
    }
}

struct ActiveSegment {
    path: PathBuf,
    writer: BufWriter<File>,
}

struct PendingAppend {
    frame: Bytes,
    record: LogRecord,
    done: oneshot::Sender<Result<()>>,
}

struct WalInner {
    dir: PathBuf,
    policy: SyncPolicy,
    /// Last assigned sequence id.
    sequence: AtomicU64,
    active: Mutex<ActiveSegment>,
    /// Closed segments not yet removed by a checkpoint, oldest first.
    sealed: Mutex<Vec<PathBuf>>,
    pending: Mutex<Vec<PendingAppend>>,
    /// Serialises batch flushes so on-disk order matches sequence order.
    flush_lock: Mutex<()>,
    listener: std::sync::Mutex<Option<mpsc::UnboundedSender<LogRecord>>>,
    /// Fault injection: fail the next batch flush before writing anything.
    #[cfg(test)]
    fail_next_flush: std::sync::atomic::AtomicBool,
}

impl WalInner {
    async fn create_segment(dir: &Path) -> Result<ActiveSegment> {
        let mut stamp = crate::unix_millis();
        let path = loop {
            let candidate = dir.join(format!("wal-{stamp:013}.log"));
            if !candidate.exists() {
                break candidate;
            }
            stamp += 1;
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(ActiveSegment {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn next_record(&self, op: Operation) -> LogRecord {
        LogRecord {
            sequence_id: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp_ms: crate::unix_millis(),
            op,
        }
    }

    /// Fires the commit listener. Only called after the record's fsync, in
    /// sequence order.
    fn notify(&self, record: &LogRecord) {
        let mut guard = self.listener.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            if tx.send(record.clone()).is_err() {
                *guard = None;
            }
        }
    }

    async fn flush_pending(&self) {
        let _flush = self.flush_lock.lock().await;
        let batch: Vec<PendingAppend> = {
            let mut pending = self.pending.lock().await;
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }

        let mut write_result: std::io::Result<()> = Ok(());
        #[cfg(test)]
        {
            if self.fail_next_flush.swap(false, Ordering::SeqCst) {
                write_result = Err(std::io::Error::other("injected flush failure"));
            }
        }

        let mut active = self.active.lock().await;
        if write_result.is_ok() {
            for append in &batch {
                if let Err(e) = active.writer.write_all(&append.frame).await {
                    write_result = Err(e);
                    break;
                }
            }
        }
        if write_result.is_ok() {
            write_result = active.writer.flush().await;
        }
        if write_result.is_ok() {
            // One fsync covers the whole batch.
            write_result = active.writer.get_ref().sync_all().await;
        }
        drop(active);

        match write_result {
            Ok(()) => {
                for append in batch {
                    self.notify(&append.record);
                    let _ = append.done.send(Ok(()));
                }
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(error = %message, "group-commit flush failed");
                for append in batch {
                    let _ = append
                        .done
                        .send(Err(SiltError::Io(std::io::Error::other(message.clone()))));
                }
            }
        }
    }
}

/// Segmented write-ahead log under `<data_dir>/wal/`.
///
/// A single logical writer: appends and batch flushes are serialised by the
/// segment/flush mutexes, so on-disk order always matches sequence order.
pub struct Wal {
    inner: Arc<WalInner>,
    flusher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Opens the log directory. Existing segments are left sealed for
    /// `replay`; appends always go to a fresh segment, so a torn tail in an
    /// old segment can never sit in front of new records.
    pub async fn open(dir: impl Into<PathBuf>, policy: SyncPolicy) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut existing = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "log") {
                existing.push(path);
            }
        }
        existing.sort();

        let active = WalInner::create_segment(&dir).await?;
        let inner = Arc::new(WalInner {
            dir,
            policy,
            sequence: AtomicU64::new(0),
            active: Mutex::new(active),
            sealed: Mutex::new(existing),
            pending: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            listener: std::sync::Mutex::new(None),
            #[cfg(test)]
            fail_next_flush: std::sync::atomic::AtomicBool::new(false),
        });

        let flusher = policy.flush_interval().map(|period| {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    inner.flush_pending().await;
                }
            })
        });

        Ok(Self {
            inner,
            flusher: std::sync::Mutex::new(flusher),
        })
    }

    /// Appends one record. Resolves only once the record's fsync has
    /// completed, whichever policy batches it there.
    pub async fn append(&self, op: Operation) -> Result<LogRecord> {
        match self.inner.policy {
            SyncPolicy::Sync => {
                let mut active = self.inner.active.lock().await;
                // Sequence is assigned under the segment lock: disk order
                // equals sequence order.
                let record = self.inner.next_record(op);
                let frame = encode_frame(&record);
                active.writer.write_all(&frame).await?;
                active.writer.flush().await?;
                active.writer.get_ref().sync_all().await?;
                // Notified under the segment lock so listener order matches
                // sequence order.
                self.inner.notify(&record);
                drop(active);
                Ok(record)
            }
            SyncPolicy::Group | SyncPolicy::Periodic => {
                let (record, rx, queued) = {
                    let mut pending = self.inner.pending.lock().await;
                    let record = self.inner.next_record(op);
                    let frame = encode_frame(&record);
                    let (tx, rx) = oneshot::channel();
                    pending.push(PendingAppend {
                        frame,
                        record: record.clone(),
                        done: tx,
                    });
                    (record, rx, pending.len())
                };

                if queued >= GROUP_FLUSH_THRESHOLD {
                    self.inner.flush_pending().await;
                }

                match rx.await {
                    Ok(Ok(())) => Ok(record),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(SiltError::State(
                        "wal closed while an append was pending".into(),
                    )),
                }
            }
        }
    }

    /// Registers the commit listener. Records are delivered after their
    /// fsync, in sequence order.
    pub fn subscribe_commits(&self) -> mpsc::UnboundedReceiver<LogRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.listener.lock().unwrap() = Some(tx);
        rx
    }

    pub fn last_sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::SeqCst)
    }

    /// Replays all sealed segments in filename order. The scan stops at the
    /// first torn tail (EOF, short read, over-long length, or CRC mismatch)
    /// and returns the records before it; corruption is never an error here.
    pub async fn replay(&self) -> Result<Vec<LogRecord>> {
        let sealed = self.inner.sealed.lock().await.clone();
        let mut records = Vec::new();

        'segments: for path in &sealed {
            let data = fs::read(path).await?;
            let mut pos = 0;
            loop {
                match scan_frame(&data[pos..]) {
                    FrameScan::Record(record, consumed) => {
                        pos += consumed;
                        records.push(record);
                    }
                    FrameScan::End => break,
                    FrameScan::Torn(reason) => {
                        tracing::warn!(
                            segment = ?path,
                            offset = pos,
                            reason,
                            "wal replay stopped at torn tail"
                        );
                        break 'segments;
                    }
                }
            }
        }

        if let Some(last) = records.last() {
            self.inner
                .sequence
                .store(last.sequence_id, Ordering::SeqCst);
        }
        Ok(records)
    }

    /// Seals the current segment and starts a fresh one, returning every
    /// sealed segment path. The caller may hand the list back to
    /// `remove_segments` once their contents are durable in SSTables.
    pub async fn rotate(&self) -> Result<Vec<PathBuf>> {
        self.inner.flush_pending().await;

        let mut active = self.inner.active.lock().await;
        active.writer.flush().await?;
        active.writer.get_ref().sync_all().await?;
        let fresh = WalInner::create_segment(&self.inner.dir).await?;
        let old = std::mem::replace(&mut *active, fresh);
        drop(active);

        let mut sealed = self.inner.sealed.lock().await;
        sealed.push(old.path);
        Ok(sealed.clone())
    }

    /// Deletes sealed segments. Only call with segments whose records are
    /// already reflected in durable SSTables.
    pub async fn remove_segments(&self, paths: &[PathBuf]) {
        let mut sealed = self.inner.sealed.lock().await;
        for path in paths {
            if let Err(e) = fs::remove_file(path).await {
                tracing::warn!(segment = ?path, error = %e, "failed to remove wal segment");
            }
            sealed.retain(|p| p != path);
        }
    }

    /// Stops the periodic flusher, drains any pending batch, and syncs the
    /// active segment.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            handle.abort();
        }
        self.inner.flush_pending().await;
        let mut active = self.inner.active.lock().await;
        active.writer.flush().await?;
        active.writer.get_ref().sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
impl Wal {
    /// Arms the fault-injection hook: the next batch flush fails before
    /// writing, and every pending append must observe the error.
    fn fail_next_flush(&self) {
        self.inner.fail_next_flush.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("dir", &self.inner.dir)
            .field("policy", &self.inner.policy)
            .field("last_sequence", &self.last_sequence())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn reopen(dir: &Path) -> Wal {
        Wal::open(dir, SyncPolicy::Sync).await.unwrap()
    }

    fn put(key: &str, value: &str) -> Operation {
        Operation::Put {
            key: Bytes::from(key.to_string()),
            value: Bytes::from(value.to_string()),
        }
    }

    #[tokio::test]
    async fn sync_append_and_replay() {
        let dir = tempdir().unwrap();
        {
            let wal = reopen(dir.path()).await;
            wal.append(put("a", "1")).await.unwrap();
            wal.append(Operation::Delete {
                key: Bytes::from("a"),
            })
            .await
            .unwrap();
            wal.append(Operation::BatchPut {
                entries: vec![
                    (Bytes::from("b"), Bytes::from("2")),
                    (Bytes::from("c"), Bytes::new()),
                ],
            })
            .await
            .unwrap();
            wal.shutdown().await.unwrap();
        }

        let wal = reopen(dir.path()).await;
        let records = wal.replay().await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.sequence_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(records[0].op, put("a", "1"));
        match &records[2].op {
            Operation::BatchPut { entries } => {
                assert_eq!(entries.len(), 2);
                // Empty values are legal.
                assert!(entries[1].1.is_empty());
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert_eq!(wal.last_sequence(), 3);
    }

    #[tokio::test]
    async fn torn_tail_keeps_prior_records() {
        let dir = tempdir().unwrap();
        {
            let wal = reopen(dir.path()).await;
            wal.append(put("a", "1")).await.unwrap();
            wal.append(put("b", "2")).await.unwrap();
            wal.append(put("c", "3")).await.unwrap();
            wal.shutdown().await.unwrap();
        }

        // Flip one byte in the last record's value region.
        let mut segments: Vec<_> = std::fs::read_dir(dir.path().to_path_buf())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == "log"))
            .collect();
        segments.sort();
        let target = segments.first().unwrap();
        let mut raw = std::fs::read(target).unwrap();
        let len = raw.len();
        raw[len - 1] ^= 0xFF;
        std::fs::write(target, raw).unwrap();

        let wal = reopen(dir.path()).await;
        let records = wal.replay().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].op, put("b", "2"));
    }

    #[tokio::test]
    async fn truncated_length_field_is_a_torn_tail() {
        let dir = tempdir().unwrap();
        {
            let wal = reopen(dir.path()).await;
            wal.append(put("a", "1")).await.unwrap();
            wal.shutdown().await.unwrap();
        }

        let segment: PathBuf = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.extension().is_some_and(|e| e == "log") && p.metadata().unwrap().len() > 0)
            .unwrap();
        let mut raw = std::fs::read(&segment).unwrap();
        raw.extend_from_slice(&[0x00, 0x00]); // two stray bytes of a next frame
        std::fs::write(&segment, raw).unwrap();

        let wal = reopen(dir.path()).await;
        let records = wal.replay().await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn group_commit_resolves_batch_together() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(Wal::open(dir.path(), SyncPolicy::Periodic).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..32 {
            let wal = Arc::clone(&wal);
            handles.push(tokio::spawn(async move {
                wal.append(put(&format!("k{i:02}"), "v")).await.unwrap()
            }));
        }
        let mut sequences = Vec::new();
        for handle in handles {
            sequences.push(handle.await.unwrap().sequence_id);
        }
        sequences.sort();
        assert_eq!(sequences, (1..=32).collect::<Vec<u64>>());
        wal.shutdown().await.unwrap();

        let wal = reopen(dir.path()).await;
        let records = wal.replay().await.unwrap();
        assert_eq!(records.len(), 32);
        // Disk order matches sequence order.
        let on_disk: Vec<_> = records.iter().map(|r| r.sequence_id).collect();
        assert_eq!(on_disk, (1..=32).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn group_commit_failure_rejects_every_pending_append() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(Wal::open(dir.path(), SyncPolicy::Group).await.unwrap());
        wal.fail_next_flush();

        // Hold the flush lock so the whole batch queues before any flush
        // can run.
        let gate = wal.inner.flush_lock.lock().await;
        let mut handles = Vec::new();
        for i in 0..16 {
            let wal = Arc::clone(&wal);
            handles.push(tokio::spawn(async move {
                if i % 4 == 3 {
                    wal.append(Operation::Delete {
                        key: Bytes::from(format!("k{i:02}")),
                    })
                    .await
                } else {
                    wal.append(put(&format!("k{i:02}"), "v")).await
                }
            }));
        }
        for _ in 0..200 {
            if wal.inner.pending.lock().await.len() == 16 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(wal.inner.pending.lock().await.len(), 16);
        drop(gate);

        // All-or-nothing: the one failed fsync rejects every waiter.
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(
                result.is_err(),
                "append resolved ok despite the failed batch flush"
            );
        }

        // The hook is one-shot, so the log keeps working afterwards.
        let record = wal.append(put("after", "1")).await.unwrap();
        assert_eq!(record.sequence_id, 17);
        wal.shutdown().await.unwrap();

        // Nothing from the failed batch ever became visible.
        let wal = reopen(dir.path()).await;
        let records = wal.replay().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].op, put("after", "1"));
    }

    #[tokio::test]
    async fn listener_fires_in_sequence_order() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), SyncPolicy::Sync).await.unwrap();
        let mut commits = wal.subscribe_commits();

        wal.append(put("a", "1")).await.unwrap();
        wal.append(put("b", "2")).await.unwrap();

        assert_eq!(commits.recv().await.unwrap().sequence_id, 1);
        assert_eq!(commits.recv().await.unwrap().sequence_id, 2);
        wal.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn rotate_and_remove_segments() {
        let dir = tempdir().unwrap();
        let wal = reopen(dir.path()).await;
        wal.append(put("a", "1")).await.unwrap();

        let sealed = wal.rotate().await.unwrap();
        assert_eq!(sealed.len(), 1);
        wal.append(put("b", "2")).await.unwrap();

        wal.remove_segments(&sealed).await;
        assert!(!sealed[0].exists());
        wal.shutdown().await.unwrap();

        // Only the post-rotation record survives.
        let wal = reopen(dir.path()).await;
        let records = wal.replay().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].op, put("b", "2"));
    }
}
