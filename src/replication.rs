use crate::engine::StorageEngine;
use crate::error::{Result, SiltError};
use crate::wal::{decode_record_body, encode_record_body, LogRecord};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const OP_REPLICATE: u8 = 0x10;
pub const OP_REPLICATE_ACK: u8 = 0x11;
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERROR: u8 = 0x01;

/// Upper bound on a frame body; anything larger is a protocol fault.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// `[payload_len:u32][opcode:u8][body]`.
fn encode_frame(opcode: u8, body: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(5 + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_u8(opcode);
    frame.put_slice(body);
    frame.freeze()
}

pub fn encode_replicate_frame(record: &LogRecord) -> Bytes {
    let mut body = BytesMut::new();
    encode_record_body(&mut body, record);
    encode_frame(OP_REPLICATE, &body)
}

pub fn encode_ack_frame(status: u8, sequence_id: u64) -> Bytes {
    let mut body = BytesMut::with_capacity(9);
    body.put_u8(status);
    body.put_u64(sequence_id);
    encode_frame(OP_REPLICATE_ACK, &body)
}

/// Reads one frame. `Ok(None)` is a clean close at a frame boundary; EOF
/// inside a frame is a protocol fault.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(u8, Bytes)>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let payload_len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if payload_len > MAX_FRAME_LEN {
        return Err(SiltError::Protocol(format!(
            "frame of {payload_len} bytes exceeds the limit"
        )));
    }
    let opcode = reader
        .read_u8()
        .await
        .map_err(|_| SiltError::Protocol("truncated frame: missing opcode".into()))?;
    let mut body = vec![0u8; payload_len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| SiltError::Protocol("truncated frame body".into()))?;
    Ok(Some((opcode, Bytes::from(body))))
}

#[derive(Debug, Default)]
pub struct ReplicationMetrics {
    records_replicated: AtomicU64,
    bytes_replicated: AtomicU64,
    failed_attempts: AtomicU64,
    last_success_ms: AtomicU64,
    last_failure_ms: AtomicU64,
    /// Timestamp of the oldest unacked record; 0 when nothing is pending.
    oldest_pending_ts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationMetricsSnapshot {
    pub records_replicated: u64,
    pub bytes_replicated: u64,
    pub failed_attempts: u64,
    pub last_success_ms: u64,
    pub last_failure_ms: u64,
    pub oldest_pending_age_ms: u64,
}

impl ReplicationMetrics {
    pub fn snapshot(&self) -> ReplicationMetricsSnapshot {
        let oldest = self.oldest_pending_ts.load(Ordering::Relaxed);
        ReplicationMetricsSnapshot {
            records_replicated: self.records_replicated.load(Ordering::Relaxed),
            bytes_replicated: self.bytes_replicated.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            last_success_ms: self.last_success_ms.load(Ordering::Relaxed),
            last_failure_ms: self.last_failure_ms.load(Ordering::Relaxed),
            oldest_pending_age_ms: match oldest {
                0 => 0,
                ts => crate::unix_millis().saturating_sub(ts),
            },
        }
    }

    fn record_failure(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms
            .store(crate::unix_millis(), Ordering::Relaxed);
    }
}

/// Primary side: pushes every committed WAL record over one persistent
/// connection and matches acks in FIFO order. Best-effort by design —
/// commits never wait for replication, and records sent while the backup
/// is away are not retried.
pub struct Primary {
    handle: JoinHandle<()>,
    metrics: Arc<ReplicationMetrics>,
}

impl Primary {
    pub fn start(
        commits: mpsc::UnboundedReceiver<LogRecord>,
        backup_addr: SocketAddr,
        reconnect_interval: Duration,
        connect_timeout: Duration,
    ) -> Self {
        let metrics = Arc::new(ReplicationMetrics::default());
        let task_metrics = Arc::clone(&metrics);
        let handle = tokio::spawn(async move {
            run_primary(
                commits,
                backup_addr,
                reconnect_interval,
                connect_timeout,
                task_metrics,
            )
            .await;
        });
        Self { handle, metrics }
    }

    pub fn metrics(&self) -> ReplicationMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

async fn run_primary(
    mut commits: mpsc::UnboundedReceiver<LogRecord>,
    backup_addr: SocketAddr,
    reconnect_interval: Duration,
    connect_timeout: Duration,
    metrics: Arc<ReplicationMetrics>,
) {
    loop {
        let stream =
            match tokio::time::timeout(connect_timeout, TcpStream::connect(backup_addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "replication connect failed");
                    metrics.record_failure();
                    if wait_out_backoff(&mut commits, reconnect_interval).await.is_err() {
                        return;
                    }
                    continue;
                }
                Err(_) => {
                    tracing::debug!("replication connect timed out");
                    metrics.record_failure();
                    if wait_out_backoff(&mut commits, reconnect_interval).await.is_err() {
                        return;
                    }
                    continue;
                }
            };
        tracing::info!(backup = %backup_addr, "replication connection established");

        let (read_half, mut write_half) = stream.into_split();
        let pending: Arc<Mutex<VecDeque<(u64, u64)>>> = Arc::new(Mutex::new(VecDeque::new()));
        let (closed_tx, mut closed_rx) = oneshot::channel::<()>();
        let ack_task = tokio::spawn(read_acks(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&metrics),
            closed_tx,
        ));

        // Pipelined sends; the ack reader settles them in FIFO order.
        loop {
            tokio::select! {
                _ = &mut closed_rx => break,
                maybe_record = commits.recv() => {
                    let Some(record) = maybe_record else {
                        ack_task.abort();
                        return;
                    };
                    let frame = encode_replicate_frame(&record);
                    if write_half.write_all(&frame).await.is_err() {
                        break;
                    }
                    metrics
                        .bytes_replicated
                        .fetch_add(frame.len() as u64, Ordering::Relaxed);
                    let mut queue = pending.lock().unwrap();
                    queue.push_back((record.sequence_id, record.timestamp_ms));
                    if queue.len() == 1 {
                        metrics
                            .oldest_pending_ts
                            .store(record.timestamp_ms, Ordering::Relaxed);
                    }
                }
            }
        }

        // Connection lost: in-flight records are dropped, never retried.
        ack_task.abort();
        let dropped = {
            let mut queue = pending.lock().unwrap();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        metrics.oldest_pending_ts.store(0, Ordering::Relaxed);
        metrics.record_failure();
        tracing::warn!(
            dropped,
            "replication connection lost, reconnecting after backoff"
        );
        if wait_out_backoff(&mut commits, reconnect_interval).await.is_err() {
            return;
        }
    }
}

/// Fixed-interval backoff. Records committed while the backup is
/// unreachable are dropped, never queued for retry. Errors once the commit
/// stream itself is gone.
async fn wait_out_backoff(
    commits: &mut mpsc::UnboundedReceiver<LogRecord>,
    reconnect_interval: Duration,
) -> std::result::Result<(), ()> {
    let deadline = tokio::time::Instant::now() + reconnect_interval;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return Ok(()),
            maybe_record = commits.recv() => match maybe_record {
                Some(record) => {
                    tracing::debug!(
                        sequence_id = record.sequence_id,
                        "dropping commit while backup is unreachable"
                    );
                }
                None => return Err(()),
            },
        }
    }
}

async fn read_acks(
    mut reader: OwnedReadHalf,
    pending: Arc<Mutex<VecDeque<(u64, u64)>>>,
    metrics: Arc<ReplicationMetrics>,
    closed: oneshot::Sender<()>,
) {
    loop {
        let (opcode, body) = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "replication ack stream failed");
                break;
            }
        };
        if opcode != OP_REPLICATE_ACK || body.len() != 9 {
            tracing::warn!(opcode, "unexpected frame on replication ack stream");
            break;
        }
        let mut cursor = &body[..];
        let status = cursor.get_u8();
        let sequence_id = cursor.get_u64();

        let expected = {
            let mut queue = pending.lock().unwrap();
            let expected = queue.pop_front();
            let next_ts = queue.front().map(|(_, ts)| *ts).unwrap_or(0);
            metrics.oldest_pending_ts.store(next_ts, Ordering::Relaxed);
            expected
        };
        match expected {
            Some((expected_seq, _)) if expected_seq == sequence_id => {
                if status == STATUS_OK {
                    metrics.records_replicated.fetch_add(1, Ordering::Relaxed);
                    metrics
                        .last_success_ms
                        .store(crate::unix_millis(), Ordering::Relaxed);
                } else {
                    tracing::warn!(sequence_id, "backup rejected replicated record");
                    metrics.record_failure();
                }
            }
            other => {
                tracing::warn!(
                    sequence_id,
                    expected = ?other,
                    "replication ack out of order"
                );
                break;
            }
        }
    }
    let _ = closed.send(());
}

#[derive(Debug, Default)]
pub struct BackupMetrics {
    records_applied: AtomicU64,
    records_rejected: AtomicU64,
    last_apply_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupMetricsSnapshot {
    pub records_applied: u64,
    pub records_rejected: u64,
    pub time_since_last_apply_ms: u64,
}

impl BackupMetrics {
    pub fn snapshot(&self) -> BackupMetricsSnapshot {
        let last = self.last_apply_ms.load(Ordering::Relaxed);
        BackupMetricsSnapshot {
            records_applied: self.records_applied.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            time_since_last_apply_ms: match last {
                0 => 0,
                ts => crate::unix_millis().saturating_sub(ts),
            },
        }
    }
}

/// Backup side: accepts a single primary at a time and applies its records
/// through `StorageEngine::apply_replicated_record`, acking each in the
/// order received.
pub struct Backup {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    connection: Arc<Mutex<Option<JoinHandle<()>>>>,
    metrics: Arc<BackupMetrics>,
}

impl Backup {
    pub async fn bind(engine: Arc<StorageEngine>, listen_addr: SocketAddr) -> Result<Self> {
        let socket = if listen_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(listen_addr)?;
        let listener = socket.listen(64)?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "replication backup listening");

        let metrics = Arc::new(BackupMetrics::default());
        let connection: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
        let connected = Arc::new(AtomicBool::new(false));

        let accept_metrics = Arc::clone(&metrics);
        let accept_connection = Arc::clone(&connection);
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "backup accept failed");
                        continue;
                    }
                };
                // One active primary at a time; extras are refused.
                if connected.swap(true, Ordering::SeqCst) {
                    tracing::warn!(peer = %peer, "refusing second primary connection");
                    drop(stream);
                    continue;
                }
                tracing::info!(peer = %peer, "primary connected");

                let engine = Arc::clone(&engine);
                let metrics = Arc::clone(&accept_metrics);
                let connected = Arc::clone(&connected);
                let handle = tokio::spawn(async move {
                    serve_primary(stream, engine, metrics).await;
                    connected.store(false, Ordering::SeqCst);
                });
                *accept_connection.lock().unwrap() = Some(handle);
            }
        });

        Ok(Self {
            local_addr,
            accept_task,
            connection,
            metrics,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> BackupMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn stop(self) {
        self.accept_task.abort();
        let _ = self.accept_task.await;
        let handle = self.connection.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn serve_primary(
    mut stream: TcpStream,
    engine: Arc<StorageEngine>,
    metrics: Arc<BackupMetrics>,
) {
    let (mut read_half, mut write_half) = stream.split();
    loop {
        let (opcode, body) = match read_frame(&mut read_half).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "dropping primary connection");
                break;
            }
        };
        if opcode != OP_REPLICATE {
            tracing::warn!(opcode, "unknown opcode from primary");
            break;
        }
        let record = match decode_record_body(&body) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable replicated record");
                break;
            }
        };
        let sequence_id = record.sequence_id;

        let status = match engine.apply_replicated_record(record).await {
            Ok(()) => {
                metrics.records_applied.fetch_add(1, Ordering::Relaxed);
                metrics
                    .last_apply_ms
                    .store(crate::unix_millis(), Ordering::Relaxed);
                STATUS_OK
            }
            Err(e) => {
                tracing::warn!(error = %e, sequence_id, "failed to apply replicated record");
                metrics.records_rejected.fetch_add(1, Ordering::Relaxed);
                STATUS_ERROR
            }
        };
        if write_half
            .write_all(&encode_ack_frame(status, sequence_id))
            .await
            .is_err()
        {
            break;
        }
    }
    tracing::info!("primary disconnected");
}
