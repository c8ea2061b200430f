use crate::error::{Result, SiltError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// When `append` resolves relative to the fsync of its record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Every append writes and fsyncs before resolving.
    Sync,
    /// Appends resolve when a batched flush completes (100 ms timer).
    Group,
    /// Group commit on a tight 10 ms timer.
    Periodic,
}

impl SyncPolicy {
    pub fn flush_interval(&self) -> Option<Duration> {
        match self {
            SyncPolicy::Sync => None,
            SyncPolicy::Group => Some(Duration::from_millis(100)),
            SyncPolicy::Periodic => Some(Duration::from_millis(10)),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ReplicationRole {
    Standalone,
    /// Push every committed WAL record to the backup at this address.
    Primary { backup_addr: SocketAddr },
    /// Accept a primary connection on this address and apply its records.
    Backup { listen_addr: SocketAddr },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub memtable_size_limit: usize,
    pub sync_policy: SyncPolicy,
    /// One sparse-index entry per this many data entries (1..=1000).
    pub sparse_index_interval: usize,
    /// Target Bloom filter false-positive rate, 0 < p < 1.
    pub bloom_fpr: f64,
    /// Compact once this many SSTables are live.
    pub compaction_threshold: usize,
    pub compaction_check_interval: Duration,
    pub replication: ReplicationRole,
    pub replication_reconnect_interval: Duration,
    pub replication_connect_timeout: Duration,
    /// Streaming TCP front-end port (0 disables the listener).
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./silt_data"),
            memtable_size_limit: 4 * 1024 * 1024,
            sync_policy: SyncPolicy::Group,
            sparse_index_interval: 10,
            bloom_fpr: 0.01,
            compaction_threshold: 4,
            compaction_check_interval: Duration::from_millis(60_000),
            replication: ReplicationRole::Standalone,
            replication_reconnect_interval: Duration::from_millis(1_000),
            replication_connect_timeout: Duration::from_millis(2_000),
            port: 7379,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.memtable_size_limit == 0 {
            return Err(SiltError::InvalidArgument(
                "memtable_size_limit must be non-zero".into(),
            ));
        }
        if !(1..=1000).contains(&self.sparse_index_interval) {
            return Err(SiltError::InvalidArgument(format!(
                "sparse_index_interval must be in 1..=1000, got {}",
                self.sparse_index_interval
            )));
        }
        if !(self.bloom_fpr > 0.0 && self.bloom_fpr < 1.0) {
            return Err(SiltError::InvalidArgument(format!(
                "bloom_fpr must be in (0, 1), got {}",
                self.bloom_fpr
            )));
        }
        if self.compaction_threshold < 2 {
            return Err(SiltError::InvalidArgument(
                "compaction_threshold must be at least 2".into(),
            ));
        }
        Ok(())
    }
}
