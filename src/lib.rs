pub mod bloom;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod memtable;
pub mod merge;
pub mod replication;
pub mod server;
pub mod sstable;
pub mod wal;

pub use config::{Config, ReplicationRole, SyncPolicy};
pub use engine::StorageEngine;
pub use error::{Result, SiltError};

/// Milliseconds since the Unix epoch; the timestamp used across WAL
/// records, SSTable footers, and metrics.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
