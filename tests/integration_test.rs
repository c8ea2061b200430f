use bytes::Bytes;
use siltdb::config::{Config, SyncPolicy};
use siltdb::engine::StorageEngine;
use siltdb::replication::{Backup, Primary};
use siltdb::wal::{encode_frame, LogRecord, Operation};
use siltdb::SiltError;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn test_config(dir: &Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        sync_policy: SyncPolicy::Sync,
        // Keep the background worker quiet; tests drive compaction.
        compaction_check_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

async fn wait_for_sstables(engine: &Arc<StorageEngine>, count: usize) {
    for _ in 0..200 {
        if engine.live_sstable_count().await >= count {
            engine.wait_for_flush().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {count} live sstables");
}

#[tokio::test]
async fn put_get_delete_survive_restart() {
    let dir = tempdir().unwrap();

    {
        let engine = StorageEngine::open(test_config(dir.path())).await.unwrap();
        engine.put("user:1", "Alice").await.unwrap();
        engine.put("user:2", "Bob").await.unwrap();
        assert_eq!(
            engine.get("user:1").await.unwrap(),
            Some(Bytes::from("Alice"))
        );
        engine.delete("user:1").await.unwrap();
        assert_eq!(engine.get("user:1").await.unwrap(), None);
        engine.close().await.unwrap();
    }

    let engine = StorageEngine::open(test_config(dir.path())).await.unwrap();
    assert_eq!(engine.get("user:1").await.unwrap(), None);
    assert_eq!(
        engine.get("user:2").await.unwrap(),
        Some(Bytes::from("Bob"))
    );
    engine.close().await.unwrap();
}

#[tokio::test]
async fn small_memtable_flushes_and_stays_readable() {
    let dir = tempdir().unwrap();
    let config = Config {
        memtable_size_limit: 256,
        ..test_config(dir.path())
    };
    let engine = StorageEngine::open(config).await.unwrap();

    for i in 0..50 {
        let value = format!("{:020}", i);
        engine.put(format!("k{i:02}"), value).await.unwrap();
    }
    wait_for_sstables(&engine, 1).await;
    assert!(engine.live_sstable_count().await >= 1);

    assert_eq!(
        engine.get("k25").await.unwrap(),
        Some(Bytes::from(format!("{:020}", 25)))
    );

    let range = engine.read_key_range("k10", "k20", Some(100)).await.unwrap();
    assert_eq!(range.len(), 11);
    let keys: Vec<String> = range
        .iter()
        .map(|(k, _)| String::from_utf8(k.to_vec()).unwrap())
        .collect();
    let expected: Vec<String> = (10..=20).map(|i| format!("k{i:02}")).collect();
    assert_eq!(keys, expected);

    engine.close().await.unwrap();
}

#[tokio::test]
async fn batch_put_is_ordered_and_counted() {
    let dir = tempdir().unwrap();
    let engine = StorageEngine::open(test_config(dir.path())).await.unwrap();

    let written = engine
        .batch_put(vec![
            (Bytes::from("a"), Bytes::from("1")),
            (Bytes::from("b"), Bytes::from("2")),
            (Bytes::from("c"), Bytes::from("3")),
        ])
        .await
        .unwrap();
    assert_eq!(written, 3);

    let range = engine.read_key_range("a", "c", Some(10)).await.unwrap();
    assert_eq!(
        range,
        vec![
            (Bytes::from("a"), Bytes::from("1")),
            (Bytes::from("b"), Bytes::from("2")),
            (Bytes::from("c"), Bytes::from("3")),
        ]
    );

    // One WAL record holds the whole batch across a restart.
    engine.close().await.unwrap();
    let engine = StorageEngine::open(test_config(dir.path())).await.unwrap();
    assert_eq!(engine.get("b").await.unwrap(), Some(Bytes::from("2")));
    engine.close().await.unwrap();
}

#[tokio::test]
async fn compaction_merges_to_one_table_and_removes_inputs() {
    let dir = tempdir().unwrap();
    let config = Config {
        memtable_size_limit: 512,
        ..test_config(dir.path())
    };
    let engine = StorageEngine::open(config).await.unwrap();

    // Each round's final put crosses the 512-byte limit, so every round
    // produces exactly one flush and leaves the active memtable empty.
    for round in 0..4usize {
        for i in 0..8usize {
            let key = format!("key-{:03}", round * 8 + i);
            engine.put(key, format!("{:050}", round)).await.unwrap();
        }
        wait_for_sstables(&engine, round + 1).await;
    }
    assert_eq!(engine.live_sstable_count().await, 4);

    let before = engine.manifest_state().await;
    let old_paths: Vec<_> = before.sstables.iter().map(|m| m.file_path.clone()).collect();
    assert_eq!(old_paths.len(), 4);

    let new_meta = engine.compact().await.unwrap().expect("a merged table");
    assert_eq!(engine.live_sstable_count().await, 1);
    assert!(new_meta.file_path.exists());
    for path in &old_paths {
        assert!(!path.exists(), "compacted input {path:?} still on disk");
    }

    // Reads are unchanged by compaction.
    for round in 0..4usize {
        let key = format!("key-{:03}", round * 8 + 3);
        assert_eq!(
            engine.get(key).await.unwrap(),
            Some(Bytes::from(format!("{:050}", round)))
        );
    }

    let stats = engine.compaction_stats().snapshot();
    assert_eq!(stats.compactions, 1);
    assert!(!stats.in_progress);

    engine.close().await.unwrap();
}

#[tokio::test]
async fn deletes_shadow_older_layers_through_compaction() {
    let dir = tempdir().unwrap();
    let config = Config {
        memtable_size_limit: 256,
        ..test_config(dir.path())
    };
    let engine = StorageEngine::open(config).await.unwrap();

    for i in 0..20 {
        engine
            .put(format!("item-{i:02}"), format!("{:020}", i))
            .await
            .unwrap();
    }
    wait_for_sstables(&engine, 1).await;

    engine.delete("item-05").await.unwrap();
    assert_eq!(engine.get("item-05").await.unwrap(), None);

    // Push the tombstone into its own table, then merge everything.
    for i in 20..40 {
        engine
            .put(format!("item-{i:02}"), format!("{:020}", i))
            .await
            .unwrap();
    }
    let live = engine.live_sstable_count().await;
    wait_for_sstables(&engine, live.max(2)).await;

    engine.compact().await.unwrap();
    assert_eq!(engine.get("item-05").await.unwrap(), None);

    let all = engine.read_key_range("item-00", "item-99", None).await.unwrap();
    assert!(all.iter().all(|(k, _)| k != "item-05"));

    engine.close().await.unwrap();
}

#[tokio::test]
async fn range_reads_resolve_newest_version_without_tombstones() {
    let dir = tempdir().unwrap();
    let config = Config {
        memtable_size_limit: 256,
        ..test_config(dir.path())
    };
    let engine = StorageEngine::open(config).await.unwrap();

    for i in 0..20 {
        engine
            .put(format!("row-{i:02}"), format!("old-{:015}", i))
            .await
            .unwrap();
    }
    wait_for_sstables(&engine, 1).await;

    // Newer versions land in the memtable layer above the flushed table.
    engine.put("row-03", "fresh").await.unwrap();
    engine.delete("row-04").await.unwrap();

    let range = engine.read_key_range("row-02", "row-05", None).await.unwrap();
    let as_strings: Vec<(String, String)> = range
        .into_iter()
        .map(|(k, v)| {
            (
                String::from_utf8(k.to_vec()).unwrap(),
                String::from_utf8(v.to_vec()).unwrap(),
            )
        })
        .collect();
    assert_eq!(
        as_strings,
        vec![
            ("row-02".to_string(), format!("old-{:015}", 2)),
            ("row-03".to_string(), "fresh".to_string()),
            ("row-05".to_string(), format!("old-{:015}", 5)),
        ]
    );

    // Reversed bounds yield nothing.
    assert!(engine
        .read_key_range("row-09", "row-01", None)
        .await
        .unwrap()
        .is_empty());

    // The limit caps the result in ascending order.
    let limited = engine.read_key_range("row-00", "row-99", Some(2)).await.unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].0, Bytes::from("row-00"));

    engine.close().await.unwrap();
}

#[tokio::test]
async fn corrupt_wal_tail_loses_only_the_torn_record() {
    let dir = tempdir().unwrap();

    {
        let engine = StorageEngine::open(test_config(dir.path())).await.unwrap();
        engine.put("a", "1").await.unwrap();
        engine.put("b", "2").await.unwrap();
        engine.put("c", "3").await.unwrap();
        engine.close().await.unwrap();
    }

    // Flip the last byte of the newest non-empty segment.
    let wal_dir = dir.path().join("wal");
    let mut segments: Vec<_> = std::fs::read_dir(&wal_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.metadata().map(|m| m.len() > 0).unwrap_or(false))
        .collect();
    segments.sort();
    let target = segments.last().expect("a wal segment with data");
    let mut raw = std::fs::read(target).unwrap();
    let len = raw.len();
    raw[len - 1] ^= 0xFF;
    std::fs::write(target, raw).unwrap();

    let engine = StorageEngine::open(test_config(dir.path())).await.unwrap();
    assert_eq!(engine.get("a").await.unwrap(), Some(Bytes::from("1")));
    assert_eq!(engine.get("b").await.unwrap(), Some(Bytes::from("2")));
    assert_eq!(engine.get("c").await.unwrap(), None);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn replay_on_top_of_flushed_sstables_is_idempotent() {
    let dir = tempdir().unwrap();
    let config = Config {
        memtable_size_limit: 256,
        ..test_config(dir.path())
    };

    let records: Vec<LogRecord> = (0..20)
        .map(|i| LogRecord {
            sequence_id: i + 1,
            timestamp_ms: 1000 + i,
            op: Operation::Put {
                key: Bytes::from(format!("dup-{i:02}")),
                value: Bytes::from(format!("{:020}", i)),
            },
        })
        .collect();

    {
        let engine = StorageEngine::open(config.clone()).await.unwrap();
        for record in &records {
            match &record.op {
                Operation::Put { key, value } => {
                    engine.put(key.clone(), value.clone()).await.unwrap()
                }
                _ => unreachable!(),
            }
        }
        wait_for_sstables(&engine, 1).await;
        engine.close().await.unwrap();
    }

    // The crash left a WAL segment whose records are already durable in an
    // SSTable (flush committed, checkpoint never ran).
    let segment = dir.path().join("wal").join("wal-9999999999999.log");
    let mut raw = Vec::new();
    for record in &records {
        raw.extend_from_slice(&encode_frame(record));
    }
    std::fs::write(&segment, raw).unwrap();

    let engine = StorageEngine::open(config).await.unwrap();
    for i in 0..20 {
        assert_eq!(
            engine.get(format!("dup-{i:02}")).await.unwrap(),
            Some(Bytes::from(format!("{:020}", i)))
        );
    }
    engine.close().await.unwrap();
}

#[tokio::test]
async fn closed_engine_rejects_operations() {
    let dir = tempdir().unwrap();
    let engine = StorageEngine::open(test_config(dir.path())).await.unwrap();
    engine.put("k", "v").await.unwrap();
    engine.close().await.unwrap();

    assert!(matches!(
        engine.put("k", "v2").await,
        Err(SiltError::State(_))
    ));
    assert!(matches!(engine.get("k").await, Err(SiltError::State(_))));
    assert!(matches!(engine.close().await, Err(SiltError::State(_))));
}

#[tokio::test]
async fn invalid_arguments_are_rejected() {
    let dir = tempdir().unwrap();
    let engine = StorageEngine::open(test_config(dir.path())).await.unwrap();

    assert!(matches!(
        engine.put("", "value").await,
        Err(SiltError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.delete("").await,
        Err(SiltError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.put(Bytes::from(vec![0xFF, 0xFE]), "value").await,
        Err(SiltError::InvalidArgument(_))
    ));

    // Empty values are legal.
    engine.put("empty", "").await.unwrap();
    assert_eq!(engine.get("empty").await.unwrap(), Some(Bytes::new()));

    engine.close().await.unwrap();
}

#[tokio::test]
async fn group_commit_round_trips() {
    let dir = tempdir().unwrap();
    let config = Config {
        sync_policy: SyncPolicy::Periodic,
        ..test_config(dir.path())
    };

    {
        let engine = StorageEngine::open(config.clone()).await.unwrap();
        let mut handles = Vec::new();
        for i in 0..64 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.put(format!("gc-{i:02}"), format!("v{i}")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        engine.close().await.unwrap();
    }

    let engine = StorageEngine::open(config).await.unwrap();
    for i in 0..64 {
        assert_eq!(
            engine.get(format!("gc-{i:02}")).await.unwrap(),
            Some(Bytes::from(format!("v{i}")))
        );
    }
    engine.close().await.unwrap();
}

#[tokio::test]
async fn replication_reaches_backup_and_survives_backup_restart() {
    let primary_dir = tempdir().unwrap();
    let backup_dir = tempdir().unwrap();

    let backup_engine = StorageEngine::open(test_config(backup_dir.path()))
        .await
        .unwrap();
    let backup = Backup::bind(
        Arc::clone(&backup_engine),
        "127.0.0.1:0".parse().unwrap(),
    )
    .await
    .unwrap();
    let backup_addr = backup.local_addr();

    let primary_engine = StorageEngine::open(test_config(primary_dir.path()))
        .await
        .unwrap();
    let primary = Primary::start(
        primary_engine.commit_stream(),
        backup_addr,
        Duration::from_millis(100),
        Duration::from_millis(500),
    );

    primary_engine.put("x", "1").await.unwrap();
    wait_for_value(&backup_engine, "x", "1").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(primary.metrics().records_replicated >= 1);

    // Kill the backup listener; primary commits must keep succeeding. The
    // record written while the backup is away is dropped, never retried.
    backup.stop().await;
    primary_engine.put("x", "2").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Restart the backup on the same address. Writes made before the
    // primary reconnects are still best-effort, so keep writing until one
    // lands.
    let backup = Backup::bind(Arc::clone(&backup_engine), backup_addr)
        .await
        .unwrap();
    for _ in 0..200 {
        primary_engine.put("x", "3").await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        if backup_engine.get("x").await.unwrap() == Some(Bytes::from("3")) {
            break;
        }
    }
    wait_for_value(&backup_engine, "x", "3").await;

    let metrics = primary.metrics();
    assert!(metrics.failed_attempts >= 1);
    assert!(backup.metrics().records_applied >= 1);

    primary.stop().await;
    backup.stop().await;
    primary_engine.close().await.unwrap();
    backup_engine.close().await.unwrap();
}

async fn wait_for_value(engine: &Arc<StorageEngine>, key: &str, expected: &str) {
    for _ in 0..200 {
        // A new put may still be in flight on the primary.
        if let Ok(Some(value)) = engine.get(key).await {
            if value == Bytes::from(expected.to_string()) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("backup never observed {key}={expected}");
}
