use crate::engine::StorageEngine;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct CompactionStats {
    compactions: AtomicU64,
    entries_kept: AtomicU64,
    entries_dropped: AtomicU64,
    last_run_ms: AtomicU64,
    in_progress: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStatsSnapshot {
    pub compactions: u64,
    pub entries_kept: u64,
    pub entries_dropped: u64,
    pub last_run_ms: u64,
    pub in_progress: bool,
}

impl CompactionStats {
    pub fn record_run(&self, kept: u64, dropped: u64) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.entries_kept.fetch_add(kept, Ordering::Relaxed);
        self.entries_dropped.fetch_add(dropped, Ordering::Relaxed);
        self.last_run_ms.store(crate::unix_millis(), Ordering::Relaxed);
    }

    pub fn set_in_progress(&self, value: bool) {
        self.in_progress.store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CompactionStatsSnapshot {
        CompactionStatsSnapshot {
            compactions: self.compactions.load(Ordering::Relaxed),
            entries_kept: self.entries_kept.load(Ordering::Relaxed),
            entries_dropped: self.entries_dropped.load(Ordering::Relaxed),
            last_run_ms: self.last_run_ms.load(Ordering::Relaxed),
            in_progress: self.in_progress.load(Ordering::Relaxed),
        }
    }
}

/// Background worker that watches the live table count and runs
/// `StorageEngine::compact` when it reaches the configured threshold.
///
/// Holds only a weak engine reference so the engine's lifetime is not
/// extended by its own worker; the loop exits when the engine is gone.
pub struct CompactionWorker {
    handle: JoinHandle<()>,
    trigger: Arc<Notify>,
    shutdown: Arc<Notify>,
}

impl CompactionWorker {
    pub fn start(engine: &Arc<StorageEngine>) -> Self {
        let weak: Weak<StorageEngine> = Arc::downgrade(engine);
        let check_interval = engine.config.compaction_check_interval;
        let threshold = engine.config.compaction_threshold;
        let trigger = Arc::new(Notify::new());
        let shutdown = Arc::new(Notify::new());

        let trigger_rx = Arc::clone(&trigger);
        let shutdown_rx = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            // interval fires immediately; swallow the first tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = trigger_rx.notified() => {}
                    _ = shutdown_rx.notified() => break,
                }

                let Some(engine) = weak.upgrade() else { break };
                if engine.live_sstable_count().await < threshold {
                    continue;
                }
                match engine.compact().await {
                    Ok(_) => {}
                    // The engine is shutting down; the loop ends on stop().
                    Err(crate::error::SiltError::State(_)) => {}
                    Err(e) => tracing::error!(error = %e, "background compaction failed"),
                }
            }
        });

        Self {
            handle,
            trigger,
            shutdown,
        }
    }

    /// Test hook: run a check now instead of waiting for the timer.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}
