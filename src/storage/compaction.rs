//! Compaction of revision history.
//!
//! [`CompactionManager`] owns the watermark: the lowest revision still guaranteed to be
//! retrievable. Moving the watermark and trimming the history below it happen under
//! the store's write lock, so a concurrent reader sees either the old watermark with
//! the old history or the new watermark with the trimmed history, never a mix.
//!
//! [`Compactor`] is the background maintenance task that requests compactions:
//! - Periodic: every interval, compact everything except the newest N revisions
//! - Revision: compact to a specific revision once

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::storage::store::log_restored;
use crate::storage::{
    Entry, Revision, RevisionStore, StorageError, StorageResult, StoreState, StoreView,
};

/// Reasons a compaction request is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactionError {
    #[error("Compaction to {requested} is below the current watermark {watermark}")]
    BelowWatermark {
        requested: Revision,
        watermark: Revision,
    },

    #[error("Cannot compact to future revision {requested} (latest applied is {latest})")]
    FutureRevision { requested: Revision, latest: Revision },
}

/// Owner of the compaction watermark and guard of historical reads.
pub struct CompactionManager {
    store: Arc<RevisionStore>,
    watermark: AtomicU64,
}

impl CompactionManager {
    pub fn new(store: Arc<RevisionStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            watermark: AtomicU64::new(0),
        })
    }

    /// The current watermark.
    pub fn watermark(&self) -> Revision {
        self.watermark.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<RevisionStore> {
        &self.store
    }

    /// Moves the watermark to exactly `up_to` and trims history below it.
    ///
    /// Rejects (as a logged no-op) a request below the current watermark or above the
    /// latest applied revision. Returns the number of removed versions.
    pub fn compact(&self, up_to: Revision) -> Result<usize, CompactionError> {
        let mut state = self.store.write();
        let watermark = self.watermark();
        let latest = state.revision();

        if up_to < watermark {
            warn!(requested = up_to, watermark, "Rejected compaction below watermark");
            return Err(CompactionError::BelowWatermark {
                requested: up_to,
                watermark,
            });
        }

        if up_to > latest {
            warn!(requested = up_to, latest, "Rejected compaction of future revision");
            return Err(CompactionError::FutureRevision {
                requested: up_to,
                latest,
            });
        }

        Ok(self.advance(&mut state, up_to))
    }

    /// Best-effort compaction used by maintenance tasks.
    ///
    /// The target is clamped to the latest applied revision and requests at or below
    /// the current watermark are ignored, so the resulting watermark is
    /// `max(previous, min(up_to, latest))`. Returns the watermark after the call.
    pub fn request_compaction(&self, up_to: Revision) -> Revision {
        let mut state = self.store.write();
        let watermark = self.watermark();
        let target = up_to.min(state.revision());

        if target <= watermark {
            debug!(
                requested = up_to,
                watermark, "Compaction request does not advance the watermark"
            );
            return watermark;
        }

        self.advance(&mut state, target);
        target
    }

    fn advance(&self, state: &mut StoreState, up_to: Revision) -> usize {
        let previous = self.watermark.swap(up_to, Ordering::SeqCst);
        if previous == up_to {
            return 0;
        }

        let removed = state.compact(up_to);
        info!(
            from = previous,
            to = up_to,
            removed,
            remaining = state.version_count(),
            "Compacted revision history"
        );
        removed
    }

    /// Reads `key` as of `at` (latest when `None`).
    ///
    /// Fails with [`StorageError::Compacted`] below the watermark, never with
    /// [`StorageError::NotFound`].
    pub fn read(&self, key: &[u8], at: Option<Revision>) -> StorageResult<Entry> {
        let state = self.store.read();
        let at = self.check_revision(&state, at)?;

        match state.entry_at(key, at) {
            Some(entry) if !entry.is_tombstone() => Ok(entry.clone()),
            _ => Err(StorageError::NotFound {
                key: key.to_vec(),
                revision: at,
            }),
        }
    }

    /// Reads the live keys in `[start, end)` as of `at` (latest when `None`).
    pub fn range(&self, start: &[u8], end: &[u8], at: Option<Revision>) -> StorageResult<Vec<Entry>> {
        let state = self.store.read();
        let at = self.check_revision(&state, at)?;
        Ok(state.range_at(start, end, at))
    }

    fn check_revision(&self, state: &StoreState, at: Option<Revision>) -> StorageResult<Revision> {
        // Loaded under the store lock: compaction holds the write side while it moves.
        let watermark = self.watermark();
        let latest = state.revision();
        let at = at.unwrap_or(latest);

        if at < watermark {
            return Err(StorageError::Compacted {
                requested: at,
                watermark,
            });
        }

        if at > latest {
            return Err(StorageError::FutureRevision {
                requested: at,
                latest,
            });
        }

        Ok(at)
    }

    /// Serializes the store together with the watermark.
    ///
    /// The watermark is loaded under the read lock, which excludes a concurrent
    /// compaction from trimming the history in between.
    pub fn snapshot(&self) -> StorageResult<Vec<u8>> {
        let state = self.store.read();
        state.encode_snapshot(self.watermark())
    }

    /// Restores the store and the watermark from a snapshot.
    pub fn restore(&self, bytes: &[u8]) -> StorageResult<()> {
        let (restored, watermark) = StoreState::decode_snapshot(bytes)?;
        let mut state = self.store.write();
        *state = restored;
        self.watermark.store(watermark, Ordering::SeqCst);
        log_restored(&state, watermark);
        Ok(())
    }
}

/// Compaction strategy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompactionMode {
    /// Periodically compact at a fixed interval
    Periodic(Duration),

    /// Compact to a specific revision (one-shot)
    Revision(Revision),
}

/// Background compactor that advances the watermark.
pub struct Compactor {
    /// Reference to the compaction manager
    manager: Arc<CompactionManager>,

    /// Compaction mode
    mode: CompactionMode,

    /// For periodic mode: number of newest revisions that are never compacted
    retain_revisions: u64,
}

impl Compactor {
    pub fn new(manager: Arc<CompactionManager>, mode: CompactionMode, retain_revisions: u64) -> Self {
        Self {
            manager,
            mode,
            retain_revisions,
        }
    }

    /// Spawns a background tokio task that performs compaction.
    ///
    /// Returns a JoinHandle that can be awaited or aborted.
    pub fn run(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match self.mode {
                CompactionMode::Periodic(interval_duration) => {
                    self.run_periodic(interval_duration).await;
                }
                CompactionMode::Revision(target_revision) => {
                    self.run_once(target_revision);
                }
            }
        })
    }

    async fn run_periodic(&self, interval_duration: Duration) {
        let mut ticker = interval(interval_duration);

        info!(
            interval = ?interval_duration,
            retain = self.retain_revisions,
            "Starting periodic compactor"
        );

        loop {
            ticker.tick().await;
            self.tick();
        }
    }

    /// One periodic step: compact everything but the newest `retain_revisions`.
    pub fn tick(&self) -> Revision {
        let current_rev = self.manager.store().current_revision();
        let target = current_rev.saturating_sub(self.retain_revisions);
        let watermark = self.manager.watermark();

        if target <= watermark {
            return watermark;
        }

        debug!(
            current_rev,
            watermark, target, "Periodic compaction"
        );
        self.manager.request_compaction(target)
    }

    fn run_once(&self, target_revision: Revision) {
        match self.manager.compact(target_revision) {
            Ok(removed) => {
                info!(target_revision, removed, "One-time compaction completed");
            }
            Err(e) => {
                warn!(target_revision, error = %e, "One-time compaction failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::Operation;

    fn store_with_revisions(n: u64) -> Arc<RevisionStore> {
        let store = RevisionStore::new();
        for rev in 1..=n {
            let value = rev.to_string();
            store
                .write()
                .apply_batch(rev, &[Operation::put(b"key", value.as_bytes())])
                .unwrap();
        }
        store
    }

    #[test]
    fn test_compact_rejects_backwards_and_future() {
        let manager = CompactionManager::new(store_with_revisions(5));

        manager.compact(3).unwrap();
        assert_eq!(manager.watermark(), 3);

        assert_eq!(
            manager.compact(2),
            Err(CompactionError::BelowWatermark {
                requested: 2,
                watermark: 3
            })
        );
        assert_eq!(
            manager.compact(9),
            Err(CompactionError::FutureRevision {
                requested: 9,
                latest: 5
            })
        );
        assert_eq!(manager.watermark(), 3);
    }

    #[test]
    fn test_request_compaction_clamps() {
        let manager = CompactionManager::new(store_with_revisions(5));

        // max(previous, min(w, latest))
        assert_eq!(manager.request_compaction(100), 5);
        assert_eq!(manager.request_compaction(2), 5);
        assert_eq!(manager.watermark(), 5);
    }

    #[test]
    fn test_read_below_watermark_is_compacted_error() {
        let manager = CompactionManager::new(store_with_revisions(10));
        manager.compact(8).unwrap();

        let err = manager.read(b"key", Some(7)).unwrap_err();
        assert_eq!(
            err,
            StorageError::Compacted {
                requested: 7,
                watermark: 8
            }
        );

        // Also for keys that never existed
        let err = manager.read(b"nope", Some(1)).unwrap_err();
        assert!(matches!(err, StorageError::Compacted { watermark: 8, .. }));

        let entry = manager.read(b"key", Some(8)).unwrap();
        assert_eq!(entry.value(), Some(&b"8"[..]));
        let entry = manager.read(b"key", None).unwrap();
        assert_eq!(entry.value(), Some(&b"10"[..]));
    }

    #[test]
    fn test_read_future_and_missing() {
        let manager = CompactionManager::new(store_with_revisions(2));

        assert!(matches!(
            manager.read(b"key", Some(3)),
            Err(StorageError::FutureRevision { requested: 3, latest: 2 })
        ));
        assert!(matches!(
            manager.read(b"other", None),
            Err(StorageError::NotFound { revision: 2, .. })
        ));
    }

    #[test]
    fn test_value_written_before_watermark_survives() {
        let store = RevisionStore::new();
        store
            .write()
            .apply_batch(1, &[Operation::put(b"stable", b"v")])
            .unwrap();
        for rev in 2..=6 {
            store
                .write()
                .apply_batch(rev, &[Operation::put(b"hot", b"x")])
                .unwrap();
        }

        let manager = CompactionManager::new(store);
        manager.compact(5).unwrap();

        assert_eq!(manager.read(b"stable", Some(5)).unwrap().revision, 1);
        assert_eq!(manager.read(b"stable", None).unwrap().revision, 1);
    }

    #[test]
    fn test_concurrent_compact_and_read() {
        let manager = CompactionManager::new(store_with_revisions(10));
        manager.compact(9).unwrap();

        let reader = {
            let manager = manager.clone();
            std::thread::spawn(move || {
                let mut outcomes = Vec::new();
                for _ in 0..1000 {
                    outcomes.push(manager.read(b"key", Some(9)));
                }
                outcomes
            })
        };

        manager.compact(10).unwrap();

        for outcome in reader.join().unwrap() {
            match outcome {
                Ok(entry) => assert_eq!(entry.value(), Some(&b"9"[..])),
                Err(StorageError::Compacted { watermark, .. }) => assert_eq!(watermark, 10),
                Err(other) => panic!("unexpected read outcome: {other}"),
            }
        }
    }

    #[test]
    fn test_snapshot_carries_watermark() {
        let manager = CompactionManager::new(store_with_revisions(4));
        manager.compact(2).unwrap();
        let bytes = manager.snapshot().unwrap();

        let other = CompactionManager::new(RevisionStore::new());
        other.restore(&bytes).unwrap();
        assert_eq!(other.watermark(), 2);
        assert!(matches!(
            other.read(b"key", Some(1)),
            Err(StorageError::Compacted { .. })
        ));
    }

    #[test]
    fn test_snapshot_concurrent_with_compaction() {
        let manager = CompactionManager::new(store_with_revisions(200));

        let compactor = {
            let manager = manager.clone();
            std::thread::spawn(move || {
                for up_to in 1..=200 {
                    manager.compact(up_to).unwrap();
                }
            })
        };

        for _ in 0..200 {
            let bytes = manager.snapshot().unwrap();
            let restored = CompactionManager::new(RevisionStore::new());
            restored.restore(&bytes).unwrap();

            // "key" is written at every revision, so the watermark itself stays readable.
            let watermark = restored.watermark();
            if watermark > 0 {
                let entry = restored.read(b"key", Some(watermark)).unwrap();
                assert_eq!(entry.revision, watermark);
            }
        }

        compactor.join().unwrap();
    }

    #[test]
    fn test_compactor_tick_retains_recent_revisions() {
        let manager = CompactionManager::new(store_with_revisions(10));
        let compactor = Compactor::new(
            manager.clone(),
            CompactionMode::Periodic(Duration::from_secs(60)),
            3,
        );

        assert_eq!(compactor.tick(), 7);
        assert_eq!(manager.watermark(), 7);
        // Nothing new applied: no movement
        assert_eq!(compactor.tick(), 7);
    }

    #[tokio::test]
    async fn test_compactor_one_shot() {
        let manager = CompactionManager::new(store_with_revisions(6));
        let compactor = Compactor::new(manager.clone(), CompactionMode::Revision(4), 0);

        compactor.run().await.unwrap();
        assert_eq!(manager.watermark(), 4);
    }
}
