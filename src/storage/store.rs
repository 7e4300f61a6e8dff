//! Revision store - the single source of truth for current and historical key state.
//!
//! The store maps every key to its [`KeyHistory`] and tracks the latest applied
//! revision. It is mutated only by the owning group's apply path; every other access
//! (reads, snapshots, compaction checks) goes through a shared read lock and may run
//! concurrently.
//!
//! The store maintains:
//! 1. A `BTreeMap` from key to history, so range reads follow byte ordering
//! 2. The latest applied revision
//!
//! The compaction watermark is owned by [`crate::storage::CompactionManager`], which
//! takes the write lock for the duration of a watermark move so readers never observe
//! a half-trimmed history.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::invoke::Operation;
use crate::storage::{Entry, KeyHistory, Revision, StorageError, StorageResult};

/// Read-only view of key state used while evaluating transaction programs.
pub trait StoreView {
    /// Newest version of `key`, tombstones included.
    fn latest(&self, key: &[u8]) -> Option<&Entry>;

    /// Latest applied revision.
    fn revision(&self) -> Revision;
}

/// Result of writing one batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Live entry of each operation's key right before that operation ran
    pub prev_entries: Vec<Option<Entry>>,

    /// Versions written by the batch, in operation order
    pub written: Vec<Entry>,
}

/// The lock-protected contents of a [`RevisionStore`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreState {
    histories: BTreeMap<Vec<u8>, KeyHistory>,
    revision: Revision,
}

impl StoreView for StoreState {
    fn latest(&self, key: &[u8]) -> Option<&Entry> {
        self.histories.get(key).and_then(KeyHistory::latest)
    }

    fn revision(&self) -> Revision {
        self.revision
    }
}

impl StoreState {
    /// Newest version of `key` visible at `at`, tombstones included.
    pub fn entry_at(&self, key: &[u8], at: Revision) -> Option<&Entry> {
        self.histories.get(key).and_then(|h| h.at(at))
    }

    /// Live (non-tombstone) versions of keys in `[start, end)` visible at `at`.
    ///
    /// An empty `end` means "only `start`".
    pub fn range_at(&self, start: &[u8], end: &[u8], at: Revision) -> Vec<Entry> {
        if end.is_empty() {
            return self
                .entry_at(start, at)
                .filter(|e| !e.is_tombstone())
                .cloned()
                .into_iter()
                .collect();
        }

        if start >= end {
            return Vec::new();
        }

        self.histories
            .range(start.to_vec()..end.to_vec())
            .filter_map(|(_, history)| history.at(at))
            .filter(|e| !e.is_tombstone())
            .cloned()
            .collect()
    }

    /// Writes one batch at `revision`, which must directly follow the current one.
    ///
    /// An empty batch still consumes the revision.
    pub fn apply_batch(
        &mut self,
        revision: Revision,
        operations: &[Operation],
    ) -> StorageResult<BatchOutcome> {
        if revision != self.revision + 1 {
            return Err(StorageError::RevisionGap {
                current: self.revision,
                attempted: revision,
            });
        }

        let mut outcome = BatchOutcome::default();

        for (counter, op) in operations.iter().enumerate() {
            let key = op.key();
            let prev = self
                .latest(key)
                .filter(|e| !e.is_tombstone())
                .cloned();

            let value = match op {
                Operation::Put { value, .. } => Some(value.clone()),
                // Removing an absent key leaves no trace in the history.
                Operation::Remove { .. } if prev.is_none() => {
                    outcome.prev_entries.push(None);
                    continue;
                }
                Operation::Remove { .. } => None,
            };

            let entry = Entry {
                key: key.to_vec(),
                value,
                revision,
                update_counter: counter as u32,
            };

            self.histories
                .entry(key.to_vec())
                .or_default()
                .push(entry.clone())?;

            outcome.prev_entries.push(prev);
            outcome.written.push(entry);
        }

        self.revision = revision;

        debug!(
            revision,
            ops = operations.len(),
            written = outcome.written.len(),
            "Applied batch"
        );

        Ok(outcome)
    }

    /// Trims every history below `watermark`, returning the number of removed versions.
    pub(crate) fn compact(&mut self, watermark: Revision) -> usize {
        let mut removed = 0;
        self.histories.retain(|_, history| {
            removed += history.compact(watermark);
            !history.is_empty()
        });
        removed
    }

    pub fn key_count(&self) -> usize {
        self.histories.len()
    }

    /// Total number of retained versions across all keys.
    pub fn version_count(&self) -> usize {
        self.histories.values().map(KeyHistory::len).sum()
    }

    /// Serializes this state together with `watermark`.
    ///
    /// The caller holds the store lock while loading the watermark, so the pair is
    /// consistent with the history it describes.
    pub fn encode_snapshot(&self, watermark: Revision) -> StorageResult<Vec<u8>> {
        #[derive(Serialize)]
        struct SnapshotRef<'a> {
            state: &'a StoreState,
            watermark: Revision,
        }

        bincode::serialize(&SnapshotRef {
            state: self,
            watermark,
        })
        .map_err(|e| StorageError::Snapshot(e.to_string()))
    }

    /// Decodes a snapshot into a state and its watermark.
    pub fn decode_snapshot(bytes: &[u8]) -> StorageResult<(StoreState, Revision)> {
        let data: SnapshotData =
            bincode::deserialize(bytes).map_err(|e| StorageError::Snapshot(e.to_string()))?;

        if data.watermark > data.state.revision {
            return Err(StorageError::Snapshot(format!(
                "watermark {} is ahead of revision {}",
                data.watermark, data.state.revision
            )));
        }

        Ok((data.state, data.watermark))
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotData {
    state: StoreState,
    watermark: Revision,
}

/// The revision store.
pub struct RevisionStore {
    state: RwLock<StoreState>,
}

impl RevisionStore {
    /// Creates an empty store at revision 0.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(StoreState::default()),
        })
    }

    /// Latest applied revision.
    pub fn current_revision(&self) -> Revision {
        self.state.read().revision
    }

    /// Newest live version of `key`, without any compaction check.
    pub fn latest(&self, key: &[u8]) -> Option<Entry> {
        self.state
            .read()
            .latest(key)
            .filter(|e| !e.is_tombstone())
            .cloned()
    }

    /// Shared read access, used by readers and the compaction guard.
    pub fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read()
    }

    /// Exclusive access, reserved for the apply path and compaction.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write()
    }

    /// Serializes the full state together with the given watermark.
    pub fn snapshot(&self, watermark: Revision) -> StorageResult<Vec<u8>> {
        self.state.read().encode_snapshot(watermark)
    }

    /// Replaces the state with a snapshot, returning the snapshot's watermark.
    pub fn restore(&self, bytes: &[u8]) -> StorageResult<Revision> {
        let (restored, watermark) = StoreState::decode_snapshot(bytes)?;
        let mut state = self.state.write();
        *state = restored;
        log_restored(&state, watermark);
        Ok(watermark)
    }
}

pub(crate) fn log_restored(state: &StoreState, watermark: Revision) {
    info!(
        revision = state.revision,
        watermark,
        keys = state.key_count(),
        "Restored revision store from snapshot"
    );
}
