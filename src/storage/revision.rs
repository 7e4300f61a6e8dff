//! Per-key revision history.
//!
//! Each key owns a [`KeyHistory`]: an append-only list of [`Entry`] values ordered by
//! `(revision, update_counter)`. A deletion appends a tombstone rather than removing
//! anything, so a read at any retained revision can tell "never existed" apart from
//! "deleted at revision N".
//!
//! Key design:
//! - Lookups of "key at revision N" are a binary search over the history
//! - History is only ever trimmed from the front, by compaction
//! - The newest entry at or below the watermark survives compaction so reads at the
//!   watermark still see the key's value

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::{StorageError, StorageResult};

/// A strictly increasing counter assigned once per applied batch.
///
/// Revision 0 denotes the empty store; the first applied batch is revision 1.
pub type Revision = u64;

/// A single version of a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// The key this version belongs to
    pub key: Vec<u8>,

    /// The value, or `None` for a tombstone
    pub value: Option<Vec<u8>>,

    /// Revision of the batch that wrote this version
    pub revision: Revision,

    /// Position of the mutation within its batch
    pub update_counter: u32,
}

impl Entry {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

/// Append-only history of one key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHistory {
    entries: Vec<Entry>,
}

impl KeyHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new version. The version must sort after every retained one.
    pub fn push(&mut self, entry: Entry) -> StorageResult<()> {
        if let Some(last) = self.entries.last() {
            if (entry.revision, entry.update_counter) <= (last.revision, last.update_counter) {
                return Err(StorageError::HistoryRewrite {
                    key: entry.key,
                    last: last.revision,
                    attempted: entry.revision,
                });
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Returns the newest version with `revision <= at`, tombstones included.
    pub fn at(&self, at: Revision) -> Option<&Entry> {
        let idx = self.entries.partition_point(|e| e.revision <= at);
        if idx == 0 {
            None
        } else {
            self.entries.get(idx - 1)
        }
    }

    /// Returns the newest version, tombstones included.
    pub fn latest(&self) -> Option<&Entry> {
        self.entries.last()
    }

    /// Drops every version that is no longer visible at or above `watermark`.
    ///
    /// The newest version at or below the watermark is kept unless it is a tombstone,
    /// in which case nothing below the watermark is visible and it goes too.
    /// Returns the number of removed versions.
    pub fn compact(&mut self, watermark: Revision) -> usize {
        let visible = self.entries.partition_point(|e| e.revision <= watermark);
        if visible == 0 {
            return 0;
        }

        let keep_from = match self.entries.get(visible - 1) {
            Some(e) if e.is_tombstone() => visible,
            _ => visible - 1,
        };

        if keep_from > 0 {
            self.entries.drain(..keep_from);
            debug!(
                removed = keep_from,
                watermark, "Compacted key history"
            );
        }
        keep_from
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &[u8], value: &[u8], revision: Revision) -> Entry {
        Entry {
            key: key.to_vec(),
            value: Some(value.to_vec()),
            revision,
            update_counter: 0,
        }
    }

    fn tombstone(key: &[u8], revision: Revision) -> Entry {
        Entry {
            key: key.to_vec(),
            value: None,
            revision,
            update_counter: 0,
        }
    }

    #[test]
    fn test_at_returns_newest_not_after_revision() {
        let mut history = KeyHistory::new();
        history.push(put(b"k", b"v1", 1)).unwrap();
        history.push(put(b"k", b"v3", 3)).unwrap();

        assert!(history.at(0).is_none());
        assert_eq!(history.at(1).unwrap().value(), Some(&b"v1"[..]));
        assert_eq!(history.at(2).unwrap().value(), Some(&b"v1"[..]));
        assert_eq!(history.at(5).unwrap().value(), Some(&b"v3"[..]));
    }

    #[test]
    fn test_push_rejects_rewrite() {
        let mut history = KeyHistory::new();
        history.push(put(b"k", b"v", 4)).unwrap();

        let err = history.push(put(b"k", b"old", 2)).unwrap_err();
        assert!(matches!(err, StorageError::HistoryRewrite { last: 4, attempted: 2, .. }));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_same_revision_ordered_by_update_counter() {
        let mut history = KeyHistory::new();
        history.push(put(b"k", b"first", 2)).unwrap();
        let mut second = put(b"k", b"second", 2);
        second.update_counter = 1;
        history.push(second).unwrap();

        assert_eq!(history.at(2).unwrap().value(), Some(&b"second"[..]));
    }

    #[test]
    fn test_tombstone_visible_until_compacted() {
        let mut history = KeyHistory::new();
        history.push(put(b"k", b"v", 1)).unwrap();
        history.push(tombstone(b"k", 2)).unwrap();

        assert!(history.at(2).unwrap().is_tombstone());
        assert!(!history.at(1).unwrap().is_tombstone());

        assert_eq!(history.compact(3), 2);
        assert!(history.is_empty());
    }

    #[test]
    fn test_compact_keeps_value_visible_at_watermark() {
        let mut history = KeyHistory::new();
        history.push(put(b"k", b"v1", 1)).unwrap();
        history.push(put(b"k", b"v3", 3)).unwrap();
        history.push(put(b"k", b"v7", 7)).unwrap();

        assert_eq!(history.compact(5), 1);
        assert_eq!(history.len(), 2);
        assert_eq!(history.at(5).unwrap().value(), Some(&b"v3"[..]));
        assert_eq!(history.at(7).unwrap().value(), Some(&b"v7"[..]));
    }
}
