//! Watch hub for revision subscriptions.
//!
//! Every applied revision is published here by the owning group's apply path:
//! - range watchers get the mutations of that revision that fall inside their range
//! - `subscribe_revisions` receivers observe the latest applied revision
//!
//! Delivery to range watchers is non-blocking. A watcher whose channel is full misses
//! the event and a warning is logged; callers that cannot tolerate gaps should re-read
//! from the store at the revision they last saw.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::storage::{Entry, Revision};

/// Watch-related errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("Watch not found: {0}")]
    WatchNotFound(u64),

    #[error("Invalid watch configuration: {0}")]
    InvalidConfig(String),
}

pub type WatchResult<T> = Result<T, WatchError>;

/// A key, or a key range, to watch.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct WatchRange {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
}

impl WatchRange {
    /// Watches exactly one key.
    pub fn key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            range_end: Vec::new(),
        }
    }

    /// Watches `[key, range_end)`.
    pub fn range(key: impl Into<Vec<u8>>, range_end: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            range_end: range_end.into(),
        }
    }

    /// Check if a key falls within this watch range.
    pub fn contains(&self, key: &[u8]) -> bool {
        if key < &self.key[..] {
            return false;
        }

        if self.range_end.is_empty() {
            key == &self.key[..]
        } else if &self.range_end[..] == b"\0" {
            // "\0" means every key >= key
            true
        } else {
            key < &self.range_end[..]
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single mutation seen by a watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub entry: Entry,
}

impl From<&Entry> for Event {
    fn from(entry: &Entry) -> Self {
        let kind = if entry.is_tombstone() {
            EventKind::Delete
        } else {
            EventKind::Put
        };
        Self {
            kind,
            entry: entry.clone(),
        }
    }
}

/// All mutations of one revision that matched a watcher.
#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub watch_id: u64,
    pub revision: Revision,
    pub events: Vec<Event>,
}

struct Watcher {
    range: WatchRange,
    start_revision: Revision,
    tx: mpsc::Sender<WatchEvent>,
    canceled: AtomicBool,
}

/// The Watch hub manages all active watchers and dispatches events.
pub struct WatchHub {
    watchers: DashMap<u64, Arc<Watcher>>,

    next_watch_id: AtomicU64,

    /// Latest applied revision
    revision_tx: watch::Sender<Revision>,
}

impl WatchHub {
    pub fn new() -> Arc<Self> {
        let (revision_tx, _) = watch::channel(0);

        Arc::new(WatchHub {
            watchers: DashMap::new(),
            next_watch_id: AtomicU64::new(1),
            revision_tx,
        })
    }

    /// Creates a new watch and returns the watch ID.
    ///
    /// Mutations at revisions below `start_revision` are not delivered.
    pub fn create_watch(
        &self,
        range: WatchRange,
        start_revision: Revision,
        tx: mpsc::Sender<WatchEvent>,
    ) -> WatchResult<u64> {
        if range.key.is_empty() {
            return Err(WatchError::InvalidConfig(
                "Watch key cannot be empty".to_string(),
            ));
        }

        let watch_id = self.next_watch_id.fetch_add(1, Ordering::SeqCst);

        self.watchers.insert(
            watch_id,
            Arc::new(Watcher {
                range,
                start_revision,
                tx,
                canceled: AtomicBool::new(false),
            }),
        );

        debug!(watch_id, start_revision, "Watch created");
        Ok(watch_id)
    }

    pub fn cancel_watch(&self, watch_id: u64) -> WatchResult<()> {
        match self.watchers.remove(&watch_id) {
            Some((_, watcher)) => {
                watcher.canceled.store(true, Ordering::SeqCst);
                debug!(watch_id, "Watch canceled");
                Ok(())
            }
            None => Err(WatchError::WatchNotFound(watch_id)),
        }
    }

    /// Publishes an applied revision and the versions it wrote.
    ///
    /// Called once per applied batch, including batches that wrote nothing.
    pub fn notify(&self, revision: Revision, written: &[Entry]) {
        self.revision_tx.send_replace(revision);

        if written.is_empty() {
            return;
        }

        // Snapshot the registry so no shard lock is held during delivery.
        let watchers: Vec<(u64, Arc<Watcher>)> = self
            .watchers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (watch_id, watcher) in watchers {
            if watcher.tx.is_closed() {
                self.drop_closed(watch_id);
                continue;
            }
            if watcher.canceled.load(Ordering::SeqCst) || revision < watcher.start_revision {
                continue;
            }

            let events: Vec<Event> = written
                .iter()
                .filter(|e| watcher.range.contains(&e.key))
                .map(Event::from)
                .collect();

            if events.is_empty() {
                continue;
            }

            let watch_event = WatchEvent {
                watch_id,
                revision,
                events,
            };

            match watcher.tx.try_send(watch_event) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => self.drop_closed(watch_id),
                Err(e) => warn!(watch_id, revision, error = %e, "Failed to send watch event"),
            }
        }
    }

    fn drop_closed(&self, watch_id: u64) {
        if self.watchers.remove(&watch_id).is_some() {
            debug!(watch_id, "Watch receiver dropped, removing watcher");
        }
    }

    /// Receiver that always holds the latest applied revision.
    pub fn subscribe_revisions(&self) -> watch::Receiver<Revision> {
        self.revision_tx.subscribe()
    }

    pub fn current_revision(&self) -> Revision {
        *self.revision_tx.borrow()
    }

    /// Returns the number of active watchers.
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}
