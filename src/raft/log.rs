use super::{RaftError, Result as RaftResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

const ENTRY_PREFIX: &[u8] = b"entry:";
const HARD_STATE_KEY: &[u8] = b"hard_state";
const SEED_KEY: &[u8] = b"seed_snapshot";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
    pub entry_type: EntryType,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryType {
    Normal,
    ConfigChange,
}

/// Term, vote and commit index, persisted so a restarted node neither votes twice
/// in a term nor forgets what it has already committed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<u64>,
    pub commit_index: u64,
}

fn entry_key(index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(ENTRY_PREFIX.len() + 8);
    key.extend_from_slice(ENTRY_PREFIX);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Durable raft log on a sled tree.
///
/// Entry keys are big-endian indices under a common prefix, so the tree's ordering is
/// the log's ordering and the last entry is found without any separate metadata.
pub struct RaftLog {
    db: sled::Tree,
    last_index: AtomicU64,
    last_term: AtomicU64,
}

impl RaftLog {
    pub fn new(db: sled::Tree) -> RaftResult<Self> {
        let log = Self {
            db,
            last_index: AtomicU64::new(0),
            last_term: AtomicU64::new(0),
        };

        log.recover()?;
        Ok(log)
    }

    /// Opens a log in a temporary sled database. Used by tests and benches.
    pub fn temporary() -> RaftResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| RaftError::LogError(format!("Open error: {}", e)))?;
        let tree = db
            .open_tree("raft_log")
            .map_err(|e| RaftError::LogError(format!("Open tree error: {}", e)))?;
        Self::new(tree)
    }

    fn recover(&self) -> RaftResult<()> {
        let last = self
            .db
            .scan_prefix(ENTRY_PREFIX)
            .next_back()
            .transpose()
            .map_err(|e| RaftError::LogError(format!("Scan error: {}", e)))?;

        if let Some((_, bytes)) = last {
            let entry = bincode::deserialize::<LogEntry>(&bytes)
                .map_err(|e| RaftError::LogError(format!("Deserialize error: {}", e)))?;
            self.last_index.store(entry.index, Ordering::Release);
            self.last_term.store(entry.term, Ordering::Release);
        }

        Ok(())
    }

    pub fn append(&self, entries: &[LogEntry]) -> RaftResult<()> {
        let last_entry = match entries.last() {
            Some(entry) => entry,
            None => return Ok(()),
        };

        let mut batch = sled::Batch::default();

        for entry in entries {
            let value = bincode::serialize(entry)
                .map_err(|e| RaftError::LogError(format!("Serialize error: {}", e)))?;
            batch.insert(entry_key(entry.index), value);
        }

        self.db
            .apply_batch(batch)
            .map_err(|e| RaftError::LogError(format!("Apply batch error: {}", e)))?;

        self.last_index.store(last_entry.index, Ordering::Release);
        self.last_term.store(last_entry.term, Ordering::Release);

        Ok(())
    }

    pub fn get(&self, index: u64) -> RaftResult<Option<LogEntry>> {
        if index == 0 {
            return Ok(None);
        }

        match self.db.get(entry_key(index)) {
            Ok(Some(bytes)) => {
                let entry = bincode::deserialize::<LogEntry>(&bytes)
                    .map_err(|e| RaftError::LogError(format!("Deserialize error: {}", e)))?;
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(RaftError::LogError(format!("Database error: {}", e))),
        }
    }

    /// Entries in `[start, end)`.
    pub fn get_range(&self, start: u64, end: u64) -> RaftResult<Vec<LogEntry>> {
        let last = self.last_index();
        let start = start.max(1);
        let end = end.min(last + 1);

        let mut entries = Vec::new();
        for index in start..end {
            match self.get(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }

        Ok(entries)
    }

    /// Removes every entry after `index`.
    pub fn truncate_after(&self, index: u64) -> RaftResult<()> {
        let last = self.last_index();

        if index >= last {
            return Ok(());
        }

        let mut batch = sled::Batch::default();
        for i in (index + 1)..=last {
            batch.remove(entry_key(i));
        }

        self.db
            .apply_batch(batch)
            .map_err(|e| RaftError::LogError(format!("Apply batch error: {}", e)))?;

        let new_last_term = self.term_at(index)?.unwrap_or(0);
        self.last_index.store(index, Ordering::Release);
        self.last_term.store(new_last_term, Ordering::Release);

        Ok(())
    }

    pub fn last_index(&self) -> u64 {
        self.last_index.load(Ordering::Acquire)
    }

    pub fn last_term(&self) -> u64 {
        self.last_term.load(Ordering::Acquire)
    }

    pub fn term_at(&self, index: u64) -> RaftResult<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }

        Ok(self.get(index)?.map(|entry| entry.term))
    }

    pub fn has_entry(&self, index: u64, term: u64) -> bool {
        match self.term_at(index) {
            Ok(Some(t)) => t == term,
            _ => false,
        }
    }

    pub fn hard_state(&self) -> RaftResult<HardState> {
        match self.db.get(HARD_STATE_KEY) {
            Ok(Some(bytes)) => bincode::deserialize::<HardState>(&bytes)
                .map_err(|e| RaftError::LogError(format!("Deserialize error: {}", e))),
            Ok(None) => Ok(HardState::default()),
            Err(e) => Err(RaftError::LogError(format!("Database error: {}", e))),
        }
    }

    pub fn save_hard_state(&self, hard_state: &HardState) -> RaftResult<()> {
        let bytes = bincode::serialize(hard_state)
            .map_err(|e| RaftError::LogError(format!("Serialize error: {}", e)))?;
        self.db
            .insert(HARD_STATE_KEY, bytes)
            .map_err(|e| RaftError::LogError(format!("Database error: {}", e)))?;
        Ok(())
    }

    /// Store snapshot the group was created from; entry 1 applies on top of it.
    pub fn seed(&self) -> RaftResult<Option<Vec<u8>>> {
        self.db
            .get(SEED_KEY)
            .map(|bytes| bytes.map(|b| b.to_vec()))
            .map_err(|e| RaftError::LogError(format!("Database error: {}", e)))
    }

    pub fn save_seed(&self, snapshot: &[u8]) -> RaftResult<()> {
        self.db
            .insert(SEED_KEY, snapshot)
            .map_err(|e| RaftError::LogError(format!("Database error: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| RaftError::LogError(format!("Flush error: {}", e)))?;
        Ok(())
    }

    pub async fn flush(&self) -> RaftResult<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| RaftError::LogError(format!("Flush error: {}", e)))?;
        Ok(())
    }
}
