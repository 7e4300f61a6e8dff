//! The raft-applied state machine of one metastorage group.
//!
//! `apply` is called once per committed log entry, in commit order, by the group's
//! single apply task. A transaction program is evaluated against the store under its
//! write lock and its batch is written at the next revision in the same critical
//! section, so no reader or compaction ever sees the evaluation and the write apart.
//!
//! Any error returned from `apply` means this replica can no longer agree with its
//! peers; the caller treats it as fatal.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::invoke::{ConditionalInvokeEngine, Statement};
use crate::metastorage::{InvokeResult, MetaCommand};
use crate::raft::{GroupId, LogEntry, Membership, PeerId};
use crate::storage::{CompactionManager, RevisionStore, StorageError, StoreView};
use crate::watch::WatchHub;

#[derive(Error, Debug)]
pub enum StateMachineError {
    #[error("Entry {index} applied out of order (last applied {last_applied})")]
    OutOfOrder { index: u64, last_applied: u64 },

    #[error("Committed entry {index} is undecodable: {reason}")]
    Decode { index: u64, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Effect of one applied log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Invoked(InvokeResult),
    MembershipApplied(Membership),
    Noop,
}

pub struct MetastorageStateMachine {
    group: GroupId,
    store: Arc<RevisionStore>,
    compaction: Arc<CompactionManager>,
    engine: ConditionalInvokeEngine,
    watch_hub: Arc<WatchHub>,
    membership: Arc<RwLock<Membership>>,
    last_applied: u64,
}

impl MetastorageStateMachine {
    pub fn new(
        group: GroupId,
        compaction: Arc<CompactionManager>,
        engine: ConditionalInvokeEngine,
        watch_hub: Arc<WatchHub>,
        membership: Arc<RwLock<Membership>>,
    ) -> Self {
        Self {
            group,
            store: compaction.store().clone(),
            compaction,
            engine,
            watch_hub,
            membership,
            last_applied: 0,
        }
    }

    /// Log index of the last applied entry.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn membership(&self) -> Membership {
        self.membership.read().clone()
    }

    pub fn compaction(&self) -> &Arc<CompactionManager> {
        &self.compaction
    }

    pub fn apply(&mut self, entry: &LogEntry) -> Result<ApplyOutcome, StateMachineError> {
        if entry.index != self.last_applied + 1 {
            return Err(StateMachineError::OutOfOrder {
                index: entry.index,
                last_applied: self.last_applied,
            });
        }

        let command = MetaCommand::decode(&entry.data).map_err(|e| StateMachineError::Decode {
            index: entry.index,
            reason: e.to_string(),
        })?;

        let outcome = match command {
            MetaCommand::MultiInvoke(program) => ApplyOutcome::Invoked(self.invoke(&program)?),
            MetaCommand::Reconfigure { peers } => {
                ApplyOutcome::MembershipApplied(self.apply_membership(peers))
            }
            MetaCommand::Noop => ApplyOutcome::Noop,
        };

        self.last_applied = entry.index;
        Ok(outcome)
    }

    fn invoke(&self, program: &Statement) -> Result<InvokeResult, StateMachineError> {
        let (evaluation, revision, outcome) = {
            let mut state = self.store.write();
            let evaluation = self.engine.evaluate(program, &*state);
            let revision = state.revision() + 1;
            let outcome = state.apply_batch(revision, &evaluation.operations)?;
            (evaluation, revision, outcome)
        };

        self.watch_hub.notify(revision, &outcome.written);

        debug!(
            group = %self.group,
            revision,
            branch = ?evaluation.branch,
            ops = evaluation.operations.len(),
            "Applied transaction"
        );

        Ok(InvokeResult {
            revision,
            branch: evaluation.branch,
            result: evaluation.result,
            applied: evaluation.operations,
            prev_entries: outcome.prev_entries,
        })
    }

    fn apply_membership(&self, peers: Vec<PeerId>) -> Membership {
        let mut membership = self.membership.write();
        membership.version += 1;
        membership.peers = peers;

        info!(
            group = %self.group,
            version = membership.version,
            peers = ?membership.node_ids(),
            "Applied membership change"
        );
        membership.clone()
    }
}
