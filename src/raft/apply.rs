//! Per-group apply actor.
//!
//! Committed entries arrive over an mpsc channel strictly in index order and are
//! applied one at a time by a single task that exclusively owns the group's
//! [`MetastorageStateMachine`]. After each entry the waiter registered at that index,
//! if any, is completed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex; // std::sync::Mutex guards are Send (unlike parking_lot)

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::metastorage::{ApplyOutcome, MetastorageStateMachine};
use crate::raft::{LogEntry, ProposalError, RaftGroupEventsDispatcher, RaftGroupEventsListener};

pub type ProposalResult = Result<ApplyOutcome, ProposalError>;

struct Pending {
    term: u64,
    tx: oneshot::Sender<ProposalResult>,
}

/// Waiters for proposals appended by this node, keyed by log index.
#[derive(Default)]
pub struct PendingProposals {
    waiters: Mutex<BTreeMap<u64, Pending>>,
}

impl PendingProposals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in the entry this node is about to append at `index`.
    pub fn register(&self, index: u64, term: u64) -> oneshot::Receiver<ProposalResult> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiters) = self.waiters.lock() {
            // A waiter left behind by an overwritten entry is superseded.
            if let Some(stale) = waiters.insert(index, Pending { term, tx }) {
                let _ = stale.tx.send(Err(ProposalError::NotLeader { leader_hint: None }));
            }
        }
        rx
    }

    /// Drops the waiter at `index` without completing it.
    pub fn cancel(&self, index: u64) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.remove(&index);
        }
    }

    /// Completes the waiter for an applied entry.
    ///
    /// The proposal resolves with the outcome only if the applied entry is the one it
    /// appended (same term), even when this node has lost leadership since. An entry
    /// from another term at that index means the proposal was overwritten.
    pub fn complete(&self, entry: &LogEntry, outcome: ApplyOutcome) {
        let pending = match self.waiters.lock() {
            Ok(mut waiters) => waiters.remove(&entry.index),
            Err(_) => None,
        };

        if let Some(pending) = pending {
            let result = if pending.term == entry.term {
                Ok(outcome)
            } else {
                debug!(
                    index = entry.index,
                    proposed_term = pending.term,
                    applied_term = entry.term,
                    "Proposal superseded by another leader"
                );
                Err(ProposalError::NotLeader { leader_hint: None })
            };
            // The caller may have given up; the entry is applied either way.
            let _ = pending.tx.send(result);
        }
    }

    /// Fails every outstanding waiter with `err`.
    pub fn fail_all(&self, err: ProposalError) {
        let drained = match self.waiters.lock() {
            Ok(mut waiters) => std::mem::take(&mut *waiters),
            Err(_) => BTreeMap::new(),
        };
        for (_, pending) in drained {
            let _ = pending.tx.send(Err(err.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawns the apply actor of one group.
///
/// `applied_tx` publishes the index of the last applied entry. A failure to apply a
/// committed entry aborts the process: this replica has diverged from its peers.
pub fn spawn_apply_loop(
    node_id: u64,
    mut state_machine: MetastorageStateMachine,
    mut entries: mpsc::Receiver<LogEntry>,
    pending: Arc<PendingProposals>,
    dispatcher: Arc<RaftGroupEventsDispatcher>,
    applied_tx: watch::Sender<u64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(group = %dispatcher.group(), node_id, "Apply loop started");

        while let Some(entry) = entries.recv().await {
            let outcome = match state_machine.apply(&entry) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(
                        group = %dispatcher.group(),
                        node_id,
                        index = entry.index,
                        term = entry.term,
                        error = %e,
                        "State machine diverged while applying a committed entry, aborting"
                    );
                    std::process::abort();
                }
            };

            let removed_self = match &outcome {
                ApplyOutcome::MembershipApplied(membership) => {
                    dispatcher.on_new_peers_configuration_applied(&membership.peers);
                    !membership.contains(node_id)
                }
                _ => false,
            };

            pending.complete(&entry, outcome);

            if removed_self {
                info!(group = %dispatcher.group(), node_id, "Node removed from group");
                pending.fail_all(ProposalError::MembershipChanged);
            }

            applied_tx.send_replace(entry.index);
        }

        debug!(group = %dispatcher.group(), node_id, "Apply loop stopped");
    })
}
