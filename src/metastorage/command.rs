//! Log entry payloads and apply results.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::invoke::{Operation, Statement};
use crate::raft::{EntryType, PeerId};
use crate::storage::{Entry, Revision};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Failed to encode command: {0}")]
    Encode(String),

    #[error("Failed to decode command: {0}")]
    Decode(String),
}

/// What a committed log entry asks the state machine to do.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaCommand {
    /// Evaluate a transaction program and apply the selected branch.
    MultiInvoke(Statement),

    /// Replace the group's peer set.
    Reconfigure { peers: Vec<PeerId> },

    /// Appended by every new leader to commit entries of earlier terms.
    Noop,
}

impl MetaCommand {
    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        bincode::serialize(self).map_err(|e| CommandError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        bincode::deserialize(bytes).map_err(|e| CommandError::Decode(e.to_string()))
    }

    pub fn entry_type(&self) -> EntryType {
        match self {
            MetaCommand::Reconfigure { .. } => EntryType::ConfigChange,
            MetaCommand::MultiInvoke(_) | MetaCommand::Noop => EntryType::Normal,
        }
    }
}

/// Result of applying one transaction program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvokeResult {
    /// Revision assigned to the batch
    pub revision: Revision,

    /// Branch taken at each nesting level, `true` for success
    pub branch: Vec<bool>,

    /// Result tag of the terminal that ran
    pub result: Vec<u8>,

    /// Operations applied, in order
    pub applied: Vec<Operation>,

    /// Live entry of each applied operation's key right before that operation
    pub prev_entries: Vec<Option<Entry>>,
}

impl InvokeResult {
    /// Whether the root condition held. Unconditional programs count as success.
    pub fn succeeded(&self) -> bool {
        self.branch.first().copied().unwrap_or(true)
    }
}
