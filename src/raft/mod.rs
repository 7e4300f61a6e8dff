pub mod apply;
pub mod config;
pub mod events;
pub mod log;
pub mod node;
pub mod state;
pub mod transport;

pub use config::GroupConfig;
pub use events::{
    GroupId, GroupStatus, ListenerId, Membership, NoopListener, PeerId, RaftGroupEventsDispatcher,
    RaftGroupEventsListener, StatusCode, NOOP_LISTENER,
};
pub use log::{EntryType, HardState, LogEntry, RaftLog};
pub use node::RaftGroup;
pub use state::{RaftRole, RaftState};
pub use transport::{
    AppendEntriesRequest, AppendEntriesResponse, LocalCluster, LocalTransport, MockTransport, RaftTransport,
    RequestVoteRequest, RequestVoteResponse,
};

use thiserror::Error;

use crate::invoke::InvokeError;

#[derive(Debug)]
pub enum RaftError {
    LogError(String),
    TransportError(String),
    ConfigError(String),
    ApplyError(String),
    NotLeader,
}

impl std::fmt::Display for RaftError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftError::LogError(msg) => write!(f, "Log error: {}", msg),
            RaftError::TransportError(msg) => write!(f, "Transport error: {}", msg),
            RaftError::ConfigError(msg) => write!(f, "Config error: {}", msg),
            RaftError::ApplyError(msg) => write!(f, "Apply error: {}", msg),
            RaftError::NotLeader => write!(f, "Not a leader"),
        }
    }
}

impl std::error::Error for RaftError {}

pub type Result<T> = std::result::Result<T, RaftError>;

/// Failure of a proposal, a linearizable read, or a reconfiguration.
///
/// Every variant except `Malformed` is transient: the caller re-resolves the leader
/// and retries with an idempotent or condition-guarded program.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProposalError {
    #[error("Not the group leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },

    #[error("Proposal timed out")]
    Timeout,

    #[error("Group membership changed while the proposal was pending")]
    MembershipChanged,

    #[error(transparent)]
    Malformed(#[from] InvokeError),

    #[error("Reconfiguration failed: {0}")]
    Reconfiguration(GroupStatus),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RaftError> for ProposalError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader => ProposalError::NotLeader { leader_hint: None },
            other => ProposalError::Internal(other.to_string()),
        }
    }
}
