use std::time::Duration;

use crate::invoke::DEFAULT_MAX_DEPTH;
use crate::raft::GroupId;

#[derive(Clone, Debug)]
pub struct GroupConfig {
    pub group: GroupId,
    pub node_id: u64,
    /// Initial voters, including this node
    pub peers: Vec<u64>,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
    pub proposal_timeout: Duration,
    pub max_log_entries_per_request: usize,
    pub max_program_depth: usize,
    pub apply_channel_capacity: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            group: GroupId::new("metastorage"),
            node_id: 1,
            peers: vec![1],
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_millis(500),
            proposal_timeout: Duration::from_secs(5),
            max_log_entries_per_request: 100,
            max_program_depth: DEFAULT_MAX_DEPTH,
            apply_channel_capacity: 1024,
        }
    }
}

impl GroupConfig {
    pub fn new(group: GroupId, node_id: u64, peers: Vec<u64>) -> Self {
        Self {
            group,
            node_id,
            peers,
            ..Default::default()
        }
    }

    pub fn with_timeouts(
        mut self,
        election_min: Duration,
        election_max: Duration,
        heartbeat: Duration,
    ) -> Self {
        self.election_timeout_min = election_min;
        self.election_timeout_max = election_max;
        self.heartbeat_interval = heartbeat;
        self
    }

    pub fn with_proposal_timeout(mut self, timeout: Duration) -> Self {
        self.proposal_timeout = timeout;
        self
    }

    pub fn validate(&self) -> super::Result<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(super::RaftError::ConfigError(
                "election_timeout_min must be less than election_timeout_max".to_string(),
            ));
        }

        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(super::RaftError::ConfigError(
                "heartbeat_interval must be less than election_timeout_min".to_string(),
            ));
        }

        if self.max_log_entries_per_request == 0 {
            return Err(super::RaftError::ConfigError(
                "max_log_entries_per_request must be greater than 0".to_string(),
            ));
        }

        if self.apply_channel_capacity == 0 {
            return Err(super::RaftError::ConfigError(
                "apply_channel_capacity must be greater than 0".to_string(),
            ));
        }

        if !self.peers.contains(&self.node_id) {
            return Err(super::RaftError::ConfigError(format!(
                "initial peers must include node {}",
                self.node_id
            )));
        }

        Ok(())
    }
}
