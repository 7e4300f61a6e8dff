use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::{GroupId, LogEntry, RaftError, RaftGroup, Result as RaftResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
    /// First index the leader should retry from, 0 if unknown
    pub conflict_index: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Peer messaging for one raft group.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn send_append_entries(
        &self,
        target: u64,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse>;

    async fn send_request_vote(
        &self,
        target: u64,
        req: RequestVoteRequest,
    ) -> RaftResult<RequestVoteResponse>;
}

#[derive(Default)]
struct LocalNetwork {
    nodes: DashMap<u64, Weak<RaftGroup>>,
    isolated: DashSet<u64>,
}

/// In-process transport that delivers requests by calling the target group directly.
///
/// All groups registered on clones of one `LocalTransport` can reach each other.
/// Isolating a node cuts every message to or from it, which is enough to simulate
/// a partitioned leader or a crashed follower.
#[derive(Clone, Default)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: u64, group: &Arc<RaftGroup>) {
        self.network.nodes.insert(node_id, Arc::downgrade(group));
    }

    pub fn deregister(&self, node_id: u64) {
        self.network.nodes.remove(&node_id);
    }

    pub fn isolate(&self, node_id: u64) {
        self.network.isolated.insert(node_id);
    }

    pub fn heal(&self, node_id: u64) {
        self.network.isolated.remove(&node_id);
    }

    fn route(&self, from: u64, target: u64) -> RaftResult<Arc<RaftGroup>> {
        if self.network.isolated.contains(&from) || self.network.isolated.contains(&target) {
            return Err(RaftError::TransportError(format!(
                "Peer {} unreachable from {}",
                target, from
            )));
        }

        self.network
            .nodes
            .get(&target)
            .and_then(|node| node.upgrade())
            .ok_or_else(|| RaftError::TransportError(format!("Peer {} not found", target)))
    }
}

#[async_trait]
impl RaftTransport for LocalTransport {
    async fn send_append_entries(
        &self,
        target: u64,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        let node = self.route(req.leader_id, target)?;
        Ok(node.handle_append_entries(req).await)
    }

    async fn send_request_vote(
        &self,
        target: u64,
        req: RequestVoteRequest,
    ) -> RaftResult<RequestVoteResponse> {
        let node = self.route(req.candidate_id, target)?;
        Ok(node.handle_request_vote(req).await)
    }
}

/// Registry of per-group [`LocalTransport`] networks.
///
/// Every server of one process shares a `LocalCluster`; replicas of the same group
/// find each other through the network registered under that group's name.
#[derive(Clone, Default)]
pub struct LocalCluster {
    networks: Arc<DashMap<GroupId, LocalTransport>>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// The network of `group`, created on first use.
    pub fn transport(&self, group: &GroupId) -> LocalTransport {
        self.networks.entry(group.clone()).or_default().clone()
    }

    /// Cuts `node_id` off in every group.
    pub fn isolate(&self, node_id: u64) {
        for network in self.networks.iter() {
            network.isolate(node_id);
        }
    }

    pub fn heal(&self, node_id: u64) {
        for network in self.networks.iter() {
            network.heal(node_id);
        }
    }
}

/// Transport for testing: acknowledges everything or nothing.
pub struct MockTransport {
    reachable: AtomicBool,
    sent: AtomicUsize,
    /// Requests left before the transport goes down; `usize::MAX` is unlimited.
    budget: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            sent: AtomicUsize::new(0),
            budget: AtomicUsize::new(usize::MAX),
        }
    }

    /// A transport on which every peer is down.
    pub fn unreachable() -> Self {
        let transport = Self::new();
        transport.set_reachable(false);
        transport
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.budget.store(usize::MAX, Ordering::SeqCst);
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delivers the next `requests` requests, then behaves as unreachable.
    pub fn fail_after(&self, requests: usize) {
        self.reachable.store(true, Ordering::SeqCst);
        self.budget.store(requests, Ordering::SeqCst);
    }

    /// Number of requests attempted so far.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    fn check(&self, target: u64) -> RaftResult<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        let delivered = self.reachable.load(Ordering::SeqCst)
            && self
                .budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                    usize::MAX => Some(left),
                    0 => None,
                    left => Some(left - 1),
                })
                .is_ok();
        if delivered {
            Ok(())
        } else {
            Err(RaftError::TransportError(format!("Peer {} unreachable", target)))
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RaftTransport for MockTransport {
    async fn send_append_entries(
        &self,
        target: u64,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        self.check(target)?;
        Ok(AppendEntriesResponse {
            term: req.term,
            success: true,
            match_index: req.prev_log_index + req.entries.len() as u64,
            conflict_index: 0,
        })
    }

    async fn send_request_vote(
        &self,
        target: u64,
        req: RequestVoteRequest,
    ) -> RaftResult<RequestVoteResponse> {
        self.check(target)?;
        Ok(RequestVoteResponse {
            term: req.term,
            vote_granted: true,
        })
    }
}
