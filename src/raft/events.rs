//! Group leadership and membership events.
//!
//! The consensus layer reports three kinds of edges to a [`RaftGroupEventsDispatcher`]:
//! a leader was elected, a new peer set was committed and applied, and a
//! reconfiguration attempt failed. The dispatcher fans them out to registered
//! [`RaftGroupEventsListener`]s.
//!
//! Delivery is edge-triggered and best effort. Leader notifications are deduplicated
//! per term, and the two membership callbacks only fire while this node is the leader.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::raft::RaftRole;

/// Name of a raft group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one participant of one group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId {
    pub node_id: u64,
    pub group: GroupId,
}

impl PeerId {
    pub fn new(node_id: u64, group: GroupId) -> Self {
        Self { node_id, group }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.group)
    }
}

/// Versioned, ordered peer set of a group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub version: u64,
    pub peers: Vec<PeerId>,
}

impl Membership {
    pub fn new(group: &GroupId, node_ids: &[u64]) -> Self {
        Self {
            version: 0,
            peers: node_ids
                .iter()
                .map(|&id| PeerId::new(id, group.clone()))
                .collect(),
        }
    }

    pub fn node_ids(&self) -> Vec<u64> {
        self.peers.iter().map(|p| p.node_id).collect()
    }

    pub fn contains(&self, node_id: u64) -> bool {
        self.peers.iter().any(|p| p.node_id == node_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    QuorumLost,
    Timeout,
    NotLeader,
    Busy,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::QuorumLost => write!(f, "QuorumLost"),
            StatusCode::Timeout => write!(f, "Timeout"),
            StatusCode::NotLeader => write!(f, "NotLeader"),
            StatusCode::Busy => write!(f, "Busy"),
        }
    }
}

/// Outcome of a reconfiguration attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupStatus {
    pub code: StatusCode,
    pub detail: String,
}

impl GroupStatus {
    pub fn new(code: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}

/// Receiver of group events.
///
/// Every callback defaults to doing nothing, so implementors override only what they
/// need. Callbacks run on the consensus layer's tasks and must not block.
pub trait RaftGroupEventsListener: Send + Sync {
    /// This node became leader for `term`.
    fn on_leader_elected(&self, _term: u64) {}

    /// A membership change was committed and applied.
    fn on_new_peers_configuration_applied(&self, _peers: &[PeerId]) {}

    /// Moving to `peers` failed during `term`; the previous configuration stays.
    fn on_reconfiguration_error(&self, _status: &GroupStatus, _peers: &[PeerId], _term: u64) {}
}

/// Listener that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopListener;

impl RaftGroupEventsListener for NoopListener {}

pub static NOOP_LISTENER: NoopListener = NoopListener;

pub type ListenerId = u64;

/// Per-group event fan-out with role tracking and a reconfiguration-in-flight flag.
pub struct RaftGroupEventsDispatcher {
    group: GroupId,
    listeners: DashMap<ListenerId, Arc<dyn RaftGroupEventsListener>>,
    next_listener_id: AtomicU64,

    /// Highest term for which `on_leader_elected` was delivered
    last_elected_term: AtomicU64,

    role: RwLock<RaftRole>,
    reconfig_in_flight: AtomicBool,
}

impl RaftGroupEventsDispatcher {
    pub fn new(group: GroupId) -> Self {
        Self {
            group,
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(1),
            last_elected_term: AtomicU64::new(0),
            role: RwLock::new(RaftRole::Follower),
            reconfig_in_flight: AtomicBool::new(false),
        }
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    pub fn register(&self, listener: Arc<dyn RaftGroupEventsListener>) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.insert(id, listener);
        debug!(group = %self.group, listener_id = id, "Registered group events listener");
        id
    }

    pub fn deregister(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn role(&self) -> RaftRole {
        *self.role.read()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == RaftRole::Leader
    }

    /// Records a transition to follower or candidate.
    ///
    /// Losing leadership abandons any in-flight reconfiguration.
    pub fn role_changed(&self, role: RaftRole) {
        let previous = std::mem::replace(&mut *self.role.write(), role);
        if previous != role {
            debug!(group = %self.group, from = %previous, to = %role, "Group role changed");
        }
        if role != RaftRole::Leader {
            self.reconfig_in_flight.store(false, Ordering::SeqCst);
        }
    }

    /// Marks a reconfiguration as started. Returns false if this node is not the
    /// leader or another reconfiguration is already in flight.
    pub fn begin_reconfiguration(&self) -> bool {
        if !self.is_leader() {
            return false;
        }
        self.reconfig_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Clears the in-flight flag without notifying anyone.
    pub fn finish_reconfiguration(&self) {
        self.reconfig_in_flight.store(false, Ordering::SeqCst);
    }

    pub fn reconfiguration_in_flight(&self) -> bool {
        self.reconfig_in_flight.load(Ordering::SeqCst)
    }

    // Collected up front so listeners may (de)register from inside a callback.
    fn snapshot_listeners(&self) -> Vec<Arc<dyn RaftGroupEventsListener>> {
        self.listeners.iter().map(|l| l.value().clone()).collect()
    }
}

impl RaftGroupEventsListener for RaftGroupEventsDispatcher {
    fn on_leader_elected(&self, term: u64) {
        *self.role.write() = RaftRole::Leader;

        let previous = self.last_elected_term.fetch_max(term, Ordering::AcqRel);
        if previous >= term {
            debug!(group = %self.group, term, "Duplicate leader notification ignored");
            return;
        }

        info!(group = %self.group, term, "Elected group leader");
        for listener in self.snapshot_listeners() {
            listener.on_leader_elected(term);
        }
    }

    fn on_new_peers_configuration_applied(&self, peers: &[PeerId]) {
        self.reconfig_in_flight.store(false, Ordering::SeqCst);
        if !self.is_leader() {
            return;
        }

        info!(group = %self.group, peers = peers.len(), "New peers configuration applied");
        for listener in self.snapshot_listeners() {
            listener.on_new_peers_configuration_applied(peers);
        }
    }

    fn on_reconfiguration_error(&self, status: &GroupStatus, peers: &[PeerId], term: u64) {
        self.reconfig_in_flight.store(false, Ordering::SeqCst);
        if !self.is_leader() {
            return;
        }

        warn!(group = %self.group, term, status = %status, "Reconfiguration failed");
        for listener in self.snapshot_listeners() {
            listener.on_reconfiguration_error(status, peers, term);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        elected: Mutex<Vec<u64>>,
        applied: Mutex<Vec<Vec<PeerId>>>,
        errors: Mutex<Vec<(StatusCode, u64)>>,
    }

    impl RaftGroupEventsListener for Recorder {
        fn on_leader_elected(&self, term: u64) {
            self.elected.lock().push(term);
        }

        fn on_new_peers_configuration_applied(&self, peers: &[PeerId]) {
            self.applied.lock().push(peers.to_vec());
        }

        fn on_reconfiguration_error(&self, status: &GroupStatus, _peers: &[PeerId], term: u64) {
            self.errors.lock().push((status.code, term));
        }
    }

    fn dispatcher_with_recorder() -> (RaftGroupEventsDispatcher, Arc<Recorder>) {
        let dispatcher = RaftGroupEventsDispatcher::new(GroupId::new("meta"));
        let recorder = Arc::new(Recorder::default());
        dispatcher.register(recorder.clone());
        (dispatcher, recorder)
    }

    #[test]
    fn test_leader_elected_deduplicated_per_term() {
        let (dispatcher, recorder) = dispatcher_with_recorder();

        dispatcher.on_leader_elected(5);
        dispatcher.on_leader_elected(5);
        assert_eq!(*recorder.elected.lock(), vec![5]);

        // Stale term after a newer one is also a duplicate.
        dispatcher.on_leader_elected(6);
        dispatcher.on_leader_elected(4);
        assert_eq!(*recorder.elected.lock(), vec![5, 6]);
    }

    #[test]
    fn test_first_leader_of_group_is_reported() {
        let (dispatcher, recorder) = dispatcher_with_recorder();
        dispatcher.on_leader_elected(1);
        assert_eq!(*recorder.elected.lock(), vec![1]);
        assert!(dispatcher.is_leader());
    }

    #[test]
    fn test_membership_events_only_on_leader() {
        let (dispatcher, recorder) = dispatcher_with_recorder();
        let group = GroupId::new("meta");
        let peers = vec![PeerId::new(1, group.clone()), PeerId::new(2, group)];
        let status = GroupStatus::new(StatusCode::QuorumLost, "no quorum");

        dispatcher.on_new_peers_configuration_applied(&peers);
        dispatcher.on_reconfiguration_error(&status, &peers, 1);
        assert!(recorder.applied.lock().is_empty());
        assert!(recorder.errors.lock().is_empty());

        dispatcher.on_leader_elected(2);
        dispatcher.on_new_peers_configuration_applied(&peers);
        dispatcher.on_reconfiguration_error(&status, &peers, 2);
        assert_eq!(recorder.applied.lock().len(), 1);
        assert_eq!(*recorder.errors.lock(), vec![(StatusCode::QuorumLost, 2)]);
    }

    #[test]
    fn test_reconfiguration_flag() {
        let dispatcher = RaftGroupEventsDispatcher::new(GroupId::new("meta"));
        assert!(!dispatcher.begin_reconfiguration());

        dispatcher.on_leader_elected(1);
        assert!(dispatcher.begin_reconfiguration());
        assert!(!dispatcher.begin_reconfiguration());

        dispatcher.role_changed(RaftRole::Follower);
        assert!(!dispatcher.reconfiguration_in_flight());
    }

    #[test]
    fn test_deregister_and_noop_listener() {
        let (dispatcher, recorder) = dispatcher_with_recorder();
        let noop_id = dispatcher.register(Arc::new(NoopListener));
        assert_eq!(dispatcher.listener_count(), 2);

        assert!(dispatcher.deregister(noop_id));
        assert!(!dispatcher.deregister(noop_id));

        dispatcher.on_leader_elected(3);
        assert_eq!(*recorder.elected.lock(), vec![3]);

        NOOP_LISTENER.on_leader_elected(3);
        NOOP_LISTENER.on_reconfiguration_error(
            &GroupStatus::new(StatusCode::Timeout, "slow"),
            &[],
            3,
        );
    }
}
