use crate::invoke::{ConditionalInvokeEngine, InvokeError, Statement};
use crate::metastorage::{ApplyOutcome, InvokeResult, MetaCommand, MetastorageStateMachine};
use crate::raft::apply::{spawn_apply_loop, PendingProposals, ProposalResult};
use crate::raft::config::GroupConfig;
use crate::raft::events::{
    GroupId, GroupStatus, Membership, PeerId, RaftGroupEventsDispatcher, RaftGroupEventsListener,
    StatusCode,
};
use crate::raft::log::{HardState, LogEntry, RaftLog};
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::transport::{
    AppendEntriesRequest, AppendEntriesResponse, RaftTransport, RequestVoteRequest,
    RequestVoteResponse,
};
use crate::raft::{ProposalError, RaftError, Result as RaftResult};
use crate::storage::{CompactionManager, RevisionStore};
use crate::watch::WatchHub;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex; // std::sync::Mutex guards are Send (unlike parking_lot)
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// AppendEntries round trips per peer in one replication pass.
const MAX_CATCH_UP_ROUNDS: usize = 16;

/// One replica of a raft group and its metastorage state machine.
pub struct RaftGroup {
    config: Arc<GroupConfig>,
    state: Arc<RaftState>,
    log: Arc<RaftLog>,
    transport: Arc<dyn RaftTransport>,
    dispatcher: Arc<RaftGroupEventsDispatcher>,
    engine: ConditionalInvokeEngine,
    compaction: Arc<CompactionManager>,
    watch_hub: Arc<WatchHub>,
    membership: Arc<RwLock<Membership>>,

    /// Target voters of an in-flight reconfiguration. While set, elections and
    /// commits need a majority of both the current and the target peer set.
    joint_peers: RwLock<Option<Vec<u64>>>,

    pending: Arc<PendingProposals>,
    apply_tx: mpsc::Sender<LogEntry>,
    applied_rx: watch::Receiver<u64>,
    apply_handle: Mutex<Option<JoinHandle<()>>>,

    /// Serializes writers of the log: leader appends, follower appends, votes
    sequencer: tokio::sync::Mutex<()>,

    /// Highest index handed to the apply loop
    dispatched: tokio::sync::Mutex<u64>,

    // Timers - use std::sync::Mutex (Send-safe guards, unlike parking_lot)
    election_timer: Mutex<Option<Instant>>,
    heartbeat_timer: Mutex<Option<Instant>>,

    /// Last time an AppendEntries from a current leader was accepted
    leader_contact: Mutex<Option<Instant>>,
}

impl RaftGroup {
    /// Starts a replica on `log`, replaying every entry it had already committed.
    ///
    /// A group whose only voter is this node elects itself immediately.
    pub async fn start(
        config: GroupConfig,
        log: RaftLog,
        transport: Arc<dyn RaftTransport>,
    ) -> RaftResult<Arc<Self>> {
        Self::start_with_seed(config, log, transport, None).await
    }

    /// Like [`RaftGroup::start`], but first restores the store from a snapshot taken
    /// from another group. The log is then applied on top of the seeded revision.
    pub async fn start_with_seed(
        config: GroupConfig,
        log: RaftLog,
        transport: Arc<dyn RaftTransport>,
        seed: Option<&[u8]>,
    ) -> RaftResult<Arc<Self>> {
        config.validate()?;

        let config = Arc::new(config);
        let log = Arc::new(log);

        let hard_state = log.hard_state()?;
        let state = Arc::new(RaftState::new());
        state.restore(
            hard_state.term,
            hard_state.voted_for,
            hard_state.commit_index.min(log.last_index()),
        );

        // A persisted seed wins over the argument: the log replays on top of it.
        let compaction = CompactionManager::new(RevisionStore::new());
        let (seed, fresh_seed) = match (log.seed()?, seed) {
            (Some(stored), _) => (Some(stored), false),
            (None, Some(_)) if log.last_index() > 0 => {
                return Err(RaftError::ConfigError(format!(
                    "group {} already has log entries and cannot be seeded",
                    config.group
                )));
            }
            (None, Some(bytes)) => (Some(bytes.to_vec()), true),
            (None, None) => (None, false),
        };
        if let Some(bytes) = &seed {
            compaction
                .restore(bytes)
                .map_err(|e| RaftError::ApplyError(e.to_string()))?;
            if fresh_seed {
                log.save_seed(bytes)?;
            }
        }

        let watch_hub = WatchHub::new();
        let membership = Arc::new(RwLock::new(Membership::new(&config.group, &config.peers)));
        let dispatcher = Arc::new(RaftGroupEventsDispatcher::new(config.group.clone()));
        let engine = ConditionalInvokeEngine::new(config.max_program_depth);
        let pending = Arc::new(PendingProposals::new());

        let state_machine = MetastorageStateMachine::new(
            config.group.clone(),
            compaction.clone(),
            engine,
            watch_hub.clone(),
            membership.clone(),
        );
        let (apply_tx, apply_rx) = mpsc::channel(config.apply_channel_capacity);
        let (applied_tx, applied_rx) = watch::channel(0);
        let apply_handle = spawn_apply_loop(
            config.node_id,
            state_machine,
            apply_rx,
            pending.clone(),
            dispatcher.clone(),
            applied_tx,
        );

        let group = Arc::new(Self {
            election_timer: Mutex::new(Some(Instant::now() + random_election_timeout(&config))),
            heartbeat_timer: Mutex::new(None),
            leader_contact: Mutex::new(None),
            config,
            state,
            log,
            transport,
            dispatcher,
            engine,
            compaction,
            watch_hub,
            membership,
            joint_peers: RwLock::new(None),
            pending,
            apply_tx,
            applied_rx,
            apply_handle: Mutex::new(Some(apply_handle)),
            sequencer: tokio::sync::Mutex::new(()),
            dispatched: tokio::sync::Mutex::new(0),
        });

        let commit_index = group.state.commit_index();
        info!(
            group = %group.config.group,
            node_id = group.config.node_id,
            term = group.state.term(),
            last_index = group.log.last_index(),
            commit_index,
            "Raft group started"
        );

        // Replay, and let membership changes in the log take effect before deciding
        // whether this node is a single-voter group.
        group.dispatch_committed().await?;
        let deadline = Instant::now() + group.config.proposal_timeout;
        group
            .wait_applied(commit_index, deadline)
            .await
            .map_err(|e| RaftError::ApplyError(format!("Log replay failed: {}", e)))?;

        let single_voter = group.membership.read().node_ids() == vec![group.config.node_id];
        if single_voter {
            group.campaign().await?;
        }

        Ok(group)
    }

    /// Runs an election for the next term.
    pub async fn campaign(self: &Arc<Self>) -> RaftResult<()> {
        if self.state.is_leader() {
            return Ok(());
        }

        let self_id = self.config.node_id;
        let voters = self.voters();
        if !voters.contains(&self_id) {
            debug!(group = %self.config.group, node_id = self_id, "Not a voter, skipping election");
            return Ok(());
        }

        let term = self.state.become_candidate(self_id);
        self.dispatcher.role_changed(RaftRole::Candidate);
        self.persist_hard_state()?;
        self.reset_election_timer();

        let mut granted: HashSet<u64> = HashSet::from([self_id]);
        if !self.has_quorum(&granted) {
            let request = RequestVoteRequest {
                term,
                candidate_id: self_id,
                last_log_index: self.log.last_index(),
                last_log_term: self.log.last_term(),
            };

            let peers: Vec<u64> = voters.into_iter().filter(|&id| id != self_id).collect();
            let (vote_tx, mut vote_rx) =
                mpsc::channel::<(u64, RaftResult<RequestVoteResponse>)>(peers.len().max(1));

            for peer_id in peers {
                let request_clone = request.clone();
                let transport_clone = self.transport.clone();
                let vote_tx_clone = vote_tx.clone();
                let rpc_timeout = self.config.rpc_timeout;

                tokio::spawn(async move {
                    let result = tokio::time::timeout(
                        rpc_timeout,
                        transport_clone.send_request_vote(peer_id, request_clone),
                    )
                    .await
                    .unwrap_or_else(|_| {
                        Err(RaftError::TransportError("RequestVote timed out".to_string()))
                    });
                    let _ = vote_tx_clone.send((peer_id, result)).await;
                });
            }
            drop(vote_tx); // rx completes once every peer answered

            let deadline = Instant::now() + random_election_timeout(&self.config);
            loop {
                tokio::select! {
                    result = vote_rx.recv() => {
                        match result {
                            Some((_, Ok(response))) if response.term > term => {
                                self.step_down(response.term);
                                return Ok(());
                            }
                            Some((peer_id, Ok(response))) => {
                                if response.vote_granted {
                                    granted.insert(peer_id);
                                }
                                if self.has_quorum(&granted) {
                                    break;
                                }
                            }
                            Some((peer_id, Err(e))) => {
                                debug!(peer_id, error = %e, "Vote request failed");
                            }
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
        }

        if !self.has_quorum(&granted) {
            debug!(
                group = %self.config.group,
                term,
                votes = granted.len(),
                "Election inconclusive"
            );
            return Ok(());
        }

        // A leader of this term may have shown up while votes were collected.
        if self.state.term() != term || self.state.role() != RaftRole::Candidate {
            return Ok(());
        }

        info!(
            group = %self.config.group,
            node_id = self_id,
            term,
            votes = granted.len(),
            "Won election"
        );
        self.become_leader(term).await
    }

    async fn become_leader(self: &Arc<Self>, term: u64) -> RaftResult<()> {
        self.state
            .become_leader(self.config.node_id, &self.voters(), self.log.last_index());
        self.dispatcher.on_leader_elected(term);
        self.set_heartbeat_timer(Instant::now() + self.config.heartbeat_interval);

        // Entries of earlier terms only commit through an entry of this term.
        match self.append_as_leader(&MetaCommand::Noop).await {
            Ok(_) => {}
            Err(ProposalError::NotLeader { .. }) => return Ok(()),
            Err(e) => return Err(RaftError::LogError(e.to_string())),
        }

        self.replicate().await;
        Ok(())
    }

    /// Gives up leadership or candidacy and adopts `term` if it is newer.
    pub fn step_down(&self, term: u64) {
        let was_leader = self.state.is_leader();
        self.state.become_follower(term.max(self.state.term()));
        self.dispatcher.role_changed(RaftRole::Follower);
        *self.joint_peers.write() = None;

        if let Err(e) = self.persist_hard_state() {
            warn!(group = %self.config.group, error = %e, "Failed to persist hard state");
        }
        if was_leader {
            info!(group = %self.config.group, term = self.state.term(), "Stepped down");
        }
        self.reset_election_timer();
    }

    /// Proposes a transaction program and waits until it is applied.
    ///
    /// The result is delivered even if this node loses leadership in between, as long
    /// as the entry it appended is the one that ends up committed.
    pub async fn propose(self: &Arc<Self>, program: Statement) -> Result<InvokeResult, ProposalError> {
        self.engine.validate(&program)?;

        match self.submit(MetaCommand::MultiInvoke(program)).await? {
            ApplyOutcome::Invoked(result) => Ok(result),
            other => Err(ProposalError::Internal(format!(
                "Unexpected apply outcome {:?}",
                other
            ))),
        }
    }

    async fn submit(self: &Arc<Self>, command: MetaCommand) -> ProposalResult {
        let mut rx = self.append_as_leader(&command).await?;
        match self.await_proposal(&mut rx).await {
            Some(result) => result,
            None => {
                warn!(group = %self.config.group, "Proposal timed out");
                Err(ProposalError::Timeout)
            }
        }
    }

    /// Keeps replicating until `rx` resolves. `None` once the proposal timeout passes;
    /// the entry stays in the log and `rx` still resolves when it applies or is replaced.
    async fn await_proposal(
        self: &Arc<Self>,
        rx: &mut oneshot::Receiver<ProposalResult>,
    ) -> Option<ProposalResult> {
        let deadline = Instant::now() + self.config.proposal_timeout;

        loop {
            self.replicate().await;

            let retry_at = (Instant::now() + self.config.heartbeat_interval).min(deadline);
            tokio::select! {
                result = &mut *rx => {
                    return Some(result.unwrap_or_else(|_| {
                        Err(ProposalError::Internal("Apply loop stopped".to_string()))
                    }));
                }
                _ = tokio::time::sleep_until(retry_at) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                }
            }
        }
    }

    async fn append_as_leader(
        &self,
        command: &MetaCommand,
    ) -> Result<oneshot::Receiver<ProposalResult>, ProposalError> {
        let data = command
            .encode()
            .map_err(|e| ProposalError::Internal(e.to_string()))?;

        let _sequencer = self.sequencer.lock().await;
        if !self.state.is_leader() {
            return Err(self.not_leader());
        }

        let term = self.state.term();
        let index = self.log.last_index() + 1;
        let rx = self.pending.register(index, term);

        let entry = LogEntry {
            index,
            term,
            data,
            entry_type: command.entry_type(),
        };
        if let Err(e) = self.log.append(&[entry]) {
            self.pending.cancel(index);
            return Err(e.into());
        }

        debug!(group = %self.config.group, index, term, "Appended entry");
        Ok(rx)
    }

    /// One replication pass to every voter, then a commit index update.
    ///
    /// Returns the peers that acknowledged this node as leader of its current term.
    pub async fn replicate(self: &Arc<Self>) -> HashSet<u64> {
        let mut responsive = HashSet::new();
        if !self.state.is_leader() {
            return responsive;
        }

        let term = self.state.term();
        let mut tasks = JoinSet::new();
        for peer_id in self
            .voters()
            .into_iter()
            .filter(|&id| id != self.config.node_id)
        {
            let group = Arc::clone(self);
            tasks.spawn(async move { (peer_id, group.replicate_to(peer_id, term).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((peer_id, true)) => {
                    responsive.insert(peer_id);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Replication task failed"),
            }
        }

        if let Err(e) = self.advance_commit(term).await {
            warn!(group = %self.config.group, error = %e, "Failed to advance commit index");
        }
        responsive
    }

    async fn replicate_to(&self, peer_id: u64, term: u64) -> bool {
        let mut responsive = false;

        for _ in 0..MAX_CATCH_UP_ROUNDS {
            if !self.state.is_leader() || self.state.term() != term {
                return false;
            }

            let last_index = self.log.last_index();
            let next_idx = self
                .state
                .next_index(peer_id)
                .unwrap_or(last_index + 1)
                .max(1);
            let prev_log_index = next_idx - 1;

            let prev_log_term = match self.log.term_at(prev_log_index) {
                Ok(Some(t)) => t,
                Ok(None) => {
                    self.state.set_next_index(peer_id, last_index + 1);
                    continue;
                }
                Err(e) => {
                    warn!(peer_id, error = %e, "Failed to read log for replication");
                    return responsive;
                }
            };

            let entries = match self.log.get_range(
                next_idx,
                next_idx + self.config.max_log_entries_per_request as u64,
            ) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(peer_id, error = %e, "Failed to read log for replication");
                    return responsive;
                }
            };

            let request = AppendEntriesRequest {
                term,
                leader_id: self.config.node_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.state.commit_index(),
            };

            let response = match tokio::time::timeout(
                self.config.rpc_timeout,
                self.transport.send_append_entries(peer_id, request),
            )
            .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    debug!(peer_id, error = %e, "AppendEntries failed");
                    return responsive;
                }
                Err(_) => {
                    debug!(peer_id, "AppendEntries timed out");
                    return responsive;
                }
            };

            if response.term > term {
                self.step_down(response.term);
                return false;
            }
            responsive = true;

            if response.success {
                self.state.update_match_index(peer_id, response.match_index);
                self.state.set_next_index(peer_id, response.match_index + 1);
                if response.match_index >= self.log.last_index() {
                    return true;
                }
            } else if response.conflict_index > 0 {
                self.state.set_next_index(peer_id, response.conflict_index);
            } else {
                self.state.set_next_index(peer_id, prev_log_index);
            }
        }

        responsive
    }

    async fn advance_commit(&self, term: u64) -> RaftResult<()> {
        if self.state.is_leader() && self.state.term() == term {
            let last_index = self.log.last_index();
            let self_id = self.config.node_id;

            let current = self.membership.read().node_ids();
            let joint = self.joint_peers.read().clone();

            let mut quorum_index = self.state.quorum_match_index(&current, self_id, last_index);
            if let Some(joint) = joint {
                quorum_index =
                    quorum_index.min(self.state.quorum_match_index(&joint, self_id, last_index));
            }

            if quorum_index > self.state.commit_index()
                && self.log.term_at(quorum_index)? == Some(term)
                && self.state.advance_commit_index(quorum_index)
            {
                debug!(group = %self.config.group, commit_index = quorum_index, "Advanced commit index");
                self.persist_hard_state()?;
            }
        }

        self.dispatch_committed().await
    }

    /// Hands committed but not yet dispatched entries to the apply loop, in order.
    async fn dispatch_committed(&self) -> RaftResult<()> {
        let mut dispatched = self.dispatched.lock().await;
        let commit_index = self.state.commit_index().min(self.log.last_index());

        while *dispatched < commit_index {
            let index = *dispatched + 1;
            let entry = self.log.get(index)?.ok_or_else(|| {
                RaftError::LogError(format!("Committed entry {} is missing", index))
            })?;

            self.apply_tx
                .send(entry)
                .await
                .map_err(|_| RaftError::ApplyError("Apply loop stopped".to_string()))?;
            *dispatched = index;
        }

        Ok(())
    }

    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let response = {
            let _sequencer = self.sequencer.lock().await;
            self.append_entries_locked(req)
        };

        if response.success {
            if let Err(e) = self.dispatch_committed().await {
                warn!(group = %self.config.group, error = %e, "Failed to dispatch committed entries");
            }
        }
        response
    }

    fn append_entries_locked(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let current_term = self.state.term();
        let reject = |term: u64, conflict_index: u64| AppendEntriesResponse {
            term,
            success: false,
            match_index: 0,
            conflict_index,
        };

        if req.term < current_term {
            return reject(current_term, 0);
        }

        if req.term > current_term || self.state.role() != RaftRole::Follower {
            self.step_down(req.term);
        }
        let term = req.term;

        self.state.set_leader_id(req.leader_id);
        self.reset_election_timer();
        if let Ok(mut contact) = self.leader_contact.lock() {
            *contact = Some(Instant::now());
        }

        if !self.log.has_entry(req.prev_log_index, req.prev_log_term) {
            let last_index = self.log.last_index();
            let conflict_index = if req.prev_log_index > last_index {
                last_index + 1
            } else {
                // Skip back over the whole conflicting term.
                let conflict_term = self
                    .log
                    .term_at(req.prev_log_index)
                    .ok()
                    .flatten()
                    .unwrap_or(0);
                let mut index = req.prev_log_index;
                while index > 1
                    && self.log.term_at(index - 1).ok().flatten() == Some(conflict_term)
                {
                    index -= 1;
                }
                index
            };
            return reject(term, conflict_index);
        }

        let mut new_entries: &[LogEntry] = &[];
        for (i, entry) in req.entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                Ok(Some(existing)) if existing == entry.term => continue,
                Ok(Some(_)) => {
                    if entry.index <= self.state.commit_index() {
                        error!(
                            group = %self.config.group,
                            index = entry.index,
                            "Leader tried to overwrite a committed entry"
                        );
                        return reject(term, 0);
                    }
                    if let Err(e) = self.log.truncate_after(entry.index - 1) {
                        warn!(error = %e, "Failed to truncate conflicting entries");
                        return reject(term, 0);
                    }
                    new_entries = &req.entries[i..];
                    break;
                }
                Ok(None) => {
                    new_entries = &req.entries[i..];
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read log");
                    return reject(term, 0);
                }
            }
        }

        if let Err(e) = self.log.append(new_entries) {
            warn!(error = %e, "Failed to append entries");
            return reject(term, 0);
        }

        let match_index = req.prev_log_index + req.entries.len() as u64;
        if req.leader_commit > self.state.commit_index()
            && self
                .state
                .advance_commit_index(req.leader_commit.min(match_index))
        {
            if let Err(e) = self.persist_hard_state() {
                warn!(error = %e, "Failed to persist hard state");
            }
        }

        AppendEntriesResponse {
            term,
            success: true,
            match_index,
            conflict_index: 0,
        }
    }

    pub async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        let _sequencer = self.sequencer.lock().await;
        let current_term = self.state.term();

        if req.term < current_term {
            return RequestVoteResponse {
                term: current_term,
                vote_granted: false,
            };
        }

        // A node removed from the group keeps campaigning; ignore it while a leader is alive.
        if req.term > current_term && self.leader_alive() {
            debug!(
                group = %self.config.group,
                candidate = req.candidate_id,
                term = req.term,
                "Ignoring vote request while leader is alive"
            );
            return RequestVoteResponse {
                term: current_term,
                vote_granted: false,
            };
        }

        if req.term > current_term {
            self.step_down(req.term);
        }

        let voted_for = self.state.voted_for();
        let can_vote = voted_for.is_none() || voted_for == Some(req.candidate_id);

        // Candidate's log must be at least as up-to-date as ours
        let last_index = self.log.last_index();
        let last_term = self.log.last_term();
        let log_ok = (req.last_log_term > last_term)
            || (req.last_log_term == last_term && req.last_log_index >= last_index);

        let mut vote_granted = can_vote && log_ok;
        if vote_granted {
            self.state.vote_for(req.candidate_id);
            match self.persist_hard_state() {
                Ok(()) => self.reset_election_timer(),
                Err(e) => {
                    warn!(error = %e, "Failed to persist vote");
                    vote_granted = false;
                }
            }
        }

        debug!(
            group = %self.config.group,
            candidate = req.candidate_id,
            term = req.term,
            vote_granted,
            "Handled vote request"
        );

        RequestVoteResponse {
            term: self.state.term(),
            vote_granted,
        }
    }

    /// Confirms leadership with a quorum and waits until everything committed so far
    /// is applied locally. Returns the commit index the read is linearized at.
    pub async fn read_index(self: &Arc<Self>) -> Result<u64, ProposalError> {
        let deadline = Instant::now() + self.config.proposal_timeout;

        let commit_index = loop {
            if !self.state.is_leader() {
                return Err(self.not_leader());
            }

            let term = self.state.term();
            let mut acked = self.replicate().await;
            acked.insert(self.config.node_id);

            let commit_index = self.state.commit_index();
            let committed_in_term = self.log.term_at(commit_index)? == Some(term);
            if self.state.is_leader() && self.has_quorum(&acked) && committed_in_term {
                break commit_index;
            }

            if Instant::now() >= deadline {
                return Err(ProposalError::Timeout);
            }
            tokio::time::sleep(self.config.heartbeat_interval).await;
        };

        self.wait_applied(commit_index, deadline).await?;
        Ok(commit_index)
    }

    /// Moves the group to a new voter set.
    ///
    /// Reachability of the target set is checked first. If a majority of it cannot be
    /// reached the attempt fails with `QuorumLost`, listeners get
    /// `on_reconfiguration_error` and the current configuration stays. Otherwise a configuration entry is committed
    /// under joint quorum and applied on every replica.
    ///
    /// If the entry does not commit within the proposal timeout the call returns
    /// `Timeout` with the outcome unknown. Joint quorum and the in-flight flag then stay
    /// until the entry is applied, which reports `on_new_peers_configuration_applied`,
    /// or replaced by another leader's entry.
    pub async fn change_peers(self: &Arc<Self>, peers: Vec<u64>) -> Result<Membership, ProposalError> {
        if !self.state.is_leader() {
            return Err(self.not_leader());
        }

        let mut target = peers;
        target.sort_unstable();
        target.dedup();
        if target.is_empty() {
            return Err(InvokeError::Malformed("Peer set cannot be empty".to_string()).into());
        }

        if !self.dispatcher.begin_reconfiguration() {
            return Err(ProposalError::Reconfiguration(GroupStatus::new(
                StatusCode::Busy,
                "Another reconfiguration is in flight",
            )));
        }

        let term = self.state.term();
        let target_peers: Vec<PeerId> = target
            .iter()
            .map(|&id| PeerId::new(id, self.config.group.clone()))
            .collect();

        info!(group = %self.config.group, term, peers = ?target, "Starting reconfiguration");

        let last_index = self.log.last_index();
        for &peer_id in target.iter().filter(|&&id| id != self.config.node_id) {
            self.state.track_peer(peer_id, last_index);
        }
        *self.joint_peers.write() = Some(target.clone());

        let mut reachable = self.replicate().await;
        reachable.insert(self.config.node_id);
        let reachable_targets = target.iter().filter(|&id| reachable.contains(id)).count();

        if reachable_targets <= target.len() / 2 {
            *self.joint_peers.write() = None;
            let status = GroupStatus::new(
                StatusCode::QuorumLost,
                format!(
                    "{} of {} target peers reachable",
                    reachable_targets,
                    target.len()
                ),
            );
            self.dispatcher
                .on_reconfiguration_error(&status, &target_peers, term);
            return Err(ProposalError::Reconfiguration(status));
        }

        let command = MetaCommand::Reconfigure {
            peers: target_peers.clone(),
        };
        let mut rx = match self.append_as_leader(&command).await {
            Ok(rx) => rx,
            Err(e) => {
                *self.joint_peers.write() = None;
                self.dispatcher.finish_reconfiguration();
                return Err(e);
            }
        };

        let outcome = self.await_proposal(&mut rx).await;
        match outcome {
            Some(outcome) => {
                self.conclude_reconfiguration(term, &target_peers, outcome)
                    .await
            }
            None => {
                // The entry may still commit: joint quorum and the in-flight flag stay
                // until it is applied or replaced.
                warn!(group = %self.config.group, term, "Configuration entry did not commit in time");
                let group = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = rx.await.unwrap_or_else(|_| {
                        Err(ProposalError::Internal("Apply loop stopped".to_string()))
                    });
                    if let Err(e) = group
                        .conclude_reconfiguration(term, &target_peers, outcome)
                        .await
                    {
                        debug!(group = %group.config.group, term, error = %e, "Late reconfiguration outcome");
                    }
                });
                Err(ProposalError::Timeout)
            }
        }
    }

    async fn conclude_reconfiguration(
        self: &Arc<Self>,
        term: u64,
        target_peers: &[PeerId],
        outcome: ProposalResult,
    ) -> Result<Membership, ProposalError> {
        // A newer term has already dropped the joint quorum and the in-flight flag,
        // and may have started a reconfiguration of its own.
        let same_term = self.state.term() == term;
        if same_term {
            *self.joint_peers.write() = None;
        }

        match outcome {
            Ok(ApplyOutcome::MembershipApplied(membership)) => {
                if !membership.contains(self.config.node_id) && self.state.is_leader() {
                    // Let the remaining voters learn the commit before going quiet.
                    self.replicate().await;
                    self.step_down(self.state.term());
                }
                Ok(membership)
            }
            Ok(other) => {
                if same_term {
                    self.dispatcher.finish_reconfiguration();
                }
                Err(ProposalError::Internal(format!(
                    "Unexpected apply outcome {:?}",
                    other
                )))
            }
            Err(e @ ProposalError::NotLeader { .. }) => {
                if same_term {
                    let status = GroupStatus::new(
                        StatusCode::NotLeader,
                        "Configuration entry was replaced before it committed",
                    );
                    self.dispatcher
                        .on_reconfiguration_error(&status, target_peers, term);
                }
                Err(e)
            }
            Err(e) => {
                if same_term {
                    self.dispatcher.finish_reconfiguration();
                }
                Err(e)
            }
        }
    }

    /// One step of the background loop: elections for followers, heartbeats for
    /// leaders, and delivery of newly committed entries.
    pub async fn tick(self: &Arc<Self>) -> RaftResult<()> {
        let now = Instant::now();

        if self.state.is_leader() {
            let heartbeat_due = self
                .heartbeat_timer
                .lock()
                .map(|timer| timer.map_or(true, |t| now >= t))
                .unwrap_or(true);
            if heartbeat_due {
                self.set_heartbeat_timer(now + self.config.heartbeat_interval);
                self.replicate().await;
            }
        } else {
            let election_expired = self
                .election_timer
                .lock()
                .map(|timer| timer.map_or(false, |t| now >= t))
                .unwrap_or(false);
            if election_expired {
                self.reset_election_timer();
                self.campaign().await?;
            }
        }

        self.dispatch_committed().await
    }

    pub fn run(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                group = %self.config.group,
                node_id = self.config.node_id,
                "Raft event loop started"
            );
            let mut interval = tokio::time::interval(Duration::from_millis(10));
            loop {
                interval.tick().await;
                if let Err(e) = self.tick().await {
                    warn!(group = %self.config.group, "Raft tick error: {}", e);
                }
            }
        })
    }

    /// Flushes the log and stops the apply loop.
    pub async fn shutdown(&self) -> RaftResult<()> {
        self.log.flush().await?;
        let handle = self.apply_handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        Ok(())
    }

    async fn wait_applied(&self, index: u64, deadline: Instant) -> Result<(), ProposalError> {
        let mut applied = self.applied_rx.clone();
        loop {
            let current = *applied.borrow();
            if current >= index {
                return Ok(());
            }

            match tokio::time::timeout_at(deadline, applied.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(ProposalError::Internal("Apply loop stopped".to_string()))
                }
                Err(_) => return Err(ProposalError::Timeout),
            }
        }
    }

    /// Current voters plus the target voters of an in-flight reconfiguration.
    fn voters(&self) -> Vec<u64> {
        let mut voters = self.membership.read().node_ids();
        if let Some(joint) = self.joint_peers.read().as_ref() {
            voters.extend(joint.iter().copied());
        }
        voters.sort_unstable();
        voters.dedup();
        voters
    }

    fn has_quorum(&self, acked: &HashSet<u64>) -> bool {
        let majority = |voters: &[u64]| {
            voters.iter().filter(|&id| acked.contains(id)).count() > voters.len() / 2
        };

        let current = self.membership.read().node_ids();
        let joint = self.joint_peers.read().clone();
        majority(&current) && joint.map_or(true, |j| majority(&j))
    }

    fn not_leader(&self) -> ProposalError {
        ProposalError::NotLeader {
            leader_hint: self
                .state
                .leader_id()
                .filter(|&id| id != self.config.node_id),
        }
    }

    fn persist_hard_state(&self) -> RaftResult<()> {
        self.log.save_hard_state(&HardState {
            term: self.state.term(),
            voted_for: self.state.voted_for(),
            commit_index: self.state.commit_index(),
        })
    }

    fn leader_alive(&self) -> bool {
        if self.state.is_leader() {
            return true;
        }
        self.leader_contact
            .lock()
            .map(|contact| {
                contact.map_or(false, |t| t.elapsed() < self.config.election_timeout_min)
            })
            .unwrap_or(false)
    }

    fn reset_election_timer(&self) {
        if let Ok(mut timer) = self.election_timer.lock() {
            *timer = Some(Instant::now() + random_election_timeout(&self.config));
        }
    }

    fn set_heartbeat_timer(&self, at: Instant) {
        if let Ok(mut timer) = self.heartbeat_timer.lock() {
            *timer = Some(at);
        }
    }

    pub fn group(&self) -> &GroupId {
        &self.config.group
    }

    pub fn node_id(&self) -> u64 {
        self.config.node_id
    }

    pub fn config(&self) -> Arc<GroupConfig> {
        self.config.clone()
    }

    pub fn get_state(&self) -> Arc<RaftState> {
        self.state.clone()
    }

    pub fn get_log(&self) -> Arc<RaftLog> {
        self.log.clone()
    }

    pub fn dispatcher(&self) -> &Arc<RaftGroupEventsDispatcher> {
        &self.dispatcher
    }

    pub fn compaction(&self) -> &Arc<CompactionManager> {
        &self.compaction
    }

    pub fn watch_hub(&self) -> &Arc<WatchHub> {
        &self.watch_hub
    }

    pub fn membership(&self) -> Membership {
        self.membership.read().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn leader_id(&self) -> Option<u64> {
        self.state.leader_id()
    }

    pub fn current_term(&self) -> u64 {
        self.state.term()
    }

    pub fn commit_index(&self) -> u64 {
        self.state.commit_index()
    }

    /// Log index of the last entry applied to the state machine.
    pub fn applied_index(&self) -> u64 {
        *self.applied_rx.borrow()
    }
}

fn random_election_timeout(config: &GroupConfig) -> Duration {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    hasher.write_u64(config.node_id);
    let hash = hasher.finish();

    let range = (config.election_timeout_max - config.election_timeout_min)
        .as_millis()
        .max(1);
    let offset_ms = (hash as u128 % range) as u64;
    config.election_timeout_min + Duration::from_millis(offset_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::{CompareOp, Condition, Operation};
    use crate::raft::transport::MockTransport;
    use crate::raft::RaftGroupEventsListener;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn config(node_id: u64, peers: Vec<u64>) -> GroupConfig {
        GroupConfig::new(GroupId::new("meta"), node_id, peers)
            .with_proposal_timeout(Duration::from_millis(300))
    }

    #[derive(Default)]
    struct TermRecorder {
        last_term: AtomicU64,
    }

    impl RaftGroupEventsListener for TermRecorder {
        fn on_leader_elected(&self, term: u64) {
            self.last_term.store(term, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_applies() {
        let group = RaftGroup::start(
            config(1, vec![1]),
            RaftLog::temporary().unwrap(),
            Arc::new(MockTransport::new()),
        )
        .await
        .unwrap();

        assert!(group.is_leader());
        assert_eq!(group.current_term(), 1);

        let a = group
            .propose(Statement::update(vec![Operation::put("x", "1")]))
            .await
            .unwrap();
        let b = group
            .propose(Statement::when(
                Condition::revision("x", CompareOp::Equal, a.revision),
                Statement::update(vec![Operation::put("x", "2")]),
                Statement::update(vec![Operation::put("x", "99")]),
            ))
            .await
            .unwrap();

        assert_eq!(b.revision, a.revision + 1);
        assert_eq!(b.applied, vec![Operation::put("x", "2")]);
        group.read_index().await.unwrap();
        assert_eq!(
            group.compaction().read(b"x", None).unwrap().value(),
            Some(&b"2"[..])
        );
    }

    #[tokio::test]
    async fn test_campaign_with_mock_peers() {
        let transport = Arc::new(MockTransport::new());
        let group = RaftGroup::start(
            config(1, vec![1, 2, 3]),
            RaftLog::temporary().unwrap(),
            transport.clone(),
        )
        .await
        .unwrap();
        assert!(!group.is_leader());

        let recorder = Arc::new(TermRecorder::default());
        group.dispatcher().register(recorder.clone());

        group.campaign().await.unwrap();
        assert!(group.is_leader());
        assert_eq!(recorder.last_term.load(Ordering::SeqCst), 1);

        let result = group
            .propose(Statement::update(vec![Operation::put("k", "v")]))
            .await
            .unwrap();
        assert_eq!(result.revision, 1);
        assert!(transport.sent() > 0);
    }

    #[tokio::test]
    async fn test_propose_times_out_without_quorum() {
        let transport = Arc::new(MockTransport::new());
        let group = RaftGroup::start(
            config(1, vec![1, 2, 3]),
            RaftLog::temporary().unwrap(),
            transport.clone(),
        )
        .await
        .unwrap();
        group.campaign().await.unwrap();

        transport.set_reachable(false);
        let err = group
            .propose(Statement::update(vec![Operation::put("k", "v")]))
            .await
            .unwrap_err();
        assert_eq!(err, ProposalError::Timeout);
    }

    #[derive(Default)]
    struct ReconfigRecorder {
        applied: parking_lot::Mutex<Vec<Vec<u64>>>,
        errors: parking_lot::Mutex<Vec<StatusCode>>,
    }

    impl RaftGroupEventsListener for ReconfigRecorder {
        fn on_new_peers_configuration_applied(&self, peers: &[PeerId]) {
            self.applied
                .lock()
                .push(peers.iter().map(|p| p.node_id).collect());
        }

        fn on_reconfiguration_error(&self, status: &GroupStatus, _peers: &[PeerId], _term: u64) {
            self.errors.lock().push(status.code);
        }
    }

    #[tokio::test]
    async fn test_timed_out_reconfiguration_commits_after_heal() {
        let transport = Arc::new(MockTransport::new());
        let group = RaftGroup::start(
            config(1, vec![1, 2, 3]),
            RaftLog::temporary().unwrap(),
            transport.clone(),
        )
        .await
        .unwrap();
        group.campaign().await.unwrap();
        group
            .propose(Statement::update(vec![Operation::put("k", "v")]))
            .await
            .unwrap();

        let recorder = Arc::new(ReconfigRecorder::default());
        group.dispatcher().register(recorder.clone());

        // One request per peer passes the reachability check, then the network drops.
        transport.fail_after(3);
        let err = group.change_peers(vec![1, 2, 3, 4]).await.unwrap_err();
        assert_eq!(err, ProposalError::Timeout);

        assert!(group.dispatcher().reconfiguration_in_flight());
        assert_eq!(*group.joint_peers.read(), Some(vec![1, 2, 3, 4]));
        assert!(recorder.errors.lock().is_empty());
        assert_eq!(group.membership().node_ids(), vec![1, 2, 3]);

        match group.change_peers(vec![1, 2]).await.unwrap_err() {
            ProposalError::Reconfiguration(status) => assert_eq!(status.code, StatusCode::Busy),
            other => panic!("expected busy, got {:?}", other),
        }

        transport.set_reachable(true);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            group.replicate().await;
            if group.joint_peers.read().is_none() && !group.dispatcher().reconfiguration_in_flight()
            {
                break;
            }
            assert!(Instant::now() < deadline, "configuration entry never applied");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(group.membership().node_ids(), vec![1, 2, 3, 4]);
        assert_eq!(*recorder.applied.lock(), vec![vec![1, 2, 3, 4]]);
        assert!(recorder.errors.lock().is_empty());

        // The group takes a new reconfiguration once the old one resolved.
        let membership = group.change_peers(vec![1, 2, 3]).await.unwrap();
        assert_eq!(membership.node_ids(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_follower_rejects_proposals() {
        let group = RaftGroup::start(
            config(1, vec![1, 2, 3]),
            RaftLog::temporary().unwrap(),
            Arc::new(MockTransport::unreachable()),
        )
        .await
        .unwrap();

        group.campaign().await.unwrap();
        assert!(!group.is_leader());

        let err = group
            .propose(Statement::update(vec![Operation::put("k", "v")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProposalError::NotLeader { .. }));
        assert!(matches!(
            group.read_index().await.unwrap_err(),
            ProposalError::NotLeader { .. }
        ));
    }

    #[tokio::test]
    async fn test_malformed_program_never_reaches_log() {
        let group = RaftGroup::start(
            config(1, vec![1]),
            RaftLog::temporary().unwrap(),
            Arc::new(MockTransport::new()),
        )
        .await
        .unwrap();
        let last_index = group.get_log().last_index();

        let err = group
            .propose(Statement::update(vec![Operation::put("", "v")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProposalError::Malformed(_)));
        assert_eq!(group.get_log().last_index(), last_index);
    }

    #[tokio::test]
    async fn test_restart_replays_committed_entries() {
        let db = sled::Config::new().temporary(true).open().unwrap();

        {
            let group = RaftGroup::start(
                config(1, vec![1]),
                RaftLog::new(db.open_tree("meta").unwrap()).unwrap(),
                Arc::new(MockTransport::new()),
            )
            .await
            .unwrap();
            group
                .propose(Statement::update(vec![Operation::put("a", "1")]))
                .await
                .unwrap();
            group
                .propose(Statement::update(vec![Operation::put("a", "2")]))
                .await
                .unwrap();
            group.shutdown().await.unwrap();
        }

        let group = RaftGroup::start(
            config(1, vec![1]),
            RaftLog::new(db.open_tree("meta").unwrap()).unwrap(),
            Arc::new(MockTransport::new()),
        )
        .await
        .unwrap();

        assert_eq!(group.current_term(), 2);
        let entry = group.compaction().read(b"a", None).unwrap();
        assert_eq!(entry.value(), Some(&b"2"[..]));
        assert_eq!(entry.revision, 2);
    }

    #[tokio::test]
    async fn test_seeded_group_keeps_seed_across_restart() {
        let source = CompactionManager::new(RevisionStore::new());
        {
            let mut state = source.store().write();
            state.apply_batch(1, &[Operation::put("k", "0")]).unwrap();
            state.apply_batch(2, &[Operation::put("x", "0")]).unwrap();
            state.apply_batch(3, &[Operation::put("k", "1")]).unwrap();
            state.apply_batch(4, &[Operation::put("other", "o")]).unwrap();
        }
        source.compact(2).unwrap();
        let snapshot = source.snapshot().unwrap();

        let db = sled::Config::new().temporary(true).open().unwrap();
        {
            let group = RaftGroup::start_with_seed(
                config(1, vec![1]),
                RaftLog::new(db.open_tree("copy").unwrap()).unwrap(),
                Arc::new(MockTransport::new()),
                Some(&snapshot),
            )
            .await
            .unwrap();
            let result = group
                .propose(Statement::update(vec![Operation::put("k", "5")]))
                .await
                .unwrap();
            assert_eq!(result.revision, 5);
            group.shutdown().await.unwrap();
        }

        let group = RaftGroup::start(
            config(1, vec![1]),
            RaftLog::new(db.open_tree("copy").unwrap()).unwrap(),
            Arc::new(MockTransport::new()),
        )
        .await
        .unwrap();

        let compaction = group.compaction();
        assert_eq!(compaction.watermark(), 2);
        let k = compaction.read(b"k", None).unwrap();
        assert_eq!((k.value(), k.revision), (Some(&b"5"[..]), 5));
        let other = compaction.read(b"other", None).unwrap();
        assert_eq!(other.revision, 4);
        assert!(matches!(
            compaction.read(b"k", Some(1)),
            Err(crate::storage::StorageError::Compacted { watermark: 2, .. })
        ));

        let next = group
            .propose(Statement::update(vec![Operation::put("k", "6")]))
            .await
            .unwrap();
        assert_eq!(next.revision, 6);
    }

    #[tokio::test]
    async fn test_seed_rejected_for_group_with_history() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        {
            let group = RaftGroup::start(
                config(1, vec![1]),
                RaftLog::new(db.open_tree("meta").unwrap()).unwrap(),
                Arc::new(MockTransport::new()),
            )
            .await
            .unwrap();
            group.shutdown().await.unwrap();
        }

        let snapshot = CompactionManager::new(RevisionStore::new()).snapshot().unwrap();
        let result = RaftGroup::start_with_seed(
            config(1, vec![1]),
            RaftLog::new(db.open_tree("meta").unwrap()).unwrap(),
            Arc::new(MockTransport::new()),
            Some(&snapshot),
        )
        .await;
        assert!(matches!(result, Err(RaftError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_append_entries_rejects_stale_term_and_gaps() {
        let group = RaftGroup::start(
            config(2, vec![1, 2, 3]),
            RaftLog::temporary().unwrap(),
            Arc::new(MockTransport::new()),
        )
        .await
        .unwrap();

        let entry = |index: u64, term: u64| LogEntry {
            index,
            term,
            data: MetaCommand::Noop.encode().unwrap(),
            entry_type: crate::raft::EntryType::Normal,
        };

        let response = group
            .handle_append_entries(AppendEntriesRequest {
                term: 2,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry(1, 1), entry(2, 2)],
                leader_commit: 1,
            })
            .await;
        assert!(response.success);
        assert_eq!(response.match_index, 2);
        assert_eq!(group.leader_id(), Some(1));
        assert_eq!(group.commit_index(), 1);

        let gap = group
            .handle_append_entries(AppendEntriesRequest {
                term: 2,
                leader_id: 1,
                prev_log_index: 5,
                prev_log_term: 2,
                entries: vec![],
                leader_commit: 1,
            })
            .await;
        assert!(!gap.success);
        assert_eq!(gap.conflict_index, 3);

        let stale = group
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: 3,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            })
            .await;
        assert!(!stale.success);
        assert_eq!(stale.term, 2);

        // A new leader overwrites the uncommitted tail.
        let overwrite = group
            .handle_append_entries(AppendEntriesRequest {
                term: 3,
                leader_id: 3,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![entry(2, 3)],
                leader_commit: 2,
            })
            .await;
        assert!(overwrite.success);
        assert_eq!(group.get_log().term_at(2).unwrap(), Some(3));
        assert_eq!(group.commit_index(), 2);
    }

    #[tokio::test]
    async fn test_request_vote_rules() {
        let group = RaftGroup::start(
            config(2, vec![1, 2, 3]),
            RaftLog::temporary().unwrap(),
            Arc::new(MockTransport::new()),
        )
        .await
        .unwrap();

        let vote = |candidate_id: u64, term: u64| RequestVoteRequest {
            term,
            candidate_id,
            last_log_index: 0,
            last_log_term: 0,
        };

        assert!(group.handle_request_vote(vote(1, 1)).await.vote_granted);
        // One vote per term.
        assert!(!group.handle_request_vote(vote(3, 1)).await.vote_granted);
        assert!(group.handle_request_vote(vote(1, 1)).await.vote_granted);
        // New term, new vote.
        assert!(group.handle_request_vote(vote(3, 2)).await.vote_granted);
        assert_eq!(group.get_log().hard_state().unwrap().voted_for, Some(3));
    }

    #[tokio::test]
    async fn test_vote_denied_while_leader_is_alive() {
        let group = RaftGroup::start(
            config(2, vec![1, 2, 3]),
            RaftLog::temporary().unwrap(),
            Arc::new(MockTransport::new()),
        )
        .await
        .unwrap();

        let heartbeat = group
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            })
            .await;
        assert!(heartbeat.success);

        let response = group
            .handle_request_vote(RequestVoteRequest {
                term: 5,
                candidate_id: 3,
                last_log_index: 10,
                last_log_term: 4,
            })
            .await;
        assert!(!response.vote_granted);
        assert_eq!(response.term, 1);
        assert_eq!(group.current_term(), 1);
        assert_eq!(group.leader_id(), Some(1));
    }
}
