//! Process-level facade over the raft groups hosted by one node.
//!
//! A [`MetaStorageServer`] owns:
//! - One sled database holding a raft log tree per group
//! - A [`RaftGroup`] per hosted group, each with its own apply actor and event loop
//! - Optional background compactors, one per group
//!
//! Groups are independent: each has its own log, revision sequence and leader.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::invoke::{Statement, DEFAULT_MAX_DEPTH};
use crate::metastorage::InvokeResult;
use crate::raft::{
    GroupConfig, GroupId, ListenerId, LocalCluster, Membership, ProposalError, RaftError,
    RaftGroup, RaftGroupEventsListener, RaftLog,
};
use crate::storage::{CompactionMode, Compactor, Entry, ErrorCode, Revision, StorageError};
use crate::watch::{WatchError, WatchEvent, WatchRange};

/// How often revision-mode auto compaction checks the revision counter.
const REVISION_COMPACTION_CHECK: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Unknown group: {0}")]
    UnknownGroup(GroupId),

    #[error("Group {0} is already hosted")]
    GroupExists(GroupId),

    #[error(transparent)]
    Proposal(#[from] ProposalError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Raft(#[from] RaftError),

    #[error("Log database error: {0}")]
    Database(String),
}

impl ServerError {
    /// Storage error category, if this is a read failure.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ServerError::Storage(e) => Some(e.code()),
            _ => None,
        }
    }
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;

/// Configuration for one metastorage node.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Human-readable name for this member.
    pub name: String,

    /// Raft identity of this node in every group it hosts.
    pub node_id: u64,

    /// Path to the data directory.
    pub data_dir: PathBuf,

    /// Groups started with the server.
    pub groups: Vec<GroupId>,

    /// Initial voters of every group, including this node.
    pub peers: Vec<u64>,

    /// Time in milliseconds of a heartbeat interval.
    pub heartbeat_interval_ms: u64,

    /// Time in milliseconds for an election to timeout.
    pub election_timeout_ms: u64,

    /// Time in milliseconds a proposal may wait to be applied.
    pub proposal_timeout_ms: u64,

    /// Deepest accepted nesting of a transaction program.
    pub max_program_depth: usize,

    /// Auto compaction mode (periodic or revision).
    pub auto_compaction_mode: AutoCompactionMode,

    /// Auto compaction retention (retention string or revision number).
    pub auto_compaction_retention: String,
}

/// Auto compaction mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AutoCompactionMode {
    /// Compact everything applied so far, once per retention period.
    Periodic,
    /// Keep the newest N revisions.
    Revision,
}

impl AutoCompactionMode {
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "periodic" => Ok(AutoCompactionMode::Periodic),
            "revision" => Ok(AutoCompactionMode::Revision),
            _ => Err(anyhow::anyhow!(
                "Invalid compaction mode: {}. Must be 'periodic' or 'revision'",
                s
            )),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            node_id: 1,
            data_dir: PathBuf::from("default.metastorage"),
            groups: vec![GroupId::new("metastorage")],
            peers: vec![1],
            heartbeat_interval_ms: 50,
            election_timeout_ms: 300,
            proposal_timeout_ms: 5000,
            max_program_depth: DEFAULT_MAX_DEPTH,
            auto_compaction_mode: AutoCompactionMode::Periodic,
            auto_compaction_retention: "0".to_string(),
        }
    }
}

impl ServerConfig {
    /// Raft settings for `group` derived from this configuration.
    pub fn group_config(&self, group: GroupId, peers: Vec<u64>) -> GroupConfig {
        let mut config = GroupConfig::new(group, self.node_id, peers)
            .with_timeouts(
                Duration::from_millis(self.election_timeout_ms),
                Duration::from_millis(self.election_timeout_ms * 2),
                Duration::from_millis(self.heartbeat_interval_ms),
            )
            .with_proposal_timeout(Duration::from_millis(self.proposal_timeout_ms));
        config.max_program_depth = self.max_program_depth;
        config
    }

    /// Background compaction schedule and retained revision count, `None` if disabled.
    pub fn compaction(&self) -> anyhow::Result<Option<(CompactionMode, u64)>> {
        let retention = self.auto_compaction_retention.trim();
        if retention.is_empty() || retention == "0" {
            return Ok(None);
        }

        match self.auto_compaction_mode {
            AutoCompactionMode::Periodic => {
                let period = parse_retention(retention)?;
                Ok(Some((CompactionMode::Periodic(period), 0)))
            }
            AutoCompactionMode::Revision => {
                let keep: u64 = retention.parse().map_err(|_| {
                    anyhow::anyhow!("Invalid revision retention: {}", retention)
                })?;
                Ok(Some((CompactionMode::Periodic(REVISION_COMPACTION_CHECK), keep)))
            }
        }
    }
}

/// Parses a retention period: `"500ms"`, `"30s"`, `"10m"`, `"2h"`, or a bare number of hours.
pub fn parse_retention(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, "h"),
    };

    let amount: u64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid retention: {}", s))?;

    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        _ => Err(anyhow::anyhow!(
            "Invalid retention unit in {}. Use ms, s, m or h",
            s
        )),
    }
}

/// One metastorage node hosting any number of raft groups.
pub struct MetaStorageServer {
    config: ServerConfig,
    cluster: LocalCluster,
    db: sled::Db,
    groups: DashMap<GroupId, Arc<RaftGroup>>,
    background_tasks: Mutex<HashMap<GroupId, Vec<JoinHandle<()>>>>,
}

impl MetaStorageServer {
    /// Opens the log database and starts every configured group.
    ///
    /// Servers sharing `cluster` can replicate to each other.
    pub async fn new(config: ServerConfig, cluster: LocalCluster) -> anyhow::Result<Self> {
        info!(
            name = %config.name,
            node_id = config.node_id,
            data_dir = %config.data_dir.display(),
            "Initializing metastorage server"
        );

        // Fail on a bad schedule before anything is started.
        config.compaction()?;

        let db = sled::open(config.data_dir.join("raft"))
            .map_err(|e| anyhow::anyhow!("Failed to open raft log database: {}", e))?;

        let server = Self {
            config,
            cluster,
            db,
            groups: DashMap::new(),
            background_tasks: Mutex::new(HashMap::new()),
        };

        for group in server.config.groups.clone() {
            server
                .add_group(group.clone(), server.config.peers.clone())
                .await
                .map_err(|e| anyhow::anyhow!("Failed to start group {}: {}", group, e))?;
        }

        info!("Metastorage server initialization complete");
        Ok(server)
    }

    /// Starts hosting a replica of `group` with the given initial voters.
    pub async fn add_group(&self, group: GroupId, peers: Vec<u64>) -> ServerResult<Arc<RaftGroup>> {
        self.start_group(group, peers, None).await
    }

    /// Starts a replica of a new group whose store begins as a copy of `snapshot`.
    pub async fn add_group_from_snapshot(
        &self,
        group: GroupId,
        peers: Vec<u64>,
        snapshot: &[u8],
    ) -> ServerResult<Arc<RaftGroup>> {
        self.start_group(group, peers, Some(snapshot)).await
    }

    async fn start_group(
        &self,
        group: GroupId,
        peers: Vec<u64>,
        seed: Option<&[u8]>,
    ) -> ServerResult<Arc<RaftGroup>> {
        if self.groups.contains_key(&group) {
            return Err(ServerError::GroupExists(group));
        }

        let tree = self
            .db
            .open_tree(format!("raft_log/{}", group))
            .map_err(|e| ServerError::Database(e.to_string()))?;
        let log = RaftLog::new(tree)?;

        let transport = self.cluster.transport(&group);
        let config = self.config.group_config(group.clone(), peers);
        let raft = RaftGroup::start_with_seed(config, log, Arc::new(transport.clone()), seed).await?;
        transport.register(self.config.node_id, &raft);

        let mut tasks = vec![raft.clone().run()];
        match self.config.compaction() {
            Ok(Some((mode, retain))) => {
                tasks.push(Compactor::new(raft.compaction().clone(), mode, retain).run());
            }
            Ok(None) => {}
            Err(e) => warn!(group = %group, error = %e, "Auto compaction disabled"),
        }

        self.background_tasks.lock().insert(group.clone(), tasks);
        self.groups.insert(group.clone(), raft.clone());

        info!(group = %group, node_id = self.config.node_id, "Group started");
        Ok(raft)
    }

    /// Stops hosting `group` on this node.
    pub async fn remove_group(&self, group: &GroupId) -> ServerResult<()> {
        let (_, raft) = self
            .groups
            .remove(group)
            .ok_or_else(|| ServerError::UnknownGroup(group.clone()))?;

        if let Some(tasks) = self.background_tasks.lock().remove(group) {
            for task in tasks {
                task.abort();
            }
        }
        self.cluster.transport(group).deregister(self.config.node_id);
        raft.shutdown().await?;

        info!(group = %group, "Group stopped");
        Ok(())
    }

    pub fn group(&self, group: &GroupId) -> ServerResult<Arc<RaftGroup>> {
        self.groups
            .get(group)
            .map(|raft| raft.value().clone())
            .ok_or_else(|| ServerError::UnknownGroup(group.clone()))
    }

    pub fn groups(&self) -> Vec<GroupId> {
        let mut groups: Vec<GroupId> = self.groups.iter().map(|g| g.key().clone()).collect();
        groups.sort();
        groups
    }

    /// Submits a transaction program to the group's leader replica on this node.
    pub async fn propose(&self, group: &GroupId, program: Statement) -> ServerResult<InvokeResult> {
        let raft = self.group(group)?;
        Ok(raft.propose(program).await?)
    }

    /// Linearizable read of `key` as of `revision` (latest when `None`).
    pub async fn get(
        &self,
        group: &GroupId,
        key: &[u8],
        revision: Option<Revision>,
    ) -> ServerResult<Entry> {
        let raft = self.group(group)?;
        raft.read_index().await?;
        Ok(raft.compaction().read(key, revision)?)
    }

    /// Linearizable read of the live keys in `[start, end)`.
    pub async fn range(
        &self,
        group: &GroupId,
        start: &[u8],
        end: &[u8],
        revision: Option<Revision>,
    ) -> ServerResult<Vec<Entry>> {
        let raft = self.group(group)?;
        raft.read_index().await?;
        Ok(raft.compaction().range(start, end, revision)?)
    }

    /// Read from this replica's applied state without contacting a quorum.
    pub fn get_local(
        &self,
        group: &GroupId,
        key: &[u8],
        revision: Option<Revision>,
    ) -> ServerResult<Entry> {
        Ok(self.group(group)?.compaction().read(key, revision)?)
    }

    /// Advances this replica's compaction watermark towards `up_to`.
    ///
    /// Returns the watermark after the call.
    pub fn request_compaction(&self, group: &GroupId, up_to: Revision) -> ServerResult<Revision> {
        Ok(self.group(group)?.compaction().request_compaction(up_to))
    }

    pub fn snapshot(&self, group: &GroupId) -> ServerResult<Vec<u8>> {
        Ok(self.group(group)?.compaction().snapshot()?)
    }

    pub async fn change_peers(&self, group: &GroupId, peers: Vec<u64>) -> ServerResult<Membership> {
        let raft = self.group(group)?;
        Ok(raft.change_peers(peers).await?)
    }

    pub fn register_listener(
        &self,
        group: &GroupId,
        listener: Arc<dyn RaftGroupEventsListener>,
    ) -> ServerResult<ListenerId> {
        Ok(self.group(group)?.dispatcher().register(listener))
    }

    pub fn deregister_listener(&self, group: &GroupId, id: ListenerId) -> ServerResult<bool> {
        Ok(self.group(group)?.dispatcher().deregister(id))
    }

    /// Watches `range` from `start_revision` on. Events arrive on the returned channel.
    pub fn watch(
        &self,
        group: &GroupId,
        range: WatchRange,
        start_revision: Revision,
        capacity: usize,
    ) -> ServerResult<(u64, mpsc::Receiver<WatchEvent>)> {
        if capacity == 0 {
            return Err(WatchError::InvalidConfig("Watch capacity must be positive".to_string()).into());
        }
        let (tx, rx) = mpsc::channel(capacity);
        let watch_id = self.group(group)?.watch_hub().create_watch(range, start_revision, tx)?;
        Ok((watch_id, rx))
    }

    pub fn cancel_watch(&self, group: &GroupId, watch_id: u64) -> ServerResult<()> {
        Ok(self.group(group)?.watch_hub().cancel_watch(watch_id)?)
    }

    /// Receiver that always holds the group's latest applied revision.
    pub fn subscribe_revisions(&self, group: &GroupId) -> ServerResult<watch::Receiver<Revision>> {
        Ok(self.group(group)?.watch_hub().subscribe_revisions())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn cluster(&self) -> &LocalCluster {
        &self.cluster
    }

    /// Serves until `shutdown` resolves, then stops every group.
    pub async fn run(&self, shutdown: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
        info!(
            name = %self.config.name,
            groups = ?self.groups(),
            "Metastorage server running"
        );
        shutdown.await;

        info!("Metastorage server shutting down");
        self.shutdown().await
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        for group in self.groups() {
            if let Err(e) = self.remove_group(&group).await {
                warn!(group = %group, error = %e, "Failed to stop group");
            }
        }

        self.db
            .flush_async()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to flush raft log database: {}", e))?;
        Ok(())
    }
}
