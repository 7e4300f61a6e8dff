//! # metastorage: a raft-replicated metadata store
//!
//! metastorage keeps cluster-wide facts (schema versions, partition assignment,
//! configuration) in a revisioned key space replicated by raft. It provides:
//!
//! - **Conditional multi-invoke**: nested if/then/else transaction programs evaluated
//!   atomically against the store, one revision per applied program
//! - **Revision history**: point-in-time reads, bounded by a compaction watermark
//! - **Group events**: leader election and membership notifications for dependent
//!   subsystems
//! - **Watches**: per-key and range subscriptions to applied revisions
//!
//! # Usage
//!
//! ```bash
//! metastorage --name node1 --node-id 1 --groups metastorage,schema
//! ```

pub mod invoke;
pub mod metastorage;
pub mod raft;
pub mod server;
pub mod storage;
pub mod watch;

// Re-export main types at crate root for convenience
pub use invoke::{CompareOp, Condition, Operation, Statement};
pub use metastorage::InvokeResult;
pub use raft::{
    GroupId, NoopListener, PeerId, ProposalError, RaftGroup, RaftGroupEventsListener,
};
pub use server::{MetaStorageServer, ServerConfig, ServerError};
pub use storage::{Entry, ErrorCode, Revision, StorageError};
pub use watch::WatchHub;
