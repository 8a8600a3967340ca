//! A single-node implementation of the Raft consensus algorithm: leader election, log
//! replication, and safe commit of a replicated state machine across a fixed cluster of
//! peers.
//!
//! Each [`RaftNode`] decides when to hold elections, how to accept or reject peer RPCs,
//! when to append and commit log entries, and when to apply committed entries to its
//! attached state machine. Everything else is a collaborator supplied by the embedding
//! application:
//!
//! - a [`Cluster`] that knows the membership and carries RPCs to peers,
//! - a [`StateMachine`] that deterministically executes committed commands,
//! - a [`StableStore`] that persists the term, the vote, and the log before the node
//!   answers RPCs that changed them.
//!
//! A node is driven by two cancellable periodic timers (election and heartbeat) plus the
//! inbound RPC handlers; [`RaftNode::run`] arms the timers for the current role, and
//! [`RaftNode::client_request`] is the command intake, forwarding to the leader from any
//! other node.

pub mod cluster;
pub mod core;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod state_machine;
pub mod storage;
mod timer;

pub use crate::cluster::{Cluster, RaftConfig};
pub use crate::core::{quorum_size, ReplicationState, Role};
pub use crate::error::{Cancelled, RequestError, TransportError};
pub use crate::log::RaftLog;
pub use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, NodeId, VoteRequest, VoteResponse,
};
pub use crate::node::{CommitHandle, RaftNode, RequestOutcome};
pub use crate::state_machine::StateMachine;
pub use crate::storage::memory::InMemoryStableStore;
pub use crate::storage::{HardState, StableStore};
