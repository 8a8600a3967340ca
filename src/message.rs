//! Message types exchanged between Raft nodes.
//!
//! The four RPC payloads mirror the request-vote and append-entries pairs from the Raft
//! paper. Every reply carries the responder's current term so the caller can step down
//! before it looks at the outcome. Commands are opaque [`Bytes`]; the state machine and
//! the transport agree on their encoding.

use core::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The unique identifier of a node, stable for the node's lifetime.
pub type NodeId = u64;

/// An entry in a node's replicated log.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log; zero-based and always equal to the entry's slot.
    pub index: u64,

    /// Term of the leader that created the entry.
    pub term: u64,

    /// Opaque command handed to the state machine once the entry commits.
    pub command: Bytes,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, command: Bytes) -> Self {
        Self {
            index,
            term,
            command,
        }
    }
}

/// A candidate's solicitation for one vote in `term`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,

    pub candidate_id: NodeId,

    /// Index of the candidate's last log entry, or `None` for an empty log.
    pub last_log_index: Option<u64>,

    /// Term of the candidate's last log entry, or `0` for an empty log.
    pub last_log_term: u64,
}

/// The response to a [`VoteRequest`], granting or denying the vote.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,

    pub vote_granted: bool,
}

/// A leader's request to append entries to a peer's log; with no entries it doubles as
/// a heartbeat.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,

    pub leader_id: NodeId,

    /// Index of the log entry immediately preceding `entries`.
    pub prev_log_index: u64,

    /// Term of the entry at `prev_log_index`, or `0` when the leader's log is empty.
    pub prev_log_term: u64,

    /// Consecutive entries to append; empty for a pure heartbeat.
    pub entries: Vec<LogEntry>,

    /// The leader's commit index, or `None` when it has committed nothing yet.
    pub leader_commit: Option<u64>,
}

impl AppendEntriesRequest {
    /// Whether this request carries no entries.
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The response to an [`AppendEntriesRequest`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,

    pub success: bool,
}

//
// Display impls
//

impl fmt::Display for VoteRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        } = self;
        fmt.debug_struct("VoteRequest")
            .field("term", term)
            .field("candidate_id", candidate_id)
            .field("last_log_index", last_log_index)
            .field("last_log_term", last_log_term)
            .finish()
    }
}

impl fmt::Display for AppendEntriesRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        } = self;
        fmt.debug_struct("AppendEntries")
            .field("term", term)
            .field("leader_id", leader_id)
            .field("prev_log_index", prev_log_index)
            .field("prev_log_term", prev_log_term)
            .field("entries", &entries.len())
            .field("leader_commit", leader_commit)
            .finish()
    }
}
